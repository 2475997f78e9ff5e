pub mod types;
pub mod error;
pub mod async_runtime;
pub mod compression;
pub mod crypto;
pub mod codec;
pub mod duration;

pub use types::*;
pub use error::{Result, VigilError};
pub use async_runtime::{
    LinearBackoff, RetryConfig, retry_with_backoff,
    ShutdownCoordinator, shutdown_signal,
};
pub use codec::{EncodedPayload, Encryption, PayloadCodec, PayloadHeaders};
