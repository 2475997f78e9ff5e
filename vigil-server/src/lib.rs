pub mod config;
pub mod error;
pub mod http;
pub mod persistence;
pub mod server;
pub mod storage;

pub use config::ServerConfig;
pub use error::{StorageError, StorageResult};
pub use persistence::PersistenceScheduler;
pub use server::MetricServer;
pub use storage::{
    open_storage, DatabaseStorage, FileStorage, MemoryStorage, MetricStorage, RetryStorage,
};
