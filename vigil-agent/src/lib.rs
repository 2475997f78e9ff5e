pub mod collector;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod sender;

pub use collector::{Collector, MetricSource, PollCounter, PollResult};
pub use config::AgentConfig;
pub use error::{CollectError, SendError, SendResult};
pub use pipeline::{Pipeline, PipelineConfig};
pub use sender::{HttpSender, MetricSender};
