pub mod config;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod retry;
pub mod traits;

pub use config::{
    AppConfig, BrokerConfig, BrokerType, ConfigValidator, CronBindingConfig, ObservabilityConfig,
    QueueConfig, RedisConfig, SchedulerConfig, WorkerConfig,
};
pub use errors::{HandlerError, QueueError, QueueResult};
pub use logging::{init_logging, LogFormat, Logger, LoggingConfig};
pub use metrics::QueueMetrics;
pub use models::*;
pub use retry::RetryPolicy;
pub use traits::*;
