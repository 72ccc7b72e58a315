use std::sync::Arc;

use tracing::{debug, info};

use jobqueue_core::{
    Broker, BrokerConfig, BrokerType, ConfigValidator, Logger, QueueResult, RetryPolicy,
};

use crate::{InMemoryBroker, InMemoryBrokerConfig, RedisBroker, RedisBrokerConfig};

pub struct BrokerFactory;

impl BrokerFactory {
    /// 按配置创建Broker，Redis不可达时返回传输错误
    pub async fn create(
        config: &BrokerConfig,
        retry_policy: &RetryPolicy,
        logger: &Logger,
    ) -> QueueResult<Arc<dyn Broker>> {
        config.validate()?;
        debug!(parent: logger.span(), "Creating broker with type: {:?}", config.r#type);

        match config.r#type {
            BrokerType::Redis => {
                info!(parent: logger.span(), "Initializing Redis broker");
                let broker = RedisBroker::connect(
                    RedisBrokerConfig::from_config(config, retry_policy),
                    logger.clone(),
                )
                .await?;
                Ok(Arc::new(broker))
            }
            BrokerType::InMemory => {
                info!(parent: logger.span(), "Initializing in-memory broker");
                let broker =
                    InMemoryBroker::new(InMemoryBrokerConfig::from_config(config, retry_policy))
                        .with_logger(logger.clone());
                Ok(Arc::new(broker))
            }
        }
    }
}
