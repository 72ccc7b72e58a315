use std::future::Future;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{Client, RedisError, RedisResult};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use jobqueue_core::{Logger, QueueError, QueueMetrics, QueueResult, RedisConfig, RetryPolicy};

/// Redis连接管理
///
/// 包装 `redis::aio::ConnectionManager`（断线自动重连），并对瞬时错误按
/// 指数退避重试。`close` 之后所有操作都返回传输错误。
pub struct RedisConnectionManager {
    connection: RwLock<Option<ConnectionManager>>,
    retry: TransportRetry,
}

/// 传输层重试：瞬时错误按退避重试，最多执行 `max_attempts` 次
#[derive(Debug, Clone)]
pub struct TransportRetry {
    max_attempts: u32,
    policy: RetryPolicy,
    metrics: QueueMetrics,
    logger: Logger,
}

impl TransportRetry {
    pub fn new(max_attempts: u32, policy: RetryPolicy, logger: Logger) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            policy,
            metrics: QueueMetrics::new(),
            logger,
        }
    }

    pub fn from_config(config: &RedisConfig, logger: Logger) -> Self {
        Self::new(
            config.max_retry_attempts,
            RetryPolicy {
                base_interval_ms: config.retry_delay_ms,
                ..RetryPolicy::transport_default()
            },
            logger,
        )
    }

    /// 执行操作直到成功、遇到不可重试的错误或次数耗尽
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut f: F) -> QueueResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt + 1 < self.max_attempts => {
                    attempt += 1;
                    self.metrics.record_transport_error(operation);
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        parent: self.logger.span(),
                        operation,
                        attempt,
                        error = %e,
                        "Redis操作失败，{:?}后重试",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    self.metrics.record_transport_error(operation);
                    error!(
                        parent: self.logger.span(),
                        operation,
                        attempts = attempt + 1,
                        error = %e,
                        "Redis操作失败"
                    );
                    return Err(QueueError::transport(format!("{operation}: {e}")));
                }
            }
        }
    }
}

impl RedisConnectionManager {
    pub async fn connect(config: &RedisConfig, logger: Logger) -> QueueResult<Self> {
        let client = Client::open(config.url())
            .map_err(|e| QueueError::transport(format!("创建Redis客户端失败: {e}")))?;

        let timeout = Duration::from_secs(config.connection_timeout_seconds);
        let mut connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                QueueError::transport(format!(
                    "连接Redis超时 {}:{} ({timeout:?})",
                    config.host, config.port
                ))
            })?
            .map_err(|e| QueueError::transport(format!("连接Redis失败: {e}")))?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(|e| QueueError::transport(format!("Redis PING失败: {e}")))?;
        if pong != "PONG" {
            return Err(QueueError::transport(format!(
                "Unexpected PING response: {pong}"
            )));
        }
        debug!(
            parent: logger.span(),
            "Successfully connected to Redis at {}:{}",
            config.host,
            config.port
        );

        Ok(Self {
            connection: RwLock::new(Some(connection)),
            retry: TransportRetry::from_config(config, logger),
        })
    }

    async fn connection(&self) -> QueueResult<ConnectionManager> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or_else(|| QueueError::transport("broker已关闭"))
    }

    /// 执行一次Redis操作，瞬时错误按退避重试，耗尽后返回传输错误
    pub async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut f: F) -> QueueResult<T>
    where
        F: FnMut(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let connection = self.connection().await?;
        self.retry
            .run(operation, || f(connection.clone()))
            .await
    }

    /// 释放连接，返回本次调用是否真正关闭了连接
    pub async fn close(&self) -> bool {
        self.connection.write().await.take().is_some()
    }
}

/// 连接层面的错误可以重试，命令或脚本本身的错误不行
fn is_transient(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}
