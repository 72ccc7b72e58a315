//! 应用配置
//!
//! 配置来源按优先级从低到高：代码默认值、TOML配置文件、`JOBQUEUE__` 前缀的
//! 环境变量（例如 `JOBQUEUE__WORKER__CONCURRENCY=20`）。

use std::collections::HashSet;
use std::path::Path;

use ::config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::errors::{QueueError, QueueResult};
use crate::logging::LoggingConfig;
use crate::models::{DEFAULT_MAX_RETRIES, DEFAULT_QUEUE};
use crate::retry::RetryPolicy;

/// 未指定配置文件时依次查找的路径
pub const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/jobqueue.toml",
    "jobqueue.toml",
    "/etc/jobqueue/config.toml",
];

/// 配置校验
pub trait ConfigValidator {
    fn validate(&self) -> QueueResult<()>;
}

/// 应用配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryPolicy,
    pub logging: LoggingConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 加载配置
    ///
    /// 显式给出的路径必须存在；否则按 [`DEFAULT_CONFIG_PATHS`] 查找，
    /// 都找不到时只使用默认值和环境变量。
    pub fn load(config_path: Option<&str>) -> QueueResult<Self> {
        let mut builder = ConfigBuilder::builder();

        match config_path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(QueueError::configuration(format!(
                        "配置文件不存在: {path}"
                    )));
                }
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
            None => {
                if let Some(path) = DEFAULT_CONFIG_PATHS
                    .iter()
                    .find(|path| Path::new(path).exists())
                {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("JOBQUEUE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 从TOML字符串解析，不读取环境变量
    pub fn from_toml_str(content: &str) -> QueueResult<Self> {
        let config: AppConfig = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> QueueResult<()> {
        self.broker.validate()?;
        self.worker.validate()?;
        self.scheduler.validate()?;
        self.retry.validate()?;
        self.observability.validate()?;

        // 租约短于处理超时会让仍在执行的任务被当作孤儿回收
        if self.worker.task_timeout_seconds >= self.broker.lease_seconds {
            return Err(QueueError::configuration(format!(
                "worker.task_timeout_seconds ({}) 必须小于 broker.lease_seconds ({})",
                self.worker.task_timeout_seconds, self.broker.lease_seconds
            )));
        }
        Ok(())
    }
}

impl ConfigValidator for RetryPolicy {
    fn validate(&self) -> QueueResult<()> {
        if self.base_interval_ms > self.max_interval_ms {
            return Err(QueueError::configuration(
                "retry.base_interval_ms 不能大于 retry.max_interval_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(QueueError::configuration(
                "retry.jitter_factor 必须在 0.0 到 1.0 之间",
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(QueueError::configuration(
                "retry.backoff_multiplier 不能小于 1.0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerType {
    Redis,
    InMemory,
}

/// Redis连接配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub database: i64,
    pub password: Option<String>,
    pub connection_timeout_seconds: u64,
    /// 瞬时传输错误的最大重试次数
    pub max_retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// 所有键的前缀
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            password: None,
            connection_timeout_seconds: 5,
            max_retry_attempts: 3,
            retry_delay_ms: 200,
            key_prefix: "jobqueue".to_string(),
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) if !password.is_empty() => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.database
            ),
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

impl ConfigValidator for RedisConfig {
    fn validate(&self) -> QueueResult<()> {
        if self.host.trim().is_empty() {
            return Err(QueueError::configuration("broker.redis.host 不能为空"));
        }
        if self.port == 0 {
            return Err(QueueError::configuration("broker.redis.port 不能为0"));
        }
        if self.connection_timeout_seconds == 0 {
            return Err(QueueError::configuration(
                "broker.redis.connection_timeout_seconds 必须大于0",
            ));
        }
        if self.max_retry_attempts == 0 {
            return Err(QueueError::configuration(
                "broker.redis.max_retry_attempts 必须大于0",
            ));
        }
        if self.key_prefix.is_empty() || self.key_prefix.contains(' ') {
            return Err(QueueError::configuration(
                "broker.redis.key_prefix 不能为空且不能包含空格",
            ));
        }
        Ok(())
    }
}

/// Broker配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub r#type: BrokerType,
    pub redis: RedisConfig,
    /// 活跃任务的租约时长，过期后视为孤儿任务
    pub lease_seconds: u64,
    /// 阻塞出队时的轮询间隔
    pub poll_interval_ms: u64,
    /// 每个队列保留的已完成任务数
    pub max_completed: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            r#type: BrokerType::Redis,
            redis: RedisConfig::default(),
            lease_seconds: 1_800,
            poll_interval_ms: 100,
            max_completed: 1_000,
        }
    }
}

impl ConfigValidator for BrokerConfig {
    fn validate(&self) -> QueueResult<()> {
        if self.r#type == BrokerType::Redis {
            self.redis.validate()?;
        }
        if self.lease_seconds == 0 {
            return Err(QueueError::configuration("broker.lease_seconds 必须大于0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(QueueError::configuration(
                "broker.poll_interval_ms 必须大于0",
            ));
        }
        Ok(())
    }
}

/// 队列及其权重
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Worker池配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// 有序的队列列表，顺序即严格优先级下的优先级
    pub queues: Vec<QueueConfig>,
    pub strict_priority: bool,
    pub shutdown_timeout_seconds: u64,
    /// 任务没有自带超时时使用的默认处理超时
    pub task_timeout_seconds: u64,
    pub dequeue_timeout_ms: u64,
    /// 孤儿任务回收周期，0表示不回收
    pub recover_interval_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: vec![
                QueueConfig::new("critical", 6),
                QueueConfig::new(DEFAULT_QUEUE, 3),
                QueueConfig::new("low", 1),
            ],
            strict_priority: false,
            shutdown_timeout_seconds: 30,
            task_timeout_seconds: 300,
            dequeue_timeout_ms: 1_000,
            recover_interval_seconds: 60,
        }
    }
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> QueueResult<()> {
        if self.concurrency == 0 {
            return Err(QueueError::configuration("worker.concurrency 必须大于0"));
        }
        if self.queues.is_empty() {
            return Err(QueueError::configuration("worker.queues 不能为空"));
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.name.trim().is_empty() {
                return Err(QueueError::configuration("队列名称不能为空"));
            }
            if queue.weight == 0 {
                return Err(QueueError::configuration(format!(
                    "队列 {} 的权重必须大于0",
                    queue.name
                )));
            }
            if !seen.insert(queue.name.as_str()) {
                return Err(QueueError::configuration(format!(
                    "队列 {} 重复配置",
                    queue.name
                )));
            }
        }

        if self.task_timeout_seconds == 0 {
            return Err(QueueError::configuration(
                "worker.task_timeout_seconds 必须大于0",
            ));
        }
        if self.dequeue_timeout_ms == 0 {
            return Err(QueueError::configuration(
                "worker.dequeue_timeout_ms 必须大于0",
            ));
        }
        Ok(())
    }
}

/// 来自配置文件的CRON绑定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronBindingConfig {
    pub cron: String,
    pub task_type: String,
    /// 每次触发时原样作为JSON载荷
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// 调度器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// 是否注册内置的默认绑定（数据清理、状态通知）
    pub default_bindings: bool,
    /// 两次检查之间的最长间隔
    pub tick_interval_ms: u64,
    pub bindings: Vec<CronBindingConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_bindings: true,
            tick_interval_ms: 1_000,
            bindings: Vec::new(),
        }
    }
}

impl ConfigValidator for SchedulerConfig {
    fn validate(&self) -> QueueResult<()> {
        if self.tick_interval_ms == 0 {
            return Err(QueueError::configuration(
                "scheduler.tick_interval_ms 必须大于0",
            ));
        }
        for binding in &self.bindings {
            if binding.task_type.trim().is_empty() {
                return Err(QueueError::configuration(format!(
                    "CRON绑定 '{}' 缺少任务类型",
                    binding.cron
                )));
            }
            if binding.queue.trim().is_empty() {
                return Err(QueueError::configuration(format!(
                    "CRON绑定 '{}' 的队列名称不能为空",
                    binding.cron
                )));
            }
        }
        Ok(())
    }
}

/// 可观测性配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,
    /// Prometheus exporter监听地址
    pub metrics_bind: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            metrics_bind: "0.0.0.0:9090".to_string(),
        }
    }
}

impl ConfigValidator for ObservabilityConfig {
    fn validate(&self) -> QueueResult<()> {
        if self.metrics_enabled
            && self.metrics_bind.parse::<std::net::SocketAddr>().is_err()
        {
            return Err(QueueError::configuration(format!(
                "observability.metrics_bind 不是有效的地址: {}",
                self.metrics_bind
            )));
        }
        Ok(())
    }
}
