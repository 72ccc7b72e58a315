//! 日志
//!
//! 进程级的订阅器只在二进制入口初始化一次（[`init_logging`]）。各组件不依赖
//! 全局日志对象，而是在构造时接收一个 [`Logger`] 句柄：它携带组件名等上下文
//! 字段，组件用它的span来instrument自己的循环。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("不支持的日志格式: {other}")),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// 服务名，作为根span的字段
    pub service: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            service: "jobqueue".to_string(),
        }
    }
}

/// 初始化日志系统
///
/// `RUST_LOG` 环境变量优先于配置中的级别。
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("初始化JSON日志格式失败")?,
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("初始化Pretty日志格式失败")?,
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
            .context("初始化Compact日志格式失败")?,
    }

    Ok(())
}

/// 显式传递的日志句柄
///
/// 克隆代价很低。`component` 派生出带组件名的子句柄，`span` 供
/// `tracing::Instrument` 使用。
#[derive(Debug, Clone)]
pub struct Logger {
    span: Span,
}

impl Logger {
    /// 以服务名创建根句柄
    pub fn new(service: &str) -> Self {
        Self {
            span: tracing::info_span!("service", service = %service),
        }
    }

    /// 不附带任何上下文的句柄，测试中使用
    pub fn disabled() -> Self {
        Self { span: Span::none() }
    }

    /// 派生组件级句柄
    pub fn component(&self, name: &str) -> Self {
        Self {
            span: tracing::info_span!(parent: &self.span, "component", component = %name),
        }
    }

    /// 派生Worker级句柄
    pub fn worker(&self, index: usize) -> Self {
        Self {
            span: tracing::info_span!(parent: &self.span, "worker", worker = index),
        }
    }

    /// 派生单个任务的句柄
    pub fn task(&self, task_id: &str, task_type: &str) -> Self {
        Self {
            span: tracing::info_span!(
                parent: &self.span,
                "task",
                task_id = %task_id,
                task_type = %task_type
            ),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}
