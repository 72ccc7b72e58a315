use std::time::Duration;

use thiserror::Error;

/// 任务处理器错误
///
/// 由处理器返回或由Worker循环在边界处合成，驱动任务的重试/归档状态机。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("任务处理失败: {0}")]
    Failed(String),

    #[error("任务处理超时: {0:?}")]
    Timeout(Duration),

    #[error("任务处理器崩溃: {0}")]
    Panicked(String),

    #[error("未知的任务类型: {0}")]
    UnknownType(String),

    #[error("任务载荷无效: {0}")]
    InvalidPayload(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// 超时错误属于处理器错误的子类型，这里单独判断以便日志和指标区分
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// 错误类别，用作指标标签
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Timeout(_) => "timeout",
            Self::Panicked(_) => "panicked",
            Self::UnknownType(_) => "unknown_type",
            Self::InvalidPayload(_) => "invalid_payload",
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}

/// 任务队列错误类型定义
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Broker传输错误: {0}")]
    Transport(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("任务ID冲突: {id}")]
    TaskIdConflict { id: String },

    #[error("任务不处于活跃状态: {id}")]
    TaskNotActive { id: String },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl QueueError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<::config::ConfigError> for QueueError {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// 统一的Result类型
pub type QueueResult<T> = std::result::Result<T, QueueError>;
