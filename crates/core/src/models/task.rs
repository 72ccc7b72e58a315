use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::errors::{QueueError, QueueResult};

/// 默认队列名称
pub const DEFAULT_QUEUE: &str = "default";

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 任务ID，入队时分配的不透明字符串
pub type TaskId = String;

/// 任务状态
///
/// 状态只能沿 `pending → active → {done | retry → active ... | archived}` 流转，
/// 且只有Broker可以写入。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Active,
    Retry,
    Archived,
    Done,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Retry => "retry",
            TaskState::Archived => "archived",
            TaskState::Done => "done",
        }
    }

    /// 是否允许从当前状态转换到 `next`
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Active)
                | (TaskState::Retry, TaskState::Active)
                | (TaskState::Active, TaskState::Done)
                | (TaskState::Active, TaskState::Retry)
                | (TaskState::Active, TaskState::Archived)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Archived | TaskState::Done)
    }

    /// 可以被Worker取出的状态（还需满足 not_before 条件）
    pub fn is_dequeueable(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Retry)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "active" => Ok(TaskState::Active),
            "retry" => Ok(TaskState::Retry),
            "archived" => Ok(TaskState::Archived),
            "done" => Ok(TaskState::Done),
            other => Err(QueueError::Serialization(format!(
                "unknown task state: {other}"
            ))),
        }
    }
}

/// `now + delay`，溢出时取最大可表示时间
pub fn time_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// 租约在任务超时之外额外保留的时间
pub const LEASE_GRACE: Duration = Duration::from_secs(30);

/// 待入队的任务模板：只有类型和载荷
///
/// 延迟、队列、重试次数等选项属于入队调用本身，见 [`EnqueueOptions`]。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub task_type: String,
    pub payload: Vec<u8>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: payload.into(),
        }
    }

    /// 以JSON编码载荷
    pub fn json<T: Serialize>(task_type: impl Into<String>, payload: &T) -> QueueResult<Self> {
        Ok(Self::new(task_type, serde_json::to_vec(payload)?))
    }
}

/// 入队选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub queue: String,
    pub max_retries: u32,
    pub task_id: Option<TaskId>,
    pub process_at: Option<DateTime<Utc>>,
    pub timeout: Option<Duration>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            task_id: None,
            process_at: None,
            timeout: None,
        }
    }
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn task_id(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = Some(at);
        self
    }

    pub fn process_in(self, delay: Duration) -> Self {
        self.process_at(time_after(Utc::now(), delay))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 任务记录：队列中的工作单元
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: Vec<u8>,
    pub queue: String,
    pub enqueued_at: DateTime<Utc>,
    pub not_before: Option<DateTime<Utc>>,
    pub max_retries: u32,
    pub attempt: u32,
    pub state: TaskState,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// 按入队选项创建一条 pending 记录
    pub fn pending(id: TaskId, task: NewTask, options: &EnqueueOptions, now: DateTime<Utc>) -> Self {
        Self {
            id,
            task_type: task.task_type,
            payload: task.payload,
            queue: options.queue.clone(),
            enqueued_at: now,
            not_before: options.process_at,
            max_retries: options.max_retries,
            attempt: 0,
            state: TaskState::Pending,
            timeout_seconds: options.timeout.map(|t| t.as_secs().max(1)),
            last_error: None,
            last_failed_at: None,
            completed_at: None,
            lease_expires_at: None,
        }
    }

    /// 在 `now` 时刻是否可以被取出
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state.is_dequeueable() && self.not_before.map_or(true, |at| at <= now)
    }

    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_retries
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    /// 出队时使用的租约时长
    ///
    /// 不短于 `base`；带有超时设置的任务至少持有 `timeout + LEASE_GRACE`，
    /// 处理器仍在执行时不会被当作孤儿回收。
    pub fn lease_duration(&self, base: Duration) -> Duration {
        match self.timeout() {
            Some(timeout) => base.max(timeout.saturating_add(LEASE_GRACE)),
            None => base,
        }
    }

    /// 把载荷解码为JSON结构
    pub fn decode_payload<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }

    /// 状态转换，非法转换返回错误
    pub fn transition(&mut self, next: TaskState) -> QueueResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(QueueError::Internal(format!(
                "illegal task state transition for {}: {} -> {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// 单个队列的统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: String,
    pub pending: usize,
    pub scheduled: usize,
    pub active: usize,
    pub retry: usize,
    pub archived: usize,
    pub done: usize,
}
