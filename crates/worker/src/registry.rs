use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use jobqueue_core::{HandlerError, Logger, QueueError, QueueResult, TaskRecord};

/// 处理器执行时可见的上下文
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// 执行该任务的Worker循环编号
    pub worker: usize,
    /// 本次是第几次重试（首次执行为0）
    pub attempt: u32,
    /// 本次执行的处理超时
    pub timeout: Duration,
    pub logger: Logger,
}

/// 任务处理器
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext, task: TaskRecord) -> Result<(), HandlerError>;
}

/// 把异步闭包包装成 [`TaskHandler`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext, TaskRecord) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext, task: TaskRecord) -> Result<(), HandlerError> {
        (self.f)(ctx, task).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskContext, TaskRecord) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

/// 任务类型到处理器的映射
///
/// 通过 [`TaskRegistryBuilder`] 构建，构建完成后不可修改。
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder::default()
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// 已注册的任务类型，按名称排序
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Default)]
pub struct TaskRegistryBuilder {
    handlers: Vec<(String, Arc<dyn TaskHandler>)>,
}

impl TaskRegistryBuilder {
    pub fn register<H>(mut self, task_type: impl Into<String>, handler: H) -> Self
    where
        H: TaskHandler + 'static,
    {
        self.handlers.push((task_type.into(), Arc::new(handler)));
        self
    }

    pub fn register_fn<F, Fut>(self, task_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskContext, TaskRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(task_type, handler_fn(f))
    }

    /// 校验并生成注册表：任务类型不能为空也不能重复
    pub fn build(self) -> QueueResult<TaskRegistry> {
        let mut handlers = HashMap::with_capacity(self.handlers.len());
        for (task_type, handler) in self.handlers {
            if task_type.trim().is_empty() {
                return Err(QueueError::configuration("任务类型不能为空"));
            }
            if handlers.contains_key(&task_type) {
                return Err(QueueError::configuration(format!(
                    "任务类型 {task_type} 重复注册"
                )));
            }
            handlers.insert(task_type, handler);
        }
        Ok(TaskRegistry { handlers })
    }
}
