use std::time::Duration;

use async_trait::async_trait;

use crate::{
    models::{EnqueueOptions, NewTask, QueueStats, TaskId, TaskRecord, TaskState},
    QueueResult,
};

/// Broker抽象接口
///
/// 共享的、持久化的有序存储的客户端。任务记录的 `state` 和 `attempt`
/// 只能通过这里的方法修改。
#[async_trait]
pub trait Broker: Send + Sync {
    /// 入队一个 pending 任务，未指定ID时分配唯一ID
    async fn enqueue(&self, task: NewTask, options: EnqueueOptions) -> QueueResult<TaskId>;

    /// 延迟入队，等价于 `not_before = now + delay` 的 `enqueue`
    async fn enqueue_delayed(
        &self,
        task: NewTask,
        delay: Duration,
        options: EnqueueOptions,
    ) -> QueueResult<TaskId> {
        self.enqueue(task, options.process_in(delay)).await
    }

    /// 按给定顺序在多个队列中等待可执行任务，最长阻塞 `timeout`
    ///
    /// 取出的记录被原子地置为 `active`，同一条记录不会被两个调用方同时取得。
    async fn dequeue(&self, queues: &[String], timeout: Duration)
        -> QueueResult<Option<TaskRecord>>;

    /// 标记任务成功完成
    async fn ack(&self, task_id: &str) -> QueueResult<()>;

    /// 标记任务失败：未超过最大重试次数时进入 `retry`，否则归档
    async fn fail(&self, task_id: &str, error: &str) -> QueueResult<TaskState>;

    /// 回收租约过期的活跃任务（执行者已失联），返回处理的任务数
    async fn recover_orphaned(&self) -> QueueResult<usize>;

    async fn get_task(&self, task_id: &str) -> QueueResult<Option<TaskRecord>>;

    /// 死信视图：已归档的任务
    async fn list_archived(&self, queue: &str) -> QueueResult<Vec<TaskRecord>>;

    async fn queue_stats(&self, queue: &str) -> QueueResult<QueueStats>;

    /// 释放传输资源，可重复调用
    async fn close(&self) -> QueueResult<()>;
}
