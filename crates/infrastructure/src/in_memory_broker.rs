use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use jobqueue_core::{
    models::{time_after, EnqueueOptions, NewTask, QueueStats, TaskId, TaskRecord, TaskState},
    Broker, BrokerConfig, Logger, QueueError, QueueMetrics, QueueResult, RetryPolicy,
};

/// 内存Broker配置
#[derive(Debug, Clone)]
pub struct InMemoryBrokerConfig {
    /// 活跃任务的租约时长
    pub lease_duration: Duration,
    /// 阻塞出队时重新检查延迟任务的间隔
    pub poll_interval: Duration,
    /// 每个队列保留的已完成任务数
    pub max_completed: usize,
    /// 任务失败后的重试退避
    pub retry_policy: RetryPolicy,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(1_800),
            poll_interval: Duration::from_millis(100),
            max_completed: 1_000,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl InMemoryBrokerConfig {
    pub fn from_config(config: &BrokerConfig, retry_policy: &RetryPolicy) -> Self {
        Self {
            lease_duration: Duration::from_secs(config.lease_seconds),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_completed: config.max_completed,
            retry_policy: retry_policy.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    tasks: HashMap<TaskId, TaskRecord>,
    /// 队列名 -> 等待中的任务ID（pending、scheduled、retry），按进入顺序排列
    waiting: HashMap<String, VecDeque<TaskId>>,
    /// 队列名 -> 已完成任务ID，超出保留数时从头部淘汰
    completed: HashMap<String, VecDeque<TaskId>>,
}

/// 内存Broker
///
/// 单进程内的完整Broker实现，语义与Redis实现一致，用于嵌入式运行和测试。
/// 所有状态由一把互斥锁保护，`dequeue` 的"取出并置为active"在锁内完成，
/// 因此同一任务不会被两个调用方同时取得。
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    notify: Arc<Notify>,
    config: InMemoryBrokerConfig,
    closed: AtomicBool,
    metrics: QueueMetrics,
    logger: Logger,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryBrokerConfig::default())
    }
}

impl InMemoryBroker {
    pub fn new(config: InMemoryBrokerConfig) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            notify: Arc::new(Notify::new()),
            config,
            closed: AtomicBool::new(false),
            metrics: QueueMetrics::new(),
            logger: Logger::disabled(),
        }
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger.component("in_memory_broker");
        self
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::transport("broker已关闭"));
        }
        Ok(())
    }

    async fn try_dequeue(&self, queues: &[String]) -> Option<TaskRecord> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let BrokerState { tasks, waiting, .. } = &mut *state;

        for queue in queues {
            let Some(ids) = waiting.get_mut(queue) else {
                continue;
            };
            let position = ids
                .iter()
                .position(|id| tasks.get(id).is_some_and(|task| task.is_eligible(now)));

            if let Some(position) = position {
                let id = ids.remove(position)?;
                let record = tasks.get_mut(&id)?;
                if let Err(e) = record.transition(TaskState::Active) {
                    warn!(parent: self.logger.span(), error = %e, "跳过状态异常的任务");
                    continue;
                }
                let lease = record.lease_duration(self.config.lease_duration);
                record.lease_expires_at = Some(time_after(now, lease));
                return Some(record.clone());
            }
        }
        None
    }

    /// 在持锁状态下执行失败处理，`fail` 和孤儿回收共用
    fn fail_locked(
        &self,
        state: &mut BrokerState,
        task_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<TaskState> {
        let record = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::TaskNotFound {
                id: task_id.to_string(),
            })?;
        if record.state != TaskState::Active {
            return Err(QueueError::TaskNotActive {
                id: task_id.to_string(),
            });
        }

        record.last_error = Some(error.to_string());
        record.last_failed_at = Some(now);
        record.lease_expires_at = None;

        if record.can_retry() {
            record.attempt += 1;
            record.not_before = Some(time_after(
                now,
                self.config.retry_policy.delay_for(record.attempt),
            ));
            record.transition(TaskState::Retry)?;
            state
                .waiting
                .entry(record.queue.clone())
                .or_default()
                .push_back(record.id.clone());
            self.metrics.record_retried(&record.queue);
            debug!(
                parent: self.logger.span(),
                task_id = %record.id,
                attempt = record.attempt,
                "任务进入重试"
            );
        } else {
            record.transition(TaskState::Archived)?;
            self.metrics.record_archived(&record.queue);
            warn!(
                parent: self.logger.span(),
                task_id = %record.id,
                attempt = record.attempt,
                error = %error,
                "任务重试次数耗尽，已归档"
            );
        }

        Ok(record.state)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, task: NewTask, options: EnqueueOptions) -> QueueResult<TaskId> {
        self.ensure_open()?;
        if options.queue.trim().is_empty() {
            return Err(QueueError::configuration("队列名称不能为空"));
        }

        let id = options
            .task_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let record = TaskRecord::pending(id.clone(), task, &options, Utc::now());

        {
            let mut state = self.state.lock().await;
            if state.tasks.contains_key(&id) {
                return Err(QueueError::TaskIdConflict { id });
            }
            state
                .waiting
                .entry(record.queue.clone())
                .or_default()
                .push_back(id.clone());
            self.metrics.record_enqueued(&record.queue, &record.task_type);
            debug!(
                parent: self.logger.span(),
                task_id = %id,
                task_type = %record.task_type,
                queue = %record.queue,
                "任务已入队"
            );
            state.tasks.insert(id.clone(), record);
        }

        self.notify.notify_waiters();
        Ok(id)
    }

    async fn dequeue(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> QueueResult<Option<TaskRecord>> {
        if queues.is_empty() {
            return Err(QueueError::configuration("出队时队列列表不能为空"));
        }
        let deadline = Instant::now() + timeout;

        loop {
            self.ensure_open()?;
            // 先注册通知再检查，避免错过检查和等待之间的入队
            let notified = self.notify.notified();

            if let Some(record) = self.try_dequeue(queues).await {
                return Ok(Some(record));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(self.config.poll_interval);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn ack(&self, task_id: &str) -> QueueResult<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let record = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::TaskNotFound {
                id: task_id.to_string(),
            })?;
        if record.state != TaskState::Active {
            return Err(QueueError::TaskNotActive {
                id: task_id.to_string(),
            });
        }
        record.transition(TaskState::Done)?;
        record.completed_at = Some(now);
        record.lease_expires_at = None;
        let queue = record.queue.clone();

        let max_completed = self.config.max_completed;
        let completed = state.completed.entry(queue).or_default();
        completed.push_back(task_id.to_string());
        let mut evicted = Vec::new();
        while completed.len() > max_completed {
            if let Some(old) = completed.pop_front() {
                evicted.push(old);
            }
        }
        for old in evicted {
            state.tasks.remove(&old);
        }

        debug!(parent: self.logger.span(), task_id = %task_id, "任务已完成");
        Ok(())
    }

    async fn fail(&self, task_id: &str, error: &str) -> QueueResult<TaskState> {
        self.ensure_open()?;
        let result = {
            let mut state = self.state.lock().await;
            self.fail_locked(&mut state, task_id, error, Utc::now())?
        };
        if result == TaskState::Retry {
            self.notify.notify_waiters();
        }
        Ok(result)
    }

    async fn recover_orphaned(&self) -> QueueResult<usize> {
        self.ensure_open()?;
        let recovered = {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            let expired: Vec<TaskId> = state
                .tasks
                .values()
                .filter(|task| {
                    task.state == TaskState::Active
                        && task.lease_expires_at.is_some_and(|at| at <= now)
                })
                .map(|task| task.id.clone())
                .collect();

            for id in &expired {
                self.fail_locked(&mut state, id, "lease expired", now)?;
            }
            expired.len()
        };

        if recovered > 0 {
            info!(parent: self.logger.span(), recovered, "已回收租约过期的任务");
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    async fn get_task(&self, task_id: &str) -> QueueResult<Option<TaskRecord>> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        Ok(state.tasks.get(task_id).cloned())
    }

    async fn list_archived(&self, queue: &str) -> QueueResult<Vec<TaskRecord>> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        let mut archived: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|task| task.queue == queue && task.state == TaskState::Archived)
            .cloned()
            .collect();
        archived.sort_by_key(|task| task.last_failed_at);
        Ok(archived)
    }

    async fn queue_stats(&self, queue: &str) -> QueueResult<QueueStats> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        let now = Utc::now();
        let mut stats = QueueStats {
            queue: queue.to_string(),
            ..QueueStats::default()
        };

        for task in state.tasks.values().filter(|task| task.queue == queue) {
            match task.state {
                TaskState::Pending if task.is_eligible(now) => stats.pending += 1,
                TaskState::Pending => stats.scheduled += 1,
                TaskState::Active => stats.active += 1,
                TaskState::Retry => stats.retry += 1,
                TaskState::Archived => stats.archived += 1,
                TaskState::Done => stats.done += 1,
            }
        }
        Ok(stats)
    }

    async fn close(&self) -> QueueResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(parent: self.logger.span(), "内存broker已关闭");
            self.notify.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobqueue_core::models::welcome_email_task;

    fn fast_broker() -> InMemoryBroker {
        InMemoryBroker::new(InMemoryBrokerConfig {
            poll_interval: Duration::from_millis(10),
            retry_policy: RetryPolicy::fixed(Duration::ZERO),
            ..InMemoryBrokerConfig::default()
        })
    }

    fn queues(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test]
    async fn test_enqueue_and_dequeue() {
        let broker = fast_broker();
        let id = broker
            .enqueue(NewTask::new("test", b"{}".to_vec()), EnqueueOptions::default())
            .await
            .unwrap();

        let task = broker
            .dequeue(&queues(&["default"]), Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.state, TaskState::Active);
        assert!(task.lease_expires_at.is_some());

        broker.ack(&id).await.unwrap();
        let stored = broker.get_task(&id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Done);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_dequeue_times_out_when_empty() {
        let broker = fast_broker();
        let started = Instant::now();
        let task = broker
            .dequeue(&queues(&["default"]), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(task.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let broker = Arc::new(InMemoryBroker::new(InMemoryBrokerConfig {
            poll_interval: Duration::from_secs(10),
            ..InMemoryBrokerConfig::default()
        }));
        let consumer = broker.clone();
        let handle = tokio::spawn(async move {
            consumer
                .dequeue(&queues(&["default"]), Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker
            .enqueue(NewTask::new("test", vec![]), EnqueueOptions::default())
            .await
            .unwrap();

        let task = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dequeue should wake up on enqueue")
            .unwrap()
            .unwrap();
        assert!(task.is_some());
    }

    #[tokio::test]
    async fn test_fifo_within_queue() {
        let broker = fast_broker();
        for i in 0..3 {
            broker
                .enqueue(
                    NewTask::new("test", vec![]),
                    EnqueueOptions::default().task_id(format!("t-{i}")),
                )
                .await
                .unwrap();
        }

        for i in 0..3 {
            let task = broker
                .dequeue(&queues(&["default"]), Duration::from_millis(10))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(task.id, format!("t-{i}"));
        }
    }

    #[tokio::test]
    async fn test_retry_then_archive() {
        let broker = fast_broker();
        let task = welcome_email_task(42, "", "").unwrap();
        let id = broker
            .enqueue(task, EnqueueOptions::default().max_retries(2))
            .await
            .unwrap();

        let mut states = Vec::new();
        for _ in 0..3 {
            let task = broker
                .dequeue(&queues(&["default"]), Duration::from_millis(100))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(task.id, id);
            states.push(broker.fail(&id, "smtp down").await.unwrap());
        }

        assert_eq!(
            states,
            vec![TaskState::Retry, TaskState::Retry, TaskState::Archived]
        );
        let archived = broker.list_archived("default").await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].attempt, 2);
        assert_eq!(archived[0].last_error.as_deref(), Some("smtp down"));

        let none = broker
            .dequeue(&queues(&["default"]), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_zero_max_retries_archives_immediately() {
        let broker = fast_broker();
        let id = broker
            .enqueue(NewTask::new("x", vec![]), EnqueueOptions::default().max_retries(0))
            .await
            .unwrap();
        broker
            .dequeue(&queues(&["default"]), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(broker.fail(&id, "boom").await.unwrap(), TaskState::Archived);
        assert_eq!(broker.get_task(&id).await.unwrap().unwrap().attempt, 0);
    }

    #[tokio::test]
    async fn test_delayed_task_not_visible_early() {
        let broker = fast_broker();
        let id = broker
            .enqueue_delayed(
                NewTask::new("x", vec![]),
                Duration::from_millis(150),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let early = broker
            .dequeue(&queues(&["default"]), Duration::from_millis(30))
            .await
            .unwrap();
        assert!(early.is_none());
        assert_eq!(broker.queue_stats("default").await.unwrap().scheduled, 1);

        let task = broker
            .dequeue(&queues(&["default"]), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.id, id);
        assert!(task.not_before.unwrap() <= Utc::now());
    }

    #[tokio::test]
    async fn test_concurrent_dequeue_returns_distinct_tasks() {
        let broker = Arc::new(fast_broker());
        for _ in 0..50 {
            broker
                .enqueue(NewTask::new("x", vec![]), EnqueueOptions::default())
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(task) = broker
                    .dequeue(&queues(&["default"]), Duration::from_millis(20))
                    .await
                    .unwrap()
                {
                    ids.push(task.id);
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 50);
        assert_eq!(all.len(), 50);
    }

    #[tokio::test]
    async fn test_queue_order_is_respected() {
        let broker = fast_broker();
        broker
            .enqueue(NewTask::new("x", vec![]), EnqueueOptions::default().task_id("d1"))
            .await
            .unwrap();
        for id in ["c1", "c2"] {
            broker
                .enqueue(
                    NewTask::new("x", vec![]),
                    EnqueueOptions::default().queue("critical").task_id(id),
                )
                .await
                .unwrap();
        }

        let order = queues(&["critical", "default"]);
        let mut seen = Vec::new();
        for _ in 0..3 {
            let task = broker
                .dequeue(&order, Duration::from_millis(10))
                .await
                .unwrap()
                .unwrap();
            seen.push(task.id);
        }
        assert_eq!(seen, vec!["c1", "c2", "d1"]);
    }

    #[tokio::test]
    async fn test_duplicate_task_id_rejected() {
        let broker = fast_broker();
        let options = EnqueueOptions::default().task_id("unique");
        broker
            .enqueue(NewTask::new("x", vec![]), options.clone())
            .await
            .unwrap();
        let err = broker
            .enqueue(NewTask::new("x", vec![]), options)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::TaskIdConflict { .. }));
    }

    #[tokio::test]
    async fn test_ack_requires_active_task() {
        let broker = fast_broker();
        let id = broker
            .enqueue(NewTask::new("x", vec![]), EnqueueOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            broker.ack(&id).await.unwrap_err(),
            QueueError::TaskNotActive { .. }
        ));
        assert!(matches!(
            broker.fail("missing", "x").await.unwrap_err(),
            QueueError::TaskNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_recover_orphaned_tasks() {
        let broker = InMemoryBroker::new(InMemoryBrokerConfig {
            lease_duration: Duration::from_millis(20),
            poll_interval: Duration::from_millis(10),
            retry_policy: RetryPolicy::fixed(Duration::ZERO),
            ..InMemoryBrokerConfig::default()
        });
        let id = broker
            .enqueue(NewTask::new("x", vec![]), EnqueueOptions::default())
            .await
            .unwrap();
        broker
            .dequeue(&queues(&["default"]), Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(broker.recover_orphaned().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(broker.recover_orphaned().await.unwrap(), 1);

        let task = broker.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Retry);
        assert_eq!(task.attempt, 1);
        assert_eq!(task.last_error.as_deref(), Some("lease expired"));
    }

    #[tokio::test]
    async fn test_task_timeout_extends_lease() {
        let broker = InMemoryBroker::new(InMemoryBrokerConfig {
            lease_duration: Duration::from_millis(20),
            poll_interval: Duration::from_millis(10),
            ..InMemoryBrokerConfig::default()
        });
        broker
            .enqueue(
                NewTask::new("x", vec![]),
                EnqueueOptions::default().timeout(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        let task = broker
            .dequeue(&queues(&["default"]), Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        let lease_left = task.lease_expires_at.unwrap() - Utc::now();
        assert!(lease_left > chrono::Duration::seconds(30));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(broker.recover_orphaned().await.unwrap(), 0);
        broker.ack(&task.id).await.unwrap();
        assert_eq!(
            broker.get_task(&task.id).await.unwrap().unwrap().state,
            TaskState::Done
        );
    }

    #[tokio::test]
    async fn test_completed_retention_cap() {
        let broker = InMemoryBroker::new(InMemoryBrokerConfig {
            max_completed: 2,
            ..InMemoryBrokerConfig::default()
        });
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = broker
                .enqueue(NewTask::new("x", vec![]), EnqueueOptions::default())
                .await
                .unwrap();
            broker
                .dequeue(&queues(&["default"]), Duration::from_millis(10))
                .await
                .unwrap();
            broker.ack(&id).await.unwrap();
            ids.push(id);
        }

        assert!(broker.get_task(&ids[0]).await.unwrap().is_none());
        assert_eq!(broker.queue_stats("default").await.unwrap().done, 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = fast_broker();
        broker.close().await.unwrap();
        broker.close().await.unwrap();

        let err = broker
            .enqueue(NewTask::new("x", vec![]), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(broker
            .dequeue(&queues(&["default"]), Duration::from_millis(10))
            .await
            .unwrap_err()
            .is_transport());
    }
}
