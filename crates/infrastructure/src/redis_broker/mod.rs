//! Redis Broker模块
//!
//! 基于Redis list/zset 的持久化Broker：状态转换全部通过Lua脚本原子完成，
//! 多个进程中的Worker可以共享同一组队列。

pub mod connection_manager;
pub mod keys;
pub mod scripts;

pub use connection_manager::{RedisConnectionManager, TransportRetry};
pub use keys::RedisKeys;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use jobqueue_core::{
    models::{
        time_after, EnqueueOptions, NewTask, QueueStats, TaskId, TaskRecord, TaskState,
        LEASE_GRACE,
    },
    Broker, BrokerConfig, Logger, QueueError, QueueMetrics, QueueResult, RedisConfig, RetryPolicy,
};

/// Redis Broker配置
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    pub redis: RedisConfig,
    pub lease_duration: Duration,
    /// 阻塞出队时的轮询间隔
    pub poll_interval: Duration,
    pub max_completed: usize,
    pub retry_policy: RetryPolicy,
}

impl RedisBrokerConfig {
    pub fn from_config(config: &BrokerConfig, retry_policy: &RetryPolicy) -> Self {
        Self {
            redis: config.redis.clone(),
            lease_duration: Duration::from_secs(config.lease_seconds),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_completed: config.max_completed,
            retry_policy: retry_policy.clone(),
        }
    }
}

/// Redis Broker
pub struct RedisBroker {
    connection: RedisConnectionManager,
    keys: RedisKeys,
    config: RedisBrokerConfig,
    metrics: QueueMetrics,
    logger: Logger,
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

impl RedisBroker {
    pub async fn connect(config: RedisBrokerConfig, logger: Logger) -> QueueResult<Self> {
        let logger = logger.component("redis_broker");
        let connection = RedisConnectionManager::connect(&config.redis, logger.clone()).await?;
        info!(
            parent: logger.span(),
            host = %config.redis.host,
            port = config.redis.port,
            prefix = %config.redis.key_prefix,
            "Redis broker已连接"
        );

        Ok(Self {
            connection,
            keys: RedisKeys::new(config.redis.key_prefix.clone()),
            config,
            metrics: QueueMetrics::new(),
            logger,
        })
    }

    fn decode(msg: &str) -> QueueResult<TaskRecord> {
        Ok(serde_json::from_str(msg)?)
    }

    async fn try_dequeue_from(&self, queue: &str) -> QueueResult<Option<TaskRecord>> {
        let now = Utc::now();
        let base_lease = self.config.lease_duration;

        let pending = self.keys.pending(queue);
        let active = self.keys.active(queue);
        let scheduled = self.keys.scheduled(queue);
        let retry = self.keys.retry(queue);
        let lease = self.keys.lease(queue);
        let task_prefix = self.keys.task_prefix();
        let (pending, active, scheduled, retry, lease, task_prefix) = (
            pending.as_str(),
            active.as_str(),
            scheduled.as_str(),
            retry.as_str(),
            lease.as_str(),
            task_prefix.as_str(),
        );

        let msg: Option<String> = self
            .connection
            .with_retry("dequeue", |mut conn| async move {
                scripts::DEQUEUE
                    .key(pending)
                    .key(active)
                    .key(scheduled)
                    .key(retry)
                    .key(lease)
                    .arg(millis(now))
                    .arg(base_lease.as_millis() as u64)
                    .arg(task_prefix)
                    .arg(LEASE_GRACE.as_millis() as u64)
                    .invoke_async::<Option<String>>(&mut conn)
                    .await
            })
            .await?;

        match msg {
            Some(msg) => {
                let mut record = Self::decode(&msg)?;
                record.state = TaskState::Active;
                let lease = record.lease_duration(base_lease);
                record.lease_expires_at = Some(time_after(now, lease));
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// 读取任务记录，`state` 以hash中的字段为准
    async fn load(&self, task_id: &str) -> QueueResult<Option<TaskRecord>> {
        let task_key = self.keys.task(task_id);
        let task_key = task_key.as_str();
        let (msg, state): (Option<String>, Option<String>) = self
            .connection
            .with_retry("get_task", |mut conn| async move {
                redis::cmd("HMGET")
                    .arg(task_key)
                    .arg("msg")
                    .arg("state")
                    .query_async::<(Option<String>, Option<String>)>(&mut conn)
                    .await
            })
            .await?;

        let Some(msg) = msg else {
            return Ok(None);
        };
        let mut record = Self::decode(&msg)?;
        if let Some(state) = state {
            record.state = state.parse()?;
        }
        if record.state == TaskState::Active {
            let lease = self.keys.lease(&record.queue);
            let lease = lease.as_str();
            let id = record.id.as_str();
            let score: Option<i64> = self
                .connection
                .with_retry("get_task", |mut conn| async move {
                    redis::cmd("ZSCORE")
                        .arg(lease)
                        .arg(id)
                        .query_async::<Option<i64>>(&mut conn)
                        .await
                })
                .await?;
            record.lease_expires_at = score.and_then(from_millis);
        }
        Ok(Some(record))
    }

    async fn load_required(&self, task_id: &str) -> QueueResult<TaskRecord> {
        self.load(task_id)
            .await?
            .ok_or_else(|| QueueError::TaskNotFound {
                id: task_id.to_string(),
            })
    }

    async fn known_queues(&self) -> QueueResult<Vec<String>> {
        let queues_key = self.keys.queues();
        let queues_key = queues_key.as_str();
        self.connection
            .with_retry("list_queues", |mut conn| async move {
                redis::cmd("SMEMBERS")
                    .arg(queues_key)
                    .query_async::<Vec<String>>(&mut conn)
                    .await
            })
            .await
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, task: NewTask, options: EnqueueOptions) -> QueueResult<TaskId> {
        if options.queue.trim().is_empty() {
            return Err(QueueError::configuration("队列名称不能为空"));
        }

        let now = Utc::now();
        let id = options
            .task_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let record = TaskRecord::pending(id.clone(), task, &options, now);
        let msg = serde_json::to_string(&record)?;
        let process_at_ms = record
            .not_before
            .filter(|at| *at > now)
            .map(millis)
            .unwrap_or(0);

        let task_key = self.keys.task(&id);
        let pending = self.keys.pending(&record.queue);
        let scheduled = self.keys.scheduled(&record.queue);
        let queues_key = self.keys.queues();
        let (task_key, pending, scheduled, queues_key, msg_ref, id_ref, queue) = (
            task_key.as_str(),
            pending.as_str(),
            scheduled.as_str(),
            queues_key.as_str(),
            msg.as_str(),
            id.as_str(),
            record.queue.as_str(),
        );

        let inserted: i64 = self
            .connection
            .with_retry("enqueue", |mut conn| async move {
                scripts::ENQUEUE
                    .key(task_key)
                    .key(pending)
                    .key(scheduled)
                    .key(queues_key)
                    .arg(msg_ref)
                    .arg(id_ref)
                    .arg(process_at_ms)
                    .arg(queue)
                    .invoke_async::<i64>(&mut conn)
                    .await
            })
            .await?;

        if inserted == 0 {
            return Err(QueueError::TaskIdConflict { id });
        }

        self.metrics.record_enqueued(&record.queue, &record.task_type);
        debug!(
            parent: self.logger.span(),
            task_id = %id,
            task_type = %record.task_type,
            queue = %record.queue,
            delayed = process_at_ms > 0,
            "任务已入队"
        );
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
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            for queue in queues {
                if let Some(record) = self.try_dequeue_from(queue).await? {
                    return Ok(Some(record));
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(self.config.poll_interval)).await;
        }
    }

    async fn ack(&self, task_id: &str) -> QueueResult<()> {
        let mut record = self.load_required(task_id).await?;
        if record.state != TaskState::Active {
            return Err(QueueError::TaskNotActive {
                id: task_id.to_string(),
            });
        }
        let now = Utc::now();
        record.transition(TaskState::Done)?;
        record.completed_at = Some(now);
        record.lease_expires_at = None;
        let msg = serde_json::to_string(&record)?;

        let active = self.keys.active(&record.queue);
        let lease = self.keys.lease(&record.queue);
        let task_key = self.keys.task(task_id);
        let completed = self.keys.completed(&record.queue);
        let task_prefix = self.keys.task_prefix();
        let max_completed = self.config.max_completed;
        let (active, lease, task_key, completed, task_prefix, msg_ref) = (
            active.as_str(),
            lease.as_str(),
            task_key.as_str(),
            completed.as_str(),
            task_prefix.as_str(),
            msg.as_str(),
        );

        let acked: i64 = self
            .connection
            .with_retry("ack", |mut conn| async move {
                scripts::ACK
                    .key(active)
                    .key(lease)
                    .key(task_key)
                    .key(completed)
                    .arg(task_id)
                    .arg(msg_ref)
                    .arg(millis(now))
                    .arg(max_completed)
                    .arg(task_prefix)
                    .invoke_async::<i64>(&mut conn)
                    .await
            })
            .await?;

        if acked == 0 {
            return Err(QueueError::TaskNotActive {
                id: task_id.to_string(),
            });
        }
        debug!(parent: self.logger.span(), task_id = %task_id, "任务已完成");
        Ok(())
    }

    async fn fail(&self, task_id: &str, error: &str) -> QueueResult<TaskState> {
        let mut record = self.load_required(task_id).await?;
        if record.state != TaskState::Active {
            return Err(QueueError::TaskNotActive {
                id: task_id.to_string(),
            });
        }

        let now = Utc::now();
        record.last_error = Some(error.to_string());
        record.last_failed_at = Some(now);
        record.lease_expires_at = None;

        let (target, score) = if record.can_retry() {
            record.attempt += 1;
            let not_before = time_after(now, self.config.retry_policy.delay_for(record.attempt));
            record.not_before = Some(not_before);
            record.transition(TaskState::Retry)?;
            (self.keys.retry(&record.queue), millis(not_before))
        } else {
            record.transition(TaskState::Archived)?;
            (self.keys.archived(&record.queue), millis(now))
        };
        let msg = serde_json::to_string(&record)?;

        let active = self.keys.active(&record.queue);
        let lease = self.keys.lease(&record.queue);
        let task_key = self.keys.task(task_id);
        let (active, lease, task_key, target, msg_ref, state) = (
            active.as_str(),
            lease.as_str(),
            task_key.as_str(),
            target.as_str(),
            msg.as_str(),
            record.state.as_str(),
        );

        let failed: i64 = self
            .connection
            .with_retry("fail", |mut conn| async move {
                scripts::FAIL
                    .key(active)
                    .key(lease)
                    .key(task_key)
                    .key(target)
                    .arg(task_id)
                    .arg(msg_ref)
                    .arg(state)
                    .arg(score)
                    .invoke_async::<i64>(&mut conn)
                    .await
            })
            .await?;

        if failed == 0 {
            return Err(QueueError::TaskNotActive {
                id: task_id.to_string(),
            });
        }

        match record.state {
            TaskState::Retry => {
                self.metrics.record_retried(&record.queue);
                debug!(
                    parent: self.logger.span(),
                    task_id = %task_id,
                    attempt = record.attempt,
                    "任务进入重试"
                );
            }
            _ => {
                self.metrics.record_archived(&record.queue);
                warn!(
                    parent: self.logger.span(),
                    task_id = %task_id,
                    attempt = record.attempt,
                    error = %error,
                    "任务重试次数耗尽，已归档"
                );
            }
        }
        Ok(record.state)
    }

    async fn recover_orphaned(&self) -> QueueResult<usize> {
        let now_ms = millis(Utc::now());
        let mut recovered = 0;

        for queue in self.known_queues().await? {
            let lease = self.keys.lease(&queue);
            let lease = lease.as_str();
            let expired: Vec<String> = self
                .connection
                .with_retry("recover_orphaned", |mut conn| async move {
                    redis::cmd("ZRANGEBYSCORE")
                        .arg(lease)
                        .arg("-inf")
                        .arg(now_ms)
                        .query_async::<Vec<String>>(&mut conn)
                        .await
                })
                .await?;

            for id in expired {
                match self.fail(&id, "lease expired").await {
                    Ok(_) => recovered += 1,
                    // 与ack/fail竞争时，对方已经处理完毕
                    Err(QueueError::TaskNotActive { .. }) | Err(QueueError::TaskNotFound { .. }) => {}
                    Err(QueueError::Serialization(e)) => {
                        warn!(
                            parent: self.logger.span(),
                            task_id = %id,
                            queue = %queue,
                            error = %e,
                            "任务记录无法解码，跳过回收"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if recovered > 0 {
            info!(parent: self.logger.span(), recovered, "已回收租约过期的任务");
        }
        Ok(recovered)
    }

    async fn get_task(&self, task_id: &str) -> QueueResult<Option<TaskRecord>> {
        self.load(task_id).await
    }

    async fn list_archived(&self, queue: &str) -> QueueResult<Vec<TaskRecord>> {
        let archived = self.keys.archived(queue);
        let archived = archived.as_str();
        let ids: Vec<String> = self
            .connection
            .with_retry("list_archived", |mut conn| async move {
                redis::cmd("ZRANGE")
                    .arg(archived)
                    .arg(0)
                    .arg(-1)
                    .query_async::<Vec<String>>(&mut conn)
                    .await
            })
            .await?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.load(&id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn queue_stats(&self, queue: &str) -> QueueResult<QueueStats> {
        let pending = self.keys.pending(queue);
        let scheduled = self.keys.scheduled(queue);
        let active = self.keys.active(queue);
        let retry = self.keys.retry(queue);
        let archived = self.keys.archived(queue);
        let completed = self.keys.completed(queue);
        let (pending, scheduled, active, retry, archived, completed) = (
            pending.as_str(),
            scheduled.as_str(),
            active.as_str(),
            retry.as_str(),
            archived.as_str(),
            completed.as_str(),
        );

        let (pending, scheduled, active, retry, archived, done): (
            usize,
            usize,
            usize,
            usize,
            usize,
            usize,
        ) = self
            .connection
            .with_retry("queue_stats", |mut conn| async move {
                redis::pipe()
                    .cmd("LLEN")
                    .arg(pending)
                    .cmd("ZCARD")
                    .arg(scheduled)
                    .cmd("LLEN")
                    .arg(active)
                    .cmd("ZCARD")
                    .arg(retry)
                    .cmd("ZCARD")
                    .arg(archived)
                    .cmd("ZCARD")
                    .arg(completed)
                    .query_async::<(usize, usize, usize, usize, usize, usize)>(&mut conn)
                    .await
            })
            .await?;

        Ok(QueueStats {
            queue: queue.to_string(),
            pending,
            scheduled,
            active,
            retry,
            archived,
            done,
        })
    }

    async fn close(&self) -> QueueResult<()> {
        if self.connection.close().await {
            info!(parent: self.logger.span(), "Redis broker已关闭");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_round_trip_precision() {
        let now = Utc::now();
        let back = from_millis(millis(now)).unwrap();
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_config_from_broker_config() {
        let broker = BrokerConfig {
            lease_seconds: 60,
            poll_interval_ms: 250,
            ..BrokerConfig::default()
        };
        let config = RedisBrokerConfig::from_config(&broker, &RetryPolicy::default());
        assert_eq!(config.lease_duration, Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.redis.key_prefix, "jobqueue");
    }
}
