use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use jobqueue_core::{
    models::{StatusChangeNotificationPayload, TASK_TYPE_STATUS_CHANGE_NOTIFICATION},
    Broker, EnqueueOptions, Logger, NewTask, QueueError, QueueResult, QueueStats, TaskId,
    TaskRecord, TaskState,
};
use jobqueue_dispatcher::{default_bindings, Scheduler, TaskTemplate};
use jobqueue_infrastructure::{InMemoryBroker, InMemoryBrokerConfig};
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};

fn broker() -> Arc<InMemoryBroker> {
    Arc::new(InMemoryBroker::new(InMemoryBrokerConfig {
        poll_interval: Duration::from_millis(10),
        ..InMemoryBrokerConfig::default()
    }))
}

async fn drain(broker: &InMemoryBroker, queue: &str) -> Vec<TaskRecord> {
    let queues = vec![queue.to_string()];
    let mut tasks = Vec::new();
    while let Some(task) = broker
        .dequeue(&queues, Duration::from_millis(20))
        .await
        .unwrap()
    {
        tasks.push(task);
    }
    tasks
}

#[tokio::test]
async fn test_hourly_binding_catches_up_once_after_pause() {
    let broker = broker();
    let scheduler = Scheduler::new(broker.clone(), Duration::from_secs(1), Logger::disabled());
    let hourly = default_bindings()
        .into_iter()
        .find(|(cron, _)| *cron == "0 * * * *")
        .map(|(_, template)| template)
        .unwrap();
    scheduler
        .register("0 * * * *", hourly, EnqueueOptions::new())
        .await
        .unwrap();

    let at = |h, m| Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap();

    assert_eq!(scheduler.tick(at(10, 15)).await, 0);
    // 进程在 10:15 到 14:20 之间暂停，错过了 11、12、13、14 点四次触发
    assert_eq!(scheduler.tick(at(14, 20)).await, 1);
    assert_eq!(
        scheduler.bindings().await[0].next_fire(),
        Some(at(15, 0))
    );
    assert_eq!(scheduler.tick(at(14, 40)).await, 0);
    assert_eq!(scheduler.tick(at(15, 0)).await, 1);
    assert_eq!(scheduler.tick(at(15, 0)).await, 0);

    let tasks = drain(&broker, "default").await;
    assert_eq!(tasks.len(), 2);
    for task in tasks {
        assert_eq!(task.task_type, TASK_TYPE_STATUS_CHANGE_NOTIFICATION);
        let payload: StatusChangeNotificationPayload = task.decode_payload().unwrap();
        assert_eq!(payload.changed_by, "system");
    }
}

#[tokio::test]
async fn test_binding_options_applied() {
    let broker = broker();
    let scheduler = Scheduler::new(broker.clone(), Duration::from_secs(1), Logger::disabled());
    scheduler
        .register(
            "*/10 * * * * *",
            TaskTemplate::fixed("report", br#"{"kind":"daily"}"#.to_vec()),
            EnqueueOptions::new().queue("low").max_retries(1),
        )
        .await
        .unwrap();

    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();
    scheduler.tick(t0).await;
    assert_eq!(scheduler.tick(t0 + chrono::Duration::seconds(9)).await, 1);

    let tasks = drain(&broker, "low").await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].max_retries, 1);
    assert_eq!(tasks[0].payload, br#"{"kind":"daily"}"#.to_vec());
}

#[tokio::test]
async fn test_timer_loop_fires_and_stops() {
    let broker = broker();
    let scheduler = Scheduler::new(broker.clone(), Duration::from_millis(100), Logger::disabled());
    scheduler
        .register(
            "* * * * * *",
            TaskTemplate::fixed("tick", b"{}".to_vec()),
            EnqueueOptions::new(),
        )
        .await
        .unwrap();

    scheduler.start().await.unwrap();
    assert!(scheduler.start().await.is_err());
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    scheduler.stop().await.unwrap();

    let fired = broker.queue_stats("default").await.unwrap().pending;
    assert!((1..=3).contains(&fired), "fired {fired} times");

    // 停止后不再触发
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(broker.queue_stats("default").await.unwrap().pending, fired);

    // 停止后可以再次注册
    scheduler
        .register("0 * * * *", TaskTemplate::fixed("t", b"{}".to_vec()), EnqueueOptions::new())
        .await
        .unwrap();
}

/// 入队总是失败的Broker，`stall` 非零时先阻塞再返回
#[derive(Default)]
struct UnreachableBroker {
    attempts: AtomicUsize,
    stall: Duration,
}

#[async_trait]
impl Broker for UnreachableBroker {
    async fn enqueue(&self, _task: NewTask, _options: EnqueueOptions) -> QueueResult<TaskId> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.stall.is_zero() {
            tokio::time::sleep(self.stall).await;
        }
        Err(QueueError::transport("connection refused"))
    }

    async fn dequeue(
        &self,
        _queues: &[String],
        _timeout: Duration,
    ) -> QueueResult<Option<TaskRecord>> {
        Ok(None)
    }

    async fn ack(&self, task_id: &str) -> QueueResult<()> {
        Err(QueueError::TaskNotFound { id: task_id.to_string() })
    }

    async fn fail(&self, task_id: &str, _error: &str) -> QueueResult<TaskState> {
        Err(QueueError::TaskNotFound { id: task_id.to_string() })
    }

    async fn recover_orphaned(&self) -> QueueResult<usize> {
        Ok(0)
    }

    async fn get_task(&self, _task_id: &str) -> QueueResult<Option<TaskRecord>> {
        Ok(None)
    }

    async fn list_archived(&self, _queue: &str) -> QueueResult<Vec<TaskRecord>> {
        Ok(Vec::new())
    }

    async fn queue_stats(&self, queue: &str) -> QueueResult<QueueStats> {
        Ok(QueueStats {
            queue: queue.to_string(),
            ..QueueStats::default()
        })
    }

    async fn close(&self) -> QueueResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_enqueue_failure_does_not_refire() {
    let broker = Arc::new(UnreachableBroker::default());
    let scheduler = Scheduler::new(broker.clone(), Duration::from_secs(1), Logger::disabled());
    scheduler
        .register("0 * * * *", TaskTemplate::fixed("t", b"{}".to_vec()), EnqueueOptions::new())
        .await
        .unwrap();

    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
    scheduler.tick(t0).await;
    let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 5).unwrap();
    assert_eq!(scheduler.tick(t1).await, 0);
    assert_eq!(scheduler.tick(t1).await, 0);
    assert_eq!(broker.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bindings_readable_while_enqueue_stalls() {
    let broker = Arc::new(UnreachableBroker {
        stall: Duration::from_millis(500),
        ..UnreachableBroker::default()
    });
    let scheduler = Arc::new(Scheduler::new(
        broker.clone(),
        Duration::from_secs(1),
        Logger::disabled(),
    ));
    scheduler
        .register("0 * * * *", TaskTemplate::fixed("t", b"{}".to_vec()), EnqueueOptions::new())
        .await
        .unwrap();
    scheduler
        .tick(Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap())
        .await;

    let firing = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler
                .tick(Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 5).unwrap())
                .await
        })
    };
    while broker.attempts.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let count = tokio::time::timeout(Duration::from_millis(100), scheduler.binding_count())
        .await
        .expect("binding_count blocked by an in-flight enqueue");
    assert_eq!(count, 1);
    assert_eq!(
        scheduler.bindings().await[0].next_fire(),
        Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap())
    );
    assert_eq!(firing.await.unwrap(), 0);
}

/// 只统计 `jobqueue_tasks_enqueued_total` 的指标记录器
#[derive(Default)]
struct EnqueueCountingRecorder {
    enqueued: Arc<AtomicU64>,
}

impl Recorder for EnqueueCountingRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        if key.name() == "jobqueue_tasks_enqueued_total" {
            Counter::from_arc(self.enqueued.clone())
        } else {
            Counter::noop()
        }
    }

    fn register_gauge(&self, _key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::noop()
    }

    fn register_histogram(&self, _key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}

#[test]
fn test_cron_fire_counts_enqueue_once() {
    let recorder = EnqueueCountingRecorder::default();
    let enqueued = recorder.enqueued.clone();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let fired = metrics::with_local_recorder(&recorder, || {
        runtime.block_on(async {
            let scheduler = Scheduler::new(broker(), Duration::from_secs(1), Logger::disabled());
            scheduler
                .register(
                    "0 * * * *",
                    TaskTemplate::fixed("report", b"{}".to_vec()),
                    EnqueueOptions::new(),
                )
                .await
                .unwrap();
            scheduler
                .tick(Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap())
                .await;
            scheduler
                .tick(Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap())
                .await
        })
    });

    assert_eq!(fired, 1);
    assert_eq!(enqueued.load(Ordering::SeqCst), 1);
}
