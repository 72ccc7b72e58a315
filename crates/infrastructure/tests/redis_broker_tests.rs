//! Redis broker集成测试
//!
//! 需要Docker，默认忽略：`cargo test -p jobqueue-infrastructure -- --ignored`

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use jobqueue_core::{
    models::welcome_email_task, Broker, EnqueueOptions, Logger, NewTask, QueueError, RedisConfig,
    RetryPolicy, TaskState,
};
use jobqueue_infrastructure::{RedisBroker, RedisBrokerConfig};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

struct RedisTestSetup {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    port: u16,
}

impl RedisTestSetup {
    async fn new() -> Result<Self> {
        let container = Redis::default().with_tag("7-alpine").start().await?;
        let port = container.get_host_port_ipv4(6379).await?;
        Ok(Self { container, port })
    }

    async fn broker(&self, prefix: &str) -> Result<RedisBroker> {
        self.broker_with_lease(prefix, Duration::from_secs(30)).await
    }

    async fn broker_with_lease(&self, prefix: &str, lease: Duration) -> Result<RedisBroker> {
        let config = RedisBrokerConfig {
            redis: RedisConfig {
                host: "127.0.0.1".to_string(),
                port: self.port,
                key_prefix: prefix.to_string(),
                ..RedisConfig::default()
            },
            lease_duration: lease,
            poll_interval: Duration::from_millis(20),
            max_completed: 10,
            retry_policy: RetryPolicy::fixed(Duration::ZERO),
        };
        Ok(RedisBroker::connect(config, Logger::disabled()).await?)
    }

    async fn raw_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let client = redis::Client::open(format!("redis://127.0.0.1:{}", self.port))?;
        Ok(client.get_multiplexed_async_connection().await?)
    }
}

fn queues(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_enqueue_dequeue_ack() -> Result<()> {
    let setup = RedisTestSetup::new().await?;
    let broker = setup.broker("basic").await?;

    let id = broker
        .enqueue(NewTask::new("test", b"{}".to_vec()), EnqueueOptions::default())
        .await?;
    let task = broker
        .dequeue(&queues(&["default"]), Duration::from_secs(1))
        .await?
        .expect("task should be available");
    assert_eq!(task.id, id);
    assert_eq!(task.state, TaskState::Active);

    broker.ack(&id).await?;
    let stored = broker.get_task(&id).await?.expect("task record kept");
    assert_eq!(stored.state, TaskState::Done);
    assert_eq!(broker.queue_stats("default").await?.done, 1);

    assert!(matches!(
        broker.ack(&id).await.unwrap_err(),
        QueueError::TaskNotActive { .. }
    ));
    Ok(())
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_retry_then_archive() -> Result<()> {
    let setup = RedisTestSetup::new().await?;
    let broker = setup.broker("retry").await?;

    let id = broker
        .enqueue(
            welcome_email_task(42, "", "")?,
            EnqueueOptions::default().max_retries(2),
        )
        .await?;

    let mut states = Vec::new();
    for _ in 0..3 {
        let task = broker
            .dequeue(&queues(&["default"]), Duration::from_secs(1))
            .await?
            .expect("task should be redelivered");
        states.push(broker.fail(&task.id, "smtp down").await?);
    }
    assert_eq!(
        states,
        vec![TaskState::Retry, TaskState::Retry, TaskState::Archived]
    );

    let archived = broker.list_archived("default").await?;
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].id, id);
    assert_eq!(archived[0].attempt, 2);
    Ok(())
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_delayed_and_priority() -> Result<()> {
    let setup = RedisTestSetup::new().await?;
    let broker = setup.broker("priority").await?;

    broker
        .enqueue_delayed(
            NewTask::new("late", vec![]),
            Duration::from_millis(300),
            EnqueueOptions::default().task_id("late"),
        )
        .await?;
    broker
        .enqueue(NewTask::new("x", vec![]), EnqueueOptions::default().task_id("d1"))
        .await?;
    for id in ["c1", "c2"] {
        broker
            .enqueue(
                NewTask::new("x", vec![]),
                EnqueueOptions::default().queue("critical").task_id(id),
            )
            .await?;
    }

    let order = queues(&["critical", "default"]);
    let mut seen = Vec::new();
    for _ in 0..3 {
        let task = broker
            .dequeue(&order, Duration::from_millis(100))
            .await?
            .expect("task");
        seen.push(task.id);
    }
    assert_eq!(seen, vec!["c1", "c2", "d1"]);

    let late = broker
        .dequeue(&order, Duration::from_secs(2))
        .await?
        .expect("delayed task becomes visible");
    assert_eq!(late.id, "late");
    Ok(())
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_concurrent_dequeue_and_conflict() -> Result<()> {
    let setup = RedisTestSetup::new().await?;
    let broker = Arc::new(setup.broker("concurrent").await?);

    for i in 0..30 {
        broker
            .enqueue(
                NewTask::new("x", vec![]),
                EnqueueOptions::default().task_id(format!("t-{i}")),
            )
            .await?;
    }
    assert!(matches!(
        broker
            .enqueue(NewTask::new("x", vec![]), EnqueueOptions::default().task_id("t-0"))
            .await
            .unwrap_err(),
        QueueError::TaskIdConflict { .. }
    ));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let broker = broker.clone();
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Ok(Some(task)) = broker
                .dequeue(&queues(&["default"]), Duration::from_millis(50))
                .await
            {
                ids.push(task.id);
            }
            ids
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await?);
    }
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(total, 30);
    assert_eq!(all.len(), 30);

    broker.close().await?;
    broker.close().await?;
    assert!(broker
        .dequeue(&queues(&["default"]), Duration::from_millis(10))
        .await
        .unwrap_err()
        .is_transport());
    Ok(())
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_lease_covers_timeout_and_skips_corrupt_records() -> Result<()> {
    let setup = RedisTestSetup::new().await?;
    let broker = setup
        .broker_with_lease("lease", Duration::from_millis(100))
        .await?;

    broker
        .enqueue(
            NewTask::new("slow", vec![]),
            EnqueueOptions::default()
                .task_id("slow")
                .timeout(Duration::from_secs(5)),
        )
        .await?;
    broker
        .enqueue(NewTask::new("crashed", vec![]), EnqueueOptions::default().task_id("crashed"))
        .await?;

    let slow = broker
        .dequeue(&queues(&["default"]), Duration::from_secs(1))
        .await?
        .expect("slow task available");
    assert_eq!(slow.id, "slow");
    let lease_left = slow.lease_expires_at.expect("lease set") - chrono::Utc::now();
    assert!(lease_left > chrono::Duration::seconds(30));
    broker
        .dequeue(&queues(&["default"]), Duration::from_secs(1))
        .await?
        .expect("crashed task available");

    // 一条无法解码的活跃记录，租约早已过期
    let mut conn = setup.raw_connection().await?;
    redis::cmd("HSET")
        .arg("lease:t:corrupt")
        .arg("msg")
        .arg("not json")
        .arg("state")
        .arg("active")
        .query_async::<()>(&mut conn)
        .await?;
    redis::cmd("LPUSH")
        .arg("lease:default:active")
        .arg("corrupt")
        .query_async::<()>(&mut conn)
        .await?;
    redis::cmd("ZADD")
        .arg("lease:default:lease")
        .arg(0)
        .arg("corrupt")
        .query_async::<()>(&mut conn)
        .await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.recover_orphaned().await?, 1);

    let crashed = broker.get_task("crashed").await?.expect("record kept");
    assert_eq!(crashed.state, TaskState::Retry);
    assert_eq!(crashed.last_error.as_deref(), Some("lease expired"));

    broker.ack("slow").await?;
    let slow = broker.get_task("slow").await?.expect("record kept");
    assert_eq!(slow.state, TaskState::Done);
    assert_eq!(slow.attempt, 0);
    Ok(())
}
