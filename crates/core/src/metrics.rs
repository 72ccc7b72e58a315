//! 任务队列指标
//!
//! 基于 `metrics` crate 的门面，未安装exporter时所有记录都是空操作。

use metrics::{counter, gauge, histogram};

/// 任务队列指标收集器
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn new() -> Self {
        Self
    }

    pub fn record_enqueued(&self, queue: &str, task_type: &str) {
        counter!("jobqueue_tasks_enqueued_total", "queue" => queue.to_string(), "type" => task_type.to_string())
            .increment(1);
    }

    pub fn record_processed(&self, queue: &str, task_type: &str, duration_seconds: f64) {
        counter!("jobqueue_tasks_processed_total", "queue" => queue.to_string(), "type" => task_type.to_string())
            .increment(1);
        histogram!("jobqueue_task_duration_seconds", "type" => task_type.to_string())
            .record(duration_seconds);
    }

    pub fn record_failed(&self, queue: &str, task_type: &str, kind: &str) {
        counter!(
            "jobqueue_tasks_failed_total",
            "queue" => queue.to_string(),
            "type" => task_type.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    pub fn record_retried(&self, queue: &str) {
        counter!("jobqueue_tasks_retried_total", "queue" => queue.to_string()).increment(1);
    }

    pub fn record_archived(&self, queue: &str) {
        counter!("jobqueue_tasks_archived_total", "queue" => queue.to_string()).increment(1);
    }

    pub fn record_transport_error(&self, operation: &'static str) {
        counter!("jobqueue_transport_errors_total", "operation" => operation).increment(1);
    }

    pub fn record_cron_fire(&self, task_type: &str) {
        counter!("jobqueue_cron_fires_total", "type" => task_type.to_string()).increment(1);
    }

    pub fn worker_busy(&self) {
        gauge!("jobqueue_busy_workers").increment(1.0);
    }

    pub fn worker_idle(&self) {
        gauge!("jobqueue_busy_workers").decrement(1.0);
    }
}
