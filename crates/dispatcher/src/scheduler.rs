use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use jobqueue_core::{
    models::{
        data_cleanup_task, status_change_notification_task, TASK_TYPE_DATA_CLEANUP,
        TASK_TYPE_STATUS_CHANGE_NOTIFICATION,
    },
    Broker, CronBindingConfig, EnqueueOptions, Logger, NewTask, QueueError, QueueMetrics,
    QueueResult, SchedulerConfig,
};

use crate::cron_utils::CronScheduler;

type PayloadGenerator = Arc<dyn Fn() -> QueueResult<Vec<u8>> + Send + Sync>;

/// 任务模板：任务类型加载荷生成器
///
/// 每次触发都调用生成器得到一份新的载荷。
#[derive(Clone)]
pub struct TaskTemplate {
    task_type: String,
    generator: PayloadGenerator,
}

impl fmt::Debug for TaskTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTemplate")
            .field("task_type", &self.task_type)
            .finish_non_exhaustive()
    }
}

impl TaskTemplate {
    pub fn new<F>(task_type: impl Into<String>, generator: F) -> Self
    where
        F: Fn() -> QueueResult<Vec<u8>> + Send + Sync + 'static,
    {
        Self {
            task_type: task_type.into(),
            generator: Arc::new(generator),
        }
    }

    /// 由任务构造函数生成模板，例如 `data_cleanup_task`
    pub fn from_builder<F>(task_type: impl Into<String>, builder: F) -> Self
    where
        F: Fn() -> QueueResult<NewTask> + Send + Sync + 'static,
    {
        Self::new(task_type, move || builder().map(|task| task.payload))
    }

    /// 每次触发都使用同一份载荷
    pub fn fixed(task_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(task_type, move || Ok(payload.clone()))
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn materialize(&self) -> QueueResult<NewTask> {
        let payload = (self.generator)()?;
        Ok(NewTask::new(self.task_type.clone(), payload))
    }
}

/// CRON表达式与任务模板的绑定
#[derive(Debug, Clone)]
pub struct CronBinding {
    pub id: String,
    schedule: CronScheduler,
    template: TaskTemplate,
    options: EnqueueOptions,
    next_fire: Option<DateTime<Utc>>,
}

impl CronBinding {
    pub fn expression(&self) -> &str {
        self.schedule.expression()
    }

    pub fn task_type(&self) -> &str {
        self.template.task_type()
    }

    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.next_fire
    }
}

/// 内置的默认绑定
///
/// - `30 3 * * *`：每天03:30清理30天前的日志
/// - `0 * * * *`：每小时发送一次由 `system` 发起的状态变更通知
pub fn default_bindings() -> Vec<(&'static str, TaskTemplate)> {
    vec![
        (
            "30 3 * * *",
            TaskTemplate::from_builder(TASK_TYPE_DATA_CLEANUP, || {
                data_cleanup_task("logs", 30)
            }),
        ),
        (
            "0 * * * *",
            TaskTemplate::from_builder(TASK_TYPE_STATUS_CHANGE_NOTIFICATION, || {
                status_change_notification_task(0, "", "", "", "", "system")
            }),
        ),
    ]
}

/// 把配置文件中的绑定转换为模板和入队选项
pub fn template_from_config(
    binding: &CronBindingConfig,
) -> QueueResult<(TaskTemplate, EnqueueOptions)> {
    let payload = serde_json::to_vec(&binding.payload)?;
    let options = EnqueueOptions::new()
        .queue(binding.queue.clone())
        .max_retries(binding.max_retries);
    Ok((TaskTemplate::fixed(binding.task_type.clone(), payload), options))
}

struct SchedulerInner {
    broker: Arc<dyn Broker>,
    bindings: Mutex<Vec<CronBinding>>,
    logger: Logger,
    metrics: QueueMetrics,
}

/// CRON调度器
///
/// 单个定时循环按 `tick_interval` 检查所有绑定。每个绑定的下次触发时间
/// 总是相对于当前墙钟时间计算，进程暂停后恢复时每个绑定最多补发一次。
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    tick_interval: Duration,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(broker: Arc<dyn Broker>, tick_interval: Duration, logger: Logger) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                broker,
                bindings: Mutex::new(Vec::new()),
                logger: logger.component("scheduler"),
                metrics: QueueMetrics::new(),
            }),
            tick_interval,
            running: AtomicBool::new(false),
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    pub fn from_config(broker: Arc<dyn Broker>, config: &SchedulerConfig, logger: Logger) -> Self {
        Self::new(
            broker,
            Duration::from_millis(config.tick_interval_ms),
            logger,
        )
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 注册一个绑定，返回绑定ID
    ///
    /// 表达式无效时返回 [`QueueError::InvalidCron`]，不影响其他绑定。
    /// 调度器运行期间不允许注册。
    pub async fn register(
        &self,
        cron_expr: &str,
        template: TaskTemplate,
        options: EnqueueOptions,
    ) -> QueueResult<String> {
        if self.is_running() {
            return Err(QueueError::configuration("调度器运行期间不能注册CRON绑定"));
        }
        let schedule = CronScheduler::new(cron_expr)?;
        let id = Uuid::new_v4().to_string();

        debug!(
            parent: self.inner.logger.span(),
            binding_id = %id,
            cron = %cron_expr,
            task_type = %template.task_type(),
            frequency = %schedule.get_frequency_description(),
            "注册CRON绑定"
        );

        self.inner.bindings.lock().await.push(CronBinding {
            id: id.clone(),
            schedule,
            template,
            options,
            next_fire: None,
        });
        Ok(id)
    }

    /// 按配置注册默认绑定和自定义绑定
    ///
    /// 无效的绑定只记录警告并跳过，返回成功注册的数量。
    pub async fn register_from_config(&self, config: &SchedulerConfig) -> usize {
        let mut candidates = Vec::new();
        if config.default_bindings {
            for (cron, template) in default_bindings() {
                candidates.push((cron.to_string(), Ok((template, EnqueueOptions::new()))));
            }
        }
        for binding in &config.bindings {
            candidates.push((binding.cron.clone(), template_from_config(binding)));
        }

        let mut registered = 0;
        for (cron, prepared) in candidates {
            let result = match prepared {
                Ok((template, options)) => self.register(&cron, template, options).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => registered += 1,
                Err(e) => {
                    warn!(parent: self.inner.logger.span(), cron = %cron, error = %e, "CRON绑定注册失败，已跳过")
                }
            }
        }
        registered
    }

    pub async fn binding_count(&self) -> usize {
        self.inner.bindings.lock().await.len()
    }

    /// 当前绑定的快照
    pub async fn bindings(&self) -> Vec<CronBinding> {
        self.inner.bindings.lock().await.clone()
    }

    /// 启动定时循环，立即返回
    pub async fn start(&self) -> QueueResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(QueueError::Internal("调度器已在运行".to_string()));
        }
        self.stop_tx.send_replace(false);

        let now = Utc::now();
        let count = {
            let mut bindings = self.inner.bindings.lock().await;
            for binding in bindings.iter_mut() {
                binding.next_fire = binding.schedule.next_execution_time(now);
            }
            bindings.len()
        };

        let inner = Arc::clone(&self.inner);
        let stop_rx = self.stop_tx.subscribe();
        let span = self.inner.logger.span().clone();
        *self.handle.lock().await = Some(tokio::spawn(
            run_timer_loop(inner, self.tick_interval, stop_rx).instrument(span),
        ));

        info!(
            parent: self.inner.logger.span(),
            bindings = count,
            tick_interval = ?self.tick_interval,
            "调度器已启动"
        );
        Ok(())
    }

    /// 停止定时循环，等待正在进行的触发完成后返回
    pub async fn stop(&self) -> QueueResult<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_tx.send_replace(true);

        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!(parent: self.inner.logger.span(), error = %e, "调度循环异常退出");
            }
        }
        info!(parent: self.inner.logger.span(), "调度器已停止");
        Ok(())
    }

    /// 以 `now` 为当前时间检查一次所有绑定，返回成功入队的任务数
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        self.inner.fire_due(now).await
    }
}

impl SchedulerInner {
    async fn fire_due(&self, now: DateTime<Utc>) -> usize {
        // 持锁只推进触发时间，入队在释放锁之后进行
        let due: Vec<CronBinding> = {
            let mut bindings = self.bindings.lock().await;
            let mut due = Vec::new();
            for binding in bindings.iter_mut() {
                let is_due = binding.next_fire.is_some_and(|next| next <= now);
                if is_due {
                    due.push(binding.clone());
                }
                // 相对当前时间重新计算，错过的多次触发只补一次
                if is_due || binding.next_fire.is_none() {
                    binding.next_fire = binding.schedule.next_execution_time(now);
                }
            }
            due
        };

        let mut enqueued = 0;
        for binding in &due {
            if self.fire(binding, now).await {
                enqueued += 1;
            }
        }
        enqueued
    }

    async fn fire(&self, binding: &CronBinding, now: DateTime<Utc>) -> bool {
        let task = match binding.template.materialize() {
            Ok(task) => task,
            Err(e) => {
                error!(
                    parent: self.logger.span(),
                    binding_id = %binding.id,
                    task_type = %binding.task_type(),
                    error = %e,
                    "生成任务载荷失败"
                );
                return false;
            }
        };

        match self.broker.enqueue(task, binding.options.clone()).await {
            Ok(task_id) => {
                self.metrics.record_cron_fire(binding.task_type());
                info!(
                    parent: self.logger.span(),
                    binding_id = %binding.id,
                    task_id = %task_id,
                    task_type = %binding.task_type(),
                    scheduled_at = %binding.next_fire.unwrap_or(now),
                    "CRON任务已入队"
                );
                true
            }
            Err(e) => {
                error!(
                    parent: self.logger.span(),
                    binding_id = %binding.id,
                    task_type = %binding.task_type(),
                    error = %e,
                    "CRON任务入队失败"
                );
                false
            }
        }
    }
}

async fn run_timer_loop(
    inner: Arc<SchedulerInner>,
    tick_interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!("调度循环启动");

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                inner.fire_due(Utc::now()).await;
            }
        }
    }
    debug!("调度循环停止");
}
