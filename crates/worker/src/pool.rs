use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use jobqueue_core::{
    Broker, HandlerError, Logger, QueueConfig, QueueError, QueueMetrics, QueueResult, TaskRecord,
    TaskState, WorkerConfig,
};

use crate::registry::{TaskContext, TaskRegistry};
use crate::selector::{QueuePolicy, QueueSelector};

/// Worker循环状态
///
/// ```text
/// Idle → Polling → Executing → Acking | Failing → Idle
/// 收到停止信号后：Stopping → Drained
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Polling,
    Executing,
    Acking,
    Failing,
    Stopping,
    Drained,
}

/// Worker池配置
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub queues: Vec<QueueConfig>,
    pub strict_priority: bool,
    pub shutdown_timeout: Duration,
    /// 任务没有自带超时时使用
    pub task_timeout: Duration,
    pub dequeue_timeout: Duration,
    /// 孤儿任务回收周期，`None` 表示不回收
    pub recover_interval: Option<Duration>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerPoolConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            queues: config.queues.clone(),
            strict_priority: config.strict_priority,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_seconds),
            task_timeout: Duration::from_secs(config.task_timeout_seconds),
            dequeue_timeout: Duration::from_millis(config.dequeue_timeout_ms),
            recover_interval: (config.recover_interval_seconds > 0)
                .then(|| Duration::from_secs(config.recover_interval_seconds)),
        }
    }
}

/// 单个Worker循环共享的只读上下文
struct LoopContext {
    broker: Arc<dyn Broker>,
    registry: Arc<TaskRegistry>,
    selector: Arc<QueueSelector>,
    task_timeout: Duration,
    dequeue_timeout: Duration,
    metrics: QueueMetrics,
}

/// Worker池
///
/// 运行 `concurrency` 个轮询循环：出队、执行处理器、按结果 ack/fail。
/// 处理器在独立的tokio任务中运行，panic和超时都在循环边界转换为
/// [`HandlerError`]，不会终止循环。
pub struct WorkerPool {
    broker: Arc<dyn Broker>,
    registry: Arc<TaskRegistry>,
    selector: Arc<QueueSelector>,
    config: WorkerPoolConfig,
    logger: Logger,
    metrics: QueueMetrics,
    pool_id: String,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    states: Mutex<Vec<Arc<watch::Sender<WorkerState>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: TaskRegistry,
        config: WorkerPoolConfig,
        logger: Logger,
    ) -> QueueResult<Self> {
        if config.concurrency == 0 {
            return Err(QueueError::configuration("Worker并发数必须大于0"));
        }
        if config.task_timeout.is_zero() || config.dequeue_timeout.is_zero() {
            return Err(QueueError::configuration("任务超时和出队超时必须大于0"));
        }
        let policy = if config.strict_priority {
            QueuePolicy::Strict
        } else {
            QueuePolicy::Weighted
        };
        let selector = QueueSelector::new(config.queues.clone(), policy)?;

        let hostname = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let pool_id = format!("{}:{}", hostname, std::process::id());
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            broker,
            registry: Arc::new(registry),
            selector: Arc::new(selector),
            config,
            logger: logger.component("worker_pool"),
            metrics: QueueMetrics::new(),
            pool_id,
            running: AtomicBool::new(false),
            stop_tx,
            states: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 启动全部Worker循环，立即返回
    pub async fn start(&self) -> QueueResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(QueueError::Internal("Worker池已在运行".to_string()));
        }
        self.stop_tx.send_replace(false);

        let mut states = self.states.lock().await;
        let mut handles = self.handles.lock().await;
        states.clear();

        for index in 0..self.config.concurrency {
            let (state_tx, _) = watch::channel(WorkerState::Idle);
            let state_tx = Arc::new(state_tx);
            states.push(Arc::clone(&state_tx));

            let ctx = LoopContext {
                broker: Arc::clone(&self.broker),
                registry: Arc::clone(&self.registry),
                selector: Arc::clone(&self.selector),
                task_timeout: self.config.task_timeout,
                dequeue_timeout: self.config.dequeue_timeout,
                metrics: self.metrics.clone(),
            };
            let logger = self.logger.worker(index);
            let span = logger.span().clone();
            let stop_rx = self.stop_tx.subscribe();
            handles.push(tokio::spawn(
                run_worker_loop(index, ctx, logger, stop_rx, state_tx).instrument(span),
            ));
        }

        if let Some(interval) = self.config.recover_interval {
            let broker = Arc::clone(&self.broker);
            let stop_rx = self.stop_tx.subscribe();
            let span = self.logger.component("recoverer").span().clone();
            handles.push(tokio::spawn(
                run_recoverer(broker, interval, stop_rx).instrument(span),
            ));
        }

        info!(
            parent: self.logger.span(),
            pool_id = %self.pool_id,
            concurrency = self.config.concurrency,
            queues = ?self.selector.queue_names(),
            policy = ?self.selector.policy(),
            task_types = ?self.registry.task_types(),
            "Worker池已启动"
        );
        Ok(())
    }

    /// 按配置的超时时间优雅停止
    pub async fn shutdown(&self) -> QueueResult<()> {
        self.shutdown_with_timeout(self.config.shutdown_timeout).await
    }

    /// 停止出队，等待正在执行的任务最多 `window`，超时后强制停止循环
    ///
    /// 被强制停止时仍处于active的任务由租约回收机制重新投递。
    pub async fn shutdown_with_timeout(&self, window: Duration) -> QueueResult<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        info!(parent: self.logger.span(), ?window, "正在停止Worker池");
        self.stop_tx.send_replace(true);

        let mut handles = std::mem::take(&mut *self.handles.lock().await);
        let deadline = tokio::time::Instant::now() + window;
        let mut forced = 0;

        for handle in handles.iter_mut() {
            if tokio::time::timeout_at(deadline, &mut *handle).await.is_err() {
                handle.abort();
                forced += 1;
            }
        }

        if forced > 0 {
            warn!(
                parent: self.logger.span(),
                forced,
                "部分Worker循环未在超时时间内结束，已强制停止"
            );
            // 被中止的循环来不及更新自己的状态
            for state in self.states.lock().await.iter() {
                let current = *state.borrow();
                if current != WorkerState::Drained {
                    debug!(parent: self.logger.span(), ?current, "Worker循环被强制停止");
                    state.send_replace(WorkerState::Drained);
                }
            }
        }

        info!(parent: self.logger.span(), "Worker池已停止");
        Ok(())
    }

    /// 各Worker循环的当前状态，按循环编号排列
    pub async fn worker_states(&self) -> Vec<WorkerState> {
        self.states
            .lock()
            .await
            .iter()
            .map(|state| *state.borrow())
            .collect()
    }
}

async fn run_worker_loop(
    index: usize,
    ctx: LoopContext,
    logger: Logger,
    mut stop_rx: watch::Receiver<bool>,
    state_tx: Arc<watch::Sender<WorkerState>>,
) {
    debug!("Worker循环启动");

    loop {
        if *stop_rx.borrow() {
            break;
        }

        state_tx.send_replace(WorkerState::Polling);
        let queues = ctx.selector.order();
        let task = match ctx.broker.dequeue(&queues, ctx.dequeue_timeout).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                state_tx.send_replace(WorkerState::Idle);
                continue;
            }
            Err(e) => {
                state_tx.send_replace(WorkerState::Idle);
                error!(error = %e, "出队失败");
                // 传输错误已在Broker内部重试过，这里退避一个出队周期
                tokio::select! {
                    _ = stop_rx.changed() => {}
                    _ = tokio::time::sleep(ctx.dequeue_timeout) => {}
                }
                continue;
            }
        };

        state_tx.send_replace(WorkerState::Executing);
        ctx.metrics.worker_busy();
        process_task(index, &ctx, &logger, &state_tx, task).await;
        ctx.metrics.worker_idle();
        state_tx.send_replace(WorkerState::Idle);
    }

    state_tx.send_replace(WorkerState::Stopping);
    debug!("Worker循环停止");
    state_tx.send_replace(WorkerState::Drained);
}

async fn process_task(
    index: usize,
    ctx: &LoopContext,
    logger: &Logger,
    state_tx: &watch::Sender<WorkerState>,
    task: TaskRecord,
) {
    let task_id = task.id.clone();
    let task_type = task.task_type.clone();
    let queue = task.queue.clone();
    let timeout = task.timeout().unwrap_or(ctx.task_timeout);
    let task_logger = logger.task(&task_id, &task_type);

    debug!(
        task_id = %task_id,
        task_type = %task_type,
        queue = %queue,
        attempt = task.attempt,
        "开始执行任务"
    );

    let started = Instant::now();
    let task_ctx = TaskContext {
        worker: index,
        attempt: task.attempt,
        timeout,
        logger: task_logger.clone(),
    };
    let outcome = execute(&ctx.registry, task_ctx, task, timeout)
        .instrument(task_logger.span().clone())
        .await;
    let elapsed = started.elapsed();

    match outcome {
        Ok(()) => {
            state_tx.send_replace(WorkerState::Acking);
            ctx.metrics
                .record_processed(&queue, &task_type, elapsed.as_secs_f64());
            match ctx.broker.ack(&task_id).await {
                Ok(()) => info!(task_id = %task_id, task_type = %task_type, ?elapsed, "任务执行成功"),
                Err(e) => error!(task_id = %task_id, error = %e, "确认任务失败"),
            }
        }
        Err(handler_error) => {
            state_tx.send_replace(WorkerState::Failing);
            ctx.metrics
                .record_failed(&queue, &task_type, handler_error.kind());
            warn!(
                task_id = %task_id,
                task_type = %task_type,
                error = %handler_error,
                ?elapsed,
                "任务执行失败"
            );
            match ctx.broker.fail(&task_id, &handler_error.to_string()).await {
                Ok(TaskState::Archived) => {
                    warn!(task_id = %task_id, "任务已进入死信队列")
                }
                Ok(state) => debug!(task_id = %task_id, %state, "任务失败已记录"),
                Err(e) => error!(task_id = %task_id, error = %e, "记录任务失败时出错"),
            }
        }
    }
}

/// 在独立任务中执行处理器，把panic、超时和未知类型统一转换为 [`HandlerError`]
///
/// 超时后只是不再等待处理器，不会中止它。
pub(crate) async fn execute(
    registry: &TaskRegistry,
    ctx: TaskContext,
    task: TaskRecord,
    timeout: Duration,
) -> Result<(), HandlerError> {
    let handler = registry
        .get(&task.task_type)
        .ok_or_else(|| HandlerError::UnknownType(task.task_type.clone()))?;

    let handle = tokio::spawn(
        async move { handler.handle(ctx, task).await }.in_current_span(),
    );

    match tokio::time::timeout(timeout, handle).await {
        Err(_) => Err(HandlerError::Timeout(timeout)),
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) if join_error.is_panic() => {
            Err(HandlerError::Panicked(panic_message(join_error.into_panic())))
        }
        Ok(Err(join_error)) => Err(HandlerError::Failed(format!(
            "处理器任务被取消: {join_error}"
        ))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn run_recoverer(
    broker: Arc<dyn Broker>,
    interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // 第一次tick立即返回，跳过它
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {
                match broker.recover_orphaned().await {
                    Ok(0) => {}
                    Ok(recovered) => info!(recovered, "已回收孤儿任务"),
                    Err(e) => warn!(error = %e, "回收孤儿任务失败"),
                }
            }
        }
        if *stop_rx.borrow() {
            break;
        }
    }
}
