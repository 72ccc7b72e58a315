use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use jobqueue_core::{AppConfig, Broker, ConfigValidator, Logger};
use jobqueue_dispatcher::Scheduler;
use jobqueue_infrastructure::BrokerFactory;
use jobqueue_worker::{register_builtin_handlers, TaskRegistry, WorkerPool, WorkerPoolConfig};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行Worker池
    Worker,
    /// 仅运行CRON调度器
    Scheduler,
    /// 同时运行两者
    All,
}

impl AppMode {
    pub fn runs_worker(&self) -> bool {
        matches!(self, AppMode::Worker | AppMode::All)
    }

    pub fn runs_scheduler(&self) -> bool {
        matches!(self, AppMode::Scheduler | AppMode::All)
    }
}

impl FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "worker" => Ok(AppMode::Worker),
            "scheduler" => Ok(AppMode::Scheduler),
            "all" => Ok(AppMode::All),
            other => Err(anyhow::anyhow!("不支持的运行模式: {other}")),
        }
    }
}

impl fmt::Display for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AppMode::Worker => "worker",
            AppMode::Scheduler => "scheduler",
            AppMode::All => "all",
        };
        f.write_str(name)
    }
}

/// 主应用程序
///
/// 按运行模式启动Worker池和调度器，收到关闭信号后依次停止调度器、
/// Worker池，最后关闭Broker。
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    broker: Arc<dyn Broker>,
    registry: TaskRegistry,
    logger: Logger,
}

impl Application {
    /// 使用内置处理器创建应用
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        let registry = register_builtin_handlers(TaskRegistry::builder())
            .build()
            .context("构建任务注册表失败")?;
        Self::with_registry(config, mode, registry).await
    }

    /// 使用自定义注册表创建应用
    pub async fn with_registry(
        config: AppConfig,
        mode: AppMode,
        registry: TaskRegistry,
    ) -> Result<Self> {
        let logger = Logger::new(&config.logging.service);
        config.validate().context("配置校验失败")?;
        if mode == AppMode::Scheduler && !config.scheduler.enabled {
            return Err(anyhow::anyhow!("调度器在配置中被禁用，无法以scheduler模式运行"));
        }

        info!(parent: logger.span(), %mode, broker = ?config.broker.r#type, "初始化应用程序");

        let broker = BrokerFactory::create(&config.broker, &config.retry, &logger)
            .await
            .context("创建Broker失败")?;

        Ok(Self {
            config,
            mode,
            broker,
            registry,
            logger,
        })
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    /// 运行直到收到关闭信号
    ///
    /// 启动阶段的配置错误直接返回，不会等待关闭信号。
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let pool = if self.mode.runs_worker() {
            let pool = WorkerPool::new(
                Arc::clone(&self.broker),
                self.registry.clone(),
                WorkerPoolConfig::from(&self.config.worker),
                self.logger.clone(),
            )
            .context("创建Worker池失败")?;
            Some(pool)
        } else {
            None
        };

        let scheduler = if self.mode.runs_scheduler() && self.config.scheduler.enabled {
            let scheduler = Scheduler::from_config(
                Arc::clone(&self.broker),
                &self.config.scheduler,
                self.logger.clone(),
            );
            let registered = scheduler.register_from_config(&self.config.scheduler).await;
            info!(parent: self.logger.span(), registered, "CRON绑定注册完成");
            Some(scheduler)
        } else {
            if self.mode.runs_scheduler() {
                warn!(parent: self.logger.span(), "调度器在配置中被禁用，跳过");
            }
            None
        };

        if let Some(pool) = &pool {
            pool.start().await.context("启动Worker池失败")?;
        }
        if let Some(scheduler) = &scheduler {
            if let Err(e) = scheduler.start().await {
                if let Some(pool) = &pool {
                    let _ = pool.shutdown().await;
                }
                return Err(e).context("启动调度器失败");
            }
        }

        info!(parent: self.logger.span(), mode = %self.mode, "应用程序已启动");

        // 发送端被丢弃同样视为关闭
        let _ = shutdown_rx.recv().await;
        info!(parent: self.logger.span(), "收到关闭信号，开始停止组件");

        if let Some(scheduler) = &scheduler {
            if let Err(e) = scheduler.stop().await {
                error!(parent: self.logger.span(), error = %e, "停止调度器失败");
            }
        }
        if let Some(pool) = &pool {
            if let Err(e) = pool.shutdown().await {
                error!(parent: self.logger.span(), error = %e, "停止Worker池失败");
            }
        }
        self.broker.close().await.context("关闭Broker失败")?;

        info!(parent: self.logger.span(), "所有组件已停止");
        Ok(())
    }
}
