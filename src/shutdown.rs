use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

/// 关闭信号分发
///
/// `shutdown` 取走发送端并广播一次；之后订阅得到的接收器立即就绪，
/// 启动较晚的组件也不会错过信号。
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_tx: Arc<Mutex<Option<broadcast::Sender<()>>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx: Arc::new(Mutex::new(Some(shutdown_tx))),
        }
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<()> {
        match &*self.shutdown_tx.lock().await {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                let _ = tx.send(());
                rx
            }
        }
    }

    /// 触发关闭，重复调用无效果
    pub async fn shutdown(&self) {
        let Some(tx) = self.shutdown_tx.lock().await.take() else {
            debug!("关闭信号已经发送过");
            return;
        };
        // 没有订阅者时发送失败，可以忽略
        let _ = tx.send(());
        info!(subscribers = tx.receiver_count(), "关闭信号已发送");
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 等待Ctrl+C或SIGTERM
pub async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("安装SIGTERM信号处理器失败")?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("监听Ctrl+C信号失败")?;
                info!("收到Ctrl+C信号");
            }
            _ = terminate.recv() => {
                info!("收到SIGTERM信号");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("监听Ctrl+C信号失败")?;
        info!("收到Ctrl+C信号");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use jobqueue_core::{AppConfig, BrokerType, EnqueueOptions, NewTask};
    use tokio::time::timeout;

    use super::*;
    use crate::app::{AppMode, Application};

    fn worker_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.broker.r#type = BrokerType::InMemory;
        config.worker.concurrency = 1;
        config.worker.dequeue_timeout_ms = 50;
        config.worker.shutdown_timeout_seconds = 1;
        config
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_one_shutdown() {
        let manager = ShutdownManager::new();
        let mut app_rx = manager.subscribe().await;
        let mut signal_rx = manager.clone().subscribe().await;

        manager.shutdown().await;
        manager.shutdown().await;

        assert!(matches!(timeout(Duration::from_millis(100), app_rx.recv()).await, Ok(Ok(()))));
        assert!(matches!(timeout(Duration::from_millis(100), signal_rx.recv()).await, Ok(Ok(()))));
        // 发送端已释放，不会有第二次信号
        assert!(app_rx.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_application_started_after_shutdown_stops_at_once() {
        let manager = ShutdownManager::new();
        manager.shutdown().await;

        let app = Application::new(worker_config(), AppMode::Worker).await.unwrap();
        let broker = app.broker();
        let rx = manager.subscribe().await;

        timeout(Duration::from_secs(3), app.run(rx))
            .await
            .expect("application ignored an earlier shutdown")
            .unwrap();
        assert!(broker
            .enqueue(NewTask::new("x", vec![]), EnqueueOptions::new())
            .await
            .unwrap_err()
            .is_transport());
    }
}
