use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, warn};

use jobqueue::app::{AppMode, Application};
use jobqueue::shutdown::{wait_for_signal, ShutdownManager};
use jobqueue_core::{init_logging, AppConfig, LogFormat};

/// 等待组件停止时在Worker关闭窗口之外额外留出的时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("jobqueue")
        .version(env!("CARGO_PKG_VERSION"))
        .about("后台任务队列与定时调度系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时依次查找 config/jobqueue.toml 等默认位置"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["worker", "scheduler", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty", "compact"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mode: AppMode = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("all")
        .parse()?;

    let mut config = AppConfig::load(config_path)
        .with_context(|| format!("加载配置失败: {}", config_path.unwrap_or("<默认位置>")))?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.logging.format = format.parse::<LogFormat>().map_err(anyhow::Error::msg)?;
    }

    init_logging(&config.logging)?;

    info!("启动任务队列系统");
    info!("运行模式: {mode}");

    if config.observability.metrics_enabled {
        install_metrics_exporter(&config.observability.metrics_bind)?;
    }

    let shutdown_window =
        Duration::from_secs(config.worker.shutdown_timeout_seconds) + SHUTDOWN_GRACE;
    let app = Arc::new(Application::new(config, mode).await?);
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    // 启动失败时应用会先于关闭信号结束
    tokio::select! {
        result = &mut app_handle => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!("应用启动失败: {e:#}");
                    Err(e)
                }
                Err(e) => Err(anyhow::anyhow!("应用任务异常退出: {e}")),
            };
        }
        signal = wait_for_signal() => {
            signal?;
        }
    }

    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(shutdown_window, app_handle).await {
        Ok(Ok(Ok(()))) => info!("应用已优雅关闭"),
        Ok(Ok(Err(e))) => {
            error!("应用关闭时发生错误: {e:#}");
            return Err(e);
        }
        Ok(Err(e)) => return Err(anyhow::anyhow!("应用任务异常退出: {e}")),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("任务队列系统已退出");
    Ok(())
}

fn install_metrics_exporter(bind: &str) -> Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("无效的指标监听地址: {bind}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("安装Prometheus exporter失败")?;
    info!("Prometheus指标暴露在 http://{addr}/metrics");
    Ok(())
}
