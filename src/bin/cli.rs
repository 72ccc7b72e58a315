use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde_json::Value;

use jobqueue_core::{
    AppConfig, Broker, BrokerType, EnqueueOptions, Logger, NewTask, TaskRecord, DEFAULT_QUEUE,
};
use jobqueue_infrastructure::BrokerFactory;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = CliApp::parse();
    cli.run().await
}

/// CLI应用程序主结构
#[derive(clap::Parser, Debug)]
#[command(name = "jobqueue-cli")]
#[command(version)]
#[command(about = "任务队列 - 命令行管理工具")]
#[command(long_about = "直接通过Broker投递任务、查看队列统计和死信任务")]
struct CliApp {
    #[command(subcommand)]
    command: Commands,

    /// 配置文件路径，缺省时使用默认位置
    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 投递任务
    Enqueue(EnqueueArgs),
    /// 查看队列统计或单个任务
    Inspect(InspectArgs),
    /// 列出已归档（重试耗尽）的任务
    DeadLetters(DeadLetterArgs),
}

#[derive(Args, Debug)]
struct EnqueueArgs {
    /// 任务类型
    #[arg(short = 't', long = "type")]
    task_type: String,
    /// 任务载荷 (JSON格式)
    #[arg(short, long, default_value = "{}")]
    payload: String,
    /// 目标队列
    #[arg(short, long, default_value = DEFAULT_QUEUE)]
    queue: String,
    /// 最大重试次数
    #[arg(short = 'r', long)]
    max_retries: Option<u32>,
    /// 延迟执行 (秒)
    #[arg(short, long)]
    delay: Option<u64>,
    /// 处理超时 (秒)
    #[arg(long)]
    timeout: Option<u64>,
    /// 指定任务ID，已存在时拒绝入队
    #[arg(long)]
    task_id: Option<String>,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// 只查看指定队列，缺省为配置中的全部队列
    #[arg(short, long)]
    queue: Option<String>,
    /// 查看单个任务详情
    #[arg(long, conflicts_with = "queue")]
    task_id: Option<String>,
}

#[derive(Args, Debug)]
struct DeadLetterArgs {
    /// 队列名称
    #[arg(short, long, default_value = DEFAULT_QUEUE)]
    queue: String,
    /// 最多显示条数
    #[arg(short, long, default_value = "20")]
    limit: usize,
}

impl CliApp {
    fn parse() -> Self {
        <Self as clap::Parser>::parse()
    }

    async fn run(self) -> Result<()> {
        let config = AppConfig::load(self.config.as_deref()).context("加载配置文件失败")?;
        if config.broker.r#type == BrokerType::InMemory {
            eprintln!("警告: 当前配置使用内存Broker，命令只作用于本进程");
        }

        let broker = BrokerFactory::create(&config.broker, &config.retry, &Logger::new("jobqueue-cli"))
            .await
            .context("连接Broker失败")?;

        let result = match self.command {
            Commands::Enqueue(args) => handle_enqueue(&broker, args).await,
            Commands::Inspect(args) => handle_inspect(&broker, &config, args).await,
            Commands::DeadLetters(args) => handle_dead_letters(&broker, args).await,
        };

        broker.close().await.context("关闭Broker失败")?;
        result
    }
}

async fn handle_enqueue(broker: &Arc<dyn Broker>, args: EnqueueArgs) -> Result<()> {
    let payload: Value =
        serde_json::from_str(&args.payload).context("解析任务载荷失败，请确保是有效的JSON格式")?;
    let task = NewTask::json(args.task_type, &payload)?;

    let mut options = EnqueueOptions::new().queue(args.queue);
    if let Some(max_retries) = args.max_retries {
        options = options.max_retries(max_retries);
    }
    if let Some(timeout) = args.timeout {
        options = options.timeout(Duration::from_secs(timeout));
    }
    if let Some(task_id) = args.task_id {
        options = options.task_id(task_id);
    }

    let task_id = match args.delay {
        Some(delay) => {
            broker
                .enqueue_delayed(task, Duration::from_secs(delay), options)
                .await?
        }
        None => broker.enqueue(task, options).await?,
    };

    println!("任务入队成功!");
    println!("任务ID: {task_id}");
    Ok(())
}

async fn handle_inspect(
    broker: &Arc<dyn Broker>,
    config: &AppConfig,
    args: InspectArgs,
) -> Result<()> {
    if let Some(task_id) = args.task_id {
        let task = broker
            .get_task(&task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("任务不存在: {task_id}"))?;
        print_task_details(&task);
        return Ok(());
    }

    let queues = match args.queue {
        Some(queue) => vec![queue],
        None => config
            .worker
            .queues
            .iter()
            .map(|queue| queue.name.clone())
            .collect(),
    };

    println!(
        "{:<16} {:>8} {:>10} {:>8} {:>8} {:>10} {:>8}",
        "队列", "pending", "scheduled", "active", "retry", "archived", "done"
    );
    println!("{}", "-".repeat(76));
    for queue in queues {
        let stats = broker.queue_stats(&queue).await?;
        println!(
            "{:<16} {:>8} {:>10} {:>8} {:>8} {:>10} {:>8}",
            stats.queue,
            stats.pending,
            stats.scheduled,
            stats.active,
            stats.retry,
            stats.archived,
            stats.done
        );
    }
    Ok(())
}

async fn handle_dead_letters(broker: &Arc<dyn Broker>, args: DeadLetterArgs) -> Result<()> {
    let tasks = broker.list_archived(&args.queue).await?;
    if tasks.is_empty() {
        println!("队列 {} 没有已归档的任务", args.queue);
        return Ok(());
    }

    println!(
        "{:<36} {:<28} {:>7} {:<25} 最后错误",
        "ID", "类型", "重试", "失败时间"
    );
    println!("{}", "-".repeat(120));
    for task in tasks.iter().take(args.limit) {
        let failed_at = task
            .last_failed_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "N/A".to_string());
        println!(
            "{:<36} {:<28} {:>7} {:<25} {}",
            task.id,
            task.task_type,
            task.attempt,
            failed_at,
            task.last_error.as_deref().unwrap_or("N/A")
        );
    }
    if tasks.len() > args.limit {
        println!("... 共 {} 条，仅显示前 {} 条", tasks.len(), args.limit);
    }
    Ok(())
}

fn print_task_details(task: &TaskRecord) {
    println!("任务详情:");
    println!("  ID: {}", task.id);
    println!("  类型: {}", task.task_type);
    println!("  队列: {}", task.queue);
    println!("  状态: {}", task.state.as_str());
    println!("  重试: {}/{}", task.attempt, task.max_retries);
    println!("  入队时间: {}", task.enqueued_at.to_rfc3339());
    if let Some(not_before) = task.not_before {
        println!("  最早执行时间: {}", not_before.to_rfc3339());
    }
    if let Some(timeout) = task.timeout_seconds {
        println!("  超时时间: {timeout} 秒");
    }
    if let Some(error) = &task.last_error {
        println!("  最后错误: {error}");
    }
    match serde_json::from_slice::<Value>(&task.payload) {
        Ok(payload) => println!(
            "  载荷: {}",
            serde_json::to_string_pretty(&payload).unwrap_or_default()
        ),
        Err(_) => println!("  载荷: {} 字节（非JSON）", task.payload.len()),
    }
}
