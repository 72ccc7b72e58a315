//! CRON调度
//!
//! 持有一组CRON表达式到任务模板的绑定，按墙钟时间把到期的绑定物化为
//! 任务并通过Broker入队。与Worker池共享同一个Broker，但生命周期独立。

pub mod cron_utils;
pub mod scheduler;

pub use cron_utils::CronScheduler;
pub use scheduler::{default_bindings, template_from_config, CronBinding, Scheduler, TaskTemplate};
