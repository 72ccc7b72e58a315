//! 任务队列系统的进程入口
//!
//! 组合Broker、Worker池和调度器，并负责按运行模式启动和优雅关闭。

pub mod app;
pub mod shutdown;

pub use app::{AppMode, Application};
pub use shutdown::{wait_for_signal, ShutdownManager};
