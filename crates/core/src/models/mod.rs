//! # 数据模型
//!
//! 任务记录、任务状态、入队选项以及内置任务类型的载荷定义。
//!
//! ## 任务状态流转
//! ```text
//! pending → active → done
//!             ↓
//!           retry → active → ... → archived
//! ```
//!
//! 状态和重试计数只由Broker写入；生产方只会创建 `pending` 记录。

pub mod payloads;
pub mod task;

pub use payloads::*;
pub use task::*;
