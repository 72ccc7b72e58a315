//! 内置任务类型及其载荷
//!
//! 生产方（用户服务等）通过这里的构造函数得到 [`NewTask`]，再调用
//! `Broker::enqueue` 入队。载荷统一采用JSON编码。

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::errors::QueueResult;
use crate::models::NewTask;

pub const TASK_TYPE_WELCOME_EMAIL: &str = "welcome_email";
pub const TASK_TYPE_STATUS_CHANGE_NOTIFICATION: &str = "status_change_notification";
pub const TASK_TYPE_DATA_CLEANUP: &str = "data_cleanup";

/// 欢迎邮件任务载荷
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeEmailPayload {
    pub user_id: i64,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub timestamp: i64,
}

/// 用户状态变更通知任务载荷
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChangeNotificationPayload {
    pub user_id: i64,
    pub email: String,
    pub user_name: String,
    pub old_status: String,
    pub new_status: String,
    pub changed_by: String,
    pub timestamp: i64,
}

/// 数据清理任务载荷
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataCleanupPayload {
    /// logs, temp_files, old_records
    pub cleanup_type: String,
    /// 保留天数
    pub retention: u32,
    pub timestamp: i64,
}

/// 创建欢迎邮件任务
pub fn welcome_email_task(user_id: i64, email: &str, user_name: &str) -> QueueResult<NewTask> {
    let payload = WelcomeEmailPayload {
        user_id,
        email: email.to_string(),
        user_name: user_name.to_string(),
        timestamp: Utc::now().timestamp(),
    };
    NewTask::json(TASK_TYPE_WELCOME_EMAIL, &payload)
}

/// 创建状态变更通知任务
pub fn status_change_notification_task(
    user_id: i64,
    email: &str,
    user_name: &str,
    old_status: &str,
    new_status: &str,
    changed_by: &str,
) -> QueueResult<NewTask> {
    let payload = StatusChangeNotificationPayload {
        user_id,
        email: email.to_string(),
        user_name: user_name.to_string(),
        old_status: old_status.to_string(),
        new_status: new_status.to_string(),
        changed_by: changed_by.to_string(),
        timestamp: Utc::now().timestamp(),
    };
    NewTask::json(TASK_TYPE_STATUS_CHANGE_NOTIFICATION, &payload)
}

/// 创建数据清理任务
pub fn data_cleanup_task(cleanup_type: &str, retention: u32) -> QueueResult<NewTask> {
    let payload = DataCleanupPayload {
        cleanup_type: cleanup_type.to_string(),
        retention,
        timestamp: Utc::now().timestamp(),
    };
    NewTask::json(TASK_TYPE_DATA_CLEANUP, &payload)
}
