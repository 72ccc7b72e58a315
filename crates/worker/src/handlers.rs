//! 内置任务处理器
//!
//! 默认实现只解码载荷并记录日志。真正发送邮件或清理数据的实现由部署方
//! 通过 [`TaskRegistryBuilder::register`] 注册同名类型来替换。

use async_trait::async_trait;
use tracing::info;

use jobqueue_core::{
    models::{
        DataCleanupPayload, StatusChangeNotificationPayload, WelcomeEmailPayload,
        TASK_TYPE_DATA_CLEANUP, TASK_TYPE_STATUS_CHANGE_NOTIFICATION, TASK_TYPE_WELCOME_EMAIL,
    },
    HandlerError, TaskRecord,
};

use crate::registry::{TaskContext, TaskHandler, TaskRegistryBuilder};

const CLEANUP_TYPES: [&str; 3] = ["logs", "temp_files", "old_records"];

pub struct WelcomeEmailHandler;

#[async_trait]
impl TaskHandler for WelcomeEmailHandler {
    async fn handle(&self, ctx: TaskContext, task: TaskRecord) -> Result<(), HandlerError> {
        let payload: WelcomeEmailPayload = task.decode_payload()?;
        info!(
            parent: ctx.logger.span(),
            user_id = payload.user_id,
            email = %payload.email,
            "发送欢迎邮件"
        );
        Ok(())
    }
}

pub struct StatusChangeNotificationHandler;

#[async_trait]
impl TaskHandler for StatusChangeNotificationHandler {
    async fn handle(&self, ctx: TaskContext, task: TaskRecord) -> Result<(), HandlerError> {
        let payload: StatusChangeNotificationPayload = task.decode_payload()?;
        info!(
            parent: ctx.logger.span(),
            user_id = payload.user_id,
            old_status = %payload.old_status,
            new_status = %payload.new_status,
            changed_by = %payload.changed_by,
            "发送状态变更通知"
        );
        Ok(())
    }
}

pub struct DataCleanupHandler;

#[async_trait]
impl TaskHandler for DataCleanupHandler {
    async fn handle(&self, ctx: TaskContext, task: TaskRecord) -> Result<(), HandlerError> {
        let payload: DataCleanupPayload = task.decode_payload()?;
        if !CLEANUP_TYPES.contains(&payload.cleanup_type.as_str()) {
            return Err(HandlerError::InvalidPayload(format!(
                "不支持的清理类型: {}",
                payload.cleanup_type
            )));
        }
        info!(
            parent: ctx.logger.span(),
            cleanup_type = %payload.cleanup_type,
            retention_days = payload.retention,
            "执行数据清理"
        );
        Ok(())
    }
}

/// 注册全部内置处理器
pub fn register_builtin_handlers(builder: TaskRegistryBuilder) -> TaskRegistryBuilder {
    builder
        .register(TASK_TYPE_WELCOME_EMAIL, WelcomeEmailHandler)
        .register(
            TASK_TYPE_STATUS_CHANGE_NOTIFICATION,
            StatusChangeNotificationHandler,
        )
        .register(TASK_TYPE_DATA_CLEANUP, DataCleanupHandler)
}
