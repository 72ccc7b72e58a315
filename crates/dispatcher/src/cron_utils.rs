use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use jobqueue_core::{QueueError, QueueResult};

/// CRON表达式解析和调度工具
///
/// 接受标准的5段表达式（分钟精度，自动补秒字段为0）以及带秒的6/7段表达式。
#[derive(Debug, Clone)]
pub struct CronScheduler {
    expression: String,
    schedule: Schedule,
}

/// 把5段表达式补齐为 `cron` crate 要求的带秒格式
pub fn normalize_expression(cron_expr: &str) -> String {
    let fields: Vec<&str> = cron_expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

impl CronScheduler {
    /// 创建新的CRON调度器
    pub fn new(cron_expr: &str) -> QueueResult<Self> {
        let normalized = normalize_expression(cron_expr);
        let field_count = normalized.split_whitespace().count();
        if !(6..=7).contains(&field_count) {
            return Err(QueueError::InvalidCron {
                expr: cron_expr.to_string(),
                message: format!("需要5、6或7个字段，实际为{}个", cron_expr.split_whitespace().count()),
            });
        }

        let schedule = Schedule::from_str(&normalized).map_err(|e| QueueError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            expression: cron_expr.to_string(),
            schedule,
        })
    }

    /// 原始表达式
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// 严格晚于 `from` 的下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// 获取从指定时间开始的多个执行时间
    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&from).take(count).collect()
    }

    /// 获取任务的执行频率描述
    pub fn get_frequency_description(&self) -> String {
        let upcoming = self.upcoming_times(Utc::now(), 2);
        if upcoming.len() >= 2 {
            let seconds = (upcoming[1] - upcoming[0]).num_seconds();

            match seconds {
                s if s < 60 => format!("每{s}秒"),
                s if s < 3600 => format!("每{}分钟", s / 60),
                s if s < 86400 => format!("每{}小时", s / 3600),
                s if s < 604800 => format!("每{}天", s / 86400),
                s => format!("每{}周", s / 604800),
            }
        } else {
            "无法确定频率".to_string()
        }
    }
}
