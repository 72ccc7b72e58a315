//! Redis键布局
//!
//! ```text
//! {prefix}:t:{id}               hash  msg=任务记录JSON, state=任务状态
//! {prefix}:{queue}:pending      list  可立即执行的任务ID（LPUSH入，RPOPLPUSH出）
//! {prefix}:{queue}:active       list  正在执行的任务ID
//! {prefix}:{queue}:scheduled    zset  延迟任务，score为 not_before 毫秒时间戳
//! {prefix}:{queue}:retry        zset  等待重试的任务，score为 not_before
//! {prefix}:{queue}:lease        zset  活跃任务的租约，score为过期时间
//! {prefix}:{queue}:archived     zset  死信，score为归档时间
//! {prefix}:{queue}:completed    zset  已完成任务，score为完成时间
//! {prefix}:queues               set   出现过的所有队列名
//! ```

#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn task(&self, id: &str) -> String {
        format!("{}{}", self.task_prefix(), id)
    }

    /// 任务hash键的前缀，Lua脚本据此拼出任务键
    pub fn task_prefix(&self) -> String {
        format!("{}:t:", self.prefix)
    }

    pub fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    pub fn pending(&self, queue: &str) -> String {
        self.queue_key(queue, "pending")
    }

    pub fn active(&self, queue: &str) -> String {
        self.queue_key(queue, "active")
    }

    pub fn scheduled(&self, queue: &str) -> String {
        self.queue_key(queue, "scheduled")
    }

    pub fn retry(&self, queue: &str) -> String {
        self.queue_key(queue, "retry")
    }

    pub fn lease(&self, queue: &str) -> String {
        self.queue_key(queue, "lease")
    }

    pub fn archived(&self, queue: &str) -> String {
        self.queue_key(queue, "archived")
    }

    pub fn completed(&self, queue: &str) -> String {
        self.queue_key(queue, "completed")
    }

    fn queue_key(&self, queue: &str, kind: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = RedisKeys::new("jq");
        assert_eq!(keys.task("abc"), "jq:t:abc");
        assert_eq!(keys.pending("critical"), "jq:critical:pending");
        assert_eq!(keys.archived("default"), "jq:default:archived");
        assert_eq!(keys.queues(), "jq:queues");
    }
}
