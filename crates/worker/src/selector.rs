use std::collections::HashSet;

use rand::seq::SliceRandom;

use jobqueue_core::{QueueConfig, QueueError, QueueResult};

/// 队列轮询策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// 总是按配置顺序，先取完高优先级队列
    Strict,
    /// 每次轮询按权重随机排列队列顺序
    Weighted,
}

/// 决定每次出队时尝试队列的顺序
#[derive(Debug, Clone)]
pub struct QueueSelector {
    queues: Vec<QueueConfig>,
    policy: QueuePolicy,
}

impl QueueSelector {
    pub fn new(queues: Vec<QueueConfig>, policy: QueuePolicy) -> QueueResult<Self> {
        if queues.is_empty() {
            return Err(QueueError::configuration("队列列表不能为空"));
        }
        let mut seen = HashSet::new();
        for queue in &queues {
            if queue.name.trim().is_empty() {
                return Err(QueueError::configuration("队列名称不能为空"));
            }
            if queue.weight == 0 {
                return Err(QueueError::configuration(format!(
                    "队列 {} 的权重必须大于0",
                    queue.name
                )));
            }
            if !seen.insert(queue.name.clone()) {
                return Err(QueueError::configuration(format!(
                    "队列 {} 重复配置",
                    queue.name
                )));
            }
        }
        Ok(Self { queues, policy })
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|queue| queue.name.clone()).collect()
    }

    /// 本次轮询的队列顺序
    ///
    /// 加权模式下把每个队列按权重重复后打乱，再按首次出现去重：
    /// 权重越大的队列越可能排在前面。
    pub fn order(&self) -> Vec<String> {
        match self.policy {
            QueuePolicy::Strict => self.queue_names(),
            QueuePolicy::Weighted => {
                let mut slots: Vec<&str> = self
                    .queues
                    .iter()
                    .flat_map(|queue| {
                        std::iter::repeat(queue.name.as_str()).take(queue.weight as usize)
                    })
                    .collect();
                slots.shuffle(&mut rand::rng());

                let mut seen = HashSet::with_capacity(self.queues.len());
                slots
                    .into_iter()
                    .filter(|name| seen.insert(*name))
                    .map(str::to_string)
                    .collect()
            }
        }
    }
}
