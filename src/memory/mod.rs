//! 短期记忆收纳：任务执行审计流水
//!
//! 引擎每次执行完一个任务（成功或失败）record 一条结构化记录；record 永不
//! 让调用方失败；记忆层故障不影响任务结果。长期/向量记忆属于外围系统。

use serde_json::Value;
use tokio::sync::RwLock;

use async_trait::async_trait;

/// 记忆收纳 trait：只进不出（检索属于外围系统）
#[async_trait]
pub trait MemorySink: Send + Sync {
    async fn record(&self, entry: Value);
}

/// 有界短期记忆：超容量时丢最旧
pub struct ShortTermMemory {
    entries: RwLock<Vec<Value>>,
    capacity: usize,
}

impl ShortTermMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// 最近 n 条（从旧到新）
    pub async fn recent(&self, n: usize) -> Vec<Value> {
        let entries = self.entries.read().await;
        let start = entries.len().saturating_sub(n);
        entries[start..].to_vec()
    }
}

#[async_trait]
impl MemorySink for ShortTermMemory {
    async fn record(&self, entry: Value) {
        let mut entries = self.entries.write().await;
        entries.push(entry);
        if entries.len() > self.capacity {
            let overflow = entries.len() - self.capacity;
            entries.drain(..overflow);
        }
    }
}

/// 黑洞：丢弃一切记录（测试用）
#[derive(Debug, Default)]
pub struct NullMemory;

#[async_trait]
impl MemorySink for NullMemory {
    async fn record(&self, _entry: Value) {}
}
