//! 任务仓库与就绪队列
//!
//! 单一事实源：权威表（id → Task）独占持有全部任务，就绪堆只存
//! (priority, seq, id) 条目，是视图不是第二份所有权。queued 集合保证
//! 「pending 必在队列中且只出现一次」由构造保证而非靠定期对账；堆中
//! 过期条目（已完成/已重建）出队时惰性丢弃。

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use serde_json::Value;

use crate::core::task::{Task, TaskId, TaskStatus};

/// 就绪堆条目；排序：priority 大者先，同级 seq 小（创建早）者先
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: i32,
    seq: u64,
    id: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 任务仓库：所有变更都走本类型的方法，引擎与恢复共用同一条变更路径
#[derive(Default)]
pub struct TaskStore {
    tasks: HashMap<TaskId, Task>,
    ready: BinaryHeap<QueueEntry>,
    /// 当前在队列中的 id；保证不重复入队
    queued: HashSet<TaskId>,
    /// 完成顺序（依赖查找取最近完成者）
    completed: Vec<TaskId>,
    next_seq: u64,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入权威表；pending 任务同时入就绪队列，父任务补 subtasks 反向引用
    pub fn add(&mut self, mut task: Task) -> TaskId {
        task.seq = self.next_seq;
        self.next_seq += 1;

        if let Some(parent_id) = task.parent_id.clone() {
            if let Some(parent) = self.tasks.get_mut(&parent_id) {
                parent.subtasks.push(task.id.clone());
            }
        }

        let id = task.id.clone();
        let pending = task.status == TaskStatus::Pending;
        let priority = task.priority;
        let seq = task.seq;
        self.tasks.insert(id.clone(), task);
        if pending {
            self.enqueue(id.clone(), priority, seq);
        }
        id
    }

    /// 唯一入队口；queued 集合挡掉重复
    fn enqueue(&mut self, id: TaskId, priority: i32, seq: u64) {
        if self.queued.insert(id.clone()) {
            self.ready.push(QueueEntry { priority, seq, id });
        }
    }

    /// 弹出最高优先级的 pending 任务 id；过期条目惰性跳过
    pub fn next(&mut self) -> Option<TaskId> {
        while let Some(entry) = self.ready.pop() {
            if !self.queued.remove(&entry.id) {
                continue; // 队列重建或完成清洗留下的过期副本
            }
            match self.tasks.get(&entry.id) {
                Some(t) if t.status == TaskStatus::Pending => return Some(entry.id),
                _ => continue,
            }
        }
        None
    }

    /// RETRY 路径：任务保持 pending，重新入队（已在队中则无事发生）
    pub fn reinsert(&mut self, id: &TaskId) {
        if let Some(task) = self.tasks.get(id) {
            if task.status == TaskStatus::Pending {
                let (priority, seq) = (task.priority, task.seq);
                self.enqueue(id.clone(), priority, seq);
            }
        }
    }

    /// 标记完成：落结果、记完成顺序、清洗队列中可能的过期副本
    pub fn complete(&mut self, id: &TaskId, result: Value) -> bool {
        let Some(task) = self.tasks.get_mut(id) else {
            return false;
        };
        task.status = TaskStatus::Completed;
        task.completed_at = Some(chrono::Utc::now().timestamp_millis());
        task.output = Some(result.clone());
        task.result = Some(result);
        self.completed.push(id.clone());
        self.queued.remove(id);
        true
    }

    /// 标记永久失败
    pub fn fail(&mut self, id: &TaskId, result: Value) -> bool {
        self.mark_terminal(id, TaskStatus::Failed, Some(result))
    }

    pub fn mark_redirected(&mut self, id: &TaskId) -> bool {
        self.mark_terminal(id, TaskStatus::Redirected, None)
    }

    pub fn mark_decomposed(&mut self, id: &TaskId) -> bool {
        self.mark_terminal(id, TaskStatus::Decomposed, None)
    }

    fn mark_terminal(&mut self, id: &TaskId, status: TaskStatus, result: Option<Value>) -> bool {
        debug_assert!(status.is_terminal());
        let Some(task) = self.tasks.get_mut(id) else {
            return false;
        };
        task.status = status;
        task.completed_at = Some(chrono::Utc::now().timestamp_millis());
        if let Some(result) = result {
            task.output = Some(result.clone());
            task.result = Some(result);
        }
        self.queued.remove(id);
        true
    }

    /// 对账操作：从权威表重建就绪队列。幂等，不产生重复条目。
    /// 恢复/重规划之外的外部触发方也可调用以强制重新同步。
    pub fn requeue_pending(&mut self) {
        self.ready.clear();
        self.queued.clear();
        let pending: Vec<(TaskId, i32, u64)> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| (t.id.clone(), t.priority, t.seq))
            .collect();
        for (id, priority, seq) in pending {
            self.enqueue(id, priority, seq);
        }
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    pub fn is_queued(&self, id: &TaskId) -> bool {
        self.queued.contains(id)
    }

    /// 同一目标下的全部任务，按创建顺序
    pub fn tasks_for_goal(&self, goal: &str) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.goal.as_deref() == Some(goal))
            .collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// 依赖查找：在已完成任务中按描述匹配，精确优先、双向子串兜底，取最近完成者
    pub fn find_completed_by_description(&self, description: &str) -> Option<&Task> {
        for id in self.completed.iter().rev() {
            if let Some(t) = self.tasks.get(id) {
                if t.description == description {
                    return Some(t);
                }
            }
        }
        for id in self.completed.iter().rev() {
            if let Some(t) = self.tasks.get(id) {
                if t.description.contains(description) || description.contains(&t.description) {
                    return Some(t);
                }
            }
        }
        None
    }

    /// 在目标的任务序列中按描述定位（精确优先、双向子串兜底），返回序列下标
    pub fn position_in_goal(&self, goal: &str, description: &str) -> Option<usize> {
        let sequence = self.tasks_for_goal(goal);
        sequence
            .iter()
            .position(|t| t.description == description)
            .or_else(|| {
                sequence.iter().position(|t| {
                    t.description.contains(description) || description.contains(&t.description)
                })
            })
    }
}
