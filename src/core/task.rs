//! 任务数据模型
//!
//! Task 是工作单元：动作 + 参数 + 依赖声明 + 尝试历史。Attempt 记录单次执行
//! （本次解析出的参数、起止时间、结果、恢复信息）。TaskSpec 是唯一的创建入口，
//! 所有任务（生成、恢复、重规划产生的）都经它物化。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 任务 ID（task_{uuid}，创建时生成，永不复用）
pub type TaskId = String;

/// 任务状态；除 Pending 外均为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 等待执行（必须可从就绪队列到达）
    Pending,
    /// 成功完成，恰有一次成功尝试，不再入队
    Completed,
    /// 永久失败
    Failed,
    /// 由 ALTERNATIVE 恢复改道：目标由新的兄弟任务继续
    Redirected,
    /// 由 DECOMPOSE 恢复拆分为子任务
    Decomposed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

/// 单次执行尝试
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub attempt_number: u32,
    /// 本次尝试实际使用的（已解析占位符的）参数
    pub parameters: Map<String, Value>,
    /// 毫秒时间戳
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub result: Option<Value>,
    pub success: Option<bool>,
    pub error: Option<String>,
    /// 本次失败后应用的恢复策略（若有）
    pub recovery_strategy: Option<String>,
    pub recovery_details: Option<Value>,
}

impl Attempt {
    pub fn new(attempt_number: u32, parameters: Map<String, Value>) -> Self {
        Self {
            attempt_number,
            parameters,
            start_time: chrono::Utc::now().timestamp_millis(),
            end_time: None,
            result: None,
            success: None,
            error: None,
            recovery_strategy: None,
            recovery_details: None,
        }
    }

    /// 恰好结算一次：记录结果与成败；失败时提取 error 文本
    pub fn complete(&mut self, result: Value, success: bool) {
        self.end_time = Some(chrono::Utc::now().timestamp_millis());
        self.success = Some(success);
        if !success {
            self.error = Some(match result.get("error") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => result.to_string(),
            });
        }
        self.result = Some(result);
    }

    pub fn add_recovery_info(&mut self, strategy: &str, details: Value) {
        self.recovery_strategy = Some(strategy.to_string());
        self.recovery_details = Some(details);
    }
}

/// 任务创建参数；Task::new 是唯一物化路径
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskSpec {
    pub description: String,
    pub action: String,
    pub parameters: Map<String, Value>,
    /// 占位符名 → 前置任务描述
    pub required_inputs: BTreeMap<String, String>,
    pub priority: i32,
    pub goal: Option<String>,
    pub parent_id: Option<TaskId>,
    pub max_attempts: u32,
}

impl TaskSpec {
    /// 未显式指定时的重试上限；入库方可据此判断调用方是否改过
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    pub fn new(description: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            action: action.into(),
            priority: 1,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            ..Default::default()
        }
    }
}

/// 任务实体；由 TaskStore 独占持有
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// 自由文本，同时充当依赖查找键
    pub description: String,
    /// 注册的动作名
    pub action: String,
    /// 参数模板；字符串值可内嵌 {{name}} 占位符，解析结果只落在 Attempt 上
    pub parameters: Map<String, Value>,
    /// 占位符名 → 前置任务描述
    pub required_inputs: BTreeMap<String, String>,
    /// 生成期建立的稳定链接：占位符名 → 同批前置任务 id
    pub input_links: BTreeMap<String, TaskId>,
    /// 越大越先执行；同级按创建顺序
    pub priority: i32,
    pub status: TaskStatus,
    /// 所属规划会话的目标
    pub goal: Option<String>,
    /// 溯源反向引用，不表达所有权
    pub parent_id: Option<TaskId>,
    pub subtasks: Vec<TaskId>,
    /// 最近一次执行的归一化结果
    pub result: Option<Value>,
    pub output: Option<Value>,
    pub attempts: Vec<Attempt>,
    /// 恒等于 attempts.len()
    pub current_attempt: u32,
    pub max_attempts: u32,
    /// 毫秒时间戳
    pub created_at: i64,
    pub completed_at: Option<i64>,
    /// 仓库分配的创建序号，同优先级 FIFO 定序
    pub seq: u64,
    pub ethical_note: Option<String>,
}

impl Task {
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            description: spec.description,
            action: spec.action,
            parameters: spec.parameters,
            required_inputs: spec.required_inputs,
            input_links: BTreeMap::new(),
            priority: spec.priority,
            status: TaskStatus::Pending,
            goal: spec.goal,
            parent_id: spec.parent_id,
            subtasks: Vec::new(),
            result: None,
            output: None,
            attempts: Vec::new(),
            current_attempt: 0,
            max_attempts: spec.max_attempts.max(1),
            created_at: chrono::Utc::now().timestamp_millis(),
            completed_at: None,
            seq: 0,
            ethical_note: None,
        }
    }

    /// 打开第 n 次尝试（n = attempts.len() + 1）并同步 current_attempt
    pub fn open_attempt(&mut self, resolved_parameters: Map<String, Value>) -> u32 {
        let number = self.attempts.len() as u32 + 1;
        self.attempts.push(Attempt::new(number, resolved_parameters));
        self.current_attempt = self.attempts.len() as u32;
        number
    }

    pub fn last_attempt_mut(&mut self) -> Option<&mut Attempt> {
        self.attempts.last_mut()
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.current_attempt >= self.max_attempts
    }
}
