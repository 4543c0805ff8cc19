//! 任务引擎：生成、调度、执行、恢复的总装配
//!
//! 引擎持有仓库的独占所有权，所有状态变更都经由这里的单一路径：
//! 任务创建走 add_task（伦理门禁）、恢复落地走 apply_recovery、
//! 失败收尾走 handle_failure。replan_tasks / rerun_tasks 是控制动作，
//! 在派发进注册表之前被引擎截获。

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::actions::{ActionRegistry, Outcome};
use crate::core::generator::{link_batch, TaskGenerator};
use crate::core::recovery::{RecoveryDecision, RecoveryManager, RecoveryPlan};
use crate::core::resolver::resolve_parameters;
use crate::core::store::TaskStore;
use crate::core::task::{Task, TaskId, TaskSpec, TaskStatus};
use crate::ethics::EthicalGate;
use crate::llm::LlmClient;
use crate::memory::MemorySink;

pub struct TaskEngine {
    actions: Arc<ActionRegistry>,
    ethics: Arc<dyn EthicalGate>,
    memory: Arc<dyn MemorySink>,
    generator: TaskGenerator,
    recovery: RecoveryManager,
    store: TaskStore,
    /// 新任务的默认尝试上限
    max_attempts: u32,
    /// 喂给模型的历史条目截断长度
    result_truncate_chars: usize,
}

impl TaskEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        actions: Arc<ActionRegistry>,
        ethics: Arc<dyn EthicalGate>,
        memory: Arc<dyn MemorySink>,
        max_attempts: u32,
        result_truncate_chars: usize,
    ) -> Self {
        Self {
            actions,
            ethics,
            memory,
            generator: TaskGenerator::new(llm.clone()),
            recovery: RecoveryManager::new(llm, result_truncate_chars),
            store: TaskStore::new(),
            max_attempts,
            result_truncate_chars,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// 接收目标：生成任务批次并全部入库
    pub async fn submit_goal(&mut self, goal: &str, context: &str) -> Vec<TaskId> {
        info!(goal, "开始为目标生成任务");
        let specs = self.generator.generate(goal, context, &self.actions).await;
        let ids = self.add_batch(specs, Some(goal)).await;
        info!(goal, count = ids.len(), "目标任务已入库");
        ids
    }

    /// 唯一的任务创建路径：伦理门禁在此，被否决的任务不会进入仓库
    pub async fn add_task(&mut self, mut spec: TaskSpec) -> Option<TaskId> {
        // 只覆盖仍为默认值的重试上限，调用方显式给值则保留
        if spec.max_attempts == 0 || spec.max_attempts == TaskSpec::DEFAULT_MAX_ATTEMPTS {
            spec.max_attempts = self.max_attempts;
        }
        if !self.ethics.evaluate(&spec.description).await {
            let explanation = self.ethics.explain(&spec.description).await;
            warn!(description = %spec.description, "任务被伦理审查否决");
            self.memory
                .record(json!({
                    "type": "task_rejected",
                    "description": spec.description,
                    "explanation": explanation,
                }))
                .await;
            return None;
        }
        let task = Task::new(spec);
        debug!(task_id = %task.id, action = %task.action, "任务入库");
        Some(self.store.add(task))
    }

    /// 批量入库：think 任务成为其后非 think 任务的父任务（到下一个
    /// think 为止的浅分组，仅供回溯，不影响调度）；批内依赖在落库后
    /// 登记 id 链接
    async fn add_batch(&mut self, specs: Vec<TaskSpec>, goal: Option<&str>) -> Vec<TaskId> {
        let mut ids = Vec::new();
        let mut think_parent: Option<TaskId> = None;
        for mut spec in specs {
            if spec.goal.is_none() {
                spec.goal = goal.map(str::to_string);
            }
            let is_think = spec.action == "think";
            // 已显式指定父任务的（如拆解子任务）不参与分组
            if !is_think && spec.parent_id.is_none() {
                if let Some(parent) = &think_parent {
                    spec.parent_id = Some(parent.clone());
                }
            }
            if let Some(id) = self.add_task(spec).await {
                if is_think {
                    think_parent = Some(id.clone());
                }
                ids.push(id);
            }
        }
        link_batch(&mut self.store, &ids);
        ids
    }

    /// 执行一个任务；队列为空返回 None
    pub async fn step(&mut self) -> Option<TaskId> {
        let id = self.store.next()?;
        self.execute_task(&id).await;
        Some(id)
    }

    /// 跑空就绪队列，返回执行的尝试次数
    pub async fn run_pending(&mut self) -> usize {
        let mut executed = 0;
        while self.step().await.is_some() {
            executed += 1;
        }
        executed
    }

    async fn execute_task(&mut self, id: &TaskId) {
        let Some(task) = self.store.get(id).cloned() else {
            error!(task_id = %id, "队列给出了仓库中不存在的任务");
            return;
        };

        let resolved = resolve_parameters(&self.store, &task);
        let attempt_number = match self.store.get_mut(id) {
            Some(t) => t.open_attempt(resolved.clone()),
            None => return,
        };
        info!(
            task_id = %id,
            action = %task.action,
            attempt = attempt_number,
            "执行任务: {}", task.description
        );

        let outcome = self.dispatch(&task, &resolved).await;
        let result_value = outcome.to_value();
        if let Some(t) = self.store.get_mut(id) {
            if let Some(attempt) = t.last_attempt_mut() {
                attempt.complete(result_value.clone(), outcome.success);
            }
        }

        if outcome.success {
            self.store.complete(id, result_value.clone());
            self.memory
                .record(json!({
                    "type": "task_completed",
                    "task_id": id,
                    "description": task.description,
                    "result": result_value,
                }))
                .await;
            info!(task_id = %id, "任务完成");
        } else {
            warn!(task_id = %id, error = %outcome.error_text(), "任务尝试失败");
            self.memory
                .record(json!({
                    "type": "task_attempt_failed",
                    "task_id": id,
                    "description": task.description,
                    "attempt": attempt_number,
                    "error": outcome.error_text(),
                }))
                .await;
            self.handle_failure(id, outcome).await;
        }
    }

    /// 控制动作在注册表之前截获，其余交给注册表统一归一化
    async fn dispatch(&mut self, task: &Task, resolved: &Map<String, Value>) -> Outcome {
        match task.action.as_str() {
            "replan_tasks" => self.replan(task).await,
            "rerun_tasks" => self.rerun(task, resolved).await,
            _ => self.actions.execute(&task.action, resolved).await,
        }
    }

    /// 失败收尾的唯一入口：先看次数预算，再问恢复分析
    async fn handle_failure(&mut self, id: &TaskId, outcome: Outcome) {
        let Some(task) = self.store.get(id).cloned() else { return };

        if task.attempts_exhausted() {
            let mut result = outcome.to_value();
            if let Some(obj) = result.as_object_mut() {
                obj.insert("max_attempts_reached".into(), json!(true));
            }
            warn!(task_id = %id, attempts = task.attempts.len(), "尝试次数耗尽，任务永久失败");
            self.store.fail(id, result);
            self.memory
                .record(json!({
                    "type": "task_failed",
                    "task_id": id,
                    "description": task.description,
                    "error": outcome.error_text(),
                    "max_attempts_reached": true,
                }))
                .await;
            return;
        }

        match self.recovery.analyze(&task).await {
            Ok(decision) => {
                if let Some(t) = self.store.get_mut(id) {
                    if let Some(attempt) = t.last_attempt_mut() {
                        attempt.add_recovery_info(
                            decision.plan.strategy_name(),
                            json!({"reason": decision.reason, "raw": decision.raw}),
                        );
                    }
                }
                self.apply_recovery(id, decision).await;
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "恢复分析失败，任务永久失败");
                self.store.fail(
                    id,
                    json!({
                        "success": false,
                        "error": outcome.error_text(),
                        "recovery_failed": true,
                    }),
                );
                self.memory
                    .record(json!({
                        "type": "task_failed",
                        "task_id": id,
                        "description": task.description,
                        "recovery_failed": true,
                    }))
                    .await;
            }
        }
    }

    /// 恢复落地的唯一入口，四种策略各自收敛到仓库的一次状态变更
    async fn apply_recovery(&mut self, id: &TaskId, decision: RecoveryDecision) {
        let Some(original) = self.store.get(id).cloned() else { return };
        match decision.plan {
            RecoveryPlan::Retry { parameters } => {
                if let Some(parameters) = parameters {
                    if let Some(t) = self.store.get_mut(id) {
                        t.parameters = parameters;
                    }
                }
                self.store.reinsert(id);
                info!(task_id = %id, "恢复: 重新入队重试");
            }
            RecoveryPlan::Alternative {
                description,
                action,
                parameters,
            } => {
                let mut spec = TaskSpec::new(
                    description
                        .unwrap_or_else(|| format!("ALTERNATIVE: {}", original.description)),
                    action,
                );
                spec.parameters = parameters;
                spec.priority = original.priority;
                spec.goal = original.goal.clone();
                spec.parent_id = Some(id.clone());
                match self.add_task(spec).await {
                    Some(new_id) => {
                        self.store.mark_redirected(id);
                        info!(task_id = %id, replacement = %new_id, "恢复: 改道到替代任务");
                    }
                    None => {
                        let note = self.ethics.explain(&original.description).await;
                        if let Some(t) = self.store.get_mut(id) {
                            t.ethical_note = Some(note);
                        }
                        self.store.fail(
                            id,
                            json!({
                                "success": false,
                                "error": "alternative task rejected by ethical review",
                                "recovery_failed": true,
                            }),
                        );
                    }
                }
            }
            RecoveryPlan::Decompose { subtasks } => {
                let mut prepared = Vec::new();
                for mut spec in subtasks {
                    spec.parent_id = Some(id.clone());
                    spec.priority = original.priority;
                    spec.goal = original.goal.clone();
                    prepared.push(spec);
                }
                let children = self.add_batch(prepared, original.goal.as_deref()).await;
                if children.is_empty() {
                    self.store.fail(
                        id,
                        json!({
                            "success": false,
                            "error": "all decomposed subtasks were rejected",
                            "recovery_failed": true,
                        }),
                    );
                } else {
                    self.store.mark_decomposed(id);
                    info!(task_id = %id, children = children.len(), "恢复: 拆解为子任务");
                }
            }
            RecoveryPlan::Abandon => {
                warn!(task_id = %id, reason = %decision.reason, "恢复: 放弃任务");
                self.store.fail(
                    id,
                    json!({
                        "success": false,
                        "error": decision.reason,
                        "recovery_attempted": true,
                    }),
                );
            }
        }
    }

    /// replan_tasks 控制动作：按执行历史为同一目标续生成任务
    async fn replan(&mut self, meta: &Task) -> Outcome {
        let Some(goal) = meta.goal.clone() else {
            return Outcome::failure("Error: replan_tasks requires the task to carry a goal");
        };
        let context = self.goal_history(&goal);
        let specs = self.generator.generate(&goal, &context, &self.actions).await;
        let ids = self.add_batch(specs, Some(&goal)).await;
        info!(goal = %goal, new_tasks = ids.len(), "重规划完成");
        let mut payload = Map::new();
        payload.insert("replanned".into(), json!(true));
        payload.insert("new_tasks".into(), json!(ids.len()));
        Outcome {
            success: true,
            payload,
        }
    }

    /// rerun_tasks 控制动作：从某个历史任务起重跑一段序列。
    /// 是否真的重跑由模型按经过时间裁决，否决时本动作直接成功返回。
    async fn rerun(&mut self, meta: &Task, resolved: &Map<String, Value>) -> Outcome {
        let Some(goal) = meta.goal.clone() else {
            return Outcome::failure("Error: rerun_tasks requires the task to carry a goal");
        };
        let Some(start_desc) = resolved
            .get("start_task_description")
            .and_then(Value::as_str)
        else {
            return Outcome::failure("Error: rerun_tasks requires 'start_task_description'");
        };

        let Some(start_pos) = self.store.position_in_goal(&goal, start_desc) else {
            return Outcome::failure(format!(
                "Error: no task matching '{}' in this goal",
                start_desc
            ));
        };
        let sequence = self.store.tasks_for_goal(&goal);
        let meta_pos = sequence
            .iter()
            .position(|t| t.id == meta.id)
            .unwrap_or(sequence.len());
        if start_pos >= meta_pos {
            return Outcome::failure("Error: rerun start task is not earlier than this task");
        }

        // 经过时间以起点任务最后一次尝试结束为准
        let start_task = sequence[start_pos];
        let reference = start_task
            .attempts
            .last()
            .and_then(|a| a.end_time)
            .unwrap_or(start_task.created_at);
        let elapsed_min = (chrono::Utc::now().timestamp_millis() - reference) / 60_000;

        let templates: Vec<TaskSpec> = sequence[start_pos..meta_pos]
            .iter()
            .filter(|t| t.action != "replan_tasks" && t.action != "rerun_tasks")
            .map(|t| {
                let mut spec = TaskSpec::new(t.description.clone(), t.action.clone());
                spec.parameters = t.parameters.clone();
                spec.required_inputs = t.required_inputs.clone();
                spec.priority = t.priority;
                spec.goal = Some(goal.clone());
                spec.parent_id = Some(meta.id.clone());
                spec
            })
            .collect();
        let descriptions: Vec<&str> = templates.iter().map(|s| s.description.as_str()).collect();

        if !self.should_rerun(&goal, &descriptions, elapsed_min).await {
            info!(goal = %goal, elapsed_min, "模型判定结果仍然有效，跳过重跑");
            let mut payload = Map::new();
            payload.insert("rerun".into(), json!(false));
            payload.insert("elapsed_minutes".into(), json!(elapsed_min));
            return Outcome {
                success: true,
                payload,
            };
        }

        let ids = self.add_batch(templates, Some(&goal)).await;
        info!(goal = %goal, count = ids.len(), "重跑任务已入队");
        let mut payload = Map::new();
        payload.insert("rerun".into(), json!(true));
        payload.insert("tasks_requeued".into(), json!(ids.len()));
        Outcome {
            success: true,
            payload,
        }
    }

    /// 模型裁决是否需要重跑；裁决不可用时保守跳过
    async fn should_rerun(&self, goal: &str, descriptions: &[&str], elapsed_min: i64) -> bool {
        let prompt = format!(
            "Goal: {}\n\
             The following tasks completed {} minutes ago:\n{}\n\
             Could their results have become stale and need to be re-executed?\n\
             Respond with exactly 'Yes' or 'No'.",
            goal,
            elapsed_min,
            descriptions
                .iter()
                .map(|d| format!("- {}", d))
                .collect::<Vec<_>>()
                .join("\n")
        );
        match self.generator.llm().generate(&prompt).await {
            Ok(verdict) => verdict.trim().to_lowercase().starts_with("yes"),
            Err(e) => {
                warn!(error = %e, "重跑裁决不可用，保守跳过重跑");
                false
            }
        }
    }

    /// 目标的执行历史摘要，供重规划使用
    fn goal_history(&self, goal: &str) -> String {
        let mut lines = String::new();
        for task in self.store.tasks_for_goal(goal) {
            let status = match task.status {
                TaskStatus::Pending => "pending",
                TaskStatus::Completed => "completed",
                TaskStatus::Failed => "failed",
                TaskStatus::Redirected => "redirected",
                TaskStatus::Decomposed => "decomposed",
            };
            let mut line = format!("- [{}] {}", status, task.description);
            if let Some(result) = &task.result {
                let text = result.to_string();
                let snippet: String = text.chars().take(self.result_truncate_chars).collect();
                line.push_str(&format!(" => {}", snippet));
            }
            lines.push_str(&line);
            lines.push('\n');
        }
        lines
    }

    /// 目标的最终状态报告，给 CLI 收尾用
    pub fn goal_report(&self, goal: &str) -> String {
        let mut report = String::new();
        for task in self.store.tasks_for_goal(goal) {
            let mark = match task.status {
                TaskStatus::Completed => "✓",
                TaskStatus::Failed => "✗",
                TaskStatus::Pending => "·",
                TaskStatus::Redirected => "→",
                TaskStatus::Decomposed => "⊕",
            };
            report.push_str(&format!(
                "{} {} ({} attempt{})\n",
                mark,
                task.description,
                task.attempts.len(),
                if task.attempts.len() == 1 { "" } else { "s" }
            ));
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Action, ActionReturn};
    use crate::ethics::Unrestricted;
    use crate::llm::MockLlmClient;
    use crate::memory::NullMemory;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 前 fail_times 次返回错误文本，之后成功
    struct FlakyAction {
        calls: Arc<AtomicUsize>,
        fail_times: usize,
    }

    #[async_trait]
    impl Action for FlakyAction {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "fails a configurable number of times, then succeeds"
        }
        async fn execute(&self, _parameters: &Map<String, Value>) -> ActionReturn {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                ActionReturn::Text(format!("Error: transient failure #{}", n + 1))
            } else {
                ActionReturn::Text("done".to_string())
            }
        }
    }

    struct EchoAction {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Action for EchoAction {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "returns its prompt parameter"
        }
        async fn execute(&self, parameters: &Map<String, Value>) -> ActionReturn {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = parameters
                .get("prompt")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            ActionReturn::Text(text)
        }
    }

    fn engine_with(
        llm: Arc<dyn LlmClient>,
        registry: ActionRegistry,
        max_attempts: u32,
    ) -> TaskEngine {
        TaskEngine::new(
            llm,
            Arc::new(registry),
            Arc::new(Unrestricted),
            Arc::new(NullMemory),
            max_attempts,
            500,
        )
    }

    fn spec(desc: &str, action: &str) -> TaskSpec {
        TaskSpec::new(desc, action)
    }

    #[tokio::test]
    async fn test_successful_task_completes_with_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ActionRegistry::new();
        registry.register(EchoAction { calls: calls.clone() });
        let mut engine = engine_with(Arc::new(MockLlmClient::new()), registry, 3);

        let mut s = spec("Say hello", "echo");
        s.parameters.insert("prompt".into(), json!("hello"));
        let id = engine.add_task(s).await.unwrap();
        engine.run_pending().await;

        let task = engine.store().get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_ref().unwrap()["result"], json!("hello"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_recovery_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ActionRegistry::new();
        registry.register(FlakyAction { calls: calls.clone(), fail_times: 2 });
        // 每次失败恢复分析都回答 RETRY
        let llm = MockLlmClient::with_responses([
            r#"{"strategy": "RETRY", "reason": "transient"}"#,
            r#"{"strategy": "RETRY", "reason": "transient"}"#,
        ]);
        let mut engine = engine_with(Arc::new(llm), registry, 3);

        let id = engine.add_task(spec("Flaky job", "flaky")).await.unwrap();
        engine.run_pending().await;

        let task = engine.store().get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempts.len(), 3);
        assert_eq!(task.attempts[0].recovery_strategy.as_deref(), Some("RETRY"));
        assert!(task.attempts[2].recovery_strategy.is_none());
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fail_permanently() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ActionRegistry::new();
        registry.register(FlakyAction { calls: calls.clone(), fail_times: 99 });
        let llm = MockLlmClient::with_responses([
            r#"{"strategy": "RETRY", "reason": "hope"}"#,
        ]);
        let mut engine = engine_with(Arc::new(llm), registry, 2);

        let id = engine.add_task(spec("Doomed job", "flaky")).await.unwrap();
        engine.run_pending().await;

        let task = engine.store().get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts.len(), 2);
        assert_eq!(task.result.as_ref().unwrap()["max_attempts_reached"], json!(true));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_alternative_recovery_redirects_task() {
        let flaky_calls = Arc::new(AtomicUsize::new(0));
        let echo_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ActionRegistry::new();
        registry.register(FlakyAction { calls: flaky_calls, fail_times: 99 });
        registry.register(EchoAction { calls: echo_calls.clone() });
        let llm = MockLlmClient::with_responses([
            r#"{"strategy": "ALTERNATIVE", "action": "echo",
                "parameters": {"prompt": "plan b"}, "reason": "flaky is broken"}"#,
        ]);
        let mut engine = engine_with(Arc::new(llm), registry, 3);

        let id = engine.add_task(spec("Broken job", "flaky")).await.unwrap();
        engine.run_pending().await;

        let original = engine.store().get(&id).unwrap();
        assert_eq!(original.status, TaskStatus::Redirected);
        assert_eq!(original.subtasks.len(), 1);

        let replacement = engine.store().get(&original.subtasks[0]).unwrap();
        assert_eq!(replacement.status, TaskStatus::Completed);
        assert!(replacement.description.starts_with("ALTERNATIVE:"));
        assert_eq!(replacement.parent_id.as_ref(), Some(&id));
        assert_eq!(echo_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_decompose_recovery_spawns_children() {
        let calls = Arc::new(AtomicUsize::new(0));
        let echo_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ActionRegistry::new();
        registry.register(FlakyAction { calls, fail_times: 99 });
        registry.register(EchoAction { calls: echo_calls.clone() });
        let llm = MockLlmClient::with_responses([
            r#"{"strategy": "DECOMPOSE", "reason": "too big", "subtasks": [
                {"description": "Half one", "action": "echo", "parameters": {"prompt": "1"}},
                {"description": "Half two", "action": "echo", "parameters": {"prompt": "2"}}
            ]}"#,
        ]);
        let mut engine = engine_with(Arc::new(llm), registry, 3);

        let id = engine.add_task(spec("Big job", "flaky")).await.unwrap();
        engine.run_pending().await;

        let original = engine.store().get(&id).unwrap();
        assert_eq!(original.status, TaskStatus::Decomposed);
        assert_eq!(original.subtasks.len(), 2);
        for child_id in &original.subtasks {
            let child = engine.store().get(child_id).unwrap();
            assert_eq!(child.status, TaskStatus::Completed);
        }
        assert_eq!(echo_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_decompose_children_inherit_priority() {
        let mut registry = ActionRegistry::new();
        registry.register(FlakyAction {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_times: 99,
        });
        registry.register(EchoAction { calls: Arc::new(AtomicUsize::new(0)) });
        let llm = MockLlmClient::with_responses([
            r#"{"strategy": "DECOMPOSE", "reason": "too big", "subtasks": [
                {"description": "Urgent half", "action": "echo", "parameters": {"prompt": "1"}}
            ]}"#,
        ]);
        let mut engine = engine_with(Arc::new(llm), registry, 3);

        let mut s = spec("Urgent job", "flaky");
        s.priority = 5;
        let id = engine.add_task(s).await.unwrap();
        engine.run_pending().await;

        let original = engine.store().get(&id).unwrap();
        assert_eq!(original.status, TaskStatus::Decomposed);
        let child = engine.store().get(&original.subtasks[0]).unwrap();
        assert_eq!(child.priority, 5);
    }

    #[tokio::test]
    async fn test_caller_supplied_max_attempts_is_honored() {
        let mut registry = ActionRegistry::new();
        registry.register(EchoAction { calls: Arc::new(AtomicUsize::new(0)) });
        let mut engine = engine_with(Arc::new(MockLlmClient::new()), registry, 5);

        let default_id = engine.add_task(spec("Default budget", "echo")).await.unwrap();
        let mut tight = spec("Tight budget", "echo");
        tight.max_attempts = 1;
        let tight_id = engine.add_task(tight).await.unwrap();

        assert_eq!(engine.store().get(&default_id).unwrap().max_attempts, 5);
        assert_eq!(engine.store().get(&tight_id).unwrap().max_attempts, 1);
    }

    #[tokio::test]
    async fn test_abandon_recovery_fails_with_reason() {
        let mut registry = ActionRegistry::new();
        registry.register(FlakyAction {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_times: 99,
        });
        let llm = MockLlmClient::with_responses([
            r#"{"strategy": "ABANDON", "reason": "fundamentally impossible"}"#,
        ]);
        let mut engine = engine_with(Arc::new(llm), registry, 3);

        let id = engine.add_task(spec("Hopeless job", "flaky")).await.unwrap();
        engine.run_pending().await;

        let task = engine.store().get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts.len(), 1);
        let result = task.result.as_ref().unwrap();
        assert_eq!(result["error"], json!("fundamentally impossible"));
        assert_eq!(result["recovery_attempted"], json!(true));
    }

    #[tokio::test]
    async fn test_unknown_strategy_marks_recovery_failed() {
        let mut registry = ActionRegistry::new();
        registry.register(FlakyAction {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_times: 99,
        });
        let llm = MockLlmClient::with_responses([
            r#"{"strategy": "TELEPORT", "reason": "??"}"#,
        ]);
        let mut engine = engine_with(Arc::new(llm), registry, 3);

        let id = engine.add_task(spec("Odd job", "flaky")).await.unwrap();
        engine.run_pending().await;

        let task = engine.store().get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.result.as_ref().unwrap()["recovery_failed"], json!(true));
    }

    #[tokio::test]
    async fn test_dependency_flows_between_tasks() {
        let echo_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ActionRegistry::new();
        registry.register(EchoAction { calls: echo_calls });
        let mut engine = engine_with(Arc::new(MockLlmClient::new()), registry, 3);

        let mut producer = spec("Compute the answer", "echo");
        producer.parameters.insert("prompt".into(), json!("42"));
        producer.priority = 2;
        let mut consumer = spec("Report the answer", "echo");
        consumer
            .parameters
            .insert("prompt".into(), json!("The answer is {{answer}}"));
        consumer
            .required_inputs
            .insert("answer".into(), "Compute the answer".into());

        let ids = engine.add_batch(vec![producer, consumer], Some("demo")).await;
        engine.run_pending().await;

        let consumer_task = engine.store().get(&ids[1]).unwrap();
        assert_eq!(consumer_task.status, TaskStatus::Completed);
        assert_eq!(
            consumer_task.result.as_ref().unwrap()["result"],
            json!("The answer is 42")
        );
    }

    #[tokio::test]
    async fn test_batch_groups_followers_under_preceding_think() {
        let echo_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ActionRegistry::new();
        registry.register(EchoAction { calls: echo_calls });
        let mut engine = engine_with(Arc::new(MockLlmClient::new()), registry, 3);

        let batch = vec![
            spec("Plan the work", "think"),
            spec("Do part one", "echo"),
            spec("Do part two", "echo"),
            spec("Reflect on results", "think"),
            spec("Do part three", "echo"),
        ];
        let ids = engine.add_batch(batch, Some("g")).await;

        assert_eq!(engine.store().get(&ids[0]).unwrap().parent_id, None);
        assert_eq!(engine.store().get(&ids[1]).unwrap().parent_id, Some(ids[0].clone()));
        assert_eq!(engine.store().get(&ids[2]).unwrap().parent_id, Some(ids[0].clone()));
        assert_eq!(engine.store().get(&ids[3]).unwrap().parent_id, None);
        assert_eq!(engine.store().get(&ids[4]).unwrap().parent_id, Some(ids[3].clone()));
    }

    #[tokio::test]
    async fn test_replan_appends_tasks_for_goal() {
        let echo_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ActionRegistry::new();
        registry.register(EchoAction { calls: echo_calls.clone() });
        // 生成器两次调用：目录筛选 + 任务生成
        let llm = MockLlmClient::with_responses([
            r#"["echo"]"#,
            r#"[{"description": "Follow-up", "action": "echo", "parameters": {"prompt": "more"}}]"#,
        ]);
        let mut engine = engine_with(Arc::new(llm), registry, 3);

        let mut meta = spec("Review progress and replan", "replan_tasks");
        meta.goal = Some("demo goal".into());
        let meta_id = engine.add_task(meta).await.unwrap();
        engine.run_pending().await;

        let meta_task = engine.store().get(&meta_id).unwrap();
        assert_eq!(meta_task.status, TaskStatus::Completed);
        assert_eq!(meta_task.result.as_ref().unwrap()["new_tasks"], json!(1));

        let goal_tasks = engine.store().tasks_for_goal("demo goal");
        assert_eq!(goal_tasks.len(), 2);
        assert_eq!(echo_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rerun_requeues_earlier_segment_when_model_says_yes() {
        let echo_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ActionRegistry::new();
        registry.register(EchoAction { calls: echo_calls.clone() });
        let llm = MockLlmClient::with_responses(["Yes"]);
        let mut engine = engine_with(Arc::new(llm), registry, 3);

        let mut fetch = spec("Fetch metrics", "echo");
        fetch.parameters.insert("prompt".into(), json!("metrics"));
        fetch.goal = Some("monitor".into());
        fetch.priority = 2;
        let fetch_id = engine.add_task(fetch).await.unwrap();

        let mut meta = spec("Refresh stale data", "rerun_tasks");
        meta.goal = Some("monitor".into());
        meta.parameters
            .insert("start_task_description".into(), json!("Fetch metrics"));
        let meta_id = engine.add_task(meta).await.unwrap();

        engine.run_pending().await;

        let meta_task = engine.store().get(&meta_id).unwrap();
        assert_eq!(meta_task.status, TaskStatus::Completed);
        assert_eq!(meta_task.result.as_ref().unwrap()["rerun"], json!(true));

        // 原任务 + 克隆各执行一次
        assert_eq!(echo_calls.load(Ordering::SeqCst), 2);
        let clones: Vec<_> = engine
            .store()
            .tasks_for_goal("monitor")
            .into_iter()
            .filter(|t| t.parent_id.as_ref() == Some(&meta_id))
            .collect();
        assert_eq!(clones.len(), 1);
        assert_eq!(clones[0].description, "Fetch metrics");
        assert_eq!(clones[0].status, TaskStatus::Completed);
        assert_ne!(clones[0].id, fetch_id);
    }

    #[tokio::test]
    async fn test_rerun_skipped_when_model_says_no() {
        let echo_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ActionRegistry::new();
        registry.register(EchoAction { calls: echo_calls.clone() });
        let llm = MockLlmClient::with_responses(["No"]);
        let mut engine = engine_with(Arc::new(llm), registry, 3);

        let mut fetch = spec("Fetch metrics", "echo");
        fetch.goal = Some("monitor".into());
        fetch.priority = 2;
        engine.add_task(fetch).await.unwrap();
        let mut meta = spec("Maybe refresh", "rerun_tasks");
        meta.goal = Some("monitor".into());
        meta.parameters
            .insert("start_task_description".into(), json!("Fetch metrics"));
        let meta_id = engine.add_task(meta).await.unwrap();

        engine.run_pending().await;

        let meta_task = engine.store().get(&meta_id).unwrap();
        assert_eq!(meta_task.status, TaskStatus::Completed);
        assert_eq!(meta_task.result.as_ref().unwrap()["rerun"], json!(false));
        assert_eq!(echo_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.store().tasks_for_goal("monitor").len(), 2);
    }

    #[tokio::test]
    async fn test_rerun_clones_skip_meta_actions() {
        let echo_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ActionRegistry::new();
        registry.register(EchoAction { calls: echo_calls.clone() });
        // 第一条: 坏掉的 rerun_tasks 恢复分析；第二条: 重跑裁决
        let llm = MockLlmClient::with_responses([
            r#"{"strategy": "ABANDON", "reason": "misconfigured"}"#,
            "Yes",
        ]);
        let mut engine = engine_with(Arc::new(llm), registry, 3);

        let mut fetch = spec("Fetch metrics", "echo");
        fetch.parameters.insert("prompt".into(), json!("metrics"));
        fetch.goal = Some("monitor".into());
        engine.add_task(fetch).await.unwrap();

        // 序列中段有一个缺参数的元动作，失败后被放弃
        let mut stale = spec("Broken refresh", "rerun_tasks");
        stale.goal = Some("monitor".into());
        let stale_id = engine.add_task(stale).await.unwrap();

        let mut meta = spec("Refresh stale data", "rerun_tasks");
        meta.goal = Some("monitor".into());
        meta.parameters
            .insert("start_task_description".into(), json!("Fetch metrics"));
        let meta_id = engine.add_task(meta).await.unwrap();

        engine.run_pending().await;

        assert_eq!(engine.store().get(&stale_id).unwrap().status, TaskStatus::Failed);
        let meta_task = engine.store().get(&meta_id).unwrap();
        assert_eq!(meta_task.result.as_ref().unwrap()["rerun"], json!(true));

        // 段内的元动作不参与克隆，只有具体工作任务被重放
        let clones: Vec<_> = engine
            .store()
            .tasks_for_goal("monitor")
            .into_iter()
            .filter(|t| t.parent_id.as_ref() == Some(&meta_id))
            .collect();
        assert_eq!(clones.len(), 1);
        assert_eq!(clones[0].description, "Fetch metrics");
        assert_eq!(echo_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_action_goes_through_recovery() {
        let registry = ActionRegistry::new();
        let llm = MockLlmClient::with_responses([
            r#"{"strategy": "ABANDON", "reason": "no such tool"}"#,
        ]);
        let mut engine = engine_with(Arc::new(llm), registry, 3);

        let id = engine.add_task(spec("Use missing tool", "vanish")).await.unwrap();
        engine.run_pending().await;
        assert_eq!(engine.store().get(&id).unwrap().status, TaskStatus::Failed);
    }
}
