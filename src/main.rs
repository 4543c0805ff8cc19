//! Jiva - 自主任务智能体
//!
//! 入口：初始化日志、加载配置、组装任务引擎，围绕命令行给出的目标
//! 跑完整个任务生命周期后打印执行报告。

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use jiva::actions::{ActionRegistry, SleepAction, ThinkAction};
use jiva::config::load_config;
use jiva::ethics::{EthicalGate, LlmEthicalGate, Unrestricted};
use jiva::llm::{LlmClient, MockLlmClient, OpenAiClient, RetryingLlmClient};
use jiva::memory::ShortTermMemory;
use jiva::TaskEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jiva::observability::init();

    let goal = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if goal.trim().is_empty() {
        anyhow::bail!("usage: jiva <goal>");
    }

    let cfg = load_config(None).context("Failed to load configuration")?;

    // OPENAI_API_KEY 设置时走真实端点，否则回退到回显 Mock
    let provider: Arc<dyn LlmClient> = if std::env::var("OPENAI_API_KEY").is_ok() {
        Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            &cfg.llm.embedding_model,
            None,
        ))
    } else {
        warn!("OPENAI_API_KEY 未设置，使用 Mock 模型运行");
        Arc::new(MockLlmClient::new())
    };
    let llm: Arc<dyn LlmClient> = Arc::new(RetryingLlmClient::new(provider));

    let mut registry = ActionRegistry::new();
    registry.register(ThinkAction::new(llm.clone()));
    registry.register(SleepAction);

    let ethics: Arc<dyn EthicalGate> = if cfg.ethics.enabled {
        Arc::new(LlmEthicalGate::new(
            llm.clone(),
            cfg.ethics.principles.clone(),
            true,
        ))
    } else {
        Arc::new(Unrestricted)
    };
    let memory = Arc::new(ShortTermMemory::new(cfg.memory.short_term_capacity));

    let mut engine = TaskEngine::new(
        llm,
        Arc::new(registry),
        ethics,
        memory,
        cfg.tasks.max_attempts,
        cfg.tasks.result_truncate_chars,
    );

    engine.submit_goal(&goal, "").await;
    let executed = engine.run_pending().await;
    info!(executed, "任务循环结束");

    println!("\nGoal: {}\n{}", goal, engine.goal_report(&goal));
    Ok(())
}
