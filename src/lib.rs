//! Jiva - Rust 自主智能体核心
//!
//! 模块划分：
//! - **actions**: 动作抽象（Action trait、注册表、返回值归一化）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务生命周期引擎（数据模型、仓库/队列、生成、依赖解析、派发、恢复）
//! - **ethics**: 伦理闸门（任务创建前的布尔裁决 + 解释）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）、宽容 JSON 解析、重试
//! - **memory**: 短期记忆收纳（任务执行审计流水）
//! - **observability**: tracing 初始化

pub mod actions;
pub mod config;
pub mod core;
pub mod ethics;
pub mod llm;
pub mod memory;
pub mod observability;

pub use crate::core::{RecoveryPlan, Task, TaskEngine, TaskSpec, TaskStatus, TaskStore};
