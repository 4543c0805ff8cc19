//! 核心域：任务模型、仓库、生成、解析、恢复与引擎

pub mod engine;
pub mod generator;
pub mod recovery;
pub mod resolver;
pub mod store;
pub mod task;

pub use engine::TaskEngine;
pub use generator::TaskGenerator;
pub use recovery::{RecoveryDecision, RecoveryError, RecoveryManager, RecoveryPlan};
pub use resolver::{extract_useful_value, resolve_parameters};
pub use store::TaskStore;
pub use task::{Attempt, Task, TaskId, TaskSpec, TaskStatus};
