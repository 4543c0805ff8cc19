//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `JIVA__*` 覆盖（双下划线表示嵌套，如 `JIVA__LLM__MODEL=gpt-4o-mini`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub tasks: TasksSection,
    #[serde(default)]
    pub ethics: EthicsSection,
    #[serde(default)]
    pub memory: MemorySection,
}

/// [app] 段：应用名
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：OpenAI 兼容端点与模型选择
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub model: String,
    /// 兼容端点地址；未设置时走官方 API
    pub base_url: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: None,
            embedding_model: default_embedding_model(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

/// [tasks] 段：任务生命周期参数
#[derive(Debug, Clone, Deserialize)]
pub struct TasksSection {
    /// 单任务尝试上限；达到后恢复终止并标记 max_attempts_reached
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 历史结果进入 prompt 前的截断长度（字符）
    #[serde(default = "default_result_truncate_chars")]
    pub result_truncate_chars: usize,
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            result_truncate_chars: default_result_truncate_chars(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_result_truncate_chars() -> usize {
    500
}

/// [ethics] 段：伦理闸门开关与原则列表
#[derive(Debug, Clone, Deserialize)]
pub struct EthicsSection {
    #[serde(default = "default_ethics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_principles")]
    pub principles: Vec<String>,
}

impl Default for EthicsSection {
    fn default() -> Self {
        Self {
            enabled: default_ethics_enabled(),
            principles: default_principles(),
        }
    }
}

fn default_ethics_enabled() -> bool {
    true
}

fn default_principles() -> Vec<String> {
    vec![
        "Doing is better than not doing".into(),
        "Do not assume everything is evil or malicious unless there is explicit evidence".into(),
        "Do no evil".into(),
    ]
}

/// [memory] 段：短期记忆容量
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_short_term_capacity")]
    pub short_term_capacity: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            short_term_capacity: default_short_term_capacity(),
        }
    }
}

fn default_short_term_capacity() -> usize {
    100
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            llm: LlmSection::default(),
            tasks: TasksSection::default(),
            ethics: EthicsSection::default(),
            memory: MemorySection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 JIVA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 JIVA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("JIVA")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.tasks.max_attempts, 3);
        assert_eq!(cfg.tasks.result_truncate_chars, 500);
        assert!(cfg.ethics.enabled);
        assert_eq!(cfg.ethics.principles.len(), 3);
        assert_eq!(cfg.llm.model, "gpt-4o-mini");
    }
}
