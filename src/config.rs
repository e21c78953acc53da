use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BIND: &str = "127.0.0.1:8000";
pub const DEFAULT_CONFIG_PATH: &str = "config/atlas.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind: String,
    pub cors_origins: Vec<String>,
    pub paths: PathsConfig,
    pub engine: EngineConfig,
    pub llm: LlmConfig,
    pub cleanup: CleanupConfig,
    pub readiness: ReadinessConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: String::from(DEFAULT_BIND),
            cors_origins: vec![String::from("http://localhost:8000")],
            paths: PathsConfig::default(),
            engine: EngineConfig::default(),
            llm: LlmConfig::default(),
            cleanup: CleanupConfig::default(),
            readiness: ReadinessConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root under which per-batch working directories are created.
    /// Falls back to the system temp dir.
    pub work_root: Option<PathBuf>,
    pub macro_template: Option<PathBuf>,
    pub conversion_template: Option<PathBuf>,
    /// Subdirectories the macro template writes categorized outputs into.
    pub output_categories: Vec<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_root: None,
            macro_template: None,
            conversion_template: None,
            output_categories: vec![
                String::from("Images"),
                String::from("Statistics"),
                String::from("Metadata"),
            ],
        }
    }
}

impl PathsConfig {
    pub fn resolved_work_root(&self) -> PathBuf {
        self.work_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("atlas-backend"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub program: String,
    pub args: Vec<String>,
    pub probe_args: Vec<String>,
    pub start_retries: u32,
    pub start_retry_delay_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: String::from("ImageJ-linux64"),
            args: vec![String::from("--headless"), String::from("-macro")],
            probe_args: vec![String::from("--headless"), String::from("--version")],
            start_retries: 3,
            start_retry_delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    #[serde(skip_serializing)]
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: String::from("https://api.anthropic.com"),
            model: String::from("claude-3-5-sonnet-latest"),
            max_tokens: 4096,
            temperature: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub delay_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { delay_secs: 300 }
    }
}

impl CleanupConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub log_timeout_secs: u64,
    pub file_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub stability_rounds: u32,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            log_timeout_secs: 60,
            file_timeout_secs: 120,
            poll_interval_ms: 1000,
            stability_rounds: 10,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse config TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub config_path: Option<String>,
    pub bind: Option<String>,
    pub work_root: Option<String>,
    pub engine_program: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        Self {
            config_path: var("ATLAS_CONFIG"),
            bind: var("ATLAS_BACKEND_BIND"),
            work_root: var("ATLAS_WORK_ROOT"),
            engine_program: var("ATLAS_ENGINE_PROGRAM"),
            api_key: var("ANTHROPIC_API_KEY"),
            model: var("ATLAS_LLM_MODEL"),
        }
    }
}

pub fn default_app_root() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

pub fn load_app_config(app_root: &Path) -> Result<AppConfig, ConfigError> {
    select_app_config(app_root, &EnvOverrides::from_env())
}

pub fn select_app_config(app_root: &Path, env: &EnvOverrides) -> Result<AppConfig, ConfigError> {
    let explicit = non_empty(env.config_path.as_deref()).map(PathBuf::from);
    let mut config = match explicit {
        Some(path) => {
            let path = if path.is_absolute() {
                path
            } else {
                app_root.join(path)
            };
            read_config_file(path.as_path())?
        }
        None => {
            let default_path = app_root.join(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                read_config_file(default_path.as_path())?
            } else {
                AppConfig::default()
            }
        }
    };

    if let Some(bind) = non_empty(env.bind.as_deref()) {
        config.bind = bind.to_string();
    }
    if let Some(work_root) = non_empty(env.work_root.as_deref()) {
        config.paths.work_root = Some(PathBuf::from(work_root));
    }
    if let Some(program) = non_empty(env.engine_program.as_deref()) {
        config.engine.program = program.to_string();
    }
    if let Some(api_key) = non_empty(env.api_key.as_deref()) {
        config.llm.api_key = api_key.to_string();
    }
    if let Some(model) = non_empty(env.model.as_deref()) {
        config.llm.model = model.to_string();
    }
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|error| ConfigError::ReadFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    toml::from_str::<AppConfig>(raw.as_str()).map_err(|error| ConfigError::ParseToml {
        path: path.display().to_string(),
        message: error.to_string(),
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
