use std::path::Path;

use serde::Deserialize;

use crate::error::{AppError, AppResult, ConfigError};

/// 程序配置文件
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite 数据库路径（厂商/模型/班级/成绩）
    pub database_path: String,
    /// 班级工作区根目录（未为班级单独指定目录时使用）
    pub workspace_root: String,
    /// 评分策略清单目录
    pub strategies_dir: String,
    /// 批改线程池大小（本地并发，和厂商并发限制无关）
    pub max_grading_workers: usize,
    /// 单次 AI 请求超时时间（秒）
    pub request_timeout_secs: u64,
    /// 厂商未配置并发数时使用的默认值
    pub default_provider_limit: usize,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 运行日志文件
    pub output_log_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "grading.db".to_string(),
            workspace_root: "workspaces".to_string(),
            strategies_dir: "strategies".to_string(),
            max_grading_workers: 16,
            request_timeout_secs: 300,
            default_provider_limit: 3,
            verbose_logging: false,
            output_log_file: "grading_log.txt".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            database_path: std::env::var("GRADING_DB_PATH").unwrap_or(default.database_path),
            workspace_root: std::env::var("WORKSPACE_ROOT").unwrap_or(default.workspace_root),
            strategies_dir: std::env::var("STRATEGIES_DIR").unwrap_or(default.strategies_dir),
            max_grading_workers: std::env::var("MAX_GRADING_WORKERS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.max_grading_workers),
            request_timeout_secs: std::env::var("REQUEST_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.request_timeout_secs),
            default_provider_limit: std::env::var("DEFAULT_PROVIDER_LIMIT").ok().and_then(|v| v.parse().ok()).unwrap_or(default.default_provider_limit),
            verbose_logging: std::env::var("VERBOSE_LOGGING").ok().and_then(|v| v.parse().ok()).unwrap_or(default.verbose_logging),
            output_log_file: std::env::var("OUTPUT_LOG_FILE").unwrap_or(default.output_log_file),
        }
    }

    /// 从 TOML 文件加载配置，缺省字段使用默认值
    pub fn from_toml_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::io(path.display().to_string(), e))?;
        let config: Config = toml::from_str(&content).map_err(|source| {
            AppError::Config(ConfigError::FileParseFailed {
                path: path.display().to_string(),
                source,
            })
        })?;
        Ok(config.normalized())
    }

    /// 修正不合法的取值（线程池和并发数至少为 1）
    pub fn normalized(mut self) -> Self {
        self.max_grading_workers = self.max_grading_workers.max(1);
        self.default_provider_limit = self.default_provider_limit.max(1);
        self
    }
}
