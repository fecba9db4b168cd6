use thiserror::Error;

use crate::models::provider::Capability;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 配置错误（没有可用的厂商/模型等）
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 上游 AI 服务错误
    #[error("上游服务错误: {0}")]
    Upstream(#[from] UpstreamError),
    /// 评分策略错误
    #[error("评分策略错误: {0}")]
    Strategy(#[from] StrategyError),
    /// 提交文件相关错误
    #[error("提交文件错误: {0}")]
    Submission(#[from] SubmissionError),
    /// 存储错误
    #[error("存储错误: {0}")]
    Storage(#[from] StorageError),
    /// 其他错误（用于包装第三方库错误）
    #[error("错误: {0}")]
    Other(String),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 指定能力下没有启用的厂商/模型
    #[error("服务不可用: 没有启用的 {capability} 模型")]
    NoProvider { capability: Capability },
    /// 回退链上所有能力均无可用模型
    #[error("服务不可用: 能力链 {chain} 均无可用模型")]
    NoProviderInChain { chain: String },
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 配置文件解析失败
    #[error("配置文件解析失败 ({path}): {source}")]
    FileParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// 上游 AI 调用错误
///
/// 网络、鉴权、协议解析失败统一归为这一种，只携带原始信息，不做重试。
#[derive(Debug, Error)]
#[error("Upstream API Error ({provider}): {message}")]
pub struct UpstreamError {
    pub provider: String,
    pub message: String,
}

impl UpstreamError {
    pub fn new(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// 评分策略错误
#[derive(Debug, Error)]
pub enum StrategyError {
    /// 策略不存在（或加载失败）
    #[error("评分策略不可用: {id}")]
    Unavailable { id: String },
    /// 策略清单解析失败
    #[error("策略清单解析失败 ({path}): {reason}")]
    ManifestInvalid { path: String, reason: String },
    /// 未注册的策略类型
    #[error("未知的策略类型 '{kind}' ({path})")]
    UnknownKind { kind: String, path: String },
    /// 批改过程中抛出的错误
    #[error("批改执行失败: {0}")]
    Execution(String),
}

/// 提交文件相关错误
#[derive(Debug, Error)]
pub enum SubmissionError {
    /// 班级不存在
    #[error("班级不存在: {cohort_id}")]
    CohortNotFound { cohort_id: i64 },
    /// 学生不存在
    #[error("找不到学生: {student_id}")]
    StudentNotFound { student_id: String },
    /// 未找到提交文件
    #[error("未找到提交文件")]
    NotFound,
    /// 学号不能用作目录名
    #[error("非法学号: {student_id}")]
    InvalidStudentId { student_id: String },
    /// 不支持的压缩格式
    #[error("不支持的压缩格式: {filename}")]
    UnsupportedArchive { filename: String },
    /// 解压失败
    #[error("解压失败 ({filename}): {reason}")]
    ExtractFailed { filename: String, reason: String },
}

/// 存储错误
#[derive(Debug, Error)]
pub enum StorageError {
    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),
    /// 文件读写错误
    #[error("文件读写失败 ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 序列化失败
    #[error("序列化失败: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ========== 从常见错误类型转换 ==========

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Storage(StorageError::Database(err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Storage(StorageError::Serialize(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Storage(StorageError::Io {
            path: String::new(),
            source: err,
        })
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        AppError::Submission(SubmissionError::ExtractFailed {
            filename: String::new(),
            reason: err.to_string(),
        })
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(ConfigError::FileParseFailed {
            path: String::new(),
            source: err,
        })
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建文件读写错误
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        AppError::Storage(StorageError::Io {
            path: path.into(),
            source,
        })
    }

    /// 创建"无可用模型"错误
    pub fn no_provider(capability: Capability) -> Self {
        AppError::Config(ConfigError::NoProvider { capability })
    }

    /// 创建策略不可用错误
    pub fn strategy_unavailable(id: impl Into<String>) -> Self {
        AppError::Strategy(StrategyError::Unavailable { id: id.into() })
    }

    /// 是否属于配置层面的错误（整批无法继续）
    pub fn is_config(&self) -> bool {
        matches!(self, AppError::Config(_))
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
