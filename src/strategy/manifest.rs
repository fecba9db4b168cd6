//! 策略清单加载

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::fs;

use crate::error::StrategyError;
use crate::models::grading::{DEFAULT_MAX_SCORE, PASS_RATIO};
use crate::models::Capability;

fn default_max_score() -> f64 {
    DEFAULT_MAX_SCORE
}

/// 策略清单
///
/// ```toml
/// id = "py_hw1"
/// name = "Python 第一次作业"
/// course = "Python 程序设计"
/// kind = "rule_based"
/// max_score = 100
///
/// [[rule_based.checks]]
/// name = "打印问候语"
/// file = "main.py"
/// strict = 'print\("Hello, World!"\)'
/// loose = "print"
/// points = 20
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyManifest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub course: String,
    pub kind: String,
    #[serde(default = "default_max_score")]
    pub max_score: f64,
    /// 及格线，缺省为满分的 60%
    #[serde(default)]
    pub pass_score: Option<f64>,
    #[serde(default)]
    pub direct_ai: Option<DirectAiSection>,
    #[serde(default)]
    pub rule_based: Option<RuleBasedSection>,
    /// 清单文件路径（加载时填充）
    #[serde(skip)]
    pub source_path: PathBuf,
}

/// AI 批改的模板内容
#[derive(Debug, Clone, Deserialize)]
pub struct DirectAiSection {
    /// 题目内容
    pub exam_content: String,
    /// 评分标准
    pub grading_standard: String,
    #[serde(default)]
    pub extra_instruction: String,
    /// 能力回退链，缺省为 vision -> standard
    #[serde(default)]
    pub capabilities: Option<Vec<Capability>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleBasedSection {
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
}

/// 一条规则检查
#[derive(Debug, Clone, Deserialize)]
pub struct CheckSpec {
    pub name: String,
    /// 期望的文件（文件名或相对路径）
    pub file: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    /// 严格匹配：满分
    pub strict: String,
    /// 宽松匹配：一半分数（至少 1 分）
    #[serde(default)]
    pub loose: Option<String>,
    pub points: f64,
}

impl StrategyManifest {
    pub fn pass_score(&self) -> f64 {
        self.pass_score.unwrap_or(self.max_score * PASS_RATIO)
    }

    fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("id 不能为空".to_string());
        }
        if self.name.trim().is_empty() {
            return Err("name 不能为空".to_string());
        }
        if !self.max_score.is_finite() || self.max_score <= 0.0 {
            return Err(format!("max_score 非法: {}", self.max_score));
        }
        Ok(())
    }

    pub(crate) fn invalid(&self, reason: impl Into<String>) -> StrategyError {
        StrategyError::ManifestInvalid {
            path: self.source_path.display().to_string(),
            reason: reason.into(),
        }
    }
}

/// 读取并校验一个清单文件
pub async fn load_manifest(path: &Path) -> Result<StrategyManifest, StrategyError> {
    let invalid = |reason: String| StrategyError::ManifestInvalid {
        path: path.display().to_string(),
        reason,
    };

    let content = fs::read_to_string(path)
        .await
        .map_err(|e| invalid(format!("无法读取: {}", e)))?;
    let mut manifest: StrategyManifest =
        toml::from_str(&content).map_err(|e| invalid(format!("无法解析: {}", e)))?;
    manifest.validate().map_err(invalid)?;
    manifest.source_path = path.to_path_buf();

    Ok(manifest)
}

/// 列出目录下所有 `.toml` 清单，按文件名排序
pub async fn list_manifest_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
