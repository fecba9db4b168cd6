//! 手写逻辑型策略：按清单中的规则逐项检查

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::manifest::{CheckSpec, StrategyManifest};
use super::toolkit::{read_text_content, verify_command, FileIndex};
use super::{GradingStrategy, StrategyEnv, StrategyFactory, StrategyOrigin};
use crate::error::StrategyError;
use crate::models::{GradingResult, StudentInfo};

pub const KIND: &str = "rule_based";

/// 编译好的检查项
#[derive(Debug)]
struct CompiledCheck {
    name: String,
    file: String,
    alternatives: Vec<String>,
    strict: Regex,
    loose: Option<Regex>,
    points: f64,
}

impl CompiledCheck {
    fn compile(spec: &CheckSpec, manifest: &StrategyManifest) -> Result<Self, StrategyError> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| manifest.invalid(format!("检查项 '{}' 正则非法: {}", spec.name, e)))
        };
        if !spec.points.is_finite() || spec.points < 0.0 {
            return Err(manifest.invalid(format!("检查项 '{}' 分值非法", spec.name)));
        }
        Ok(Self {
            name: spec.name.clone(),
            file: spec.file.clone(),
            alternatives: spec.alternatives.clone(),
            strict: compile(&spec.strict)?,
            loose: spec.loose.as_deref().map(compile).transpose()?,
            points: spec.points,
        })
    }
}

pub struct RuleBasedStrategy {
    id: String,
    name: String,
    course: String,
    max_score: f64,
    pass_score: f64,
    checks: Vec<CompiledCheck>,
}

#[async_trait]
impl GradingStrategy for RuleBasedStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn course(&self) -> &str {
        &self.course
    }

    fn origin(&self) -> StrategyOrigin {
        StrategyOrigin::Logic
    }

    async fn grade(&self, scratch_dir: &Path, student: &StudentInfo) -> Result<GradingResult> {
        let root = scratch_dir.to_path_buf();
        let index = tokio::task::spawn_blocking(move || FileIndex::scan(&root))
            .await
            .context("扫描提交目录失败")?;
        debug!(
            "[{}] 学生 {} 的提交包含 {} 个文件",
            self.id,
            student.student_id,
            index.len()
        );

        let mut result = GradingResult::new();
        let mut total = 0.0;
        for check in &self.checks {
            let Some(found) = index.smart_find(&check.file, &check.alternatives) else {
                result.add_sub_score(&check.name, 0.0);
                result.add_deduction(format!("{}: 缺少文件 {} (-{})", check.name, check.file, check.points));
                continue;
            };
            if let Some(note) = &found.note {
                result.add_deduction(format!("{}: {} (-{})", check.name, note, found.penalty));
            }

            let content = read_text_content(&found.path)
                .await
                .with_context(|| format!("读取文件失败: {}", found.relative))?;
            let outcome = verify_command(
                &content,
                &check.name,
                &check.strict,
                check.loose.as_ref(),
                check.points,
            );
            if let Some(deduction) = outcome.deduction {
                result.add_deduction(deduction);
            }

            let score = (outcome.score - found.penalty).max(0.0);
            result.add_sub_score(&check.name, score);
            total += score;
        }

        result.total_score = total;
        Ok(result.finalize(self.max_score, self.pass_score))
    }
}

/// `rule_based` 工厂
pub struct RuleBasedFactory;

impl StrategyFactory for RuleBasedFactory {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn build(
        &self,
        manifest: &StrategyManifest,
        _env: &StrategyEnv,
    ) -> Result<Arc<dyn GradingStrategy>, StrategyError> {
        let section = manifest
            .rule_based
            .as_ref()
            .ok_or_else(|| manifest.invalid("缺少 [rule_based] 配置"))?;
        if section.checks.is_empty() {
            return Err(manifest.invalid("[rule_based] 至少需要一条检查"));
        }
        let checks = section
            .checks
            .iter()
            .map(|spec| CompiledCheck::compile(spec, manifest))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Arc::new(RuleBasedStrategy {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            course: manifest.course.clone(),
            max_score: manifest.max_score,
            pass_score: manifest.pass_score(),
            checks,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{Database, ProviderAdmission};
    use crate::services::{AiDispatcher, CapabilityRouter};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn env() -> StrategyEnv {
        StrategyEnv {
            dispatcher: Arc::new(AiDispatcher::new(
                Arc::new(ProviderAdmission::new()),
                Duration::from_secs(1),
            )),
            router: Arc::new(CapabilityRouter::new(Arc::new(Database::open_in_memory().unwrap()))),
        }
    }

    fn manifest(toml_src: &str) -> StrategyManifest {
        toml::from_str(toml_src).unwrap()
    }

    const HELLO: &str = r#"
id = "py_hw1"
name = "Python 第一次作业"
course = "Python"
kind = "rule_based"
max_score = 30

[[rule_based.checks]]
name = "问候"
file = "main.py"
strict = 'print\("Hello, World!"\)'
loose = "print"
points = 20

[[rule_based.checks]]
name = "说明文档"
file = "README.md"
alternatives = ["readme.txt"]
strict = "(?i)作者"
points = 10
"#;

    fn student() -> StudentInfo {
        StudentInfo {
            student_id: "2023001".to_string(),
            name: "张三".to_string(),
        }
    }

    #[tokio::test]
    async fn test_full_marks() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("main.py"), "print(\"Hello, World!\")").unwrap();
        fs::write(tmp.path().join("README.md"), "作者: 张三").unwrap();

        let strategy = RuleBasedFactory.build(&manifest(HELLO), &env()).unwrap();
        assert_eq!(strategy.origin(), StrategyOrigin::Logic);
        assert!(!strategy.is_ai());

        let result = strategy.grade(tmp.path(), &student()).await.unwrap();
        assert_eq!(result.total_score, 30.0);
        assert!(result.is_pass);
        assert!(result.deductions.is_empty());
        assert_eq!(result.sub_scores.len(), 2);
    }

    #[tokio::test]
    async fn test_penalties_and_missing_files() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("Main.py"), "print('hi')").unwrap();

        let strategy = RuleBasedFactory.build(&manifest(HELLO), &env()).unwrap();
        let result = strategy.grade(tmp.path(), &student()).await.unwrap();

        // 宽松匹配 10 分，文件名大小写扣 1 分；README 缺失 0 分
        assert_eq!(result.sub_scores[0].score, 9.0);
        assert_eq!(result.sub_scores[1].score, 0.0);
        assert_eq!(result.total_score, 9.0);
        assert!(!result.is_pass);
        assert_eq!(result.deductions.len(), 3);
        assert!(result.deduct_str().contains("缺少文件 README.md"));
    }

    #[test]
    fn test_invalid_regex_rejected_at_build() {
        let src = HELLO.replace("strict = \"(?i)作者\"", "strict = \"(unclosed\"");
        let err = RuleBasedFactory.build(&manifest(&src), &env()).err().unwrap();
        assert!(matches!(err, StrategyError::ManifestInvalid { .. }));
    }

    #[test]
    fn test_missing_section_rejected() {
        let src = "id = \"x\"\nname = \"x\"\nkind = \"rule_based\"\n";
        assert!(RuleBasedFactory.build(&manifest(src), &env()).is_err());
    }
}
