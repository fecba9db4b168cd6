//! 批改服务 - 编排层
//!
//! ## 职责
//!
//! - `grade_one`：批改一个学生（找文件 → 解压 → 取策略 → 批改 → 落库）
//! - `grade_all`：清空旧成绩后并发批改整个班级，汇总统计并写成绩汇总文档
//!
//! 单个学生的任何失败（找不到文件、解压失败、策略报错甚至 panic）都会变成
//! 一条 ERROR 成绩记录，不影响其他学生。"没有可用模型"这类配置错误同样落库，
//! 并额外向上传播。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::workspace::CohortWorkspace;
use crate::config::Config;
use crate::error::{AppError, AppResult, SubmissionError};
use crate::infrastructure::{unpack_submission, Database};
use crate::models::{Cohort, GradeRecord, GradingResult, StudentInfo};
use crate::services::{CapabilityRouter, ScoreDocumentWriter};
use crate::strategy::StrategyRegistry;
use crate::utils::logging::{log_batch_complete, log_batch_start};

/// 单个学生的批改结果
#[derive(Debug, Clone, Serialize)]
pub struct GradeOutcome {
    pub success: bool,
    pub message: String,
    pub result_data: Option<GradingResult>,
}

impl GradeOutcome {
    fn ok(result: GradingResult) -> Self {
        Self {
            success: true,
            message: "批改完成".to_string(),
            result_data: Some(result),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            result_data: None,
        }
    }
}

/// 一个班级的批改统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub success: usize,
    pub failed: usize,
    pub total: usize,
}

/// 批改服务
pub struct GradingService {
    store: Arc<Database>,
    registry: Arc<StrategyRegistry>,
    router: Arc<CapabilityRouter>,
    workspace_root: PathBuf,
    max_workers: usize,
    score_writer: ScoreDocumentWriter,
}

impl GradingService {
    pub fn new(
        store: Arc<Database>,
        registry: Arc<StrategyRegistry>,
        router: Arc<CapabilityRouter>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            registry,
            router,
            workspace_root: PathBuf::from(&config.workspace_root),
            max_workers: config.max_grading_workers.max(1),
            score_writer: ScoreDocumentWriter::new(),
        }
    }

    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.registry
    }

    fn workspace(&self, cohort: &Cohort) -> CohortWorkspace {
        CohortWorkspace::for_cohort(cohort, &self.workspace_root)
    }

    /// 批改一个学生
    ///
    /// 配置错误（没有可用模型）先写入 ERROR 记录再返回 `Err`，其他失败都体现在
    /// `GradeOutcome` 里。
    pub async fn grade_one(&self, cohort_id: i64, student_id: &str) -> AppResult<GradeOutcome> {
        let cohort = match self.store.get_cohort(cohort_id) {
            Ok(Some(cohort)) => cohort,
            Ok(None) => {
                return Ok(GradeOutcome::failed(
                    SubmissionError::CohortNotFound { cohort_id }.to_string(),
                ))
            }
            Err(e) => return Ok(GradeOutcome::failed(e.to_string())),
        };
        let student = match self.store.get_student(cohort_id, student_id) {
            Ok(Some(student)) => student,
            Ok(None) => {
                return Ok(GradeOutcome::failed(
                    SubmissionError::StudentNotFound {
                        student_id: student_id.to_string(),
                    }
                    .to_string(),
                ))
            }
            Err(e) => return Ok(GradeOutcome::failed(e.to_string())),
        };
        let tag = format!("[班级 {}][学生 {}]", cohort_id, student_id);

        let workspace = self.workspace(&cohort);
        let submission = match workspace.find_submission(&student).await {
            Ok(Some(path)) => path,
            Ok(None) => {
                warn!("{} ⚠️  未找到提交文件", tag);
                return Ok(self.persist_error(cohort_id, student_id, SubmissionError::NotFound, ""));
            }
            Err(e) => return Ok(self.persist_error(cohort_id, student_id, e, "")),
        };
        let filename = submission
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let scratch = match workspace.extracted_dir(student_id) {
            Ok(dir) => dir,
            Err(e) => {
                warn!("{} ❌ {}", tag, e);
                return Ok(self.persist_error(cohort_id, student_id, e, &filename));
            }
        };
        if let Err(e) = unpack_submission(&submission, &scratch).await {
            warn!("{} ❌ 解压失败: {}", tag, e);
            return Ok(self.persist_error(cohort_id, student_id, e, &filename));
        }

        let Some(strategy) = self.registry.get(&cohort.strategy).await else {
            let err = AppError::strategy_unavailable(&cohort.strategy);
            error!("{} ❌ {}", tag, err);
            return Ok(self.persist_error(cohort_id, student_id, err, &filename));
        };

        debug!("{} 使用策略 {} 批改 {}", tag, strategy.id(), filename);
        let info = StudentInfo::from(&student);
        let graded = AssertUnwindSafe(strategy.grade(&scratch, &info))
            .catch_unwind()
            .await;

        let result = match graded {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => match e.downcast::<AppError>() {
                Ok(app) if app.is_config() => {
                    error!("{} ❌ {}", tag, app);
                    self.persist_error(cohort_id, student_id, &app, &filename);
                    return Err(app);
                }
                Ok(app) => {
                    error!("{} ❌ 批改失败: {}", tag, app);
                    return Ok(self.persist_error(cohort_id, student_id, app, &filename));
                }
                Err(e) => {
                    error!("{} ❌ 批改失败: {:#}", tag, e);
                    return Ok(self.persist_error(cohort_id, student_id, format!("{:#}", e), &filename));
                }
            },
            Err(panic) => {
                let message = format!("批改过程崩溃: {}", panic_message(panic.as_ref()));
                error!("{} 💥 {}", tag, message);
                return Ok(self.persist_error(cohort_id, student_id, message, &filename));
            }
        };

        let record = GradeRecord::from_result(student_id, cohort_id, &result, &filename);
        if let Err(e) = self.store.save_grade(&record) {
            error!("{} ❌ 保存成绩失败: {}", tag, e);
            return Ok(GradeOutcome::failed(e.to_string()));
        }

        info!(
            "{} ✅ {} 分 ({})",
            tag, result.total_score, record.status
        );
        Ok(GradeOutcome::ok(result))
    }

    /// 写入 ERROR 成绩记录
    fn persist_error(
        &self,
        cohort_id: i64,
        student_id: &str,
        err: impl ToString,
        filename: &str,
    ) -> GradeOutcome {
        let message = err.to_string();
        let record = GradeRecord::error(student_id, cohort_id, &message, filename);
        if let Err(e) = self.store.save_grade(&record) {
            error!(
                "[班级 {}][学生 {}] 保存错误记录失败: {}",
                cohort_id, student_id, e
            );
        }
        GradeOutcome::failed(message)
    }

    /// 批改整个班级
    ///
    /// 先检查策略所需的模型是否可用（不可用直接返回错误，旧成绩保持不变），
    /// 然后清空旧成绩，以 `max_workers` 的并发逐个调用 `grade_one`。
    pub async fn grade_all(self: &Arc<Self>, cohort_id: i64) -> AppResult<BatchSummary> {
        let cohort = self
            .store
            .get_cohort(cohort_id)?
            .ok_or(SubmissionError::CohortNotFound { cohort_id })?;

        let strategy = self.registry.get(&cohort.strategy).await;
        let ai_mode = strategy.as_ref().map(|s| s.is_ai()).unwrap_or(false);
        if let Some(strategy) = &strategy {
            let chain = strategy.required_capabilities();
            if !chain.is_empty() {
                self.router.resolve_chain(chain)?;
            }
        } else {
            warn!("[班级 {}] ⚠️  评分策略 {} 不可用", cohort_id, cohort.strategy);
        }

        let students = self.store.list_students(cohort_id)?;
        let removed = self.store.clear_grades(cohort_id)?;
        debug!("[班级 {}] 已清除 {} 条旧成绩", cohort_id, removed);

        let total = students.len();
        log_batch_start(cohort_id, &cohort.name, total, self.max_workers, ai_mode);

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut handles = Vec::with_capacity(total);
        for student in &students {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| AppError::Other(e.to_string()))?;
            let service = Arc::clone(self);
            let student_id = student.student_id.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                service.grade_one(cohort_id, &student_id).await
            });
            handles.push((student.student_id.clone(), handle));
        }

        let mut summary = BatchSummary {
            total,
            ..Default::default()
        };
        for (student_id, handle) in handles {
            match handle.await {
                Ok(Ok(outcome)) if outcome.success => summary.success += 1,
                Ok(Ok(_)) => summary.failed += 1,
                Ok(Err(e)) => {
                    error!("[班级 {}][学生 {}] ❌ {}", cohort_id, student_id, e);
                    summary.failed += 1;
                }
                Err(e) => {
                    error!("[班级 {}][学生 {}] 任务执行失败: {}", cohort_id, student_id, e);
                    summary.failed += 1;
                }
            }
        }

        self.write_score_document(&cohort).await;
        log_batch_complete(cohort_id, summary.success, summary.total);
        Ok(summary)
    }

    /// 写成绩汇总文档，失败只记日志
    async fn write_score_document(&self, cohort: &Cohort) {
        let grades = match self.store.list_grades(cohort.id) {
            Ok(grades) => grades,
            Err(e) => {
                warn!("[班级 {}] 读取成绩失败，跳过汇总: {}", cohort.id, e);
                return;
            }
        };
        let names: Vec<(String, String)> = self
            .store
            .list_students(cohort.id)
            .map(|students| {
                students
                    .into_iter()
                    .map(|s| (s.student_id, s.name))
                    .collect()
            })
            .unwrap_or_default();

        let dir = self.workspace(cohort).root().to_path_buf();
        match self.score_writer.write(&dir, cohort, &names, &grades).await {
            Ok(path) => info!("📄 成绩汇总已生成: {}", path.display()),
            Err(e) => warn!("[班级 {}] ⚠️  成绩汇总生成失败: {:#}", cohort.id, e),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_from_payloads() {
        let from_str: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(from_str.as_ref()), "boom");

        let from_string: Box<dyn Any + Send> = Box::new(format!("index {} out of range", 3));
        assert_eq!(panic_message(from_string.as_ref()), "index 3 out of range");

        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_unknown_cohort_or_student_is_not_persisted() {
        let store = Arc::new(Database::open_in_memory().unwrap());
        let router = Arc::new(CapabilityRouter::new(Arc::clone(&store)));
        let env = crate::strategy::StrategyEnv {
            dispatcher: Arc::new(crate::services::AiDispatcher::new(
                Arc::new(crate::infrastructure::ProviderAdmission::new()),
                std::time::Duration::from_secs(1),
            )),
            router: Arc::clone(&router),
        };
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = Arc::new(StrategyRegistry::new(tmp.path(), env).with_builtin_factories());
        let service = Arc::new(GradingService::new(
            Arc::clone(&store),
            registry,
            router,
            &Config::default(),
        ));

        let outcome = service.grade_one(42, "2023001").await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.contains("42"));

        let cohort = store.create_cohort("1班", "Python", "none", "", 1).unwrap();
        let outcome = service.grade_one(cohort, "ghost").await.unwrap();
        assert!(!outcome.success);
        assert!(store.list_grades(cohort).unwrap().is_empty());

        assert!(service.grade_all(42).await.is_err());
    }
}
