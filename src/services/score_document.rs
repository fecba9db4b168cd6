//! 成绩汇总文档 - 业务能力层
//!
//! 只负责"把一个班级的成绩写成 JSON 汇总"，不关心批改流程。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use tracing::debug;

use crate::models::{Cohort, GradeRecord, GradeStatus};

/// 汇总文档中的一行
#[derive(Debug, Serialize)]
struct ScoreRow<'a> {
    student_id: &'a str,
    name: &'a str,
    total_score: f64,
    status: GradeStatus,
    deduct_details: &'a str,
    filename: &'a str,
}

#[derive(Debug, Serialize)]
struct ScoreDocument<'a> {
    cohort_id: i64,
    cohort_name: &'a str,
    course: &'a str,
    strategy: &'a str,
    generated_at: String,
    pass_count: usize,
    total: usize,
    rows: Vec<ScoreRow<'a>>,
}

/// 成绩汇总写入服务
pub struct ScoreDocumentWriter {
    file_name: String,
}

impl ScoreDocumentWriter {
    pub fn new() -> Self {
        Self {
            file_name: "score_summary.json".to_string(),
        }
    }

    /// 使用自定义文件名
    pub fn with_file_name(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    /// 写入汇总文件，返回文件路径
    ///
    /// `names` 是 (学号, 姓名) 列表，用于补全姓名；成绩按学号排序。
    pub async fn write(
        &self,
        dir: &Path,
        cohort: &Cohort,
        names: &[(String, String)],
        grades: &[GradeRecord],
    ) -> Result<PathBuf> {
        let mut rows: Vec<ScoreRow<'_>> = grades
            .iter()
            .map(|g| ScoreRow {
                student_id: &g.student_id,
                name: names
                    .iter()
                    .find(|(sid, _)| sid == &g.student_id)
                    .map(|(_, name)| name.as_str())
                    .unwrap_or(""),
                total_score: g.total_score,
                status: g.status,
                deduct_details: &g.deduct_details,
                filename: &g.filename,
            })
            .collect();
        rows.sort_by(|a, b| a.student_id.cmp(b.student_id));

        let document = ScoreDocument {
            cohort_id: cohort.id,
            cohort_name: &cohort.name,
            course: &cohort.course,
            strategy: &cohort.strategy,
            generated_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            pass_count: grades.iter().filter(|g| g.status == GradeStatus::Pass).count(),
            total: grades.len(),
            rows,
        };

        let json = serde_json::to_string_pretty(&document).context("序列化成绩汇总失败")?;
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("创建目录失败: {}", dir.display()))?;
        let path = dir.join(&self.file_name);
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("写入成绩汇总失败: {}", path.display()))?;

        debug!("成绩汇总已写入: {} ({} 条)", path.display(), document.total);
        Ok(path)
    }
}

impl Default for ScoreDocumentWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GradingResult;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_summary_contains_sorted_rows_and_pass_count() {
        let tmp = TempDir::new().unwrap();
        let cohort = Cohort {
            id: 7,
            name: "软件1班".to_string(),
            course: "Python".to_string(),
            strategy: "py_hw1".to_string(),
            workspace_path: String::new(),
            created_by: 1,
        };
        let mut passed = GradingResult::new();
        passed.total_score = 88.0;
        let passed = passed.finalize(100.0, 60.0);
        let grades = vec![
            GradeRecord::error("2023002", 7, "未找到提交文件", ""),
            GradeRecord::from_result("2023001", 7, &passed, "2023001.zip"),
        ];
        let names = vec![
            ("2023001".to_string(), "张三".to_string()),
            ("2023002".to_string(), "李四".to_string()),
        ];

        let path = ScoreDocumentWriter::new()
            .write(tmp.path(), &cohort, &names, &grades)
            .await
            .unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["pass_count"], 1);
        assert_eq!(value["total"], 2);
        assert_eq!(value["rows"][0]["student_id"], "2023001");
        assert_eq!(value["rows"][0]["name"], "张三");
        assert_eq!(value["rows"][1]["status"], "ERROR");
    }
}
