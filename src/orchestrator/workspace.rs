//! 班级工作区目录
//!
//! ```text
//! <班级目录>/
//!   raw/                 学生上传的原始文件
//!   extracted/<学号>/     解压后的批改目录
//! ```

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{AppError, AppResult, SubmissionError};
use crate::models::{Cohort, Student};

#[derive(Debug, Clone)]
pub struct CohortWorkspace {
    root: PathBuf,
}

impl CohortWorkspace {
    /// 班级指定了目录就用它，否则放在 `<workspace_root>/cohort_<id>`
    pub fn for_cohort(cohort: &Cohort, workspace_root: &Path) -> Self {
        let root = if cohort.workspace_path.trim().is_empty() {
            workspace_root.join(format!("cohort_{}", cohort.id))
        } else {
            PathBuf::from(&cohort.workspace_path)
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    /// 学号必须是单个普通路径段，否则解压前的清空会越出 `extracted/`
    pub fn extracted_dir(&self, student_id: &str) -> AppResult<PathBuf> {
        let mut components = Path::new(student_id).components();
        let single = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(seg)), None) if seg == student_id
        );
        if !single || student_id.contains('\\') {
            return Err(SubmissionError::InvalidStudentId {
                student_id: student_id.to_string(),
            }
            .into());
        }
        Ok(self.root.join("extracted").join(student_id))
    }

    /// 按文件名查找学生的提交：第一个包含学号或姓名的文件（按文件名排序）
    pub async fn find_submission(&self, student: &Student) -> AppResult<Option<PathBuf>> {
        let raw = self.raw_dir();
        let mut entries = match tokio::fs::read_dir(&raw).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("原始文件目录不存在: {}", raw.display());
                return Ok(None);
            }
            Err(e) => return Err(AppError::io(raw.display().to_string(), e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::io(raw.display().to_string(), e))?
        {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                files.push(entry.path());
            }
        }
        files.sort();

        let name = student.name.trim();
        Ok(files.into_iter().find(|path| {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            file_name.contains(&student.student_id) || (!name.is_empty() && file_name.contains(name))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn cohort(path: &str) -> Cohort {
        Cohort {
            id: 3,
            name: "软件1班".to_string(),
            course: "Python".to_string(),
            strategy: "py_hw1".to_string(),
            workspace_path: path.to_string(),
            created_by: 1,
        }
    }

    fn student(id: &str, name: &str) -> Student {
        Student {
            student_id: id.to_string(),
            name: name.to_string(),
            cohort_id: 3,
        }
    }

    #[test]
    fn test_default_location_under_workspace_root() {
        let ws = CohortWorkspace::for_cohort(&cohort(""), Path::new("/data/ws"));
        assert_eq!(ws.root(), Path::new("/data/ws/cohort_3"));
        assert_eq!(
            ws.extracted_dir("2023001").unwrap(),
            Path::new("/data/ws/cohort_3/extracted/2023001")
        );
    }

    #[test]
    fn test_extracted_dir_rejects_path_like_ids() {
        let ws = CohortWorkspace::for_cohort(&cohort(""), Path::new("/data/ws"));
        for bad in ["../x", "..", ".", "a/b", "/abs", "a\\b", ""] {
            assert!(ws.extracted_dir(bad).is_err(), "{:?} should be rejected", bad);
        }
        assert!(ws.extracted_dir("2023-001.x").is_ok());
    }

    #[tokio::test]
    async fn test_find_by_id_or_name_first_match_wins() {
        let tmp = TempDir::new().unwrap();
        let ws = CohortWorkspace::for_cohort(&cohort(&tmp.path().display().to_string()), Path::new("/unused"));
        fs::create_dir_all(ws.raw_dir()).unwrap();
        fs::write(ws.raw_dir().join("b_2023001_v2.zip"), "").unwrap();
        fs::write(ws.raw_dir().join("a_2023001.zip"), "").unwrap();
        fs::write(ws.raw_dir().join("作业_李四.zip"), "").unwrap();

        let found = ws.find_submission(&student("2023001", "张三")).await.unwrap().unwrap();
        assert!(found.ends_with("a_2023001.zip"));

        let by_name = ws.find_submission(&student("2023002", "李四")).await.unwrap().unwrap();
        assert!(by_name.ends_with("作业_李四.zip"));

        assert!(ws.find_submission(&student("2023009", "")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_raw_dir_means_no_submission() {
        let tmp = TempDir::new().unwrap();
        let ws = CohortWorkspace::for_cohort(&cohort(""), tmp.path());
        assert!(ws.find_submission(&student("2023001", "张三")).await.unwrap().is_none());
    }
}
