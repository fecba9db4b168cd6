//! 班级、学生与策略生成任务记录

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// 班级（同一批改策略、同一批次）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cohort {
    pub id: i64,
    pub name: String,
    pub course: String,
    /// 绑定的评分策略 ID
    pub strategy: String,
    /// 工作区目录，空字符串表示使用默认位置
    pub workspace_path: String,
    pub created_by: i64,
}

/// 学生
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub student_id: String,
    pub name: String,
    pub cohort_id: i64,
}

/// 传给评分策略的学生信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentInfo {
    pub student_id: String,
    pub name: String,
}

impl From<&Student> for StudentInfo {
    fn from(student: &Student) -> Self {
        Self {
            student_id: student.student_id.clone(),
            name: student.name.clone(),
        }
    }
}

/// 策略生成任务记录（只读，供策略列表展示）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHistory {
    pub task_id: i64,
    pub name: String,
    pub strategy_id: Option<String>,
    pub status: String,
    pub description: String,
    pub creator_name: Option<String>,
    pub created_at: Option<NaiveDateTime>,
}
