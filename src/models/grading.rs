//! 评分结果
//!
//! `GradingResult` 是策略的输出；`GradeRecord` 是落库的成绩记录。

use std::fmt;

use serde::{Deserialize, Serialize};

/// 默认满分
pub const DEFAULT_MAX_SCORE: f64 = 100.0;
/// 及格线占满分的比例（百分制下为 60 分）
pub const PASS_RATIO: f64 = 0.6;

/// 评分细项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubScore {
    pub name: String,
    pub score: f64,
}

/// 标准化的评分结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradingResult {
    pub total_score: f64,
    pub is_pass: bool,
    pub sub_scores: Vec<SubScore>,
    pub deductions: Vec<String>,
}

impl GradingResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加一个评分细项，非有限数值按 0 分处理
    pub fn add_sub_score(&mut self, name: impl Into<String>, score: f64) {
        let score = if score.is_finite() { score } else { 0.0 };
        self.sub_scores.push(SubScore {
            name: name.into(),
            score,
        });
    }

    pub fn add_deduction(&mut self, msg: impl Into<String>) {
        self.deductions.push(msg.into());
    }

    /// 扣分说明，用 "; " 连接
    pub fn deduct_str(&self) -> String {
        self.deductions.join("; ")
    }

    /// 细项序列化为 JSON（落库用）
    pub fn details_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.sub_scores)
    }

    /// 把总分限制在 [0, max_score] 内，并按及格线计算是否通过
    pub fn finalize(mut self, max_score: f64, pass_score: f64) -> Self {
        if !self.total_score.is_finite() {
            self.total_score = 0.0;
        }
        self.total_score = self.total_score.clamp(0.0, max_score.max(0.0));
        self.is_pass = self.total_score >= pass_score;
        self
    }
}

/// 成绩状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GradeStatus {
    Pass,
    Fail,
    Error,
}

impl GradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GradeStatus::Pass => "PASS",
            GradeStatus::Fail => "FAIL",
            GradeStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PASS" => Some(GradeStatus::Pass),
            "FAIL" => Some(GradeStatus::Fail),
            "ERROR" => Some(GradeStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for GradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 落库的成绩记录（每个学生在每个班级只有一条）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRecord {
    pub student_id: String,
    pub cohort_id: i64,
    pub total_score: f64,
    pub sub_scores: Vec<SubScore>,
    pub deduct_details: String,
    pub status: GradeStatus,
    pub filename: String,
}

impl GradeRecord {
    pub fn from_result(
        student_id: impl Into<String>,
        cohort_id: i64,
        result: &GradingResult,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            student_id: student_id.into(),
            cohort_id,
            total_score: result.total_score,
            sub_scores: result.sub_scores.clone(),
            deduct_details: result.deduct_str(),
            status: if result.is_pass {
                GradeStatus::Pass
            } else {
                GradeStatus::Fail
            },
            filename: filename.into(),
        }
    }

    /// 错误记录：0 分、空细项、状态 ERROR
    pub fn error(
        student_id: impl Into<String>,
        cohort_id: i64,
        message: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            student_id: student_id.into(),
            cohort_id,
            total_score: 0.0,
            sub_scores: Vec::new(),
            deduct_details: message.into(),
            status: GradeStatus::Error,
            filename: filename.into(),
        }
    }
}
