//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量批改和流程调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `grading_service` - 批改服务
//! - `grade_one`：单个学生的完整流程（找文件 → 解压 → 取策略 → 批改 → 落库）
//! - `grade_all`：清空旧成绩，用 Semaphore 控制本地并发，汇总统计
//!
//! ### `workspace` - 班级工作区
//! - 原始文件目录 / 解压目录的位置
//! - 按学号或姓名匹配提交文件
//!
//! ## 层次关系
//!
//! ```text
//! grading_service (处理 Vec<Student>)
//!     ↓
//! strategy::StrategyRegistry → GradingStrategy (处理单个学生)
//!     ↓
//! services (能力层：routing / ai_dispatch / score_document)
//!     ↓
//! infrastructure (基础设施：Database / ProviderAdmission / archive)
//! ```
//!
//! ## 设计原则
//!
//! 1. **失败隔离**：单个学生的失败只产生一条 ERROR 记录
//! 2. **本地并发与厂商并发分离**：线程池大小和厂商准入上限互不相干
//! 3. **无业务逻辑**：只做调度和统计，评分交给策略

pub mod grading_service;
pub mod workspace;

pub use grading_service::{BatchSummary, GradeOutcome, GradingService};
pub use workspace::CohortWorkspace;
