//! # Grading Core
//!
//! 并发作业批改核心：对接多家限流的 AI 厂商，策略可在运行时热加载。
//!
//! ## 架构设计
//!
//! 本系统采用四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源，只暴露能力
//! - `Database` - 唯一持有 SQLite 连接（厂商、模型、班级、成绩、任务记录）
//! - `ProviderAdmission` - 每个厂商一个可在线调整容量的准入许可池
//! - `archive` - 提交文件解压
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"
//! - `CapabilityRouter` - 按能力选模型
//! - `AiDispatcher` - 把一次对话发给厂商（两种协议）
//! - `FileUploader` - 上传视频/PDF 到厂商文件服务
//! - `ScoreDocumentWriter` - 写成绩汇总
//!
//! ### ③ 策略层（Strategy）
//! - `strategy/` - 批改一个学生
//! - `StrategyRegistry` - 扫描清单目录，热加载
//! - `direct_ai` / `rule_based` - 内置策略类型
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/grading_service` - 单个学生与整班批改，失败隔离
//! - `orchestrator/workspace` - 班级工作区目录
//!
//! ## 模块结构

pub mod app;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod strategy;
pub mod utils;

// 重新导出常用类型
pub use app::App;
pub use config::Config;
pub use error::{AppError, AppResult};
pub use infrastructure::{Database, ProviderAdmission};
pub use models::{Capability, GradeRecord, GradingResult, ProviderConfig};
pub use orchestrator::{BatchSummary, GradeOutcome, GradingService};
pub use services::{AiDispatcher, CapabilityRouter};
pub use strategy::{GradingStrategy, StrategyRegistry};
