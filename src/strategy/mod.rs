//! 评分策略
//!
//! 策略是编译进程序的插件类型，由 `strategies/` 目录下的 TOML 清单实例化：
//! 清单的 `kind` 字段选择一个已注册的工厂，工厂根据清单构造策略。
//!
//! - `direct_ai` - 模板填充型：把提交内容和评分标准交给 AI 批改
//! - `rule_based` - 手写逻辑型：按文件 + 正则规则逐项给分

pub mod direct_ai;
pub mod manifest;
pub mod registry;
pub mod rule_based;
pub mod toolkit;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StrategyError;
use crate::models::{Capability, GradingResult, StudentInfo};
use crate::services::{AiDispatcher, CapabilityRouter};

pub use direct_ai::DirectAiFactory;
pub use manifest::StrategyManifest;
pub use registry::{ReloadReport, StrategyRegistry, StrategySummary};
pub use rule_based::RuleBasedFactory;

/// 策略来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyOrigin {
    /// 由模板填充生成（AI 批改）
    Template,
    /// 手写逻辑
    Logic,
}

/// 评分策略
#[async_trait]
pub trait GradingStrategy: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn course(&self) -> &str;

    fn origin(&self) -> StrategyOrigin;

    /// 是否调用 AI
    fn is_ai(&self) -> bool {
        false
    }

    /// 调用 AI 时使用的能力回退链，空表示不需要 AI
    fn required_capabilities(&self) -> &[Capability] {
        &[]
    }

    /// 批改一个学生解压后的提交目录
    async fn grade(&self, scratch_dir: &Path, student: &StudentInfo) -> anyhow::Result<GradingResult>;
}

/// 构造策略时可用的共享能力
#[derive(Clone)]
pub struct StrategyEnv {
    pub dispatcher: Arc<AiDispatcher>,
    pub router: Arc<CapabilityRouter>,
}

/// 按清单构造策略的工厂（按 `kind` 显式注册）
pub trait StrategyFactory: Send + Sync {
    fn kind(&self) -> &'static str;

    fn build(
        &self,
        manifest: &StrategyManifest,
        env: &StrategyEnv,
    ) -> Result<Arc<dyn GradingStrategy>, StrategyError>;
}
