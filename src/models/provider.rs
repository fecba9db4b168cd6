//! 厂商与模型配置
//!
//! 对应配置库中的 `ai_providers` / `ai_models` 两张表。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 模型能力标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// 普通对话
    Standard,
    /// 深度思考
    Thinking,
    /// 视觉/多模态
    Vision,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Standard => "standard",
            Capability::Thinking => "thinking",
            Capability::Vision => "vision",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Capability::Standard),
            "thinking" => Ok(Capability::Thinking),
            "vision" => Ok(Capability::Vision),
            other => Err(format!("未知的模型能力: {}", other)),
        }
    }
}

/// 厂商协议类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// 标准 chat/completions 协议
    ChatCompletions,
    /// 支持多模态输入的 responses 协议（流式）
    ResponsesMultimodal,
}

impl ProtocolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolKind::ChatCompletions => "chat_completions",
            ProtocolKind::ResponsesMultimodal => "responses_multimodal",
        }
    }
}

impl FromStr for ProtocolKind {
    type Err = String;

    /// 兼容后台录入的厂商类型名（openai / volcengine）
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat_completions" | "openai" => Ok(ProtocolKind::ChatCompletions),
            "responses_multimodal" | "responses" | "volcengine" => {
                Ok(ProtocolKind::ResponsesMultimodal)
            }
            other => Err(format!("不支持的协议类型: {}", other)),
        }
    }
}

/// 一次调用所用的厂商配置快照
///
/// 由 `best_config_for` 生成，调用期间不可变；权威的并发上限保存在配置库里，
/// 两次读取之间可能被管理员修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_id: i64,
    pub provider_name: String,
    pub protocol: ProtocolKind,
    pub base_url: String,
    pub api_key: String,
    pub max_concurrent_requests: usize,
    pub enabled: bool,
    /// 被选中的模型
    pub model_name: String,
    pub capability: Capability,
    pub force_structured_output: bool,
}

impl ProviderConfig {
    /// 模型名是否暗示推理模型（需要打开 thinking 开关）
    pub fn is_reasoning_model(&self) -> bool {
        self.model_name.contains("thinking") || self.model_name.contains("reasoner")
    }
}

/// 模型记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: i64,
    pub provider_id: i64,
    pub model_name: String,
    pub capability: Capability,
    pub weight: i64,
    pub enabled: bool,
    pub force_structured_output: bool,
}
