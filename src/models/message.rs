//! 对话消息
//!
//! 发送给厂商的消息既可以是纯文本，也可以是多模态内容列表；
//! 还可以携带已上传到厂商文件服务的文件 ID。

use serde::{Deserialize, Serialize};

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// 多模态内容片段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// 图片 URL，可以是 `data:` 形式的 base64
    ImageUrl { url: String },
    VideoUrl { url: String },
    /// 厂商文件服务中的文件
    File { file_id: String },
}

/// 消息内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// 一条对话消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_ids: Vec<String>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
            file_ids: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            file_ids: Vec::new(),
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
            file_ids: Vec::new(),
        }
    }

    pub fn with_file_ids(mut self, file_ids: Vec<String>) -> Self {
        self.file_ids = file_ids;
        self
    }

    /// 是否为多模态（列表）内容
    pub fn is_multimodal(&self) -> bool {
        matches!(self.content, MessageContent::Parts(_))
    }

    /// 纯文本内容（多模态消息返回 None）
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Parts(_) => None,
        }
    }
}
