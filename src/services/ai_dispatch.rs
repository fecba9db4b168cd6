//! AI 调用分发 - 业务能力层
//!
//! 只负责"把一次对话发给某个厂商并拿回文本"，不关心是谁在批改。
//!
//! ## 技术栈
//! - `chat_completions` 协议：使用 `async-openai` crate
//! - `responses_multimodal` 协议：使用 `reqwest`
//!   - 含文件或多模态内容时走流式 responses 接口，只拼接文本增量事件
//!   - 否则走普通 chat 接口，推理模型附带 `thinking` 开关
//!
//! 整个外部调用包在厂商准入许可里，并受请求超时约束。
//! 所有网络、鉴权、协议错误统一转换为 `UpstreamError`，本层不重试。

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestMessageContentPartImage, ChatCompletionRequestMessageContentPartText,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequestArgs, ImageDetail, ImageUrl,
    },
    Client,
};
use futures::StreamExt;
use regex::Regex;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, error, warn};

use super::provider_files::FileUploader;
use crate::error::UpstreamError;
use crate::infrastructure::{Database, ProviderAdmission};
use crate::models::{ChatMessage, ContentPart, MessageContent, ProtocolKind, ProviderConfig, Role};

/// 读取厂商最新并发上限的来源
///
/// 快照里的上限可能已经过时，分发前再读一次。
pub trait LimitSource: Send + Sync {
    fn current_limit(&self, provider_id: i64) -> Option<usize>;
}

impl LimitSource for Database {
    fn current_limit(&self, provider_id: i64) -> Option<usize> {
        match self.provider_concurrency(provider_id) {
            Ok(limit) => limit,
            Err(e) => {
                warn!("读取厂商 {} 并发上限失败，使用快照值: {}", provider_id, e);
                None
            }
        }
    }
}

/// 删除历史回复里的思考内容
pub fn strip_thinking(text: &str) -> String {
    static THINKING: OnceLock<Regex> = OnceLock::new();
    let re = THINKING.get_or_init(|| {
        Regex::new(r"(?s)<thinking>.*?</thinking>|<think>.*?</think>").expect("valid regex")
    });
    re.replace_all(text, "").trim().to_string()
}

/// 清理历史消息：助手的纯文本回复去掉思考内容
pub fn sanitize_history(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|msg| match (&msg.role, &msg.content) {
            (Role::Assistant, MessageContent::Text(text)) => ChatMessage {
                content: MessageContent::Text(strip_thinking(text)),
                ..msg.clone()
            },
            _ => msg.clone(),
        })
        .collect()
}

/// 是否需要走 responses 接口（带文件 ID 或多模态内容）
pub fn needs_responses_api(messages: &[ChatMessage]) -> bool {
    messages
        .iter()
        .any(|m| !m.file_ids.is_empty() || m.is_multimodal())
}

/// 把系统提示词和所有消息合并成 responses 接口的单条用户输入
///
/// - 多模态消息的内容片段原样保留；
/// - 文件 ID 转为文件片段；
/// - 有文件时，纯文本消息合并后连同系统提示词作为一个文本片段；
/// - 否则系统提示词并入第一个文本片段，没有文本片段时插在最前面。
pub fn build_responses_input(system_prompt: &str, messages: &[ChatMessage]) -> Vec<ContentPart> {
    let has_files = messages.iter().any(|m| !m.file_ids.is_empty());

    let mut parts = Vec::new();
    let mut text_buffer = String::new();
    for msg in messages {
        match &msg.content {
            MessageContent::Parts(items) => parts.extend(items.iter().cloned()),
            MessageContent::Text(text) if has_files && !text.is_empty() => {
                text_buffer.push_str(text);
                text_buffer.push('\n');
            }
            MessageContent::Text(_) => {}
        }
    }
    for msg in messages {
        for file_id in &msg.file_ids {
            parts.push(ContentPart::File {
                file_id: file_id.clone(),
            });
        }
    }

    if !text_buffer.is_empty() {
        parts.push(ContentPart::Text {
            text: format!("{}\n\n{}", system_prompt, text_buffer),
        });
        return parts;
    }

    match parts
        .iter_mut()
        .find(|p| matches!(p, ContentPart::Text { .. }))
    {
        Some(ContentPart::Text { text }) => {
            *text = format!("{}\n\n{}", system_prompt, text);
        }
        _ => parts.insert(
            0,
            ContentPart::Text {
                text: system_prompt.to_string(),
            },
        ),
    }
    parts
}

/// responses 接口的内容片段格式
fn responses_part_json(part: &ContentPart) -> JsonValue {
    match part {
        ContentPart::Text { text } => json!({ "type": "input_text", "text": text }),
        ContentPart::ImageUrl { url } => json!({ "type": "input_image", "image_url": url }),
        ContentPart::VideoUrl { url } => json!({ "type": "input_video", "video_url": url }),
        ContentPart::File { file_id } => json!({ "type": "input_file", "file_id": file_id }),
    }
}

/// 流式 responses 事件收集器
///
/// 按行解析 SSE，只拼接 `response.output_text.delta`，推理摘要增量直接丢弃。
#[derive(Debug, Default)]
pub struct SseTextCollector {
    pending: Vec<u8>,
    text: String,
    done: bool,
}

impl SseTextCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 喂入一段字节（可能在任意位置截断）
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), String> {
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.handle_line(line.trim_end_matches(['\r', '\n']))?;
        }
        Ok(())
    }

    /// 结束，处理末尾没有换行的残留行
    pub fn finish(mut self) -> Result<String, String> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&rest).to_string();
            self.handle_line(line.trim())?;
        }
        Ok(self.text)
    }

    fn handle_line(&mut self, line: &str) -> Result<(), String> {
        let Some(payload) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let payload = payload.trim();
        if payload.is_empty() || self.done {
            return Ok(());
        }
        if payload == "[DONE]" {
            self.done = true;
            return Ok(());
        }

        let event: JsonValue = serde_json::from_str(payload)
            .map_err(|e| format!("无法解析流式事件: {} ({})", e, payload))?;
        match event.get("type").and_then(|t| t.as_str()) {
            Some("response.output_text.delta") => {
                if let Some(delta) = event.get("delta").and_then(|d| d.as_str()) {
                    self.text.push_str(delta);
                }
            }
            Some("response.reasoning_summary_text.delta") => {}
            Some("error") => {
                let message = event
                    .get("message")
                    .or_else(|| event.pointer("/error/message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown stream error");
                return Err(message.to_string());
            }
            Some("response.failed") => {
                let message = event
                    .pointer("/response/error/message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("response failed");
                return Err(message.to_string());
            }
            _ => {}
        }
        Ok(())
    }
}

/// AI 调用分发器
///
/// 职责：
/// - 清理历史消息
/// - 申请厂商准入许可（按最新上限）
/// - 按协议类型调用厂商，归一化文本结果
/// - 不重试、不解释空结果
pub struct AiDispatcher {
    admission: Arc<ProviderAdmission>,
    limits: Option<Arc<dyn LimitSource>>,
    default_limit: usize,
    request_timeout: Duration,
    http: reqwest::Client,
}

impl AiDispatcher {
    /// 创建新的分发器
    pub fn new(admission: Arc<ProviderAdmission>, request_timeout: Duration) -> Self {
        Self {
            admission,
            limits: None,
            default_limit: 1,
            request_timeout,
            http: reqwest::Client::new(),
        }
    }

    /// 分发前从配置库重新读取并发上限
    pub fn with_limit_source(mut self, limits: Arc<dyn LimitSource>) -> Self {
        self.limits = Some(limits);
        self
    }

    /// 厂商没有配置并发上限（0）时使用的值
    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit.max(1);
        self
    }

    pub fn admission(&self) -> &Arc<ProviderAdmission> {
        &self.admission
    }

    /// 厂商当前的并发上限：优先读最新值，未设置时用默认值
    fn effective_limit(&self, config: &ProviderConfig) -> usize {
        let limit = self
            .limits
            .as_ref()
            .and_then(|l| l.current_limit(config.provider_id))
            .unwrap_or(config.max_concurrent_requests);
        if limit == 0 {
            self.default_limit
        } else {
            limit
        }
    }

    /// 在厂商准入许可下上传文件，返回文件 ID
    pub async fn upload_file(&self, path: &Path, config: &ProviderConfig) -> Result<String, UpstreamError> {
        let limit = self.effective_limit(config);
        let uploader = FileUploader::new(&self.http);
        self.admission
            .run(config.provider_id, &config.provider_name, limit, uploader.upload(path, config))
            .await
    }

    /// 发送一次对话，返回厂商的文本回复（可能为空字符串）
    pub async fn dispatch(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        config: &ProviderConfig,
    ) -> Result<String, UpstreamError> {
        let messages = sanitize_history(messages);
        let limit = self.effective_limit(config);

        debug!(
            "调用厂商 [{}]，模型: {}，协议: {}，消息数: {}",
            config.provider_name,
            config.model_name,
            config.protocol.as_str(),
            messages.len()
        );

        // 超时从拿到许可后开始计算
        let call = async {
            tokio::time::timeout(
                self.request_timeout,
                self.call(system_prompt, &messages, config),
            )
            .await
        };
        let outcome = self
            .admission
            .run(config.provider_id, &config.provider_name, limit, call)
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::new(
                &config.provider_name,
                format!("请求超时 ({:?})", self.request_timeout),
            )),
        };

        match result {
            Ok(text) => {
                debug!("厂商 [{}] 调用成功，回复 {} 字符", config.provider_name, text.len());
                Ok(text.trim().to_string())
            }
            Err(e) => {
                error!("[ERROR] {} 调用失败: {}", config.provider_name, e.message);
                Err(e)
            }
        }
    }

    async fn call(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        config: &ProviderConfig,
    ) -> Result<String, UpstreamError> {
        match config.protocol {
            ProtocolKind::ResponsesMultimodal if needs_responses_api(messages) => {
                let input = build_responses_input(system_prompt, messages);
                self.stream_responses(&input, config).await
            }
            ProtocolKind::ResponsesMultimodal => {
                self.chat_with_thinking(system_prompt, messages, config).await
            }
            ProtocolKind::ChatCompletions => {
                self.openai_chat(system_prompt, messages, config)
                    .await
                    .map_err(|e| UpstreamError::new(&config.provider_name, e.to_string()))
            }
        }
    }

    /// 标准 chat/completions 调用（async-openai）
    async fn openai_chat(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        config: &ProviderConfig,
    ) -> Result<String, OpenAIError> {
        let mut openai_config = OpenAIConfig::new().with_api_key(&config.api_key);
        if !config.base_url.is_empty() {
            openai_config = openai_config.with_api_base(&config.base_url);
        }
        let client = Client::with_config(openai_config);

        let request = CreateChatCompletionRequestArgs::default()
            .model(&config.model_name)
            .messages(build_openai_messages(system_prompt, messages)?)
            .build()?;

        let response = client.chat().create(request).await?;

        Ok(response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default())
    }

    /// responses 协议下的纯文本对话，推理模型附带 thinking 开关
    async fn chat_with_thinking(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        config: &ProviderConfig,
    ) -> Result<String, UpstreamError> {
        let mut body_messages = vec![json!({ "role": "system", "content": system_prompt })];
        for msg in messages {
            body_messages.push(json!({
                "role": role_str(msg.role),
                "content": msg.text().unwrap_or_default(),
            }));
        }

        let mut body = json!({
            "model": config.model_name,
            "messages": body_messages,
        });
        if config.is_reasoning_model() {
            body["thinking"] = json!({ "type": "enabled" });
        }
        if config.force_structured_output {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let value: JsonValue = self
            .post_json(config, "chat/completions", &body)
            .await?
            .json()
            .await
            .map_err(|e| UpstreamError::new(&config.provider_name, e.to_string()))?;

        Ok(value
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string())
    }

    /// 流式 responses 调用
    async fn stream_responses(
        &self,
        input: &[ContentPart],
        config: &ProviderConfig,
    ) -> Result<String, UpstreamError> {
        let content: Vec<JsonValue> = input.iter().map(responses_part_json).collect();
        let body = json!({
            "model": config.model_name,
            "input": [{ "role": "user", "content": content }],
            "stream": true,
        });

        let response = self.post_json(config, "responses", &body).await?;
        let mut stream = response.bytes_stream();
        let mut collector = SseTextCollector::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| UpstreamError::new(&config.provider_name, e.to_string()))?;
            collector
                .feed(&chunk)
                .map_err(|e| UpstreamError::new(&config.provider_name, e))?;
        }
        collector
            .finish()
            .map_err(|e| UpstreamError::new(&config.provider_name, e))
    }

    async fn post_json(
        &self,
        config: &ProviderConfig,
        path: &str,
        body: &JsonValue,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = endpoint(&config.base_url, path);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| UpstreamError::new(&config.provider_name, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::new(
                &config.provider_name,
                format!("HTTP {} ({}): {}", status.as_u16(), url, text),
            ));
        }
        Ok(response)
    }
}

/// 拼接厂商接口地址
pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// 构建 async-openai 的消息列表
///
/// chat 协议只能携带文本和图片，视频/文件片段被跳过。
fn build_openai_messages(
    system_prompt: &str,
    messages: &[ChatMessage],
) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    out.push(ChatCompletionRequestMessage::System(
        ChatCompletionRequestSystemMessageArgs::default()
            .content(system_prompt)
            .build()?,
    ));

    for msg in messages {
        match (msg.role, &msg.content) {
            (Role::System, content) => {
                out.push(ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(flatten_text(content))
                        .build()?,
                ));
            }
            (Role::Assistant, content) => {
                out.push(ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(flatten_text(content))
                        .build()?,
                ));
            }
            (Role::User, MessageContent::Text(text)) => {
                out.push(ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(text.as_str())
                        .build()?,
                ));
            }
            (Role::User, MessageContent::Parts(parts)) => {
                let mut content_parts: Vec<ChatCompletionRequestUserMessageContentPart> =
                    Vec::new();
                for part in parts {
                    match part {
                        ContentPart::Text { text } => content_parts.push(
                            ChatCompletionRequestUserMessageContentPart::Text(
                                ChatCompletionRequestMessageContentPartText { text: text.clone() },
                            ),
                        ),
                        ContentPart::ImageUrl { url } => content_parts.push(
                            ChatCompletionRequestUserMessageContentPart::ImageUrl(
                                ChatCompletionRequestMessageContentPartImage {
                                    image_url: ImageUrl {
                                        url: url.clone(),
                                        detail: Some(ImageDetail::Auto),
                                    },
                                },
                            ),
                        ),
                        other => debug!("chat 协议不支持的内容片段，已跳过: {:?}", other),
                    }
                }
                out.push(ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(ChatCompletionRequestUserMessageContent::Array(content_parts))
                        .build()?,
                ));
            }
        }
    }
    Ok(out)
}

fn flatten_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Capability;

    fn provider(protocol: ProtocolKind, base_url: &str) -> ProviderConfig {
        ProviderConfig {
            provider_id: 1,
            provider_name: "test".to_string(),
            protocol,
            base_url: base_url.to_string(),
            api_key: "sk-test".to_string(),
            max_concurrent_requests: 2,
            enabled: true,
            model_name: "doubao-seed-thinking".to_string(),
            capability: Capability::Standard,
            force_structured_output: false,
        }
    }

    #[test]
    fn test_strip_thinking_removes_tagged_blocks() {
        assert_eq!(
            strip_thinking("<thinking>先分析题目\n再打分</thinking>\n得分 80"),
            "得分 80"
        );
        assert_eq!(strip_thinking("  无思考内容 "), "无思考内容");
        assert_eq!(strip_thinking("a<think>x</think>b"), "ab");
    }

    #[test]
    fn test_sanitize_only_touches_assistant_text() {
        let history = vec![
            ChatMessage::user("<thinking>用户原文</thinking>问题"),
            ChatMessage::assistant("<thinking>推理</thinking>回答"),
        ];
        let cleaned = sanitize_history(&history);
        assert_eq!(cleaned[0].text(), Some("<thinking>用户原文</thinking>问题"));
        assert_eq!(cleaned[1].text(), Some("回答"));
    }

    #[test]
    fn test_responses_input_merges_system_prompt_into_first_text() {
        let messages = vec![ChatMessage::user_parts(vec![
            ContentPart::ImageUrl {
                url: "data:image/png;base64,AAAA".to_string(),
            },
            ContentPart::Text {
                text: "请批改".to_string(),
            },
        ])];
        let parts = build_responses_input("你是阅卷专家", &messages);
        assert_eq!(parts.len(), 2);
        assert_eq!(
            parts[1],
            ContentPart::Text {
                text: "你是阅卷专家\n\n请批改".to_string()
            }
        );
    }

    #[test]
    fn test_responses_input_inserts_system_prompt_without_text() {
        let messages = vec![ChatMessage::user_parts(vec![ContentPart::VideoUrl {
            url: "https://cdn/v.mp4".to_string(),
        }])];
        let parts = build_responses_input("SYS", &messages);
        assert_eq!(parts[0], ContentPart::Text { text: "SYS".to_string() });
    }

    #[test]
    fn test_responses_input_with_file_ids_collects_plain_text() {
        let messages = vec![ChatMessage::user("整理以下内容").with_file_ids(vec!["file-1".to_string()])];
        assert!(needs_responses_api(&messages));

        let parts = build_responses_input("SYS", &messages);
        assert_eq!(
            parts,
            vec![
                ContentPart::File {
                    file_id: "file-1".to_string()
                },
                ContentPart::Text {
                    text: "SYS\n\n整理以下内容\n".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_sse_collector_keeps_only_text_deltas() {
        let mut collector = SseTextCollector::new();
        let stream = concat!(
            "event: response.reasoning_summary_text.delta\n",
            "data: {\"type\":\"response.reasoning_summary_text.delta\",\"delta\":\"想一想\"}\n\n",
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\"{\\\"total_score\\\":\"}\n\n",
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\" 90}\"}\n\n",
            "data: {\"type\":\"response.completed\"}\n\n",
            "data: [DONE]\n\n",
        );
        // 故意在中间截断
        let bytes = stream.as_bytes();
        let (a, b) = bytes.split_at(bytes.len() / 2);
        collector.feed(a).unwrap();
        collector.feed(b).unwrap();
        assert_eq!(collector.finish().unwrap(), "{\"total_score\": 90}");
    }

    #[test]
    fn test_sse_collector_surfaces_stream_errors() {
        let mut collector = SseTextCollector::new();
        let err = collector
            .feed(b"data: {\"type\":\"error\",\"message\":\"quota exceeded\"}\n")
            .unwrap_err();
        assert_eq!(err, "quota exceeded");
    }

    #[test]
    fn test_sse_collector_handles_split_multibyte_chars() {
        let line = "data: {\"type\":\"response.output_text.delta\",\"delta\":\"满分\"}\n";
        let bytes = line.as_bytes();
        let cut = line.find("满").unwrap() + 1;
        let mut collector = SseTextCollector::new();
        collector.feed(&bytes[..cut]).unwrap();
        collector.feed(&bytes[cut..]).unwrap();
        assert_eq!(collector.finish().unwrap(), "满分");
    }

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        assert_eq!(endpoint("https://a/api/v3/", "/responses"), "https://a/api/v3/responses");
    }

    #[test]
    fn test_openai_messages_skip_unsupported_parts() {
        let messages = vec![ChatMessage::user_parts(vec![
            ContentPart::Text {
                text: "看图".to_string(),
            },
            ContentPart::File {
                file_id: "f".to_string(),
            },
        ])];
        let built = build_openai_messages("SYS", &messages).unwrap();
        assert_eq!(built.len(), 2);
        match &built[1] {
            ChatCompletionRequestMessage::User(user) => match &user.content {
                ChatCompletionRequestUserMessageContent::Array(parts) => assert_eq!(parts.len(), 1),
                other => panic!("unexpected content: {:?}", other),
            },
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_failure_becomes_upstream_error_and_releases_permit() {
        let admission = Arc::new(ProviderAdmission::new());
        let dispatcher = AiDispatcher::new(Arc::clone(&admission), Duration::from_secs(5));
        // 端口 9 (discard) 通常没有监听，连接会立即失败
        let config = provider(ProtocolKind::ResponsesMultimodal, "http://127.0.0.1:9/api/v3");

        let err = dispatcher
            .dispatch("SYS", &[ChatMessage::user("hi")], &config)
            .await
            .unwrap_err();
        assert_eq!(err.provider, "test");
        assert!(!err.message.is_empty());

        let snapshot = admission.snapshot(1).unwrap();
        assert_eq!(snapshot.in_use, 0);
        assert_eq!(snapshot.available, 2);
    }

    #[tokio::test]
    async fn test_silent_provider_times_out_and_releases_permit() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // 只接受连接，从不回复
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let admission = Arc::new(ProviderAdmission::new());
        let dispatcher = AiDispatcher::new(Arc::clone(&admission), Duration::from_millis(200));
        let config = provider(ProtocolKind::ResponsesMultimodal, &format!("http://{}", addr));

        let started = std::time::Instant::now();
        let err = dispatcher
            .dispatch("SYS", &[ChatMessage::user("hi")], &config)
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(err.provider, "test");
        assert!(err.message.contains("超时"), "{}", err.message);
        assert!(err.message.contains("200ms"), "{}", err.message);

        let snapshot = admission.snapshot(1).unwrap();
        assert_eq!(snapshot.in_use, 0);
        assert_eq!(snapshot.available, 2);
        server.abort();
    }

    #[tokio::test]
    async fn test_file_upload_goes_through_admission() {
        let tmp = tempfile::TempDir::new().unwrap();
        let video = tmp.path().join("demo.mp4");
        std::fs::write(&video, b"not really a video").unwrap();

        let admission = Arc::new(ProviderAdmission::new());
        let dispatcher = AiDispatcher::new(Arc::clone(&admission), Duration::from_secs(5));
        let config = provider(ProtocolKind::ResponsesMultimodal, "http://127.0.0.1:9/api/v3");

        let err = dispatcher.upload_file(&video, &config).await.unwrap_err();
        assert_eq!(err.provider, "test");

        let snapshot = admission.snapshot(1).unwrap();
        assert_eq!(snapshot.capacity, 2);
        assert_eq!(snapshot.in_use, 0);
    }

    struct FixedLimit(usize);

    impl LimitSource for FixedLimit {
        fn current_limit(&self, _provider_id: i64) -> Option<usize> {
            Some(self.0)
        }
    }

    #[tokio::test]
    async fn test_dispatch_uses_fresh_limit_from_source() {
        let admission = Arc::new(ProviderAdmission::new());
        let dispatcher = AiDispatcher::new(Arc::clone(&admission), Duration::from_secs(5))
            .with_limit_source(Arc::new(FixedLimit(5)));
        let config = provider(ProtocolKind::ResponsesMultimodal, "http://127.0.0.1:9");

        let _ = dispatcher.dispatch("SYS", &[], &config).await;
        assert_eq!(admission.snapshot(1).unwrap().capacity, 5);
    }

    #[tokio::test]
    async fn test_unset_limit_falls_back_to_default() {
        let admission = Arc::new(ProviderAdmission::new());
        let dispatcher = AiDispatcher::new(Arc::clone(&admission), Duration::from_secs(5))
            .with_default_limit(4);
        let mut config = provider(ProtocolKind::ResponsesMultimodal, "http://127.0.0.1:9");
        config.max_concurrent_requests = 0;

        let _ = dispatcher.dispatch("SYS", &[], &config).await;
        assert_eq!(admission.snapshot(1).unwrap().capacity, 4);
    }

    /// 需要真实厂商：VOLC_API_KEY / VOLC_BASE_URL / VOLC_MODEL
    #[tokio::test]
    #[ignore]
    async fn test_responses_stream_against_real_provider() {
        let _ = tracing_subscriber::fmt::try_init();
        let mut config = provider(
            ProtocolKind::ResponsesMultimodal,
            &std::env::var("VOLC_BASE_URL").unwrap_or_default(),
        );
        config.api_key = std::env::var("VOLC_API_KEY").unwrap_or_default();
        config.model_name = std::env::var("VOLC_MODEL").unwrap_or_default();

        let dispatcher = AiDispatcher::new(Arc::new(ProviderAdmission::new()), Duration::from_secs(300));
        let messages = vec![ChatMessage::user_parts(vec![ContentPart::Text {
            text: "只回复数字 1".to_string(),
        }])];
        let text = dispatcher.dispatch("你是一个简洁的助手", &messages, &config).await.unwrap();
        println!("厂商回复: {}", text);
        assert!(!text.is_empty());
    }
}
