//! 模板填充型策略：把提交内容连同题目和评分标准交给 AI 批改
//!
//! 流程：收集文件 → 选模型 → 上传大文件 → 组装消息 → 调用 → 解析 JSON 结果

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use regex::Regex;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::manifest::{DirectAiSection, StrategyManifest};
use super::toolkit::decode_text;
use super::{GradingStrategy, StrategyEnv, StrategyFactory, StrategyOrigin};
use crate::error::StrategyError;
use crate::models::{
    Capability, ChatMessage, ContentPart, GradingResult, ProtocolKind, StudentInfo,
};
use crate::utils::logging::truncate_text;

pub const KIND: &str = "direct_ai";

/// 单个文件大小上限
pub const MAX_FILE_BYTES: u64 = 512 * 1024 * 1024;
/// 图片/视频/PDF 总数上限
pub const MAX_MEDIA_FILES: usize = 10;

const DEFAULT_CHAIN: &[Capability] = &[Capability::Vision, Capability::Standard];

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "py", "java", "c", "h", "cpp", "hpp", "cs", "js", "ts", "jsx", "tsx", "html",
    "htm", "css", "json", "xml", "sql", "go", "rs", "sh", "bat", "yaml", "yml", "toml", "ini",
    "csv", "php", "vue", "kt", "swift", "r", "m",
];
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];
const UPLOAD_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm", "pdf"];

/// 提交中的一个文件
#[derive(Debug, Clone, PartialEq)]
enum SubmissionItem {
    Text { relative: String, path: PathBuf },
    Image { relative: String, path: PathBuf },
    Upload { relative: String, path: PathBuf },
}

/// 收集结果
#[derive(Debug, Default)]
struct Collected {
    items: Vec<SubmissionItem>,
    skipped: Vec<String>,
}

impl Collected {
    fn media_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| !matches!(i, SubmissionItem::Text { .. }))
            .count()
    }
}

/// 遍历提交目录并按扩展名分类（阻塞）
fn collect_submission(root: &Path) -> Collected {
    let mut collected = Collected::default();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path().to_path_buf();
        let relative = path
            .strip_prefix(root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        if relative.starts_with("__MACOSX") {
            continue;
        }

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > MAX_FILE_BYTES {
            collected.skipped.push(relative);
            continue;
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        let item = if TEXT_EXTENSIONS.contains(&ext.as_str()) {
            SubmissionItem::Text { relative, path }
        } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            SubmissionItem::Image { relative, path }
        } else if UPLOAD_EXTENSIONS.contains(&ext.as_str()) {
            SubmissionItem::Upload { relative, path }
        } else {
            debug!("忽略无法识别的文件: {}", relative);
            continue;
        };
        collected.items.push(item);
    }
    collected
}

fn image_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        _ => "image/png",
    }
}

/// AI 给出的批改结论
#[derive(Debug, Clone, PartialEq)]
pub struct AiVerdict {
    pub total_score: f64,
    pub details: Vec<(String, f64)>,
    pub comment: String,
}

fn as_score(value: Option<&JsonValue>) -> Option<f64> {
    match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// 从 AI 回复中取出第一个 JSON 对象并解析
pub fn parse_ai_answer(answer: &str) -> Option<AiVerdict> {
    static JSON_BLOCK: OnceLock<Regex> = OnceLock::new();
    let re = JSON_BLOCK.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

    let block = re.find(answer)?.as_str();
    let value: JsonValue = serde_json::from_str(block).ok()?;
    let total_score = as_score(value.get("total_score"))?;

    let details = value
        .get("details")
        .and_then(|d| d.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let name = item.get("name")?.as_str()?.to_string();
                    Some((name, as_score(item.get("score")).unwrap_or(0.0)))
                })
                .collect()
        })
        .unwrap_or_default();
    let comment = value
        .get("comment")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    Some(AiVerdict {
        total_score,
        details,
        comment,
    })
}

pub struct DirectAiStrategy {
    id: String,
    name: String,
    course: String,
    max_score: f64,
    pass_score: f64,
    template: DirectAiSection,
    capabilities: Vec<Capability>,
    env: StrategyEnv,
}

impl DirectAiStrategy {
    fn system_prompt(&self) -> String {
        format!(
            "你是一名严谨公正的《{course}》课程阅卷老师。请根据题目和评分标准批改学生提交的作业，满分 {max} 分。\n\
             只输出一个 JSON 对象，格式如下：\n\
             {{\"total_score\": 数字, \"details\": [{{\"name\": \"评分项\", \"score\": 数字}}], \"comment\": \"扣分原因与评语\"}}",
            course = self.course,
            max = self.max_score,
        )
    }

    fn user_prompt(&self, student: &StudentInfo, code_text: &str) -> String {
        let mut prompt = format!(
            "【题目】\n{}\n\n【评分标准】\n{}\n",
            self.template.exam_content, self.template.grading_standard
        );
        if !self.template.extra_instruction.is_empty() {
            prompt.push_str(&format!("\n【补充要求】\n{}\n", self.template.extra_instruction));
        }
        prompt.push_str(&format!(
            "\n【学生】{} ({})\n\n【提交内容】\n{}",
            student.name, student.student_id, code_text
        ));
        prompt
    }
}

#[async_trait]
impl GradingStrategy for DirectAiStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn course(&self) -> &str {
        &self.course
    }

    fn origin(&self) -> StrategyOrigin {
        StrategyOrigin::Template
    }

    fn is_ai(&self) -> bool {
        true
    }

    fn required_capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn grade(&self, scratch_dir: &Path, student: &StudentInfo) -> Result<GradingResult> {
        let root = scratch_dir.to_path_buf();
        let collected = tokio::task::spawn_blocking(move || collect_submission(&root))
            .await
            .context("遍历提交目录失败")?;

        let mut result = GradingResult::new();
        for skipped in &collected.skipped {
            result.add_deduction(format!("文件过大已忽略: {}", skipped));
        }
        if collected.media_count() > MAX_MEDIA_FILES {
            result.add_deduction(format!(
                "多媒体文件超过 {} 个 (共 {} 个)，无法批改",
                MAX_MEDIA_FILES,
                collected.media_count()
            ));
            return Ok(result.finalize(self.max_score, self.pass_score));
        }

        let config = self.env.router.resolve_chain(&self.capabilities)?;

        let mut code_text = String::new();
        let mut images = Vec::new();
        let mut file_ids = Vec::new();
        for item in &collected.items {
            match item {
                SubmissionItem::Text { relative, path } => {
                    let bytes = tokio::fs::read(path)
                        .await
                        .with_context(|| format!("读取文件失败: {}", relative))?;
                    code_text.push_str(&format!(
                        "\n### 文件: {}\n```\n{}\n```\n",
                        relative,
                        decode_text(&bytes)
                    ));
                }
                SubmissionItem::Image { relative, path } => {
                    let bytes = tokio::fs::read(path)
                        .await
                        .with_context(|| format!("读取图片失败: {}", relative))?;
                    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                    images.push(ContentPart::ImageUrl {
                        url: format!("data:{};base64,{}", image_mime(path), encoded),
                    });
                }
                SubmissionItem::Upload { relative, path } => {
                    if config.protocol != ProtocolKind::ResponsesMultimodal {
                        result.add_deduction(format!("当前模型不支持该文件类型，已忽略: {}", relative));
                        continue;
                    }
                    file_ids.push(self.env.dispatcher.upload_file(path, &config).await?);
                }
            }
        }
        if code_text.is_empty() && images.is_empty() && file_ids.is_empty() {
            code_text.push_str("（未找到可批改的文件）");
        }

        let user_prompt = self.user_prompt(student, &code_text);
        let message = if images.is_empty() {
            ChatMessage::user(user_prompt)
        } else {
            let mut parts = vec![ContentPart::Text { text: user_prompt }];
            parts.extend(images);
            ChatMessage::user_parts(parts)
        };
        let message = message.with_file_ids(file_ids);

        info!(
            "[{}] 学生 {} 提交 AI 批改，模型: {}",
            self.id, student.student_id, config.model_name
        );
        let answer = self
            .env
            .dispatcher
            .dispatch(&self.system_prompt(), &[message], &config)
            .await?;

        match parse_ai_answer(&answer) {
            Some(verdict) => {
                for (name, score) in verdict.details {
                    result.add_sub_score(name, score);
                }
                if !verdict.comment.is_empty() {
                    result.add_deduction(verdict.comment);
                }
                result.total_score = verdict.total_score;
            }
            None => {
                warn!(
                    "[{}] 学生 {} 的 AI 回复无法解析: {}",
                    self.id,
                    student.student_id,
                    truncate_text(&answer, 80)
                );
                result.add_deduction("AI 返回格式无法解析");
                result.total_score = 0.0;
            }
        }

        Ok(result.finalize(self.max_score, self.pass_score))
    }
}

/// `direct_ai` 工厂
pub struct DirectAiFactory;

impl StrategyFactory for DirectAiFactory {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn build(
        &self,
        manifest: &StrategyManifest,
        env: &StrategyEnv,
    ) -> Result<Arc<dyn GradingStrategy>, StrategyError> {
        let template = manifest
            .direct_ai
            .clone()
            .ok_or_else(|| manifest.invalid("缺少 [direct_ai] 配置"))?;
        if template.exam_content.trim().is_empty() || template.grading_standard.trim().is_empty() {
            return Err(manifest.invalid("exam_content 和 grading_standard 不能为空"));
        }
        let capabilities = match &template.capabilities {
            Some(chain) if !chain.is_empty() => chain.clone(),
            _ => DEFAULT_CHAIN.to_vec(),
        };

        Ok(Arc::new(DirectAiStrategy {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            course: manifest.course.clone(),
            max_score: manifest.max_score,
            pass_score: manifest.pass_score(),
            template,
            capabilities,
            env: env.clone(),
        }))
    }
}
