//! 批改工具箱
//!
//! 手写逻辑策略常用的几件事：在提交目录里找文件（容忍大小写和替代文件名），
//! 尽量把文件读成文本，以及按"严格 / 宽松"两档正则给分。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use walkdir::WalkDir;

/// 大小写不符或使用替代文件名时扣的分
pub const NAME_MISMATCH_PENALTY: f64 = 1.0;

/// 扫描时跳过的目录
const IGNORED_DIRS: &[&str] = &["__MACOSX", ".git", ".idea", ".vscode", "node_modules", "__pycache__"];

/// 提交目录的文件索引
#[derive(Debug, Default)]
pub struct FileIndex {
    root: PathBuf,
    /// 相对路径（`/` 分隔）
    files: Vec<String>,
    /// 小写的相对路径或文件名 -> files 下标
    lookup: HashMap<String, Vec<usize>>,
}

/// 查找结果
#[derive(Debug, Clone, PartialEq)]
pub struct FoundFile {
    pub path: PathBuf,
    pub relative: String,
    pub penalty: f64,
    pub note: Option<String>,
}

impl FileIndex {
    /// 递归扫描目录（阻塞）
    pub fn scan(root: &Path) -> Self {
        let mut index = FileIndex {
            root: root.to_path_buf(),
            ..Default::default()
        };

        let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
            e.depth() == 0
                || !e
                    .file_name()
                    .to_str()
                    .map(|n| IGNORED_DIRS.contains(&n))
                    .unwrap_or(false)
        });
        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            index.files.push(rel);
        }
        index.files.sort();

        for (i, rel) in index.files.iter().enumerate() {
            let lower = rel.to_lowercase();
            let name = lower.rsplit('/').next().unwrap_or(&lower).to_string();
            index.lookup.entry(lower.clone()).or_default().push(i);
            if name != lower {
                index.lookup.entry(name).or_default().push(i);
            }
        }
        index
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// 所有文件的相对路径
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// 按期望文件名查找，依次尝试：精确、忽略大小写、替代文件名
    pub fn smart_find(&self, expected: &str, alternatives: &[String]) -> Option<FoundFile> {
        if let Some(rel) = self.lookup_name(expected, true) {
            return Some(self.found(rel, 0.0, None));
        }
        if let Some(rel) = self.lookup_name(expected, false) {
            let note = format!("文件名大小写不符: 期望 {}，实际 {}", expected, rel);
            return Some(self.found(rel, NAME_MISMATCH_PENALTY, Some(note)));
        }
        for alt in alternatives {
            if let Some(rel) = self
                .lookup_name(alt, true)
                .or_else(|| self.lookup_name(alt, false))
            {
                let note = format!("使用了替代文件名 {} (期望 {})", rel, expected);
                return Some(self.found(rel, NAME_MISMATCH_PENALTY, Some(note)));
            }
        }
        None
    }

    /// 取最浅的那个匹配
    fn lookup_name(&self, wanted: &str, exact: bool) -> Option<&str> {
        let wanted = wanted.trim().trim_start_matches("./").replace('\\', "/");
        let candidates = self.lookup.get(&wanted.to_lowercase())?;
        candidates
            .iter()
            .map(|&i| self.files[i].as_str())
            .filter(|rel| {
                !exact || *rel == wanted || rel.rsplit('/').next() == Some(wanted.as_str())
            })
            .min_by_key(|rel| (rel.matches('/').count(), rel.len()))
    }

    fn found(&self, rel: &str, penalty: f64, note: Option<String>) -> FoundFile {
        FoundFile {
            path: self.root.join(rel),
            relative: rel.to_string(),
            penalty,
            note,
        }
    }
}

/// 把字节尽量解成文本：去掉 BOM，UTF-8 失败时做有损转换
pub fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// 读取文本文件内容
pub async fn read_text_content(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(decode_text(&bytes))
}

/// 单项检查结果
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub score: f64,
    pub deduction: Option<String>,
}

/// 严格匹配给满分；宽松匹配给一半（至少 1 分，不超过满分）；都不匹配 0 分
pub fn verify_command(
    content: &str,
    name: &str,
    strict: &Regex,
    loose: Option<&Regex>,
    points: f64,
) -> CheckOutcome {
    if strict.is_match(content) {
        return CheckOutcome {
            score: points,
            deduction: None,
        };
    }
    if loose.map(|re| re.is_match(content)).unwrap_or(false) {
        let score = (points / 2.0).max(1.0).min(points);
        return CheckOutcome {
            score,
            deduction: Some(format!("{}: 写法不规范 (-{})", name, points - score)),
        };
    }
    CheckOutcome {
        score: 0.0,
        deduction: Some(format!("{}: 未完成 (-{})", name, points)),
    }
}
