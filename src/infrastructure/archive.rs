//! 提交文件解压
//!
//! 每次解压都会先清空目标目录，保证上一次的解压结果不会残留。
//! 目前只支持 zip；rar / 7z 直接报不支持，其他文件原样复制进目录。

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{AppError, AppResult, SubmissionError};

/// 提交文件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    /// 认得但解不了的压缩格式
    Unsupported,
    /// 非压缩文件
    Plain,
}

impl ArchiveKind {
    pub fn of(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "zip" => ArchiveKind::Zip,
            "rar" | "7z" => ArchiveKind::Unsupported,
            _ => ArchiveKind::Plain,
        }
    }
}

/// 把提交文件展开到 `dest`（阻塞操作放在 blocking 线程池里执行）
pub async fn unpack_submission(source: &Path, dest: &Path) -> AppResult<()> {
    let source = source.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_blocking(&source, &dest))
        .await
        .map_err(|e| AppError::Other(format!("解压任务异常退出: {}", e)))?
}

fn unpack_blocking(source: &Path, dest: &Path) -> AppResult<()> {
    let filename = file_name_of(source);

    let kind = ArchiveKind::of(source);
    if kind == ArchiveKind::Unsupported {
        return Err(SubmissionError::UnsupportedArchive { filename }.into());
    }

    reset_dir(dest)?;

    match kind {
        ArchiveKind::Zip => {
            let file = fs::File::open(source)
                .map_err(|e| AppError::io(source.display().to_string(), e))?;
            let extract_failed = |e: zip::result::ZipError| SubmissionError::ExtractFailed {
                filename: filename.clone(),
                reason: e.to_string(),
            };
            let mut archive = zip::ZipArchive::new(file).map_err(extract_failed)?;
            archive.extract(dest).map_err(extract_failed)?;
            debug!("已解压 {} ({} 个条目) -> {}", filename, archive.len(), dest.display());
        }
        ArchiveKind::Plain => {
            let target: PathBuf = dest.join(&filename);
            fs::copy(source, &target).map_err(|e| AppError::io(target.display().to_string(), e))?;
            debug!("非压缩提交，已复制 {} -> {}", filename, target.display());
        }
        ArchiveKind::Unsupported => unreachable!("checked above"),
    }
    Ok(())
}

/// 删除并重建目录
fn reset_dir(dir: &Path) -> AppResult<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(|e| AppError::io(dir.display().to_string(), e))?;
    }
    fs::create_dir_all(dir).map_err(|e| AppError::io(dir.display().to_string(), e))
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
