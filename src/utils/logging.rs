//! 日志工具模块
//!
//! 提供日志初始化、格式化和输出的辅助函数

use std::fs::{self, OpenOptions};
use std::io::Write;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 初始化 tracing 订阅者
///
/// 优先使用 `RUST_LOG`，否则默认 `info`；`verbose` 为真时提升到 `debug`。
/// 重复调用是安全的（只有第一次生效）。
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 初始化运行日志文件（覆盖旧文件，写入表头）
///
/// # 参数
/// - `log_file_path`: 日志文件路径
pub fn init_log_file(log_file_path: &str) -> Result<()> {
    let log_header = format!(
        "{}\n批改运行日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(log_file_path, log_header)
        .with_context(|| format!("无法写入日志文件: {}", log_file_path))?;
    Ok(())
}

/// 向运行日志文件追加一行
pub fn append_log_line(log_file_path: &str, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path)
        .with_context(|| format!("无法打开日志文件: {}", log_file_path))?;
    writeln!(file, "[{}] {}", chrono::Local::now().format("%H:%M:%S"), line)?;
    Ok(())
}

/// 记录程序启动信息
///
/// # 参数
/// - `max_workers`: 批改并发数
/// - `cohort_count`: 待批改的班级数
pub fn log_startup(max_workers: usize, cohort_count: usize) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 并发批改模式");
    info!("📊 批改并发数: {}", max_workers);
    info!("📚 待批改班级: {} 个", cohort_count);
    info!("{}", "=".repeat(60));
}

/// 记录一个班级的批改开始
///
/// # 参数
/// - `cohort_id`: 班级 ID
/// - `cohort_name`: 班级名称
/// - `total`: 学生人数
/// - `workers`: 并发数
/// - `ai_mode`: 策略是否调用 AI
pub fn log_batch_start(cohort_id: i64, cohort_name: &str, total: usize, workers: usize, ai_mode: bool) {
    info!("\n{}", "=".repeat(60));
    info!("📦 开始批改班级 [{}] {}", cohort_id, cohort_name);
    info!(
        "👥 学生 {} 人 | 并发 {} | {}",
        total,
        workers,
        if ai_mode {
            "AI 批改模式（受厂商并发上限约束）"
        } else {
            "逻辑批改模式"
        }
    );
    info!("{}", "=".repeat(60));
}

/// 记录一个班级的批改完成
pub fn log_batch_complete(cohort_id: i64, success: usize, total: usize) {
    info!("\n{}", "─".repeat(60));
    info!("✓ 班级 [{}] 批改完成: 成功 {}/{}", cohort_id, success, total);
    info!("{}", "─".repeat(60));
}

/// 打印最终统计信息
///
/// # 参数
/// - `success`: 成功数量
/// - `failed`: 失败数量
/// - `total`: 总数
/// - `log_file_path`: 日志文件路径
pub fn print_final_stats(success: usize, failed: usize, total: usize, log_file_path: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部批改完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功: {}/{}", success, total);
    info!("❌ 失败: {}", failed);
    info!("{}", "=".repeat(60));
    info!("\n日志已保存至: {}", log_file_path);
}

/// 截断长文本用于日志显示
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_truncate_text_counts_chars() {
        assert_eq!(truncate_text("批改结果很长", 2), "批改...");
        assert_eq!(truncate_text("短", 5), "短");
    }

    #[test]
    fn test_log_file_header_then_append() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run.log");
        let path = path.to_str().unwrap();

        init_log_file(path).unwrap();
        append_log_line(path, "班级 1: 2/3").unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("批改运行日志"));
        assert!(content.trim_end().ends_with("班级 1: 2/3"));
    }
}
