use anyhow::{Context, Result};
use grading_core::utils::logging;
use grading_core::{App, Config};
use tracing::info;

/// 用法：
///   grading_core [--config 配置文件.toml] [班级ID ...]
///
/// 不给班级 ID 时只列出可用的评分策略。
#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1).peekable();

    // 加载配置
    let config = if args.peek().map(|a| a == "--config").unwrap_or(false) {
        args.next();
        let path = args.next().context("--config 需要一个文件路径")?;
        Config::from_toml_file(&path)?
    } else {
        Config::from_env()
    };

    // 初始化日志
    logging::init(config.verbose_logging);

    let cohort_ids = args
        .map(|a| a.parse::<i64>().with_context(|| format!("无效的班级 ID: {}", a)))
        .collect::<Result<Vec<_>>>()?;

    let app = App::initialize(config).await?;

    if cohort_ids.is_empty() {
        for s in app.strategies().await {
            info!(
                "{:<20} {:<24} {:<12} {}",
                s.id,
                s.name,
                if s.is_ai { "AI" } else { "规则" },
                s.created_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        return Ok(());
    }

    app.run(&cohort_ids).await?;
    Ok(())
}
