//! 应用入口：组装各层并按班级批改

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::infrastructure::{Database, ProviderAdmission};
use crate::orchestrator::{BatchSummary, GradingService};
use crate::services::{AiDispatcher, CapabilityRouter};
use crate::strategy::{StrategyEnv, StrategyRegistry, StrategySummary};
use crate::utils::logging::{append_log_line, init_log_file, log_startup, print_final_stats};

/// 应用主结构
pub struct App {
    config: Config,
    store: Arc<Database>,
    registry: Arc<StrategyRegistry>,
    service: Arc<GradingService>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        let config = config.normalized();
        init_log_file(&config.output_log_file)?;

        let store = Arc::new(
            Database::open(&config.database_path)
                .with_context(|| format!("无法打开配置库: {}", config.database_path))?,
        );

        let dispatcher = Arc::new(
            AiDispatcher::new(
                Arc::new(ProviderAdmission::new()),
                Duration::from_secs(config.request_timeout_secs),
            )
            .with_limit_source(store.clone())
            .with_default_limit(config.default_provider_limit),
        );
        let router = Arc::new(CapabilityRouter::new(Arc::clone(&store)));

        let env = StrategyEnv {
            dispatcher,
            router: Arc::clone(&router),
        };
        let registry = Arc::new(
            StrategyRegistry::new(PathBuf::from(&config.strategies_dir), env)
                .with_builtin_factories()
                .with_history(Arc::clone(&store)),
        );
        let report = registry.reload().await;
        info!(
            "📚 策略目录 {}: 加载 {} 个，失败 {} 个",
            config.strategies_dir,
            report.loaded.len(),
            report.failed.len()
        );

        let service = Arc::new(GradingService::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            router,
            &config,
        ));

        Ok(Self {
            config,
            store,
            registry,
            service,
        })
    }

    pub fn store(&self) -> &Arc<Database> {
        &self.store
    }

    pub fn service(&self) -> &Arc<GradingService> {
        &self.service
    }

    /// 列出所有可用策略
    pub async fn strategies(&self) -> Vec<StrategySummary> {
        self.registry.list_all().await
    }

    /// 依次批改给定的班级，返回汇总统计
    pub async fn run(&self, cohort_ids: &[i64]) -> Result<BatchSummary> {
        log_startup(self.config.max_grading_workers, cohort_ids.len());
        let log_path = &self.config.output_log_file;

        let mut overall = BatchSummary::default();
        for &cohort_id in cohort_ids {
            match self.service.grade_all(cohort_id).await {
                Ok(summary) => {
                    overall.success += summary.success;
                    overall.failed += summary.failed;
                    overall.total += summary.total;
                    let line = format!(
                        "班级 {}: 成功 {}/{}，失败 {}",
                        cohort_id, summary.success, summary.total, summary.failed
                    );
                    if let Err(e) = append_log_line(log_path, &line) {
                        warn!("写入运行日志失败: {:#}", e);
                    }
                }
                Err(e) => {
                    error!("[班级 {}] ❌ 无法开始批改: {}", cohort_id, e);
                    if let Err(e) = append_log_line(log_path, &format!("班级 {}: {}", cohort_id, e)) {
                        warn!("写入运行日志失败: {:#}", e);
                    }
                }
            }
        }

        print_final_stats(overall.success, overall.failed, overall.total, log_path);
        Ok(overall)
    }
}
