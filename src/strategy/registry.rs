//! 策略注册表
//!
//! 每次 `reload` 都从空表开始重新扫描清单目录，构建完整的新表后在短锁内整体替换。
//! 坏掉的清单只记录日志并跳过，旧的注册不会保留。

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDateTime;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::manifest::{list_manifest_files, load_manifest, StrategyManifest};
use super::{
    DirectAiFactory, GradingStrategy, RuleBasedFactory, StrategyEnv, StrategyFactory,
    StrategyOrigin,
};
use crate::error::StrategyError;
use crate::infrastructure::Database;

/// 已加载的策略记录
#[derive(Clone)]
struct StrategyRecord {
    manifest: Arc<StrategyManifest>,
    factory: Arc<dyn StrategyFactory>,
    is_ai: bool,
    origin: StrategyOrigin,
}

/// 一次重新加载的结果
#[derive(Debug, Default)]
pub struct ReloadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(PathBuf, String)>,
}

/// 策略列表中的一项
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategySummary {
    pub id: String,
    pub name: String,
    pub course: String,
    pub is_ai: bool,
    pub origin: StrategyOrigin,
    pub created_at: Option<NaiveDateTime>,
    pub creator: Option<String>,
    pub description: Option<String>,
}

/// 策略注册表
pub struct StrategyRegistry {
    dir: PathBuf,
    env: StrategyEnv,
    factories: HashMap<&'static str, Arc<dyn StrategyFactory>>,
    history: Option<Arc<Database>>,
    entries: RwLock<HashMap<String, StrategyRecord>>,
}

impl StrategyRegistry {
    /// 创建空注册表（不含任何工厂）
    pub fn new(dir: impl Into<PathBuf>, env: StrategyEnv) -> Self {
        Self {
            dir: dir.into(),
            env,
            factories: HashMap::new(),
            history: None,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// 注册内置的 `direct_ai` 与 `rule_based`
    pub fn with_builtin_factories(self) -> Self {
        self.with_factory(Arc::new(DirectAiFactory))
            .with_factory(Arc::new(RuleBasedFactory))
    }

    pub fn with_factory(mut self, factory: Arc<dyn StrategyFactory>) -> Self {
        self.factories.insert(factory.kind(), factory);
        self
    }

    /// 列表展示时合并策略生成任务记录
    pub fn with_history(mut self, store: Arc<Database>) -> Self {
        self.history = Some(store);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 重新扫描目录并整体替换注册表，从不返回错误
    pub async fn reload(&self) -> ReloadReport {
        let mut report = ReloadReport::default();
        let mut fresh: HashMap<String, StrategyRecord> = HashMap::new();

        let files = match list_manifest_files(&self.dir).await {
            Ok(files) => files,
            Err(e) => {
                warn!("⚠️  无法读取策略目录 {}: {}", self.dir.display(), e);
                Vec::new()
            }
        };

        for path in files {
            match self.load_one(&path).await {
                Ok(record) => {
                    let id = record.manifest.id.clone();
                    if fresh.contains_key(&id) {
                        warn!("策略 {} 重复定义，使用 {}", id, path.display());
                    }
                    report.loaded.push(id.clone());
                    fresh.insert(id, record);
                }
                Err(e) => {
                    warn!("❌ 加载策略失败 {}: {}", path.display(), e);
                    report.failed.push((path, e.to_string()));
                }
            }
        }

        let count = fresh.len();
        *self.entries.write() = fresh;
        debug!(
            "策略注册表已刷新: {} 个可用，{} 个失败",
            count,
            report.failed.len()
        );
        report
    }

    async fn load_one(&self, path: &Path) -> Result<StrategyRecord, StrategyError> {
        let manifest = load_manifest(path).await?;
        let factory = self
            .factories
            .get(manifest.kind.as_str())
            .cloned()
            .ok_or_else(|| StrategyError::UnknownKind {
                kind: manifest.kind.clone(),
                path: path.display().to_string(),
            })?;

        // 试构造一次，尽早暴露清单里的错误
        let probe = factory.build(&manifest, &self.env)?;
        Ok(StrategyRecord {
            is_ai: probe.is_ai(),
            origin: probe.origin(),
            manifest: Arc::new(manifest),
            factory,
        })
    }

    /// 重新加载后返回一个新构造的策略实例
    pub async fn get(&self, id: &str) -> Option<Arc<dyn GradingStrategy>> {
        self.reload().await;
        let record = self.entries.read().get(id).cloned()?;
        match record.factory.build(&record.manifest, &self.env) {
            Ok(strategy) => Some(strategy),
            Err(e) => {
                warn!("构造策略 {} 失败: {}", id, e);
                None
            }
        }
    }

    /// 重新加载后列出所有策略，按创建时间倒序，时间未知的排在最后
    pub async fn list_all(&self) -> Vec<StrategySummary> {
        self.reload().await;
        let records: Vec<StrategyRecord> = self.entries.read().values().cloned().collect();

        let mut summaries: Vec<StrategySummary> = records
            .into_iter()
            .map(|record| {
                let manifest = &record.manifest;
                let mut summary = StrategySummary {
                    id: manifest.id.clone(),
                    name: manifest.name.clone(),
                    course: manifest.course.clone(),
                    is_ai: record.is_ai,
                    origin: record.origin,
                    created_at: None,
                    creator: None,
                    description: None,
                };
                if let Some(store) = &self.history {
                    match store.task_for_strategy(&manifest.id) {
                        Ok(Some(task)) => {
                            summary.created_at = task.created_at;
                            summary.creator = task.creator_name;
                            summary.description = Some(task.description);
                        }
                        Ok(None) => {}
                        Err(e) => warn!("读取策略 {} 的任务记录失败: {}", manifest.id, e),
                    }
                }
                summary
            })
            .collect();

        summaries.sort_by(compare_newest_first);
        info!("📋 共 {} 个可用策略", summaries.len());
        summaries
    }
}

fn compare_newest_first(a: &StrategySummary, b: &StrategySummary) -> Ordering {
    match (a.created_at, b.created_at) {
        (Some(x), Some(y)) => y.cmp(&x).then_with(|| a.id.cmp(&b.id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.id.cmp(&b.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::ProviderAdmission;
    use crate::services::{AiDispatcher, CapabilityRouter};
    use chrono::NaiveDate;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn registry(dir: &Path, store: Arc<Database>) -> StrategyRegistry {
        let env = StrategyEnv {
            dispatcher: Arc::new(AiDispatcher::new(
                Arc::new(ProviderAdmission::new()),
                Duration::from_secs(1),
            )),
            router: Arc::new(CapabilityRouter::new(Arc::clone(&store))),
        };
        StrategyRegistry::new(dir, env)
            .with_builtin_factories()
            .with_history(store)
    }

    fn rule_manifest(id: &str, name: &str) -> String {
        format!(
            r#"
id = "{id}"
name = "{name}"
course = "Python"
kind = "rule_based"

[[rule_based.checks]]
name = "入口"
file = "main.py"
strict = "def main"
points = 100
"#
        )
    }

    fn ai_manifest(id: &str) -> String {
        format!(
            r#"
id = "{id}"
name = "AI 批改"
kind = "direct_ai"

[direct_ai]
exam_content = "题目"
grading_standard = "标准"
"#
        )
    }

    #[tokio::test]
    async fn test_reload_after_edit_yields_single_updated_registration() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(tmp.path(), Arc::new(Database::open_in_memory().unwrap()));
        let path = tmp.path().join("py_hw1.toml");

        fs::write(&path, rule_manifest("py_hw1", "第一版")).unwrap();
        assert_eq!(reg.get("py_hw1").await.unwrap().name(), "第一版");

        fs::write(&path, rule_manifest("py_hw1", "第二版")).unwrap();
        let listed = reg.list_all().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "第二版");
        assert_eq!(reg.get("py_hw1").await.unwrap().name(), "第二版");
    }

    #[tokio::test]
    async fn test_malformed_manifest_is_skipped_without_error() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(tmp.path(), Arc::new(Database::open_in_memory().unwrap()));
        fs::write(tmp.path().join("good.toml"), rule_manifest("good", "正常")).unwrap();
        fs::write(tmp.path().join("bad.toml"), "id = \"bad\"\nname = [").unwrap();
        fs::write(
            tmp.path().join("unknown.toml"),
            "id = \"u\"\nname = \"u\"\nkind = \"magic\"\n",
        )
        .unwrap();

        let report = reg.reload().await;
        assert_eq!(report.loaded, vec!["good".to_string()]);
        assert_eq!(report.failed.len(), 2);
        assert!(reg.get("good").await.is_some());
        assert!(reg.get("bad").await.is_none());
        assert!(reg.get("u").await.is_none());
    }

    #[tokio::test]
    async fn test_broken_edit_drops_previous_registration() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(tmp.path(), Arc::new(Database::open_in_memory().unwrap()));
        let path = tmp.path().join("hw.toml");

        fs::write(&path, rule_manifest("hw", "可用")).unwrap();
        assert!(reg.get("hw").await.is_some());

        fs::write(&path, rule_manifest("hw", "坏正则").replace("def main", "(def")).unwrap();
        assert!(reg.get("hw").await.is_none());

        fs::remove_file(&path).unwrap();
        assert!(reg.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_yields_empty_registry() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(
            &tmp.path().join("nope"),
            Arc::new(Database::open_in_memory().unwrap()),
        );
        let report = reg.reload().await;
        assert!(report.loaded.is_empty());
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_list_all_merges_history_and_sorts_newest_first() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(Database::open_in_memory().unwrap());
        let reg = registry(tmp.path(), Arc::clone(&store));

        fs::write(tmp.path().join("a.toml"), rule_manifest("old", "旧")).unwrap();
        fs::write(tmp.path().join("b.toml"), ai_manifest("new")).unwrap();
        fs::write(tmp.path().join("c.toml"), rule_manifest("orphan", "无记录")).unwrap();

        let teacher = store.add_user("王老师").unwrap();
        let at = |d: u32| NaiveDate::from_ymd_opt(2024, 3, d).unwrap().and_hms_opt(9, 0, 0).unwrap();
        store
            .insert_task("旧任务", Some("old"), "第一次", Some(teacher), Some(at(1)))
            .unwrap();
        store
            .insert_task("新任务", Some("new"), "第二次", Some(teacher), Some(at(5)))
            .unwrap();

        let listed = reg.list_all().await;
        let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old", "orphan"]);

        assert!(listed[0].is_ai);
        assert_eq!(listed[0].origin, StrategyOrigin::Template);
        assert_eq!(listed[0].creator.as_deref(), Some("王老师"));
        assert_eq!(listed[1].description.as_deref(), Some("第一次"));
        assert_eq!(listed[2].created_at, None);
        assert_eq!(listed[2].origin, StrategyOrigin::Logic);
    }
}
