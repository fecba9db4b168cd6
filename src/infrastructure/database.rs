//! 配置库 - 基础设施层
//!
//! 唯一持有 SQLite 连接的模块。保存：
//! - AI 厂商与模型（能力路由 `best_config_for` 的数据来源）
//! - 班级、学生、成绩
//! - 策略生成任务记录（策略列表的展示元数据）
//!
//! 连接放在 `parking_lot::Mutex` 里，批改线程共享同一个 `Database`；
//! 每个方法只在执行 SQL 期间持锁。

use std::path::Path;

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::error::AppResult;
use crate::models::{
    Capability, Cohort, GradeRecord, GradeStatus, ModelConfig, ProtocolKind, ProviderConfig,
    Student, SubScore, TaskHistory,
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 配置库
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// 打开（或创建）数据库文件并初始化表结构
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        info!("📂 配置库已打开: {}", path.as_ref().display());
        Ok(db)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                username   TEXT NOT NULL UNIQUE,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS ai_providers (
                id                      INTEGER PRIMARY KEY AUTOINCREMENT,
                name                    TEXT NOT NULL UNIQUE,
                provider_type           TEXT NOT NULL,
                base_url                TEXT NOT NULL DEFAULT '',
                api_key                 TEXT NOT NULL,
                max_concurrent_requests INTEGER NOT NULL DEFAULT 3,
                is_enabled              INTEGER NOT NULL DEFAULT 1,
                created_at              TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS ai_models (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                provider_id    INTEGER NOT NULL,
                model_name     TEXT NOT NULL,
                capability     TEXT NOT NULL CHECK (capability IN ('standard', 'thinking', 'vision')),
                weight         INTEGER NOT NULL DEFAULT 50,
                can_force_json INTEGER NOT NULL DEFAULT 0,
                is_enabled     INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (provider_id) REFERENCES ai_providers (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS ai_tasks (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'pending',
                grader_id   TEXT,
                extra_desc  TEXT NOT NULL DEFAULT '',
                created_by  INTEGER,
                created_at  TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS classes (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                name           TEXT NOT NULL,
                course         TEXT NOT NULL DEFAULT '',
                workspace_path TEXT NOT NULL DEFAULT '',
                strategy       TEXT NOT NULL,
                created_by     INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS students (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                student_id TEXT NOT NULL,
                name       TEXT NOT NULL,
                class_id   INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS grades (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                student_id     TEXT NOT NULL,
                class_id       INTEGER NOT NULL,
                total_score    REAL NOT NULL,
                score_details  TEXT NOT NULL,
                deduct_details TEXT NOT NULL,
                status         TEXT NOT NULL,
                filename       TEXT NOT NULL,
                UNIQUE (student_id, class_id)
            );

            CREATE INDEX IF NOT EXISTS idx_ai_models_capability ON ai_models(capability);
            CREATE INDEX IF NOT EXISTS idx_students_class_id ON students(class_id);
            "#,
        )?;
        Ok(())
    }

    // ========== 用户 ==========

    pub fn add_user(&self, username: &str) -> AppResult<i64> {
        let conn = self.conn.lock();
        conn.execute("INSERT INTO users (username) VALUES (?1)", params![username])?;
        Ok(conn.last_insert_rowid())
    }

    // ========== AI 厂商与模型 ==========

    pub fn add_provider(
        &self,
        name: &str,
        protocol: ProtocolKind,
        base_url: &str,
        api_key: &str,
        max_concurrent: usize,
    ) -> AppResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ai_providers (name, provider_type, base_url, api_key, max_concurrent_requests)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, protocol.as_str(), base_url, api_key, max_concurrent as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 修改厂商并发上限（服务运行中生效）
    pub fn update_provider_limit(&self, provider_id: i64, limit: usize) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE ai_providers SET max_concurrent_requests = ?1 WHERE id = ?2",
            params![limit as i64, provider_id],
        )?;
        Ok(())
    }

    pub fn set_provider_enabled(&self, provider_id: i64, enabled: bool) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE ai_providers SET is_enabled = ?1 WHERE id = ?2",
            params![enabled, provider_id],
        )?;
        Ok(())
    }

    pub fn add_model(
        &self,
        provider_id: i64,
        model_name: &str,
        capability: Capability,
        weight: i64,
        force_json: bool,
    ) -> AppResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ai_models (provider_id, model_name, capability, weight, can_force_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![provider_id, model_name, capability.as_str(), weight, force_json],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_model_enabled(&self, model_id: i64, enabled: bool) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE ai_models SET is_enabled = ?1 WHERE id = ?2",
            params![enabled, model_id],
        )?;
        Ok(())
    }

    pub fn list_models(&self, provider_id: i64) -> AppResult<Vec<ModelConfig>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, provider_id, model_name, capability, weight, is_enabled, can_force_json
             FROM ai_models WHERE provider_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![provider_id], |row| {
            Ok(ModelConfig {
                id: row.get(0)?,
                provider_id: row.get(1)?,
                model_name: row.get(2)?,
                capability: parse_capability(row, 3)?,
                weight: row.get(4)?,
                enabled: row.get(5)?,
                force_structured_output: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// 按能力选出权重最高的已启用模型（所属厂商也必须启用）
    ///
    /// 权重相同按模型 ID 升序。不会替换成其他能力，回退由调用方决定。
    pub fn best_config_for(&self, capability: Capability) -> AppResult<Option<ProviderConfig>> {
        let conn = self.conn.lock();
        let config = conn
            .query_row(
                "SELECT p.id, p.name, p.provider_type, p.base_url, p.api_key,
                        p.max_concurrent_requests, p.is_enabled,
                        m.model_name, m.capability, m.can_force_json
                 FROM ai_models m
                 JOIN ai_providers p ON m.provider_id = p.id
                 WHERE m.capability = ?1 AND m.is_enabled = 1 AND p.is_enabled = 1
                 ORDER BY m.weight DESC, m.id ASC
                 LIMIT 1",
                params![capability.as_str()],
                |row| {
                    let protocol: String = row.get(2)?;
                    let protocol = protocol.parse::<ProtocolKind>().map_err(|_| {
                        rusqlite::Error::InvalidColumnType(
                            2,
                            "provider_type".to_string(),
                            rusqlite::types::Type::Text,
                        )
                    })?;
                    let limit: i64 = row.get(5)?;
                    Ok(ProviderConfig {
                        provider_id: row.get(0)?,
                        provider_name: row.get(1)?,
                        protocol,
                        base_url: row.get(3)?,
                        api_key: row.get(4)?,
                        max_concurrent_requests: limit.max(0) as usize,
                        enabled: row.get(6)?,
                        model_name: row.get(7)?,
                        capability: parse_capability(row, 8)?,
                        force_structured_output: row.get(9)?,
                    })
                },
            )
            .optional()?;

        debug!(
            "能力 {} 选中: {:?}",
            capability,
            config.as_ref().map(|c| (&c.provider_name, &c.model_name))
        );
        Ok(config)
    }

    /// 读取厂商当前的并发上限（每次调用前重新读取），未配置（0）时返回 None
    pub fn provider_concurrency(&self, provider_id: i64) -> AppResult<Option<usize>> {
        let conn = self.conn.lock();
        let limit: Option<i64> = conn
            .query_row(
                "SELECT max_concurrent_requests FROM ai_providers WHERE id = ?1",
                params![provider_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(limit.filter(|l| *l > 0).map(|l| l as usize))
    }

    // ========== 班级与学生 ==========

    pub fn create_cohort(
        &self,
        name: &str,
        course: &str,
        strategy: &str,
        workspace_path: &str,
        created_by: i64,
    ) -> AppResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO classes (name, course, strategy, workspace_path, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, course, strategy, workspace_path, created_by],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_cohort(&self, cohort_id: i64) -> AppResult<Option<Cohort>> {
        let conn = self.conn.lock();
        let cohort = conn
            .query_row(
                "SELECT id, name, course, strategy, workspace_path, created_by
                 FROM classes WHERE id = ?1",
                params![cohort_id],
                |row| {
                    Ok(Cohort {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        course: row.get(2)?,
                        strategy: row.get(3)?,
                        workspace_path: row.get(4)?,
                        created_by: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(cohort)
    }

    /// 修改班级绑定的评分策略
    pub fn set_cohort_strategy(&self, cohort_id: i64, strategy: &str) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE classes SET strategy = ?1 WHERE id = ?2",
            params![strategy, cohort_id],
        )?;
        Ok(())
    }

    pub fn add_student(&self, cohort_id: i64, student_id: &str, name: &str) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO students (student_id, name, class_id) VALUES (?1, ?2, ?3)",
            params![student_id, name, cohort_id],
        )?;
        Ok(())
    }

    pub fn list_students(&self, cohort_id: i64) -> AppResult<Vec<Student>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT student_id, name, class_id FROM students WHERE class_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![cohort_id], |row| {
            Ok(Student {
                student_id: row.get(0)?,
                name: row.get(1)?,
                cohort_id: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_student(&self, cohort_id: i64, student_id: &str) -> AppResult<Option<Student>> {
        let conn = self.conn.lock();
        let student = conn
            .query_row(
                "SELECT student_id, name, class_id FROM students
                 WHERE class_id = ?1 AND student_id = ?2",
                params![cohort_id, student_id],
                |row| {
                    Ok(Student {
                        student_id: row.get(0)?,
                        name: row.get(1)?,
                        cohort_id: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(student)
    }

    // ========== 成绩 ==========

    pub fn clear_grades(&self, cohort_id: i64) -> AppResult<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM grades WHERE class_id = ?1", params![cohort_id])?;
        Ok(removed)
    }

    /// 保存成绩：先删后插，在一个事务里完成，读者不会看到中间状态
    pub fn save_grade(&self, record: &GradeRecord) -> AppResult<()> {
        let details = serde_json::to_string(&record.sub_scores)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM grades WHERE student_id = ?1 AND class_id = ?2",
            params![record.student_id, record.cohort_id],
        )?;
        tx.execute(
            "INSERT INTO grades (student_id, class_id, total_score, score_details,
                                 deduct_details, status, filename)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.student_id,
                record.cohort_id,
                record.total_score,
                details,
                record.deduct_details,
                record.status.as_str(),
                record.filename
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_grade(&self, cohort_id: i64, student_id: &str) -> AppResult<Option<GradeRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT student_id, class_id, total_score, score_details, deduct_details, status, filename
                 FROM grades WHERE class_id = ?1 AND student_id = ?2",
                params![cohort_id, student_id],
                row_to_grade,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_grades(&self, cohort_id: i64) -> AppResult<Vec<GradeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT student_id, class_id, total_score, score_details, deduct_details, status, filename
             FROM grades WHERE class_id = ?1 ORDER BY student_id",
        )?;
        let rows = stmt.query_map(params![cohort_id], row_to_grade)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ========== 策略生成任务 ==========

    /// 写入一条策略生成任务记录，`created_at` 为空时使用当前时间
    pub fn insert_task(
        &self,
        name: &str,
        strategy_id: Option<&str>,
        description: &str,
        created_by: Option<i64>,
        created_at: Option<NaiveDateTime>,
    ) -> AppResult<i64> {
        let created_at = created_at
            .unwrap_or_else(|| chrono::Local::now().naive_local())
            .format(TIMESTAMP_FORMAT)
            .to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ai_tasks (name, status, grader_id, extra_desc, created_by, created_at)
             VALUES (?1, 'success', ?2, ?3, ?4, ?5)",
            params![name, strategy_id, description, created_by, created_at],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 查找生成该策略的最近一条任务记录（联表取创建者名称）
    pub fn task_for_strategy(&self, strategy_id: &str) -> AppResult<Option<TaskHistory>> {
        let conn = self.conn.lock();
        let task = conn
            .query_row(
                "SELECT t.id, t.name, t.grader_id, t.status, t.extra_desc, u.username, t.created_at
                 FROM ai_tasks t
                 LEFT JOIN users u ON t.created_by = u.id
                 WHERE t.grader_id = ?1
                 ORDER BY t.created_at DESC, t.id DESC
                 LIMIT 1",
                params![strategy_id],
                |row| {
                    let created_at: Option<String> = row.get(6)?;
                    Ok(TaskHistory {
                        task_id: row.get(0)?,
                        name: row.get(1)?,
                        strategy_id: row.get(2)?,
                        status: row.get(3)?,
                        description: row.get(4)?,
                        creator_name: row.get(5)?,
                        created_at: created_at
                            .and_then(|s| NaiveDateTime::parse_from_str(&s, TIMESTAMP_FORMAT).ok()),
                    })
                },
            )
            .optional()?;
        Ok(task)
    }
}

fn parse_capability(row: &Row, idx: usize) -> rusqlite::Result<Capability> {
    let raw: String = row.get(idx)?;
    raw.parse::<Capability>().map_err(|_| {
        rusqlite::Error::InvalidColumnType(idx, "capability".to_string(), rusqlite::types::Type::Text)
    })
}

fn row_to_grade(row: &Row) -> rusqlite::Result<GradeRecord> {
    let details: String = row.get(3)?;
    let sub_scores: Vec<SubScore> = serde_json::from_str(&details).unwrap_or_default();
    let status: String = row.get(5)?;
    let status = GradeStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(5, "status".to_string(), rusqlite::types::Type::Text)
    })?;
    Ok(GradeRecord {
        student_id: row.get(0)?,
        cohort_id: row.get(1)?,
        total_score: row.get(2)?,
        sub_scores,
        deduct_details: row.get(4)?,
        status,
        filename: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let pid = db
            .add_provider("volc", ProtocolKind::ResponsesMultimodal, "https://ark.example/api/v3", "k", 2)
            .unwrap();
        (db, pid)
    }

    #[test]
    fn test_best_config_prefers_highest_weight() {
        let (db, pid) = seeded();
        db.add_model(pid, "doubao-lite", Capability::Standard, 10, false).unwrap();
        db.add_model(pid, "doubao-pro", Capability::Standard, 90, true).unwrap();

        let config = db.best_config_for(Capability::Standard).unwrap().unwrap();
        assert_eq!(config.model_name, "doubao-pro");
        assert!(config.force_structured_output);
        assert_eq!(config.protocol, ProtocolKind::ResponsesMultimodal);
        assert_eq!(config.max_concurrent_requests, 2);
    }

    #[test]
    fn test_best_config_ties_break_by_model_id() {
        let (db, pid) = seeded();
        db.add_model(pid, "first", Capability::Vision, 50, false).unwrap();
        db.add_model(pid, "second", Capability::Vision, 50, false).unwrap();

        let config = db.best_config_for(Capability::Vision).unwrap().unwrap();
        assert_eq!(config.model_name, "first");
    }

    #[test]
    fn test_disabled_provider_or_model_is_skipped() {
        let (db, pid) = seeded();
        let mid = db.add_model(pid, "m", Capability::Thinking, 50, false).unwrap();

        db.set_model_enabled(mid, false).unwrap();
        assert!(db.best_config_for(Capability::Thinking).unwrap().is_none());

        db.set_model_enabled(mid, true).unwrap();
        db.set_provider_enabled(pid, false).unwrap();
        assert!(db.best_config_for(Capability::Thinking).unwrap().is_none());
    }

    #[test]
    fn test_provider_limit_is_read_fresh() {
        let (db, pid) = seeded();
        assert_eq!(db.provider_concurrency(pid).unwrap(), Some(2));
        db.update_provider_limit(pid, 7).unwrap();
        assert_eq!(db.provider_concurrency(pid).unwrap(), Some(7));
        assert_eq!(db.provider_concurrency(999).unwrap(), None);
    }

    #[test]
    fn test_save_grade_replaces_previous_record() {
        let db = Database::open_in_memory().unwrap();
        let cid = db.create_cohort("网络1班", "Linux", "linux_final", "", 1).unwrap();

        db.save_grade(&GradeRecord::error("s1", cid, "未找到提交文件", "")).unwrap();
        let mut ok = crate::models::GradingResult::new();
        ok.total_score = 88.0;
        ok.add_sub_score("Task 1", 88.0);
        let ok = ok.finalize(100.0, 60.0);
        db.save_grade(&GradeRecord::from_result("s1", cid, &ok, "s1.zip")).unwrap();

        let grades = db.list_grades(cid).unwrap();
        assert_eq!(grades.len(), 1);
        assert_eq!(grades[0].status, GradeStatus::Pass);
        assert_eq!(grades[0].sub_scores.len(), 1);
        assert_eq!(grades[0].filename, "s1.zip");
    }

    #[test]
    fn test_task_for_strategy_joins_creator() {
        let db = Database::open_in_memory().unwrap();
        let uid = db.add_user("wang_laoshi").unwrap();
        let at = NaiveDateTime::parse_from_str("2025-06-01 08:00:00", TIMESTAMP_FORMAT).unwrap();
        db.insert_task("期末机考", Some("linux_final"), "严格模式", Some(uid), Some(at))
            .unwrap();

        let task = db.task_for_strategy("linux_final").unwrap().unwrap();
        assert_eq!(task.creator_name.as_deref(), Some("wang_laoshi"));
        assert_eq!(task.created_at, Some(at));
        assert!(db.task_for_strategy("missing").unwrap().is_none());
    }
}
