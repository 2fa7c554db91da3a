//! # Audit 模块
//!
//! 统一审计日志系统，记录所有数据治理操作。
//!
//! ## 设计原则
//!
//! 1. **结构化日志**：所有操作记录为结构化数据
//! 2. **只追加**：条目写入后不再修改，终态条目通过 `correlation_id` 关联到 Started 条目
//! 3. **持久化**：写入专用 SQLite 表（独立于受治理的数据库）
//!
//! ## 审计内容
//!
//! - 迁移操作（Migration）
//! - 备份操作（Backup）
//! - 恢复操作（Restore）
//! - 同步操作（Sync）
//! - 维护操作（Maintenance）

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// 审计日志条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    /// 唯一 ID
    pub id: String,
    /// 关联 ID（同一逻辑操作的 Started 与终态条目共享）
    pub correlation_id: String,
    /// 时间戳
    pub timestamp: DateTime<Utc>,
    /// 操作类型
    pub operation: AuditOperation,
    /// 操作目标（数据库名、备份 ID 或文件路径）
    pub target: String,
    /// 状态
    pub status: AuditStatus,
    /// 耗时（毫秒）
    pub duration_ms: Option<u64>,
    /// 详细信息（JSON）
    pub details: serde_json::Value,
    /// 错误信息（如果有）
    pub error_message: Option<String>,
}

/// 审计操作类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuditOperation {
    /// 迁移操作
    Migration {
        from_version: u32,
        to_version: u32,
        applied_count: usize,
    },
    /// 备份操作
    Backup {
        backup_type: BackupType,
        file_count: usize,
        total_size: u64,
    },
    /// 恢复操作
    Restore { backup_id: String },
    /// 同步操作（导出 / 导入 / 旧版聊天迁移）
    Sync {
        direction: SyncDirection,
        records_affected: usize,
    },
    /// 维护操作（审计清理、备份删除等）
    Maintenance { action: String },
}

impl AuditOperation {
    /// 操作类型名（与查询过滤器的 operation_type 对应）
    pub fn type_name(&self) -> &'static str {
        match self {
            AuditOperation::Migration { .. } => "Migration",
            AuditOperation::Backup { .. } => "Backup",
            AuditOperation::Restore { .. } => "Restore",
            AuditOperation::Sync { .. } => "Sync",
            AuditOperation::Maintenance { .. } => "Maintenance",
        }
    }
}

/// 备份类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupType {
    /// 完整备份
    Full,
    /// 增量备份
    Incremental,
    /// 恢复前安全快照
    PreRestore,
}

/// 同步方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncDirection {
    /// 导出为 ZIP
    Export,
    /// 从 ZIP 导入
    Import,
    /// 旧版聊天数据迁移
    LegacyChat,
}

/// 审计状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditStatus {
    /// 开始
    Started,
    /// 完成
    Completed,
    /// 失败
    Failed,
    /// 部分成功（含：取消、失败后已回滚）
    Partial,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Started => "Started",
            AuditStatus::Completed => "Completed",
            AuditStatus::Failed => "Failed",
            AuditStatus::Partial => "Partial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Started" => Some(AuditStatus::Started),
            "Completed" => Some(AuditStatus::Completed),
            "Failed" => Some(AuditStatus::Failed),
            "Partial" => Some(AuditStatus::Partial),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AuditStatus::Started)
    }
}

impl AuditLog {
    /// 创建新的审计日志（状态为 Started，关联 ID 等于自身 ID）
    pub fn new(operation: AuditOperation, target: impl Into<String>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            correlation_id: id.clone(),
            id,
            timestamp: Utc::now(),
            operation,
            target: target.into(),
            status: AuditStatus::Started,
            duration_ms: None,
            details: serde_json::Value::Null,
            error_message: None,
        }
    }

    /// 关联到已有的 Started 条目
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// 标记为完成
    pub fn complete(mut self, duration_ms: u64) -> Self {
        self.status = AuditStatus::Completed;
        self.duration_ms = Some(duration_ms);
        self
    }

    /// 标记为失败
    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.status = AuditStatus::Failed;
        self.error_message = Some(error.into());
        self
    }

    /// 标记为部分成功
    pub fn partial(mut self, message: impl Into<String>) -> Self {
        self.status = AuditStatus::Partial;
        self.error_message = Some(message.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// 添加详细信息
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// 审计数据库连接管理
pub struct AuditDatabase {
    conn: Mutex<Connection>,
}

impl AuditDatabase {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// 从路径打开审计数据库并初始化表
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AuditError::Database(format!("创建审计目录失败: {}", e)))?;
        }
        let conn = Connection::open(path).map_err(|e| AuditError::Database(e.to_string()))?;
        let db = Self::new(conn);
        db.init()?;
        Ok(db)
    }

    /// 内存数据库（测试使用）
    pub fn open_in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory().map_err(|e| AuditError::Database(e.to_string()))?;
        let db = Self::new(conn);
        db.init()?;
        Ok(db)
    }

    pub fn get_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, AuditError> {
        self.conn
            .lock()
            .map_err(|e| AuditError::Database(format!("Failed to acquire lock: {}", e)))
    }

    pub fn init(&self) -> Result<(), AuditError> {
        let conn = self.get_conn()?;
        AuditRepository::init(&conn)
    }
}

/// 审计日志仓库
pub struct AuditRepository;

impl AuditRepository {
    pub const CREATE_TABLE_SQL: &'static str = r#"
        CREATE TABLE IF NOT EXISTS __audit_log (
            id TEXT PRIMARY KEY NOT NULL,
            correlation_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            operation_type TEXT NOT NULL,
            operation_data TEXT NOT NULL,
            target TEXT NOT NULL,
            status TEXT NOT NULL,
            duration_ms INTEGER,
            details TEXT,
            error_message TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_timestamp ON __audit_log(timestamp);
        CREATE INDEX IF NOT EXISTS idx_audit_log_operation_type ON __audit_log(operation_type);
        CREATE INDEX IF NOT EXISTS idx_audit_log_status ON __audit_log(status);
        CREATE INDEX IF NOT EXISTS idx_audit_log_correlation ON __audit_log(correlation_id);
    "#;

    const INSERT_SQL: &'static str = r#"
        INSERT INTO __audit_log (
            id, correlation_id, timestamp, operation_type, operation_data, target,
            status, duration_ms, details, error_message
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
    "#;

    const SELECT_COLUMNS: &'static str = "SELECT id, correlation_id, timestamp, operation_type, \
         operation_data, target, status, duration_ms, details, error_message FROM __audit_log";

    pub fn init(conn: &Connection) -> Result<(), AuditError> {
        conn.execute_batch(Self::CREATE_TABLE_SQL)
            .map_err(|e| AuditError::Database(e.to_string()))?;
        Ok(())
    }

    /// 保存审计日志（只追加）
    pub fn save(conn: &Connection, log: &AuditLog) -> Result<(), AuditError> {
        let operation_data = serde_json::to_string(&log.operation)?;
        let details_str = serde_json::to_string(&log.details)?;

        conn.execute(
            Self::INSERT_SQL,
            params![
                log.id,
                log.correlation_id,
                log.timestamp.to_rfc3339(),
                log.operation.type_name(),
                operation_data,
                log.target,
                log.status.as_str(),
                log.duration_ms,
                details_str,
                log.error_message,
            ],
        )
        .map_err(|e| AuditError::Database(e.to_string()))?;

        Ok(())
    }

    /// 构建 WHERE 子句和参数
    fn build_where(filter: &AuditFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut where_clause = String::from(" WHERE 1=1");
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref op_type) = filter.operation_type {
            params_vec.push(Box::new(op_type.clone()));
            where_clause.push_str(&format!(" AND operation_type = ?{}", params_vec.len()));
        }
        if let Some(ref target) = filter.target {
            params_vec.push(Box::new(target.clone()));
            where_clause.push_str(&format!(" AND target = ?{}", params_vec.len()));
        }
        if let Some(ref from_time) = filter.from_time {
            params_vec.push(Box::new(from_time.to_rfc3339()));
            where_clause.push_str(&format!(" AND timestamp >= ?{}", params_vec.len()));
        }
        if let Some(ref to_time) = filter.to_time {
            params_vec.push(Box::new(to_time.to_rfc3339()));
            where_clause.push_str(&format!(" AND timestamp <= ?{}", params_vec.len()));
        }
        if let Some(status) = filter.status {
            params_vec.push(Box::new(status.as_str().to_string()));
            where_clause.push_str(&format!(" AND status = ?{}", params_vec.len()));
        }

        (where_clause, params_vec)
    }

    /// 查询审计日志（按时间倒序）
    pub fn query(conn: &Connection, filter: &AuditFilter) -> Result<Vec<AuditLog>, AuditError> {
        let (where_clause, params_vec) = Self::build_where(filter);
        // rowid 作为同一毫秒内的次序
        let mut sql = format!(
            "{}{} ORDER BY timestamp DESC, rowid DESC",
            Self::SELECT_COLUMNS,
            where_clause
        );

        match (filter.limit, filter.offset) {
            (Some(limit), offset) => {
                sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset.unwrap_or(0)))
            }
            (None, Some(offset)) if offset > 0 => {
                sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset))
            }
            _ => {}
        }

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AuditError::Database(e.to_string()))?;
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(params_refs.as_slice(), Self::row_to_audit_log)
            .map_err(|e| AuditError::Database(e.to_string()))?;

        let mut logs = Vec::new();
        for row_result in rows {
            let log = row_result.map_err(|e| AuditError::Database(e.to_string()))?;
            logs.push(log?);
        }
        Ok(logs)
    }

    /// 分页查询审计日志（返回列表 + 满足条件的总数）
    pub fn query_paged(
        conn: &Connection,
        filter: &AuditFilter,
    ) -> Result<AuditQueryResult, AuditError> {
        let (where_clause, params_vec) = Self::build_where(filter);
        let count_sql = format!("SELECT COUNT(*) FROM __audit_log{}", where_clause);
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|b| b.as_ref()).collect();
        let total: i64 = conn
            .query_row(&count_sql, params_refs.as_slice(), |row| row.get(0))
            .map_err(|e| AuditError::Database(e.to_string()))?;

        let logs = Self::query(conn, filter)?;
        Ok(AuditQueryResult {
            logs,
            total: total as u64,
        })
    }

    pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<AuditLog>, AuditError> {
        let sql = format!("{} WHERE id = ?1", Self::SELECT_COLUMNS);
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AuditError::Database(e.to_string()))?;
        let mut rows = stmt
            .query_map(params![id], Self::row_to_audit_log)
            .map_err(|e| AuditError::Database(e.to_string()))?;

        if let Some(row_result) = rows.next() {
            let log = row_result.map_err(|e| AuditError::Database(e.to_string()))?;
            return Ok(Some(log?));
        }
        Ok(None)
    }

    /// 按关联 ID 查询同一逻辑操作的所有条目（按写入顺序）
    pub fn find_by_correlation(
        conn: &Connection,
        correlation_id: &str,
    ) -> Result<Vec<AuditLog>, AuditError> {
        let sql = format!(
            "{} WHERE correlation_id = ?1 ORDER BY rowid ASC",
            Self::SELECT_COLUMNS
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AuditError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![correlation_id], Self::row_to_audit_log)
            .map_err(|e| AuditError::Database(e.to_string()))?;
        let mut logs = Vec::new();
        for row_result in rows {
            let log = row_result.map_err(|e| AuditError::Database(e.to_string()))?;
            logs.push(log?);
        }
        Ok(logs)
    }

    pub fn count_by_type(conn: &Connection, operation_type: &str) -> Result<u64, AuditError> {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM __audit_log WHERE operation_type = ?1",
                params![operation_type],
                |row| row.get(0),
            )
            .map_err(|e| AuditError::Database(e.to_string()))?;
        Ok(count as u64)
    }

    pub fn count_all(conn: &Connection) -> Result<u64, AuditError> {
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM __audit_log", [], |row| row.get(0))
            .map_err(|e| AuditError::Database(e.to_string()))?;
        Ok(count as u64)
    }

    /// 清理旧审计日志，保留最近 N 条
    ///
    /// ## 返回
    /// 被删除的记录数量
    pub fn cleanup_keep_recent(conn: &Connection, keep_count: usize) -> Result<u64, AuditError> {
        let sql = "DELETE FROM __audit_log WHERE id NOT IN (
            SELECT id FROM __audit_log ORDER BY timestamp DESC, rowid DESC LIMIT ?1
        )";
        let deleted = conn
            .execute(sql, params![keep_count as i64])
            .map_err(|e| AuditError::Database(e.to_string()))?;
        Ok(deleted as u64)
    }

    /// 从数据库行解析 AuditLog
    fn row_to_audit_log(row: &Row) -> rusqlite::Result<Result<AuditLog, AuditError>> {
        let id: String = row.get(0)?;
        let correlation_id: String = row.get(1)?;
        let timestamp_str: String = row.get(2)?;
        let _operation_type: String = row.get(3)?;
        let operation_data: String = row.get(4)?;
        let target: String = row.get(5)?;
        let status_str: String = row.get(6)?;
        let duration_ms: Option<u64> = row.get(7)?;
        let details_str: Option<String> = row.get(8)?;
        let error_message: Option<String> = row.get(9)?;

        let timestamp = match DateTime::parse_from_rfc3339(&timestamp_str) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(e) => {
                return Ok(Err(AuditError::Database(format!(
                    "Invalid timestamp: {}",
                    e
                ))))
            }
        };

        let operation: AuditOperation = match serde_json::from_str(&operation_data) {
            Ok(op) => op,
            Err(e) => return Ok(Err(AuditError::Serialization(e))),
        };

        let Some(status) = AuditStatus::parse(&status_str) else {
            return Ok(Err(AuditError::Database(format!(
                "Invalid status: {}",
                status_str
            ))));
        };

        let details = match details_str {
            Some(ref s) if !s.is_empty() => {
                serde_json::from_str(s).unwrap_or(serde_json::Value::Null)
            }
            _ => serde_json::Value::Null,
        };

        Ok(Ok(AuditLog {
            id,
            correlation_id,
            timestamp,
            operation,
            target,
            status,
            duration_ms,
            details,
            error_message,
        }))
    }
}

/// 审计日志查询过滤器
#[derive(Debug, Default, Clone)]
pub struct AuditFilter {
    /// 操作类型（Migration / Backup / Restore / Sync / Maintenance）
    pub operation_type: Option<String>,
    pub target: Option<String>,
    pub from_time: Option<DateTime<Utc>>,
    pub to_time: Option<DateTime<Utc>>,
    pub status: Option<AuditStatus>,
    /// 最大返回数量
    pub limit: Option<usize>,
    /// 偏移量（用于分页）
    pub offset: Option<usize>,
}

/// 带分页信息的审计日志查询结果
#[derive(Debug)]
pub struct AuditQueryResult {
    pub logs: Vec<AuditLog>,
    /// 满足过滤条件的总记录数（不受 limit/offset 影响）
    pub total: u64,
}

/// 审计错误
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ============================================================================
// 审计健康状态
// ============================================================================

#[derive(Debug, Clone)]
struct AuditHealthError {
    message: String,
    occurred_at: String,
}

/// 审计健康快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditHealthSnapshot {
    pub is_healthy: bool,
    pub last_error: Option<String>,
    pub last_error_at: Option<String>,
}

impl AuditHealthSnapshot {
    fn healthy() -> Self {
        Self {
            is_healthy: true,
            last_error: None,
            last_error_at: None,
        }
    }
}

/// 最近一次审计写入结果
#[derive(Debug, Default)]
pub struct AuditHealthState {
    last_error: Mutex<Option<AuditHealthError>>,
}

impl AuditHealthState {
    pub fn record_success(&self) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = None;
        }
    }

    pub fn record_failure(&self, message: impl Into<String>) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(AuditHealthError {
                message: message.into(),
                occurred_at: Utc::now().to_rfc3339(),
            });
        }
    }

    pub fn snapshot(&self) -> AuditHealthSnapshot {
        let guard = self.last_error.lock().ok();
        match guard.as_deref() {
            Some(Some(err)) => AuditHealthSnapshot {
                is_healthy: false,
                last_error: Some(err.message.clone()),
                last_error_at: Some(err.occurred_at.clone()),
            },
            _ => AuditHealthSnapshot::healthy(),
        }
    }
}

// ============================================================================
// AuditLogger：组件使用的写入入口
// ============================================================================

/// 进行中的审计操作
///
/// 由 [`AuditLogger::start`] 返回，必须通过 `finish` 系列方法消费，
/// 保证每个 Started 条目最多对应一个终态条目。
#[derive(Debug)]
#[must_use = "an audit operation must be finished with a terminal status"]
pub struct AuditOperationHandle {
    correlation_id: String,
    operation: AuditOperation,
    target: String,
    started: Instant,
}

impl AuditOperationHandle {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// 已耗时（毫秒，至少为 1）
    pub fn elapsed_ms(&self) -> u64 {
        (self.started.elapsed().as_millis() as u64).max(1)
    }
}

/// 审计写入器
///
/// 写入失败只记录日志和健康状态，不影响业务操作。
#[derive(Clone)]
pub struct AuditLogger {
    db: Arc<AuditDatabase>,
    health: Arc<AuditHealthState>,
}

impl AuditLogger {
    pub fn new(db: Arc<AuditDatabase>) -> Self {
        Self {
            db,
            health: Arc::new(AuditHealthState::default()),
        }
    }

    pub fn database(&self) -> &Arc<AuditDatabase> {
        &self.db
    }

    pub fn health(&self) -> AuditHealthSnapshot {
        self.health.snapshot()
    }

    /// 写入一条完整条目
    pub fn record(&self, log: &AuditLog) {
        let result = self
            .db
            .get_conn()
            .and_then(|conn| AuditRepository::save(&conn, log));
        match result {
            Ok(()) => self.health.record_success(),
            Err(e) => {
                tracing::warn!(
                    "[Audit] 审计写入失败 (operation={}, target={}): {}",
                    log.operation.type_name(),
                    log.target,
                    e
                );
                self.health.record_failure(e.to_string());
            }
        }
    }

    /// 写入 Started 条目，返回句柄
    pub fn start(&self, operation: AuditOperation, target: impl Into<String>) -> AuditOperationHandle {
        let log = AuditLog::new(operation.clone(), target);
        self.record(&log);
        AuditOperationHandle {
            correlation_id: log.correlation_id,
            operation,
            target: log.target,
            started: Instant::now(),
        }
    }

    fn terminal(
        &self,
        handle: AuditOperationHandle,
        operation: Option<AuditOperation>,
        status: AuditStatus,
        details: serde_json::Value,
        error: Option<String>,
    ) -> String {
        let duration_ms = handle.elapsed_ms();
        let mut log = AuditLog::new(operation.unwrap_or(handle.operation), handle.target)
            .with_correlation(handle.correlation_id)
            .with_duration(duration_ms)
            .with_details(details);
        log.status = status;
        log.error_message = error;
        self.record(&log);
        log.id
    }

    /// 完成（可用最终统计覆盖操作数据）
    pub fn complete(
        &self,
        handle: AuditOperationHandle,
        operation: Option<AuditOperation>,
        details: serde_json::Value,
    ) -> String {
        self.terminal(handle, operation, AuditStatus::Completed, details, None)
    }

    pub fn fail(&self, handle: AuditOperationHandle, error: impl Into<String>) -> String {
        self.terminal(
            handle,
            None,
            AuditStatus::Failed,
            serde_json::Value::Null,
            Some(error.into()),
        )
    }

    pub fn partial(
        &self,
        handle: AuditOperationHandle,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> String {
        self.terminal(
            handle,
            None,
            AuditStatus::Partial,
            details,
            Some(message.into()),
        )
    }

    /// 分页查询
    pub fn query_paged(&self, filter: &AuditFilter) -> Result<AuditQueryResult, AuditError> {
        let conn = self.db.get_conn()?;
        AuditRepository::query_paged(&conn, filter)
    }

    /// 清理审计日志并写入一条 Maintenance 条目
    pub fn cleanup_keep_recent(&self, keep_count: usize) -> Result<u64, AuditError> {
        let handle = self.start(
            AuditOperation::Maintenance {
                action: "audit_cleanup".to_string(),
            },
            "__audit_log",
        );
        let deleted = {
            let conn = self.db.get_conn()?;
            AuditRepository::cleanup_keep_recent(&conn, keep_count)
        };
        match deleted {
            Ok(n) => {
                tracing::info!("[Audit] 已清理 {} 条审计日志，保留最近 {} 条", n, keep_count);
                self.complete(
                    handle,
                    None,
                    serde_json::json!({ "deleted": n, "keep_recent": keep_count }),
                );
                Ok(n)
            }
            Err(e) => {
                self.fail(handle, e.to_string());
                Err(e)
            }
        }
    }
}
