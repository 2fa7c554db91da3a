//! # Migration Coordinator (迁移协调器)
//!
//! 负责协调多数据库迁移，处理依赖关系和执行顺序。
//!
//! ## 执行流程
//!
//! 1. 依赖图拓扑排序（存在环时直接报配置错误）
//! 2. 磁盘空间预检
//! 3. 按依赖顺序逐库执行 Refinery 迁移，每个迁移文件一个事务
//! 4. 迁移后验证预期表与索引
//! 5. 写入审计日志；失败时持久化最后一次错误

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::definitions::MigrationSet;
use super::{get_migration_set, MigrationError};
use crate::data_governance::audit::{AuditLogger, AuditOperation};
use crate::data_governance::database::{Database, DatabaseSet};
use crate::data_governance::schema_registry::{
    self, DatabaseId, DependencyGraph, SchemaRegistry, REFINERY_SCHEMA_HISTORY_TABLE,
};

/// 最后一次迁移错误的持久化文件名
const LAST_ERROR_FILE_NAME: &str = ".last_migration_error";

/// 磁盘预检的固定余量（50MB）
const DISK_MARGIN_BYTES: u64 = 50 * 1024 * 1024;

/// 迁移协调器
pub struct MigrationCoordinator {
    /// 应用数据目录
    data_dir: PathBuf,
    databases: DatabaseSet,
    /// 审计写入器（None 时仅记录 tracing 日志）
    audit: Option<AuditLogger>,
    graph: DependencyGraph,
    disk_space_multiplier: u64,
}

/// 迁移报告
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    /// 各数据库的迁移结果
    pub databases: Vec<DatabaseMigrationReport>,
    /// 总体是否成功
    pub success: bool,
    /// 总耗时（毫秒）
    pub total_duration_ms: u64,
    pub error: Option<String>,
}

impl MigrationReport {
    pub fn new() -> Self {
        Self {
            databases: Vec::new(),
            success: true,
            total_duration_ms: 0,
            error: None,
        }
    }

    pub fn add(&mut self, report: DatabaseMigrationReport) {
        if !report.success {
            self.success = false;
        }
        self.databases.push(report);
    }

    /// 本次运行应用的迁移总数
    pub fn applied_total(&self) -> usize {
        self.databases.iter().map(|r| r.applied_count).sum()
    }
}

impl Default for MigrationReport {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个数据库的迁移报告
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseMigrationReport {
    pub id: DatabaseId,
    /// 迁移前版本
    pub from_version: u32,
    /// 迁移后版本
    pub to_version: u32,
    /// 应用的迁移数量
    pub applied_count: usize,
    pub success: bool,
    /// 耗时（毫秒）
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// 单个数据库的迁移状态（只读视图）
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseMigrationStatus {
    pub id: DatabaseId,
    pub current_version: u32,
    /// 当前构建已知的最新版本
    pub target_version: u32,
    pub pending_count: usize,
    /// 依赖库均已到达目标版本
    pub dependencies_met: bool,
    pub is_initialized: bool,
    /// 结构性问题（缺表、版本超前等）
    pub issues: Vec<String>,
    pub last_migration_at: Option<String>,
}

/// 全部数据库的迁移状态
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatusReport {
    pub databases: Vec<DatabaseMigrationStatus>,
    /// 最小的当前版本
    pub global_version: u64,
    pub has_pending_migrations: bool,
    /// 依赖图错误（如存在环）
    pub dependency_error: Option<String>,
    pub last_error: Option<String>,
}

/// 持久化的最后一次迁移错误
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LastMigrationError {
    database: String,
    error: String,
    occurred_at: String,
}

impl MigrationCoordinator {
    pub fn new(data_dir: PathBuf, databases: DatabaseSet) -> Self {
        Self {
            data_dir,
            databases,
            audit: None,
            graph: DependencyGraph::default(),
            disk_space_multiplier: 2,
        }
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    /// 注入自定义依赖图
    pub fn with_dependency_graph(mut self, graph: DependencyGraph) -> Self {
        self.graph = graph;
        self
    }

    pub fn with_disk_space_multiplier(mut self, multiplier: u64) -> Self {
        self.disk_space_multiplier = multiplier.max(1);
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn databases(&self) -> &DatabaseSet {
        &self.databases
    }

    /// 按依赖顺序排列的受管数据库
    pub fn ordered_databases(&self) -> Result<Vec<DatabaseId>, MigrationError> {
        let present = self.databases.ids();
        let order = self.graph.topological_order()?;
        Ok(order.into_iter().filter(|id| present.contains(id)).collect())
    }

    /// 执行所有数据库的迁移
    ///
    /// 按依赖顺序执行，任一数据库失败则停止后续迁移。
    pub fn run_all(&self) -> Result<MigrationReport, MigrationError> {
        let start = Instant::now();
        let mut report = MigrationReport::new();

        tracing::info!(
            "[Migration] 开始执行所有数据库迁移, 数据目录: {}",
            self.data_dir.display()
        );

        let ordered = match self.ordered_databases() {
            Ok(ordered) => ordered,
            Err(e) => {
                tracing::error!("[Migration] 依赖图无效: {}", e);
                self.persist_last_error("*", &e);
                return Err(e);
            }
        };

        if let Err(e) = self.preflight_disk_space_check() {
            self.persist_last_error("*", &e);
            return Err(e);
        }

        for db_id in ordered {
            if let Err(e) = self.check_dependencies(db_id, &report) {
                tracing::error!("[Migration] {} 依赖检查失败: {}", db_id, e);
                report.success = false;
                report.error = Some(e.to_string());
                self.persist_last_error(db_id.as_str(), &e);
                return Err(e);
            }

            match self.migrate_database(db_id) {
                Ok(db_report) => {
                    tracing::info!(
                        "[Migration] {} 迁移完成: v{} -> v{}, 应用了 {} 个迁移",
                        db_id,
                        db_report.from_version,
                        db_report.to_version,
                        db_report.applied_count
                    );
                    report.add(db_report);
                }
                Err(e) => {
                    let completed: Vec<&str> = report
                        .databases
                        .iter()
                        .filter(|r| r.success)
                        .map(|r| r.id.as_str())
                        .collect();
                    tracing::error!(
                        failed_db = db_id.as_str(),
                        error = %e,
                        completed_dbs = ?completed,
                        "[Migration] {} 迁移失败",
                        db_id
                    );
                    self.persist_last_error(db_id.as_str(), &e);
                    return Err(e);
                }
            }
        }

        report.total_duration_ms = start.elapsed().as_millis() as u64;
        self.clear_last_error();
        tracing::info!(
            "[Migration] 迁移完成, 总耗时: {}ms, 应用 {} 个迁移",
            report.total_duration_ms,
            report.applied_total()
        );
        Ok(report)
    }

    /// 为单个数据库执行待执行迁移
    ///
    /// 依赖库未到达目标版本时拒绝执行。
    pub fn apply_pending_migrations(
        &self,
        id: DatabaseId,
    ) -> Result<DatabaseMigrationReport, MigrationError> {
        let result = self.apply_pending_inner(id);
        match &result {
            Ok(_) => self.clear_last_error(),
            Err(e) => self.persist_last_error(id.as_str(), e),
        }
        result
    }

    fn apply_pending_inner(&self, id: DatabaseId) -> Result<DatabaseMigrationReport, MigrationError> {
        self.graph.topological_order()?;
        if self.databases.get(id).is_none() {
            return Err(MigrationError::UnknownDatabase(id.as_str().to_string()));
        }
        if let Some(dep) = self.first_unmet_dependency(id)? {
            return Err(MigrationError::DependencyNotSatisfied {
                database: id.as_str().to_string(),
                dependency: dep.as_str().to_string(),
            });
        }
        self.preflight_disk_space_check()?;
        self.migrate_database(id)
    }

    /// 检查数据库依赖在本次运行中是否已成功迁移（fail-close）
    pub(crate) fn check_dependencies(
        &self,
        db_id: DatabaseId,
        report: &MigrationReport,
    ) -> Result<(), MigrationError> {
        for dep in self.graph.dependencies_of(db_id) {
            let dep_success = report
                .databases
                .iter()
                .find(|r| r.id == *dep)
                .map(|r| r.success)
                .unwrap_or(false);

            if !dep_success {
                return Err(MigrationError::DependencyNotSatisfied {
                    database: db_id.as_str().to_string(),
                    dependency: dep.as_str().to_string(),
                });
            }
        }
        Ok(())
    }

    /// 第一个未到达目标版本的依赖
    fn first_unmet_dependency(&self, id: DatabaseId) -> Result<Option<DatabaseId>, MigrationError> {
        for dep in self.graph.dependencies_of(id) {
            let Some(db) = self.databases.get(*dep) else {
                return Ok(Some(*dep));
            };
            if db.schema_version()? < super::target_version(*dep) {
                return Ok(Some(*dep));
            }
        }
        Ok(None)
    }

    /// 迁移单个数据库
    fn migrate_database(&self, id: DatabaseId) -> Result<DatabaseMigrationReport, MigrationError> {
        let start = Instant::now();
        let db = self
            .databases
            .get(id)
            .ok_or_else(|| MigrationError::UnknownDatabase(id.as_str().to_string()))?;

        tracing::info!(
            "[Migration] 开始迁移数据库 {}: {}",
            id,
            db.live_path().display()
        );

        let from_version = db.schema_version().unwrap_or(0);
        let audit_handle = self.audit.as_ref().map(|audit| {
            audit.start(
                AuditOperation::Migration {
                    from_version,
                    to_version: from_version,
                    applied_count: 0,
                },
                id.as_str(),
            )
        });

        match self.migrate_database_inner(id, db.as_ref(), from_version) {
            Ok((to_version, applied_count)) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                if let (Some(audit), Some(handle)) = (&self.audit, audit_handle) {
                    audit.complete(
                        handle,
                        Some(AuditOperation::Migration {
                            from_version,
                            to_version,
                            applied_count,
                        }),
                        serde_json::json!({
                            "database": id.as_str(),
                            "from_version": from_version,
                            "to_version": to_version,
                        }),
                    );
                }
                Ok(DatabaseMigrationReport {
                    id,
                    from_version,
                    to_version,
                    applied_count,
                    success: true,
                    duration_ms,
                    error: None,
                })
            }
            Err(e) => {
                if let (Some(audit), Some(handle)) = (&self.audit, audit_handle) {
                    audit.fail(handle, e.to_string());
                }
                Err(e)
            }
        }
    }

    fn migrate_database_inner(
        &self,
        id: DatabaseId,
        db: &dyn Database,
        from_version: u32,
    ) -> Result<(u32, usize), MigrationError> {
        let mut conn = db.open()?;

        // SQLite 默认禁用外键，需要在每个连接上启用
        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(|e| MigrationError::Database(format!("启用外键约束失败: {}", e)))?;

        let before = self.get_migration_count(&conn)?;
        if let Err(e) = self.run_refinery_migrations(&mut conn, id) {
            let reached = self.get_current_version(&conn).unwrap_or(from_version);
            tracing::error!(
                "[Migration] {} 迁移中断, 停留在 v{}: {}",
                id,
                reached,
                e
            );
            return Err(e);
        }
        let applied_count = self.get_migration_count(&conn)?.saturating_sub(before);
        let to_version = self.get_current_version(&conn)?;

        // fail-close：迁移后验证失败时立即终止
        self.verify_migrations(&conn, id, get_migration_set(id), to_version)?;

        Ok((to_version, applied_count))
    }

    fn run_refinery_migrations(
        &self,
        conn: &mut rusqlite::Connection,
        id: DatabaseId,
    ) -> Result<(), MigrationError> {
        let runner = match id {
            DatabaseId::Vfs => self.create_vfs_runner(),
            DatabaseId::ChatV2 => self.create_chat_v2_runner(),
            DatabaseId::Notes => self.create_notes_runner(),
            DatabaseId::Graph => self.create_graph_runner(),
            DatabaseId::Vectors => self.create_vectors_runner(),
        }?;

        let report = runner
            .set_grouped(false)
            .set_abort_divergent(false)
            .set_abort_missing(false)
            .run(conn)
            .map_err(|e| MigrationError::Refinery(e.to_string()))?;

        for migration in report.applied_migrations() {
            tracing::debug!("[Migration] {} 已应用: {}", id, migration);
        }
        Ok(())
    }

    fn create_vfs_runner(&self) -> Result<refinery::Runner, MigrationError> {
        mod vfs_migrations {
            refinery::embed_migrations!("migrations/vfs");
        }
        Ok(vfs_migrations::migrations::runner())
    }

    fn create_chat_v2_runner(&self) -> Result<refinery::Runner, MigrationError> {
        mod chat_v2_migrations {
            refinery::embed_migrations!("migrations/chat_v2");
        }
        Ok(chat_v2_migrations::migrations::runner())
    }

    fn create_notes_runner(&self) -> Result<refinery::Runner, MigrationError> {
        mod notes_migrations {
            refinery::embed_migrations!("migrations/notes");
        }
        Ok(notes_migrations::migrations::runner())
    }

    fn create_graph_runner(&self) -> Result<refinery::Runner, MigrationError> {
        mod graph_migrations {
            refinery::embed_migrations!("migrations/graph");
        }
        Ok(graph_migrations::migrations::runner())
    }

    fn create_vectors_runner(&self) -> Result<refinery::Runner, MigrationError> {
        mod vectors_migrations {
            refinery::embed_migrations!("migrations/vectors");
        }
        Ok(vectors_migrations::migrations::runner())
    }

    /// 从 `refinery_schema_history` 读取最新版本
    pub(crate) fn get_current_version(
        &self,
        conn: &rusqlite::Connection,
    ) -> Result<u32, MigrationError> {
        Ok(schema_registry::read_schema_version(conn)?)
    }

    fn get_migration_count(&self, conn: &rusqlite::Connection) -> Result<usize, MigrationError> {
        if !schema_registry::table_exists(conn, REFINERY_SCHEMA_HISTORY_TABLE)? {
            return Ok(0);
        }
        let count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", REFINERY_SCHEMA_HISTORY_TABLE),
                [],
                |row| row.get(0),
            )
            .map_err(|e| MigrationError::Database(e.to_string()))?;
        Ok(count as usize)
    }

    /// 验证已应用迁移的预期表和索引
    fn verify_migrations(
        &self,
        conn: &rusqlite::Connection,
        id: DatabaseId,
        migration_set: &MigrationSet,
        current_version: u32,
    ) -> Result<(), MigrationError> {
        let issues = collect_schema_issues(conn, migration_set, current_version)?;
        if let Some(reason) = issues.into_iter().next() {
            return Err(MigrationError::VerificationFailed {
                database: id.as_str().to_string(),
                version: current_version,
                reason,
            });
        }
        tracing::debug!(
            database = id.as_str(),
            version = current_version,
            "[Migration] 迁移后验证通过"
        );
        Ok(())
    }

    /// 磁盘空间预检查
    ///
    /// 要求可用空间至少为数据库总大小 × 倍数 + 50MB 余量。
    fn preflight_disk_space_check(&self) -> Result<(), MigrationError> {
        let mut total_db_size: u64 = 0;
        for db in self.databases.iter() {
            let path = db.live_path();
            if let Ok(metadata) = fs::metadata(path) {
                total_db_size += metadata.len();
            }
            let mut wal = path.as_os_str().to_owned();
            wal.push("-wal");
            if let Ok(metadata) = fs::metadata(PathBuf::from(wal)) {
                total_db_size += metadata.len();
            }
        }

        let required_bytes = total_db_size
            .saturating_mul(self.disk_space_multiplier)
            .saturating_add(DISK_MARGIN_BYTES);
        let available =
            crate::backup_common::get_available_disk_space(&self.data_dir).unwrap_or(u64::MAX);

        if available < required_bytes {
            let err = MigrationError::InsufficientDiskSpace {
                available_mb: available / (1024 * 1024),
                required_mb: required_bytes / (1024 * 1024),
            };
            tracing::error!("[Migration] 磁盘空间不足，无法安全执行迁移: {}", err);
            return Err(err);
        }
        Ok(())
    }

    /// 只读状态视图（不修改任何数据库）
    pub fn status(&self) -> MigrationStatusReport {
        let dependency_error = self.graph.topological_order().err().map(|e| e.to_string());

        let mut databases = Vec::with_capacity(self.databases.len());
        for db in self.databases.iter() {
            databases.push(self.database_status(db.as_ref()));
        }

        let global_version = databases
            .iter()
            .map(|s| s.current_version as u64)
            .min()
            .unwrap_or(0);
        let has_pending_migrations = databases.iter().any(|s| s.pending_count > 0);

        MigrationStatusReport {
            databases,
            global_version,
            has_pending_migrations,
            dependency_error,
            last_error: self.last_error(),
        }
    }

    fn database_status(&self, db: &dyn Database) -> DatabaseMigrationStatus {
        let id = db.id();
        let set = get_migration_set(id);
        let target_version = super::target_version(id);
        let mut issues = Vec::new();

        let (current_version, last_migration_at) = if db.exists() {
            match open_read_only(db).and_then(|conn| {
                let status = SchemaRegistry::read_database_status(id, &conn)?;
                let mut schema_issues = collect_schema_issues(&conn, set, status.schema_version)?;
                issues.append(&mut schema_issues);
                Ok(status)
            }) {
                Ok(status) => {
                    let at = (!status.updated_at.is_empty()).then_some(status.updated_at);
                    (status.schema_version, at)
                }
                Err(e) => {
                    issues.push(format!("读取版本失败: {}", e));
                    (0, None)
                }
            }
        } else {
            (0, None)
        };

        if current_version > target_version {
            issues.push(format!(
                "schema 版本 v{} 高于当前构建的目标版本 v{}",
                current_version, target_version
            ));
        }

        let dependencies_met = self.graph.dependencies_of(id).iter().all(|dep| {
            self.databases
                .get(*dep)
                .and_then(|d| d.schema_version().ok())
                .map(|v| v >= super::target_version(*dep))
                .unwrap_or(false)
        });
        if !dependencies_met {
            issues.push("依赖数据库尚未迁移到目标版本".to_string());
        }

        DatabaseMigrationStatus {
            id,
            current_version,
            target_version,
            pending_count: set.pending(current_version as i32).count(),
            dependencies_met,
            is_initialized: current_version > 0,
            issues,
            last_migration_at,
        }
    }

    /// 聚合当前 Schema 状态
    pub fn aggregate_schema_registry(&self) -> Result<SchemaRegistry, MigrationError> {
        let mut connections = Vec::new();
        for db in self.databases.iter() {
            if db.exists() {
                connections.push((db.id(), open_read_only(db.as_ref())?));
            }
        }
        let registry =
            SchemaRegistry::aggregate_from_databases(connections.iter().map(|(id, c)| (*id, c)))?;
        Ok(registry)
    }

    pub fn needs_migration(&self, id: DatabaseId) -> Result<bool, MigrationError> {
        let db = self
            .databases
            .get(id)
            .ok_or_else(|| MigrationError::UnknownDatabase(id.as_str().to_string()))?;
        Ok(db.schema_version()? < super::target_version(id))
    }

    /// 所有待执行的迁移数量
    pub fn pending_migrations_count(&self) -> Result<usize, MigrationError> {
        let mut total = 0;
        for db in self.databases.iter() {
            let current = db.schema_version()? as i32;
            total += get_migration_set(db.id()).pending(current).count();
        }
        Ok(total)
    }

    fn last_error_path(&self) -> PathBuf {
        self.data_dir.join(LAST_ERROR_FILE_NAME)
    }

    /// 最后一次迁移失败的描述
    pub fn last_error(&self) -> Option<String> {
        let content = fs::read_to_string(self.last_error_path()).ok()?;
        match serde_json::from_str::<LastMigrationError>(&content) {
            Ok(last) => Some(format!(
                "[{}] {} ({})",
                last.database, last.error, last.occurred_at
            )),
            Err(_) => Some(content),
        }
    }

    fn persist_last_error(&self, database: &str, error: &MigrationError) {
        let record = LastMigrationError {
            database: database.to_string(),
            error: error.to_string(),
            occurred_at: chrono::Utc::now().to_rfc3339(),
        };
        let result = serde_json::to_string_pretty(&record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            .and_then(|json| {
                fs::create_dir_all(&self.data_dir)?;
                fs::write(self.last_error_path(), json)
            });
        if let Err(e) = result {
            tracing::warn!("[Migration] 持久化迁移错误失败: {}", e);
        }
    }

    fn clear_last_error(&self) {
        let path = self.last_error_path();
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("[Migration] 清除迁移错误记录失败: {}", e);
            }
        }
    }
}

fn open_read_only(db: &dyn Database) -> Result<rusqlite::Connection, MigrationError> {
    Ok(crate::data_governance::database::open_snapshot_read_only(
        db.id(),
        db.live_path(),
    )?)
}

/// 对已应用的迁移检查预期表和索引，返回问题列表
fn collect_schema_issues(
    conn: &rusqlite::Connection,
    migration_set: &MigrationSet,
    current_version: u32,
) -> Result<Vec<String>, MigrationError> {
    let mut issues = Vec::new();
    for migration in migration_set
        .migrations
        .iter()
        .filter(|m| m.refinery_version as i64 <= current_version as i64)
    {
        for table in migration.expected_tables {
            if !schema_registry::table_exists(conn, table)? {
                issues.push(format!(
                    "迁移 {} ({}) 缺少预期表 {}",
                    migration.refinery_version, migration.name, table
                ));
            }
        }
        for index in migration.expected_indexes {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='index' AND name=?1)",
                    [index],
                    |row| row.get(0),
                )
                .map_err(|e| MigrationError::Database(e.to_string()))?;
            if !exists {
                issues.push(format!(
                    "迁移 {} ({}) 缺少预期索引 {}",
                    migration.refinery_version, migration.name, index
                ));
            }
        }
    }
    Ok(issues)
}
