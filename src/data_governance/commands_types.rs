// ==================== 请求与响应类型定义 ====================

use serde::{Deserialize, Serialize};

use super::audit::{AuditFilter, AuditLog, AuditStatus};
use super::backup::{AssetType, BackupSelection, BackupTier};
use super::migration::{DatabaseMigrationStatus, MigrationStatusReport};
use super::schema_registry::{DatabaseId, SchemaRegistry};

/// 启动后台任务的响应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStarted {
    pub job_id: String,
}

/// 备份请求
///
/// `tiered = false` 时备份全部数据库；否则按 `tiers` 选择（缺少 Core 的分层备份
/// 可以创建，但不能作为恢复目标）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRequest {
    #[serde(default)]
    pub tiered: bool,
    #[serde(default)]
    pub tiers: Vec<BackupTier>,
    #[serde(default)]
    pub include_databases: Vec<DatabaseId>,
    #[serde(default)]
    pub exclude_databases: Vec<DatabaseId>,
    /// false 时输出只写入暂存目录
    #[serde(default = "default_add_to_catalog")]
    pub add_to_catalog: bool,
    #[serde(default)]
    pub include_assets: bool,
    #[serde(default)]
    pub asset_types: Vec<AssetType>,
    /// 指定时创建增量备份，忽略层级设置
    #[serde(default)]
    pub incremental_base: Option<String>,
}

fn default_add_to_catalog() -> bool {
    true
}

impl Default for BackupRequest {
    fn default() -> Self {
        Self {
            tiered: false,
            tiers: Vec::new(),
            include_databases: Vec::new(),
            exclude_databases: Vec::new(),
            add_to_catalog: true,
            include_assets: false,
            asset_types: Vec::new(),
            incremental_base: None,
        }
    }
}

impl BackupRequest {
    /// 全量备份（全部数据库）
    pub fn full() -> Self {
        Self::default()
    }

    /// 分层备份
    pub fn tiered(tiers: &[BackupTier]) -> Self {
        let selection = BackupSelection::tiers(tiers);
        Self {
            tiered: true,
            tiers: selection.tiers,
            include_assets: selection.include_assets,
            ..Self::default()
        }
    }

    pub fn incremental(base_id: impl Into<String>) -> Self {
        Self {
            incremental_base: Some(base_id.into()),
            ..Self::default()
        }
    }

    pub fn to_selection(&self) -> BackupSelection {
        // 非分层备份不记录层级，清单按 Core 处理
        let tiers = if self.tiered {
            self.tiers.clone()
        } else {
            Vec::new()
        };
        BackupSelection {
            tiers,
            include_databases: self.include_databases.clone(),
            exclude_databases: self.exclude_databases.clone(),
            include_assets: self.include_assets,
            asset_types: self.asset_types.clone(),
        }
    }
}

/// 审计日志过滤条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditLogFilter {
    /// Migration / Backup / Restore / Sync / Maintenance
    #[serde(default)]
    pub operation_type: Option<String>,
    #[serde(default)]
    pub status: Option<AuditStatus>,
    #[serde(default)]
    pub target: Option<String>,
}

impl AuditLogFilter {
    pub fn operation(operation_type: impl Into<String>) -> Self {
        Self {
            operation_type: Some(operation_type.into()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: AuditStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub(crate) fn into_query(self, offset: usize, limit: usize) -> AuditFilter {
        AuditFilter {
            operation_type: self.operation_type,
            target: self.target,
            status: self.status,
            limit: Some(limit),
            offset: Some(offset),
            ..Default::default()
        }
    }
}

/// 审计日志响应
#[derive(Debug, Clone, Serialize)]
pub struct AuditLogResponse {
    pub id: String,
    pub correlation_id: String,
    pub timestamp: String,
    pub operation_type: String,
    pub target: String,
    pub status: AuditStatus,
    pub duration_ms: Option<u64>,
    pub details: serde_json::Value,
    pub error_message: Option<String>,
}

/// 审计日志分页响应
#[derive(Debug, Clone, Serialize)]
pub struct AuditLogPagedResponse {
    /// 当前页的审计日志列表
    pub logs: Vec<AuditLogResponse>,
    /// 满足过滤条件的总记录数（不受 limit/offset 影响）
    pub total: u64,
}

impl From<AuditLog> for AuditLogResponse {
    fn from(log: AuditLog) -> Self {
        Self {
            id: log.id,
            correlation_id: log.correlation_id,
            timestamp: log.timestamp.to_rfc3339(),
            operation_type: log.operation.type_name().to_string(),
            target: log.target,
            status: log.status,
            duration_ms: log.duration_ms,
            details: log.details,
            error_message: log.error_message,
        }
    }
}

/// 迁移状态响应
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatusResponse {
    pub global_version: u64,
    pub all_healthy: bool,
    pub databases: Vec<MigrationDatabaseStatus>,
    /// 待执行迁移总数
    pub pending_migrations_total: usize,
    pub has_pending_migrations: bool,
    pub dependency_error: Option<String>,
    /// 最后的迁移错误（如果有）
    pub last_error: Option<String>,
}

/// 迁移数据库状态
#[derive(Debug, Clone, Serialize)]
pub struct MigrationDatabaseStatus {
    pub id: String,
    pub current_version: u32,
    /// 目标版本（最新可用迁移版本）
    pub target_version: u32,
    pub is_initialized: bool,
    pub last_migration_at: Option<String>,
    pub pending_count: usize,
    pub has_pending: bool,
}

impl From<&DatabaseMigrationStatus> for MigrationDatabaseStatus {
    fn from(status: &DatabaseMigrationStatus) -> Self {
        Self {
            id: status.id.as_str().to_string(),
            current_version: status.current_version,
            target_version: status.target_version,
            is_initialized: status.is_initialized,
            last_migration_at: status.last_migration_at.clone(),
            pending_count: status.pending_count,
            has_pending: status.pending_count > 0,
        }
    }
}

impl From<MigrationStatusReport> for MigrationStatusResponse {
    fn from(report: MigrationStatusReport) -> Self {
        let databases: Vec<MigrationDatabaseStatus> =
            report.databases.iter().map(MigrationDatabaseStatus::from).collect();
        let pending_migrations_total = databases.iter().map(|d| d.pending_count).sum();
        let all_healthy = report.dependency_error.is_none()
            && report
                .databases
                .iter()
                .all(|d| d.is_initialized && d.pending_count == 0 && d.issues.is_empty());
        Self {
            global_version: report.global_version,
            all_healthy,
            databases,
            pending_migrations_total,
            has_pending_migrations: report.has_pending_migrations,
            dependency_error: report.dependency_error,
            last_error: report.last_error,
        }
    }
}

/// 健康检查响应
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResponse {
    pub overall_healthy: bool,
    pub total_databases: usize,
    pub initialized_count: usize,
    pub uninitialized_count: usize,
    pub dependency_check_passed: bool,
    pub dependency_error: Option<String>,
    pub databases: Vec<DatabaseHealthStatus>,
    pub checked_at: String,
    pub pending_migrations_count: usize,
    pub has_pending_migrations: bool,
    /// 审计写入是否健康
    pub audit_log_healthy: bool,
    pub audit_log_error: Option<String>,
    pub audit_log_error_at: Option<String>,
    /// 有可继续的中断任务
    pub resumable_jobs: usize,
    /// 恢复已完成，等待重启
    pub restart_required: bool,
}

/// 数据库健康状态
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseHealthStatus {
    pub id: String,
    pub is_healthy: bool,
    pub dependencies_met: bool,
    pub schema_version: u32,
    pub target_version: u32,
    pub pending_count: usize,
    pub issues: Vec<String>,
}

impl From<&DatabaseMigrationStatus> for DatabaseHealthStatus {
    fn from(status: &DatabaseMigrationStatus) -> Self {
        let mut issues = status.issues.clone();
        if !status.is_initialized {
            issues.push("数据库未初始化".to_string());
        }
        if !status.dependencies_met {
            issues.push("依赖数据库未就绪".to_string());
        }
        if status.pending_count > 0 {
            issues.push(format!(
                "有 {} 个迁移待执行 (当前: v{}, 目标: v{})",
                status.pending_count, status.current_version, status.target_version
            ));
        }
        Self {
            id: status.id.as_str().to_string(),
            is_healthy: issues.is_empty(),
            dependencies_met: status.dependencies_met,
            schema_version: status.current_version,
            target_version: status.target_version,
            pending_count: status.pending_count,
            issues,
        }
    }
}

/// Schema 注册表响应
#[derive(Debug, Clone, Serialize)]
pub struct SchemaRegistryResponse {
    pub global_version: u64,
    pub aggregated_at: String,
    pub databases: Vec<DatabaseStatusResponse>,
}

/// 数据库 Schema 状态
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStatusResponse {
    pub id: String,
    pub schema_version: u32,
    pub migration_count: usize,
    pub checksum: String,
    pub updated_at: String,
    pub dependencies: Vec<String>,
}

impl From<SchemaRegistry> for SchemaRegistryResponse {
    fn from(registry: SchemaRegistry) -> Self {
        let databases = DatabaseId::all_ordered()
            .into_iter()
            .filter_map(|id| {
                registry.get_status(&id).map(|status| DatabaseStatusResponse {
                    id: id.as_str().to_string(),
                    schema_version: status.schema_version,
                    migration_count: status.migration_history.len(),
                    checksum: status.checksum.clone(),
                    updated_at: status.updated_at.clone(),
                    dependencies: id
                        .dependencies()
                        .iter()
                        .map(|d| d.as_str().to_string())
                        .collect(),
                })
            })
            .collect();
        Self {
            global_version: registry.global_version,
            aggregated_at: registry.aggregated_at,
            databases,
        }
    }
}
