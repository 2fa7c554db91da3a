//! # 数据治理控制面
//!
//! `GovernanceService` 是对外的唯一入口：
//!
//! - 任务控制：`start_backup` / `start_export` / `start_import` / `start_restore` /
//!   `start_chat_migration` / `cancel_job` / `resume_job`，进度通过 `take_event_receiver` 取得的通道推送
//! - 查询：备份目录、健康检查、迁移状态、备份校验、审计日志、可恢复任务
//! - 旧版聊天迁移：状态检查、同步迁移、回滚、事件订阅
//!
//! 修改型任务共享一个全局任务槽，槽被占用时立即返回 `Concurrency` 错误；
//! 只读查询不占用任务槽。

use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::audit::{
    AuditDatabase, AuditHealthSnapshot, AuditLogger, AuditOperation, SyncDirection,
};
use super::backup::zip_export::{
    TransferCheckpoint, ZipExportError, ZipExportOptions, ZipExporter, ZipImporter,
};
use super::backup::{BackupCatalogEntry, BackupManager, BackupProgress, BackupStage};
use super::commands_types::{
    AuditLogFilter, AuditLogPagedResponse, AuditLogResponse, BackupRequest, DatabaseHealthStatus,
    HealthCheckResponse, JobStarted, MigrationStatusResponse, SchemaRegistryResponse,
};
use super::database::DatabaseSet;
use super::migration::{MigrationCoordinator, MigrationReport};
use super::restore::{RestoreCoordinator, RestorePhase, RestoreProgress};
use super::schema_registry::DatabaseId;
use super::verification::{VerificationService, VerifyResult};
use super::{GovernanceError, GovernanceResult};
use crate::backup_config::GovernanceConfig;
use crate::backup_job_manager::{
    BackupJobContext, BackupJobKind, BackupJobManager, BackupJobParams, BackupJobPhase,
    BackupJobResultPayload, BackupJobStatus, BackupJobSummary, JobEventReceiver, PersistedJob,
};
use crate::chat_v2::migration::{
    check_migration_status, rollback_migration, MigrationCheckResult, MigrationEvent,
    MigrationEventSender, MigrationEventType, MigrationExecutor,
    MigrationReport as ChatMigrationReport, MigrationStatus,
};
use crate::chat_v2::ChatV2Error;

/// 聊天迁移事件广播容量
const CHAT_EVENT_CAPACITY: usize = 256;

/// 审计清理的最小保留条数
const MIN_AUDIT_KEEP_RECENT: usize = 100;

/// 数据治理服务
///
/// 可廉价克隆，克隆体共享同一套状态。
#[derive(Clone)]
pub struct GovernanceService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: GovernanceConfig,
    backups: BackupManager,
    audit: AuditLogger,
    coordinator: MigrationCoordinator,
    jobs: BackupJobManager,
    chat_events: MigrationEventSender,
    restart_required: AtomicBool,
}

impl GovernanceService {
    /// 按配置打开标准五库
    pub fn open(config: GovernanceConfig) -> GovernanceResult<Self> {
        let databases = DatabaseSet::standard(&config.data_dir);
        Self::open_with_databases(config, databases)
    }

    /// 使用自定义数据库集合（嵌入与测试）
    pub fn open_with_databases(
        config: GovernanceConfig,
        databases: DatabaseSet,
    ) -> GovernanceResult<Self> {
        config.validate()?;

        let audit = AuditLogger::new(Arc::new(AuditDatabase::open(&config.audit_db_path())?));
        let backups = BackupManager::new(
            config.backup_dir(),
            config.data_dir.clone(),
            databases.clone(),
        )
        .with_app_version(env!("CARGO_PKG_VERSION"))
        .with_asset_config(config.assets.clone())
        .with_retention(config.retention_limit())
        .with_disk_space_multiplier(config.min_free_space_multiplier)
        .with_audit(audit.clone());
        let coordinator = MigrationCoordinator::new(config.data_dir.clone(), databases)
            .with_audit(audit.clone())
            .with_disk_space_multiplier(config.min_free_space_multiplier);
        let jobs = BackupJobManager::new(&config.data_dir, config.event_channel_capacity)
            .with_retention(Duration::from_secs(config.job_retention_secs));

        if let Err(e) = jobs.cleanup_finished_persisted_jobs() {
            warn!("[Governance] 清理持久化任务失败: {}", e);
        }
        let (chat_events, _) = broadcast::channel(CHAT_EVENT_CAPACITY);

        info!(
            "[Governance] 已打开数据目录 {:?}，备份目录 {:?}",
            config.data_dir,
            config.backup_dir()
        );
        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                backups,
                audit,
                coordinator,
                jobs,
                chat_events,
                restart_required: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.inner.config
    }

    pub fn backup_manager(&self) -> &BackupManager {
        &self.inner.backups
    }

    pub fn audit_logger(&self) -> &AuditLogger {
        &self.inner.audit
    }

    /// 取走任务事件接收端（只能取一次）
    pub fn take_event_receiver(&self) -> Option<JobEventReceiver> {
        self.inner.jobs.take_event_receiver()
    }

    // ========================================================================
    // 任务控制
    // ========================================================================

    pub fn start_backup(&self, request: BackupRequest) -> GovernanceResult<JobStarted> {
        let params = BackupJobParams {
            selection: Some(request.to_selection()),
            incremental_base: request.incremental_base.clone(),
            stage_only: !request.add_to_catalog,
            ..Default::default()
        };
        self.spawn_job(BackupJobKind::Backup, params)
    }

    /// 导出备份为 ZIP，`level` 为 None 时使用配置的默认级别
    pub fn start_export(&self, backup_id: &str, level: Option<u32>) -> GovernanceResult<JobStarted> {
        let level = level.unwrap_or(self.inner.config.default_compression_level);
        if level > 9 {
            return Err(ZipExportError::InvalidCompressionLevel(level).into());
        }
        let params = BackupJobParams {
            backup_id: Some(backup_id.to_string()),
            output_path: Some(self.export_path(backup_id)),
            compression_level: Some(level),
            ..Default::default()
        };
        self.spawn_job(BackupJobKind::Export, params)
    }

    pub fn start_import(&self, zip_path: &Path) -> GovernanceResult<JobStarted> {
        let params = BackupJobParams {
            zip_path: Some(zip_path.to_path_buf()),
            ..Default::default()
        };
        self.spawn_job(BackupJobKind::Import, params)
    }

    /// 恢复备份
    ///
    /// 调用方负责在恢复期间停止应用的正常写入；完成后 `is_restart_required` 为 true。
    pub fn start_restore(&self, backup_id: &str) -> GovernanceResult<JobStarted> {
        let params = BackupJobParams {
            backup_id: Some(backup_id.to_string()),
            ..Default::default()
        };
        self.spawn_job(BackupJobKind::Restore, params)
    }

    pub fn start_chat_migration(&self) -> GovernanceResult<JobStarted> {
        self.spawn_job(BackupJobKind::ChatMigration, BackupJobParams::default())
    }

    /// 取消当前任务；空闲时返回 `Ok(false)`
    pub fn cancel_job(&self) -> GovernanceResult<bool> {
        Ok(self.inner.jobs.cancel_active())
    }

    /// 继续一个中断或瞬时失败的任务，沿用原任务 ID 与检查点
    pub fn resume_job(&self, job_id: &str) -> GovernanceResult<JobStarted> {
        let handle = runtime_handle()?;
        let (ctx, persisted) = self.inner.jobs.resume_job(job_id)?;
        info!(
            "[Governance] 继续任务 {} ({}), 上次状态 {:?}",
            job_id,
            persisted.kind.as_str(),
            persisted.status
        );
        Ok(self.run_in_background(&handle, ctx))
    }

    fn spawn_job(&self, kind: BackupJobKind, params: BackupJobParams) -> GovernanceResult<JobStarted> {
        // 先确认运行时可用，避免占用任务槽后无法执行
        let handle = runtime_handle()?;
        let ctx = self.inner.jobs.create_job(kind, params)?;
        Ok(self.run_in_background(&handle, ctx))
    }

    fn run_in_background(&self, handle: &Handle, ctx: BackupJobContext) -> JobStarted {
        let inner = Arc::clone(&self.inner);
        let job_id = ctx.job_id.clone();
        handle.spawn_blocking(move || {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| inner.run_job(&ctx)))
                .unwrap_or_else(|panic| {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!("[Governance] 任务 {} 崩溃: {}", ctx.job_id, message);
                    Err(GovernanceError::Internal(format!("任务崩溃: {}", message)))
                });
            ctx.finish(result);
        });
        JobStarted { job_id }
    }

    fn export_path(&self, backup_id: &str) -> PathBuf {
        self.inner
            .config
            .export_dir()
            .join(format!("{}.zip", backup_id))
    }

    // ========================================================================
    // 查询
    // ========================================================================

    /// 备份目录（最新在前，不含未完成的备份）
    pub fn get_backup_catalog(&self) -> GovernanceResult<Vec<BackupCatalogEntry>> {
        Ok(self.inner.backups.list_catalog()?)
    }

    /// 健康检查
    ///
    /// 检查各数据库的版本、依赖和结构，并附带审计写入状态。
    pub fn check_health(&self) -> HealthCheckResponse {
        let status = self.inner.coordinator.status();
        let databases: Vec<DatabaseHealthStatus> =
            status.databases.iter().map(DatabaseHealthStatus::from).collect();
        let total_databases = databases.len();
        let initialized_count = status.databases.iter().filter(|d| d.is_initialized).count();
        let pending_migrations_count: usize = databases.iter().map(|d| d.pending_count).sum();
        let audit = self.inner.audit.health();
        let resumable_jobs = self
            .inner
            .jobs
            .list_resumable_jobs()
            .map(|jobs| jobs.len())
            .unwrap_or_else(|e| {
                warn!("[Governance] 读取可恢复任务失败: {}", e);
                0
            });

        let overall_healthy = status.dependency_error.is_none()
            && databases.iter().all(|d| d.is_healthy)
            && audit.is_healthy;
        if overall_healthy {
            info!("[Governance] 健康检查通过: {} 个数据库", total_databases);
        } else {
            warn!(
                "[Governance] 健康检查发现问题: 未初始化 {}, 待执行迁移 {}, 依赖错误 {:?}",
                total_databases - initialized_count,
                pending_migrations_count,
                status.dependency_error
            );
        }

        HealthCheckResponse {
            overall_healthy,
            total_databases,
            initialized_count,
            uninitialized_count: total_databases - initialized_count,
            dependency_check_passed: status.dependency_error.is_none(),
            dependency_error: status.dependency_error,
            databases,
            checked_at: chrono::Utc::now().to_rfc3339(),
            pending_migrations_count,
            has_pending_migrations: status.has_pending_migrations,
            audit_log_healthy: audit.is_healthy,
            audit_log_error: audit.last_error,
            audit_log_error_at: audit.last_error_at,
            resumable_jobs,
            restart_required: self.is_restart_required(),
        }
    }

    pub fn get_migration_status(&self) -> MigrationStatusResponse {
        MigrationStatusResponse::from(self.inner.coordinator.status())
    }

    pub fn get_schema_registry(&self) -> GovernanceResult<SchemaRegistryResponse> {
        Ok(self.inner.coordinator.aggregate_schema_registry()?.into())
    }

    /// 执行待执行的 Schema 迁移；`None` 表示按依赖顺序迁移全部数据库
    ///
    /// 有后台任务运行时拒绝执行。
    pub fn apply_pending_migrations(
        &self,
        database: Option<DatabaseId>,
    ) -> GovernanceResult<MigrationReport> {
        if let Some(active) = self.inner.jobs.active_job() {
            return Err(GovernanceError::Concurrency(format!(
                "任务 {} ({}) 运行中，不能执行迁移",
                active.job_id,
                active.kind.as_str()
            )));
        }
        match database {
            None => Ok(self.inner.coordinator.run_all()?),
            Some(id) => {
                let mut report = MigrationReport::new();
                report.add(self.inner.coordinator.apply_pending_migrations(id)?);
                Ok(report)
            }
        }
    }

    /// 校验备份（只读）
    ///
    /// 正在被恢复的备份不能校验。开始与结束各发出一个 `verify` 事件。
    pub fn verify_backup(&self, backup_id: &str) -> GovernanceResult<VerifyResult> {
        self.ensure_not_restore_target(backup_id)?;
        let jobs = &self.inner.jobs;
        jobs.emit_verification_status(backup_id, BackupJobStatus::Running, "开始校验备份");

        match VerificationService::new(&self.inner.backups).verify(backup_id) {
            Ok(result) => {
                if result.is_valid {
                    jobs.emit_verification_status(
                        backup_id,
                        BackupJobStatus::Completed,
                        "备份校验通过",
                    );
                } else {
                    jobs.emit_verification_status(
                        backup_id,
                        BackupJobStatus::Failed,
                        format!("备份校验失败: {} 个错误", result.total_errors()),
                    );
                }
                Ok(result)
            }
            Err(e) => {
                let err = GovernanceError::from(e);
                jobs.emit_verification_status(backup_id, BackupJobStatus::Failed, err.to_string());
                Err(err)
            }
        }
    }

    /// 删除备份；被恢复任务引用时拒绝
    pub fn delete_backup(&self, backup_id: &str) -> GovernanceResult<()> {
        self.ensure_not_restore_target(backup_id)?;
        let handle = self.inner.audit.start(
            AuditOperation::Maintenance {
                action: "delete_backup".to_string(),
            },
            backup_id,
        );
        match self.inner.backups.delete_backup(backup_id) {
            Ok(()) => {
                self.inner.audit.complete(handle, None, serde_json::Value::Null);
                Ok(())
            }
            Err(e) => {
                let err = GovernanceError::from(e);
                self.inner.audit.fail(handle, err.to_string());
                Err(err)
            }
        }
    }

    fn ensure_not_restore_target(&self, backup_id: &str) -> GovernanceResult<()> {
        if let Some((active, params)) = self.inner.jobs.active_params() {
            if active.kind == BackupJobKind::Restore
                && params.backup_id.as_deref() == Some(backup_id)
            {
                return Err(GovernanceError::Concurrency(format!(
                    "备份 {} 正在被恢复任务 {} 使用",
                    backup_id, active.job_id
                )));
            }
        }
        Ok(())
    }

    /// 分页查询审计日志
    pub fn get_audit_log(
        &self,
        filter: AuditLogFilter,
        offset: usize,
        limit: usize,
    ) -> GovernanceResult<AuditLogPagedResponse> {
        let result = self
            .inner
            .audit
            .query_paged(&filter.into_query(offset, limit))?;
        Ok(AuditLogPagedResponse {
            logs: result.logs.into_iter().map(AuditLogResponse::from).collect(),
            total: result.total,
        })
    }

    /// 只保留最近 `keep_recent` 条审计日志（不少于 100 条）
    pub fn cleanup_audit_logs(&self, keep_recent: usize) -> GovernanceResult<u64> {
        if keep_recent < MIN_AUDIT_KEEP_RECENT {
            return Err(GovernanceError::Configuration(format!(
                "审计日志至少保留 {} 条（请求 {}）",
                MIN_AUDIT_KEEP_RECENT, keep_recent
            )));
        }
        Ok(self.inner.audit.cleanup_keep_recent(keep_recent)?)
    }

    pub fn audit_health(&self) -> AuditHealthSnapshot {
        self.inner.audit.health()
    }

    /// 可通过 `resume_job` 继续的任务
    pub fn get_resumable_jobs(&self) -> GovernanceResult<Vec<PersistedJob>> {
        self.inner.jobs.list_resumable_jobs()
    }

    pub fn list_jobs(&self) -> Vec<BackupJobSummary> {
        self.inner.jobs.list_jobs()
    }

    pub fn get_job(&self, job_id: &str) -> Option<BackupJobSummary> {
        self.inner.jobs.get_job(job_id)
    }

    /// 恢复完成后内存状态不可信，需要重启
    pub fn is_restart_required(&self) -> bool {
        self.inner.restart_required.load(Ordering::SeqCst)
    }

    // ========================================================================
    // 旧版聊天迁移
    // ========================================================================

    pub fn check_chat_migration_status(&self) -> GovernanceResult<MigrationCheckResult> {
        let Some(legacy) = self.inner.open_legacy_database()? else {
            return Ok(MigrationCheckResult::default());
        };
        let chat = self.inner.open_chat_v2()?;
        Ok(check_migration_status(&legacy, &chat)?)
    }

    /// 同步执行聊天迁移（占用任务槽直到完成）
    pub fn migrate_legacy_chat(&self) -> GovernanceResult<ChatMigrationReport> {
        let ctx = self
            .inner
            .jobs
            .create_job(BackupJobKind::ChatMigration, BackupJobParams::default())?;
        let result = self.inner.migrate_chat(&ctx);
        finish_inline(&ctx, result, chat_migration_payload)
    }

    /// 回滚聊天迁移，回到未迁移状态
    pub fn rollback_chat_migration(&self) -> GovernanceResult<ChatMigrationReport> {
        let ctx = self
            .inner
            .jobs
            .create_job(BackupJobKind::ChatMigration, BackupJobParams::default())?;
        let result = self.inner.rollback_chat(&ctx);
        finish_inline(&ctx, result, |report| {
            BackupJobResultPayload::success(format!(
                "回滚完成: 删除 {} 个会话",
                report.sessions_removed
            ))
            .with_stats(serde_json::to_value(report).unwrap_or_default())
        })
    }

    /// 订阅 `chat_v2_migration` 事件
    pub fn subscribe_chat_migration_events(&self) -> broadcast::Receiver<MigrationEvent> {
        self.inner.chat_events.subscribe()
    }
}

fn runtime_handle() -> GovernanceResult<Handle> {
    Handle::try_current()
        .map_err(|_| GovernanceError::Internal("后台任务需要在 tokio 运行时中启动".to_string()))
}

/// 同步执行的任务写入终态，并把结果原样返回
fn finish_inline<T>(
    ctx: &BackupJobContext,
    result: GovernanceResult<T>,
    payload: impl FnOnce(&T) -> BackupJobResultPayload,
) -> GovernanceResult<T> {
    match result {
        Ok(value) => {
            ctx.complete(payload(&value));
            Ok(value)
        }
        Err(GovernanceError::Cancelled) => {
            ctx.cancelled(Some("任务已取消".to_string()));
            Err(GovernanceError::Cancelled)
        }
        Err(e) => {
            ctx.fail(&e);
            Err(e)
        }
    }
}

fn chat_migration_payload(report: &ChatMigrationReport) -> BackupJobResultPayload {
    let message = if report.is_noop() {
        "没有待迁移的旧版聊天记录".to_string()
    } else {
        format!(
            "迁移完成: {} 个会话, {} 条消息",
            report.sessions_created, report.messages_migrated
        )
    };
    BackupJobResultPayload::success(message)
        .with_stats(serde_json::to_value(report).unwrap_or_default())
}

fn backup_phase(stage: BackupStage) -> BackupJobPhase {
    match stage {
        BackupStage::Preparing => BackupJobPhase::Scan,
        BackupStage::CopyingDatabase => BackupJobPhase::Snapshot,
        BackupStage::CopyingAssets => BackupJobPhase::Assets,
        BackupStage::Finalizing | BackupStage::Completed => BackupJobPhase::Finalizing,
    }
}

fn restore_phase(phase: RestorePhase) -> BackupJobPhase {
    match phase {
        RestorePhase::PreBackup => BackupJobPhase::PreBackup,
        RestorePhase::Restoring | RestorePhase::RolledBack => BackupJobPhase::Restoring,
        RestorePhase::Verifying => BackupJobPhase::Verify,
        RestorePhase::Finalizing | RestorePhase::Done => BackupJobPhase::Finalizing,
    }
}

// ============================================================================
// 任务执行
// ============================================================================

impl ServiceInner {
    fn run_job(&self, ctx: &BackupJobContext) -> GovernanceResult<BackupJobResultPayload> {
        match ctx.kind() {
            Some(BackupJobKind::Backup) => self.run_backup(ctx),
            Some(BackupJobKind::Export) => self.run_export(ctx),
            Some(BackupJobKind::Import) => self.run_import(ctx),
            Some(BackupJobKind::Restore) => self.run_restore(ctx),
            Some(BackupJobKind::ChatMigration) => {
                self.migrate_chat(ctx).map(|report| chat_migration_payload(&report))
            }
            Some(BackupJobKind::Verify) => Err(GovernanceError::Configuration(
                "校验不作为后台任务执行".to_string(),
            )),
            None => Err(GovernanceError::NotFound(format!("任务不存在: {}", ctx.job_id))),
        }
    }

    fn run_backup(&self, ctx: &BackupJobContext) -> GovernanceResult<BackupJobResultPayload> {
        let params = ctx.params();
        ctx.mark_running(BackupJobPhase::Scan, 0.0, Some("准备备份".to_string()), 0, 0);

        let mut on_progress = |p: BackupProgress| {
            let percent = if p.total_items == 0 {
                0.0
            } else {
                5.0 + 90.0 * p.processed_items as f32 / p.total_items as f32
            };
            ctx.mark_running(
                backup_phase(p.stage),
                percent,
                p.current_item,
                p.processed_items,
                p.total_items,
            );
        };
        let should_cancel = || ctx.is_cancelled();

        let outcome = match params.incremental_base.as_deref() {
            Some(base) => {
                self.backups
                    .create_incremental_backup(base, &mut on_progress, &should_cancel)?
            }
            None => self.backups.create_backup(
                &params.selection.clone().unwrap_or_default(),
                !params.stage_only,
                &mut on_progress,
                &should_cancel,
            )?,
        };

        let backup_id = outcome.manifest.backup_id.clone();
        info!("[Governance] 备份任务完成: {} -> {:?}", backup_id, outcome.path);
        Ok(
            BackupJobResultPayload::success(format!("备份完成: {}", backup_id))
                .with_backup_id(backup_id)
                .with_output_path(&outcome.path)
                .with_stats(json!({
                    "file_count": outcome.manifest.files.len(),
                    "is_incremental": outcome.manifest.is_incremental,
                    "catalogued": outcome.catalog_entry.is_some(),
                    "removed_by_retention": outcome.removed_by_retention,
                })),
        )
    }

    fn run_export(&self, ctx: &BackupJobContext) -> GovernanceResult<BackupJobResultPayload> {
        let params = ctx.params();
        let backup_id = params
            .backup_id
            .clone()
            .ok_or_else(|| GovernanceError::Configuration("导出任务缺少 backup_id".to_string()))?;
        let options = ZipExportOptions {
            compression_level: params
                .compression_level
                .unwrap_or(self.config.default_compression_level),
            output_path: params.output_path.clone(),
        };
        let resume = match ctx.checkpoint() {
            Some(TransferCheckpoint::Export(checkpoint)) => Some(checkpoint),
            _ => None,
        };

        let handle = self.audit.start(
            AuditOperation::Sync {
                direction: SyncDirection::Export,
                records_affected: 0,
            },
            backup_id.as_str(),
        );
        let mut observer = ctx.clone();
        let result = ZipExporter::new(&self.backups)
            .with_checkpoint_interval(self.config.checkpoint_interval_items as usize)
            .export(&backup_id, &options, resume, &mut observer);

        match result {
            Ok(exported) => {
                self.audit.complete(
                    handle,
                    Some(AuditOperation::Sync {
                        direction: SyncDirection::Export,
                        records_affected: exported.file_count,
                    }),
                    json!({
                        "zip_path": exported.zip_path,
                        "zip_checksum": exported.zip_checksum,
                        "resumed_from_entry": exported.resumed_from_entry,
                    }),
                );
                Ok(BackupJobResultPayload::success(format!("导出完成: {}", backup_id))
                    .with_backup_id(backup_id)
                    .with_output_path(&exported.zip_path)
                    .with_stats(serde_json::to_value(&exported)?))
            }
            Err(ZipExportError::Cancelled) => {
                self.audit
                    .partial(handle, "导出已取消", json!({ "output_path": options.output_path }));
                Err(GovernanceError::Cancelled)
            }
            Err(e) => {
                let err = GovernanceError::from(e);
                self.audit.fail(handle, err.to_string());
                Err(err)
            }
        }
    }

    fn run_import(&self, ctx: &BackupJobContext) -> GovernanceResult<BackupJobResultPayload> {
        let params = ctx.params();
        let zip_path = params
            .zip_path
            .clone()
            .ok_or_else(|| GovernanceError::Configuration("导入任务缺少 zip_path".to_string()))?;
        let resume = match ctx.checkpoint() {
            Some(TransferCheckpoint::Import(checkpoint)) => Some(checkpoint),
            _ => None,
        };

        let handle = self.audit.start(
            AuditOperation::Sync {
                direction: SyncDirection::Import,
                records_affected: 0,
            },
            zip_path.to_string_lossy().to_string(),
        );
        let mut observer = ctx.clone();
        let result = ZipImporter::new(&self.backups)
            .with_checkpoint_interval(self.config.checkpoint_interval_items as usize)
            .import(&zip_path, &ctx.job_id, resume, &mut observer);

        match result {
            Ok(imported) => {
                self.audit.complete(
                    handle,
                    Some(AuditOperation::Sync {
                        direction: SyncDirection::Import,
                        records_affected: imported.file_count,
                    }),
                    json!({
                        "backup_id": imported.backup_id,
                        "restorable": imported.restorable,
                    }),
                );
                let message = if imported.restorable {
                    format!("导入完成: {}，可以从该备份恢复", imported.backup_id)
                } else {
                    format!("导入完成: {}（该备份不能直接恢复）", imported.backup_id)
                };
                Ok(BackupJobResultPayload::success(message)
                    .with_backup_id(imported.backup_id.clone())
                    .with_stats(serde_json::to_value(&imported)?))
            }
            Err(ZipExportError::Cancelled) => {
                self.audit.partial(handle, "导入已取消", serde_json::Value::Null);
                Err(GovernanceError::Cancelled)
            }
            Err(e) => {
                let err = GovernanceError::from(e);
                self.audit.fail(handle, err.to_string());
                Err(err)
            }
        }
    }

    fn run_restore(&self, ctx: &BackupJobContext) -> GovernanceResult<BackupJobResultPayload> {
        let backup_id = ctx
            .params()
            .backup_id
            .ok_or_else(|| GovernanceError::Configuration("恢复任务缺少 backup_id".to_string()))?;

        let mut on_progress = |p: RestoreProgress| {
            ctx.mark_running(
                restore_phase(p.phase),
                p.percent,
                Some(p.message),
                p.processed_items,
                p.total_items,
            );
        };
        let should_cancel = || ctx.is_cancelled();
        let outcome = RestoreCoordinator::new(&self.backups)
            .with_audit(&self.audit)
            .restore(&backup_id, &mut on_progress, &should_cancel)?;

        self.restart_required.store(true, Ordering::SeqCst);
        info!(
            "[Governance] 恢复完成: {}，需要重启应用",
            outcome.backup_id
        );
        Ok(BackupJobResultPayload::success("恢复完成，请重启应用")
            .with_backup_id(outcome.backup_id.clone())
            .with_stats(serde_json::to_value(&outcome)?)
            .with_restart_required())
    }

    fn open_legacy_database(&self) -> GovernanceResult<Option<Connection>> {
        let path = self.config.legacy_database_path();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Connection::open(&path)?))
    }

    fn open_chat_v2(&self) -> GovernanceResult<Connection> {
        let db = self
            .backups
            .databases()
            .get(DatabaseId::ChatV2)
            .ok_or_else(|| GovernanceError::NotFound("chat_v2 数据库未注册".to_string()))?;
        Ok(db.open()?)
    }

    fn migrate_chat(&self, ctx: &BackupJobContext) -> GovernanceResult<ChatMigrationReport> {
        ctx.mark_running(
            BackupJobPhase::Migrating,
            0.0,
            Some("检查旧版聊天数据".to_string()),
            0,
            0,
        );
        let Some(legacy) = self.open_legacy_database()? else {
            info!(
                "[ChatMigration] 旧版数据库不存在，无需迁移: {:?}",
                self.config.legacy_database_path()
            );
            return Ok(ChatMigrationReport {
                status: MigrationStatus::Completed,
                ..Default::default()
            });
        };
        let chat = self.open_chat_v2()?;

        // 分组之间的取消检查顺带把迁移事件转成任务进度
        let progress_rx = RefCell::new(self.chat_events.subscribe());
        let should_cancel = || {
            loop {
                match progress_rx.borrow_mut().try_recv() {
                    Ok(event) if event.event_type == MigrationEventType::Progress => {
                        let p = &event.progress;
                        ctx.mark_running(
                            BackupJobPhase::Migrating,
                            p.percent as f32,
                            Some(event.message.clone()),
                            p.migrated_messages as u64,
                            p.total_messages as u64,
                        );
                    }
                    Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
            ctx.is_cancelled()
        };

        let handle = self.audit.start(
            AuditOperation::Sync {
                direction: SyncDirection::LegacyChat,
                records_affected: 0,
            },
            self.config.legacy_database_path().to_string_lossy().to_string(),
        );
        let result = MigrationExecutor::new(Some(self.chat_events.clone()))
            .with_cancel_check(&should_cancel)
            .execute(&legacy, &chat);

        match result {
            Ok(report) if report.status == MigrationStatus::Failed => {
                let message = format!(
                    "{} 个分组迁移失败: {}",
                    report.errors.len(),
                    report.errors.join("; ")
                );
                self.audit.fail(handle, message.clone());
                Err(GovernanceError::Internal(message))
            }
            Ok(report) => {
                self.audit.complete(
                    handle,
                    Some(AuditOperation::Sync {
                        direction: SyncDirection::LegacyChat,
                        records_affected: report.messages_migrated,
                    }),
                    serde_json::to_value(&report)?,
                );
                Ok(report)
            }
            Err(ChatV2Error::Cancelled) => {
                self.audit
                    .partial(handle, "聊天迁移已取消，已提交的分组保留", serde_json::Value::Null);
                Err(GovernanceError::Cancelled)
            }
            Err(e) => {
                let err = GovernanceError::from(e);
                self.audit.fail(handle, err.to_string());
                Err(err)
            }
        }
    }

    fn rollback_chat(&self, ctx: &BackupJobContext) -> GovernanceResult<ChatMigrationReport> {
        ctx.mark_running(
            BackupJobPhase::Migrating,
            0.0,
            Some("回滚聊天迁移".to_string()),
            0,
            0,
        );
        let Some(legacy) = self.open_legacy_database()? else {
            warn!("[ChatMigration] 旧版数据库不存在，跳过回滚");
            return Ok(ChatMigrationReport::default());
        };
        let chat = self.open_chat_v2()?;

        let handle = self.audit.start(
            AuditOperation::Maintenance {
                action: "chat_migration_rollback".to_string(),
            },
            self.config.legacy_database_path().to_string_lossy().to_string(),
        );
        match rollback_migration(&legacy, &chat, Some(self.chat_events.clone())) {
            Ok(report) => {
                self.audit
                    .complete(handle, None, serde_json::to_value(&report)?);
                Ok(report)
            }
            Err(e) => {
                let err = GovernanceError::from(e);
                self.audit.fail(handle, err.to_string());
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_job_manager::BackupJobEvent;
    use crate::data_governance::audit::AuditStatus;
    use crate::data_governance::backup::test_support::{never, no_progress, seed_data_dir};
    use crate::data_governance::backup::zip_export::{ExportCheckpoint, TransferObserver};
    use crate::data_governance::backup::{BackupSelection, BackupTier};
    use assert_matches::assert_matches;
    use std::fs;
    use tempfile::TempDir;

    fn config(dir: &Path) -> GovernanceConfig {
        let mut config = GovernanceConfig::new(dir);
        config.min_free_space_multiplier = 1;
        config.event_channel_capacity = 256;
        config
    }

    fn seeded_service(dir: &Path) -> GovernanceService {
        seed_data_dir(dir);
        GovernanceService::open(config(dir)).unwrap()
    }

    fn add_note(service: &GovernanceService, id: &str) {
        service
            .backup_manager()
            .databases()
            .get(DatabaseId::Notes)
            .unwrap()
            .open()
            .unwrap()
            .execute(
                "INSERT INTO notes (id, title, content, created_at, updated_at) VALUES (?1, 't', 'c', '2026-03-01T00:00:00Z', '2026-03-01T00:00:00Z')",
                [id],
            )
            .unwrap();
    }

    fn note_count(service: &GovernanceService) -> i64 {
        service
            .backup_manager()
            .databases()
            .get(DatabaseId::Notes)
            .unwrap()
            .open()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM notes", [], |r| r.get(0))
            .unwrap()
    }

    fn backup_now(service: &GovernanceService, selection: &BackupSelection) -> String {
        service
            .backup_manager()
            .create_backup(selection, true, &mut no_progress(), &never)
            .unwrap()
            .manifest
            .backup_id
    }

    async fn run_to_end(rx: &mut JobEventReceiver, started: JobStarted) -> BackupJobEvent {
        rx.wait_terminal(&started.job_id).await.unwrap()
    }

    #[test]
    fn test_start_without_runtime_does_not_take_slot() {
        let dir = TempDir::new().unwrap();
        let service = seeded_service(dir.path());
        let result = service.start_backup(BackupRequest::full());
        assert_matches!(result, Err(GovernanceError::Internal(_)));
        assert!(service.inner.jobs.active_job().is_none());
        assert!(!service.cancel_job().unwrap());
    }

    #[test]
    fn test_second_job_is_rejected_while_first_runs() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let dir = TempDir::new().unwrap();
            let service = seeded_service(dir.path());
            let mut rx = service.take_event_receiver().unwrap();

            // 占住唯一的阻塞线程，让备份任务停在队列里
            let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
            let blocker = tokio::task::spawn_blocking(move || {
                let _ = release_rx.recv();
            });

            let backup = service.start_backup(BackupRequest::full()).unwrap();
            let restore = service.start_restore("anything");
            assert_matches!(restore, Err(GovernanceError::Concurrency(_)));
            assert_matches!(
                service.apply_pending_migrations(None),
                Err(GovernanceError::Concurrency(_))
            );

            release_tx.send(()).unwrap();
            blocker.await.unwrap();
            let terminal = run_to_end(&mut rx, backup).await;
            assert_eq!(terminal.status, BackupJobStatus::Completed);
            assert_eq!(service.get_backup_catalog().unwrap().len(), 1);
            assert!(service.inner.jobs.active_job().is_none());
        });
    }

    #[tokio::test]
    async fn test_verify_then_restore_requires_restart() {
        let dir = TempDir::new().unwrap();
        let service = seeded_service(dir.path());
        let mut rx = service.take_event_receiver().unwrap();
        let backup_id = backup_now(&service, &BackupSelection::core_only());
        add_note(&service, "n2");

        let verified = service.verify_backup(&backup_id).unwrap();
        assert!(verified.is_valid);
        assert_eq!(verified.databases_verified.len(), 5);
        assert!(verified.databases_verified.iter().all(|d| d.is_valid));
        assert!(verified.errors.is_empty());

        let started = service.start_restore(&backup_id).unwrap();
        let mut phases = Vec::new();
        let terminal = loop {
            let event = rx.recv().await.unwrap();
            if event.job_id != started.job_id {
                continue;
            }
            if event.is_terminal() {
                break event;
            }
            if event.status == BackupJobStatus::Running && phases.last() != Some(&event.phase) {
                phases.push(event.phase);
            }
        };

        assert_eq!(terminal.status, BackupJobStatus::Completed);
        assert_eq!(
            phases,
            vec![
                BackupJobPhase::PreBackup,
                BackupJobPhase::Restoring,
                BackupJobPhase::Verify,
                BackupJobPhase::Finalizing,
            ]
        );
        assert!(terminal.result.unwrap().requires_restart);
        assert!(service.is_restart_required());
        assert!(service.check_health().restart_required);
        assert_eq!(note_count(&service), 1);

        let audit = service
            .get_audit_log(
                AuditLogFilter::operation("Restore").with_status(AuditStatus::Completed),
                0,
                50,
            )
            .unwrap();
        assert_eq!(audit.total, 1);
        assert!(audit.logs[0].duration_ms.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_restore_of_tier_without_core_fails_with_configuration() {
        let dir = TempDir::new().unwrap();
        let service = seeded_service(dir.path());
        let mut rx = service.take_event_receiver().unwrap();

        let backup = service
            .start_backup(BackupRequest::tiered(&[BackupTier::Important]))
            .unwrap();
        let terminal = run_to_end(&mut rx, backup).await;
        let backup_id = terminal.result.unwrap().backup_id.unwrap();

        add_note(&service, "n2");
        let restore = service.start_restore(&backup_id).unwrap();
        let terminal = run_to_end(&mut rx, restore).await;
        assert_eq!(terminal.status, BackupJobStatus::Failed);
        let result = terminal.result.unwrap();
        assert_eq!(result.error_category.as_deref(), Some("configuration"));
        assert!(result.resumable_job_id.is_none());
        assert_eq!(note_count(&service), 2);
        assert!(!service.is_restart_required());
    }

    #[tokio::test]
    async fn test_export_import_round_trip_verifies_identically() {
        let dir = TempDir::new().unwrap();
        let service = seeded_service(dir.path());
        let mut rx = service.take_event_receiver().unwrap();
        let backup_id = backup_now(&service, &BackupSelection::core_only());

        let export = service.start_export(&backup_id, Some(6)).unwrap();
        let exported = run_to_end(&mut rx, export).await;
        assert_eq!(exported.status, BackupJobStatus::Completed);
        let zip_path = PathBuf::from(exported.result.unwrap().output_path.unwrap());
        assert!(zip_path.is_file());

        let import = service.start_import(&zip_path).unwrap();
        let imported = run_to_end(&mut rx, import).await;
        assert_eq!(imported.status, BackupJobStatus::Completed);
        let imported_id = imported.result.unwrap().backup_id.unwrap();
        assert_ne!(imported_id, backup_id);

        let original = service.verify_backup(&backup_id).unwrap();
        let round_trip = service.verify_backup(&imported_id).unwrap();
        assert_eq!(original.is_valid, round_trip.is_valid);
        assert_eq!(original.databases_verified, round_trip.databases_verified);

        let syncs = service
            .get_audit_log(AuditLogFilter::operation("Sync"), 0, 50)
            .unwrap();
        let completed = syncs
            .logs
            .iter()
            .filter(|l| l.status == AuditStatus::Completed)
            .count();
        assert_eq!(completed, 2);
    }

    #[test]
    fn test_invalid_export_level_is_rejected_synchronously() {
        let dir = TempDir::new().unwrap();
        let service = seeded_service(dir.path());
        assert_matches!(
            service.start_export("b1", Some(12)),
            Err(GovernanceError::Configuration(_))
        );
        assert!(service.inner.jobs.active_job().is_none());
    }

    /// 第 `cancel_after` 次取消检查时中断，记录最后一个检查点
    struct InterruptingObserver {
        checks: std::cell::Cell<usize>,
        cancel_after: usize,
        checkpoint: Option<ExportCheckpoint>,
    }

    impl TransferObserver for InterruptingObserver {
        fn on_checkpoint(&mut self, checkpoint: &TransferCheckpoint) {
            if let TransferCheckpoint::Export(cp) = checkpoint {
                self.checkpoint = Some(cp.clone());
            }
        }

        fn is_cancelled(&self) -> bool {
            self.checks.set(self.checks.get() + 1);
            self.checks.get() > self.cancel_after
        }
    }

    #[tokio::test]
    async fn test_interrupted_export_resumes_after_restart() {
        let dir = TempDir::new().unwrap();
        let job_id = "export-job-1";
        let (backup_id, checkpoint, output_path) = {
            let service = seeded_service(dir.path());
            fs::create_dir_all(dir.path().join("notes_assets/sub")).unwrap();
            fs::write(dir.path().join("notes_assets/a.txt"), b"alpha").unwrap();
            fs::write(dir.path().join("notes_assets/sub/b.txt"), vec![7u8; 4096]).unwrap();
            let backup_id = backup_now(&service, &BackupSelection::recommended());
            let output_path = service.export_path(&backup_id);

            // 进程在导出中途退出：检查点已落盘，任务记录停留在 Running
            let options = ZipExportOptions {
                compression_level: 6,
                output_path: Some(output_path.clone()),
            };
            let mut observer = InterruptingObserver {
                checks: std::cell::Cell::new(0),
                cancel_after: 3,
                checkpoint: None,
            };
            let interrupted = ZipExporter::new(service.backup_manager()).export(
                &backup_id,
                &options,
                None,
                &mut observer,
            );
            assert_matches!(interrupted, Err(ZipExportError::Cancelled));
            let checkpoint = observer.checkpoint.unwrap();

            let now = chrono::Utc::now();
            let persisted = PersistedJob {
                job_id: job_id.to_string(),
                kind: BackupJobKind::Export,
                status: BackupJobStatus::Running,
                phase: BackupJobPhase::Compress,
                progress: 40.0,
                created_at: now,
                started_at: Some(now),
                updated_at: now,
                params: BackupJobParams {
                    backup_id: Some(backup_id.clone()),
                    output_path: Some(output_path.clone()),
                    compression_level: Some(6),
                    ..Default::default()
                },
                checkpoint: Some(TransferCheckpoint::Export(checkpoint.clone())),
                error_message: None,
                error_category: None,
            };
            let jobs_dir = service.config().jobs_dir();
            fs::create_dir_all(&jobs_dir).unwrap();
            fs::write(
                jobs_dir.join(format!("{}.json", job_id)),
                serde_json::to_string(&persisted).unwrap(),
            )
            .unwrap();
            (backup_id, checkpoint, output_path)
        };

        let service = GovernanceService::open(config(dir.path())).unwrap();
        let mut rx = service.take_event_receiver().unwrap();
        let resumable = service.get_resumable_jobs().unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].job_id, job_id);

        let started = service.resume_job(job_id).unwrap();
        assert_eq!(started.job_id, job_id);
        let terminal = run_to_end(&mut rx, started).await;
        assert_eq!(terminal.status, BackupJobStatus::Completed);

        let stats = terminal.result.unwrap().stats.unwrap();
        let total_size = stats["total_size"].as_u64().unwrap();
        let this_run = stats["bytes_transferred"].as_u64().unwrap();
        assert_eq!(stats["resumed_from_entry"].as_u64(), Some(3));
        assert!(this_run < total_size);
        assert_eq!(checkpoint.bytes_transferred + this_run, total_size);
        assert!(output_path.is_file());
        assert!(service.get_resumable_jobs().unwrap().is_empty());

        let fresh = ZipExporter::new(service.backup_manager())
            .export(
                &backup_id,
                &ZipExportOptions {
                    compression_level: 6,
                    output_path: Some(dir.path().join("fresh.zip")),
                },
                None,
                &mut crate::data_governance::backup::zip_export::NoopObserver,
            )
            .unwrap();
        assert_eq!(
            fs::read(&output_path).unwrap(),
            fs::read(&fresh.zip_path).unwrap()
        );
    }

    #[test]
    fn test_delete_backup_refuses_pinned_and_audits() {
        let dir = TempDir::new().unwrap();
        let service = seeded_service(dir.path());
        let backup_id = backup_now(&service, &BackupSelection::core_only());

        let pin = service.backup_manager().pin(&backup_id);
        assert_matches!(
            service.delete_backup(&backup_id),
            Err(GovernanceError::Concurrency(_))
        );
        drop(pin);

        service.delete_backup(&backup_id).unwrap();
        assert!(service.get_backup_catalog().unwrap().is_empty());
        assert_matches!(
            service.delete_backup(&backup_id),
            Err(GovernanceError::NotFound(_))
        );

        let maintenance = service
            .get_audit_log(AuditLogFilter::operation("Maintenance"), 0, 50)
            .unwrap();
        let statuses: Vec<AuditStatus> = maintenance.logs.iter().map(|l| l.status).collect();
        assert!(statuses.contains(&AuditStatus::Completed));
        assert!(statuses.contains(&AuditStatus::Failed));
    }

    #[test]
    fn test_verify_is_rejected_for_active_restore_target() {
        let dir = TempDir::new().unwrap();
        let service = seeded_service(dir.path());
        let backup_id = backup_now(&service, &BackupSelection::core_only());
        let ctx = service
            .inner
            .jobs
            .create_job(
                BackupJobKind::Restore,
                BackupJobParams {
                    backup_id: Some(backup_id.clone()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_matches!(
            service.verify_backup(&backup_id),
            Err(GovernanceError::Concurrency(_))
        );
        assert_matches!(
            service.delete_backup(&backup_id),
            Err(GovernanceError::Concurrency(_))
        );
        ctx.cancelled(None);
        assert!(service.verify_backup(&backup_id).unwrap().is_valid);
    }

    #[test]
    fn test_health_and_migration_status_after_seed() {
        let dir = TempDir::new().unwrap();
        let service = seeded_service(dir.path());

        let health = service.check_health();
        assert!(health.overall_healthy, "{:?}", health.databases);
        assert_eq!(health.total_databases, 5);
        assert_eq!(health.uninitialized_count, 0);
        assert!(health.audit_log_healthy);
        assert_eq!(health.resumable_jobs, 0);

        let status = service.get_migration_status();
        assert!(status.all_healthy);
        assert!(!status.has_pending_migrations);
        assert!(status.global_version > 0);

        let registry = service.get_schema_registry().unwrap();
        assert_eq!(registry.databases.len(), 5);

        let report = service.apply_pending_migrations(Some(DatabaseId::Notes)).unwrap();
        assert_eq!(report.applied_total(), 0);
    }

    #[test]
    fn test_fresh_data_dir_reports_uninitialized() {
        let dir = TempDir::new().unwrap();
        let service = GovernanceService::open(config(dir.path())).unwrap();
        let health = service.check_health();
        assert!(!health.overall_healthy);
        assert!(health.has_pending_migrations);

        let report = service.apply_pending_migrations(None).unwrap();
        assert!(report.success);
        assert!(service.check_health().overall_healthy);
    }

    #[test]
    fn test_audit_cleanup_enforces_floor() {
        let dir = TempDir::new().unwrap();
        let service = seeded_service(dir.path());
        assert_matches!(
            service.cleanup_audit_logs(10),
            Err(GovernanceError::Configuration(_))
        );
        assert_eq!(service.cleanup_audit_logs(1000).unwrap(), 0);
        let maintenance = service
            .get_audit_log(
                AuditLogFilter::operation("Maintenance").with_status(AuditStatus::Completed),
                0,
                10,
            )
            .unwrap();
        assert_eq!(maintenance.total, 1);
    }

    fn seed_legacy_chat(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE mistakes (id TEXT PRIMARY KEY, ocr_text TEXT, user_question TEXT, chat_metadata TEXT);
             CREATE TABLE chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mistake_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                thinking_content TEXT,
                rag_sources TEXT,
                memory_sources TEXT,
                graph_sources TEXT,
                web_search_sources TEXT,
                image_paths TEXT,
                image_base64 TEXT,
                doc_attachments TEXT,
                tool_call TEXT,
                tool_result TEXT,
                stable_id TEXT,
                metadata TEXT
             );
             INSERT INTO mistakes (id, ocr_text) VALUES ('m1', '三角函数');
             INSERT INTO chat_messages (mistake_id, role, content, timestamp) VALUES ('m1', 'user', '怎么化简', '2025-06-01T08:00:00Z');
             INSERT INTO chat_messages (mistake_id, role, content, timestamp) VALUES ('m1', 'assistant', '用和角公式', '2025-06-01T08:01:00Z');
             INSERT INTO chat_messages (mistake_id, role, content, timestamp) VALUES ('m2', 'user', '第二题', '2025-06-02T08:00:00Z');",
        )
        .unwrap();
    }

    #[test]
    fn test_chat_migration_is_idempotent_and_rolls_back() {
        let dir = TempDir::new().unwrap();
        let service = seeded_service(dir.path());
        seed_legacy_chat(&service.config().legacy_database_path());
        let mut events = service.subscribe_chat_migration_events();

        let before = service.check_chat_migration_status().unwrap();
        assert!(before.needs_migration);
        assert_eq!(before.pending_sessions, 2);

        let first = service.migrate_legacy_chat().unwrap();
        assert_eq!(first.sessions_created, 2);
        assert_eq!(first.messages_migrated, 3);
        let mut progress_events = 0;
        while let Ok(event) = events.try_recv() {
            if event.event_type == MigrationEventType::Progress {
                progress_events += 1;
            }
        }
        assert_eq!(progress_events, 2);

        let second = service.migrate_legacy_chat().unwrap();
        assert!(second.is_noop());
        assert_eq!(second.messages_migrated, 0);

        let status = service.check_chat_migration_status().unwrap();
        assert_eq!(status.status, MigrationStatus::Completed);
        assert!(status.can_rollback);

        let rollback = service.rollback_chat_migration().unwrap();
        assert_eq!(rollback.status, MigrationStatus::RolledBack);
        assert_eq!(rollback.sessions_removed, 2);
        let after = service.check_chat_migration_status().unwrap();
        assert_eq!(after.status, MigrationStatus::NotStarted);
        assert_eq!(after.pending_messages, 3);
        assert!(service.inner.jobs.active_job().is_none());
    }

    #[tokio::test]
    async fn test_chat_migration_job_without_legacy_database_is_noop() {
        let dir = TempDir::new().unwrap();
        let service = seeded_service(dir.path());
        let mut rx = service.take_event_receiver().unwrap();

        let status = service.check_chat_migration_status().unwrap();
        assert!(!status.needs_migration);

        let started = service.start_chat_migration().unwrap();
        let terminal = run_to_end(&mut rx, started).await;
        assert_eq!(terminal.status, BackupJobStatus::Completed);
        assert_eq!(terminal.kind, BackupJobKind::ChatMigration);
        assert!(terminal.result.unwrap().success);
    }
}
