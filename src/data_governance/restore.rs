//! # 恢复协调器
//!
//! 严格顺序的恢复状态机：
//!
//! ```text
//! PreBackup -> Restoring -> Verifying -> Finalizing -> Done
//!                 |             |
//!                 +-------------+--> RolledBack
//! ```
//!
//! - PreBackup (0-20%)：恢复前安全快照；失败时不触碰任何线上数据
//! - Restoring (20-70%)：逐库替换，再替换资产目录（原目录先改名保留）
//! - Verifying (70-95%)：对线上数据重新执行结构检查
//! - Finalizing (95-100%)：清理、审计，标记需要重启
//!
//! Restoring / Verifying 阶段的任何失败（包括取消）都会用安全快照整体回滚；
//! 回滚本身失败时返回 [`GovernanceError::RollbackFailed`]，需要人工介入。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use super::audit::{AuditLogger, AuditOperation};
use super::backup::{assets, AssetType, BackupManager, BackupManifest, BackupPin};
use super::schema_registry::DatabaseId;
use super::verification::{self, VerificationService};
use super::{GovernanceError, GovernanceResult};

/// 恢复阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePhase {
    PreBackup,
    Restoring,
    Verifying,
    Finalizing,
    Done,
    RolledBack,
}

impl RestorePhase {
    /// 正常流程中的下一阶段
    pub fn next(self) -> Option<RestorePhase> {
        match self {
            RestorePhase::PreBackup => Some(RestorePhase::Restoring),
            RestorePhase::Restoring => Some(RestorePhase::Verifying),
            RestorePhase::Verifying => Some(RestorePhase::Finalizing),
            RestorePhase::Finalizing => Some(RestorePhase::Done),
            RestorePhase::Done | RestorePhase::RolledBack => None,
        }
    }

    /// 此阶段失败时是否需要回滚线上数据
    pub fn requires_rollback(self) -> bool {
        matches!(self, RestorePhase::Restoring | RestorePhase::Verifying)
    }

    /// 进度区间（百分比）
    pub fn progress_range(self) -> (f32, f32) {
        match self {
            RestorePhase::PreBackup => (0.0, 20.0),
            RestorePhase::Restoring => (20.0, 70.0),
            RestorePhase::Verifying => (70.0, 95.0),
            RestorePhase::Finalizing => (95.0, 100.0),
            RestorePhase::Done | RestorePhase::RolledBack => (100.0, 100.0),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RestorePhase::PreBackup => "pre_backup",
            RestorePhase::Restoring => "restoring",
            RestorePhase::Verifying => "verifying",
            RestorePhase::Finalizing => "finalizing",
            RestorePhase::Done => "done",
            RestorePhase::RolledBack => "rolled_back",
        }
    }
}

/// 恢复进度
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreProgress {
    pub phase: RestorePhase,
    pub percent: f32,
    pub processed_items: u64,
    pub total_items: u64,
    pub message: String,
}

/// 恢复结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub backup_id: String,
    pub restore_id: String,
    pub restored_databases: Vec<DatabaseId>,
    pub restored_assets: usize,
    /// 恢复后内存中的状态不可信，需要重启
    pub restart_required: bool,
    pub duration_ms: u64,
}

/// 被改名保留的资产目录
struct AsideDir {
    live: PathBuf,
    aside: Option<PathBuf>,
}

/// Restoring 阶段已经触碰的线上状态
#[derive(Default)]
struct Touched {
    databases: Vec<DatabaseId>,
    asset_dirs: Vec<AsideDir>,
}

/// 恢复协调器
pub struct RestoreCoordinator<'a> {
    manager: &'a BackupManager,
    audit: Option<&'a AuditLogger>,
}

impl<'a> RestoreCoordinator<'a> {
    pub fn new(manager: &'a BackupManager) -> Self {
        Self {
            manager,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: &'a AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    /// 恢复备份
    ///
    /// 调用方负责在此期间停止应用的正常写入。
    pub fn restore(
        &self,
        backup_id: &str,
        progress: &mut dyn FnMut(RestoreProgress),
        should_cancel: &dyn Fn() -> bool,
    ) -> GovernanceResult<RestoreOutcome> {
        let handle = self.audit.map(|audit| {
            audit.start(
                AuditOperation::Restore {
                    backup_id: backup_id.to_string(),
                },
                backup_id,
            )
        });
        let start = std::time::Instant::now();

        let result = self.run(backup_id, progress, should_cancel, start);

        if let (Some(audit), Some(handle)) = (self.audit, handle) {
            match &result {
                Ok(outcome) => {
                    audit.complete(
                        handle,
                        None,
                        serde_json::json!({
                            "restore_id": outcome.restore_id,
                            "databases": outcome.restored_databases,
                            "assets": outcome.restored_assets,
                            "restart_required": outcome.restart_required,
                        }),
                    );
                }
                Err(e) => {
                    audit.fail(handle, e.to_string());
                }
            }
        }
        result
    }

    fn run(
        &self,
        backup_id: &str,
        progress: &mut dyn FnMut(RestoreProgress),
        should_cancel: &dyn Fn() -> bool,
        start: std::time::Instant,
    ) -> GovernanceResult<RestoreOutcome> {
        let _pin: BackupPin = self.manager.pin(backup_id);
        let manifest = self.manager.load_manifest(backup_id)?;
        manifest.check_restorable()?;
        let backup_dir = self.manager.backup_path(backup_id)?;

        let verify = VerificationService::new(self.manager).verify_unpinned(backup_id)?;
        if !verify.is_valid {
            let database = verify.first_failed_database().map(|d| d.id.as_str().to_string());
            return Err(GovernanceError::Integrity {
                database,
                message: format!("备份校验失败，未执行恢复: {}", verify.errors.join("; ")),
            });
        }

        let restore_id = format!(
            "{}_{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        info!("[Restore] 开始恢复: backup={}, restore_id={}", backup_id, restore_id);

        // PreBackup
        let mut phase = RestorePhase::PreBackup;
        report(progress, phase, 0.0, 0, 1, "正在创建恢复前安全快照");
        if should_cancel() {
            return Err(GovernanceError::Cancelled);
        }
        let (safety, safety_dir) = match self.manager.create_safety_snapshot(&restore_id, should_cancel) {
            Ok(s) => s,
            Err(e) => {
                error!("[Restore] 安全快照失败，终止恢复（线上数据未改动）: {}", e);
                let _ = fs::remove_dir_all(self.manager.pre_restore_dir().join(&restore_id));
                return Err(e.into());
            }
        };
        report(progress, phase, 1.0, 1, 1, "安全快照完成");

        // Restoring
        phase = advance(phase);
        let mut touched = Touched::default();
        let restore_result = self.replace_live_data(
            &manifest,
            &backup_dir,
            &restore_id,
            &mut touched,
            progress,
            should_cancel,
        );
        let restored_assets = match restore_result {
            Ok(n) => n,
            Err(e) => return Err(self.roll_back(e, phase, &touched, &safety, &safety_dir, progress)),
        };

        // Verifying
        phase = advance(phase);
        report(progress, phase, 0.0, 0, 1, "正在校验恢复后的数据库");
        let live_results = verification::verify_live_databases(self.manager.databases(), &manifest);
        if let Some(failed) = live_results.iter().find(|r| !r.is_valid) {
            let err = GovernanceError::integrity(
                failed.id.as_str(),
                failed.error.clone().unwrap_or_else(|| "校验失败".to_string()),
            );
            return Err(self.roll_back(err, phase, &touched, &safety, &safety_dir, progress));
        }
        if should_cancel() {
            return Err(self.roll_back(
                GovernanceError::Cancelled,
                phase,
                &touched,
                &safety,
                &safety_dir,
                progress,
            ));
        }
        report(progress, phase, 1.0, 1, 1, "校验通过");

        // Finalizing
        phase = advance(phase);
        report(progress, phase, 0.0, 0, 1, "正在清理");
        for dir in &touched.asset_dirs {
            if let Some(aside) = &dir.aside {
                if let Err(e) = fs::remove_dir_all(aside) {
                    warn!("[Restore] 清理旧资产目录失败 {:?}: {}", aside, e);
                }
            }
        }
        if let Err(e) = fs::remove_dir_all(&safety_dir) {
            warn!("[Restore] 清理安全快照失败 {:?}: {}", safety_dir, e);
        }
        phase = advance(phase);
        report(progress, phase, 1.0, 1, 1, "恢复完成，需要重启应用");

        let outcome = RestoreOutcome {
            backup_id: backup_id.to_string(),
            restore_id,
            restored_databases: touched.databases.clone(),
            restored_assets,
            restart_required: true,
            duration_ms: (start.elapsed().as_millis() as u64).max(1),
        };
        info!(
            "[Restore] 恢复完成: backup={}, databases={:?}, assets={}, {}ms",
            backup_id, outcome.restored_databases, outcome.restored_assets, outcome.duration_ms
        );
        Ok(outcome)
    }

    /// 替换线上数据库与资产目录，返回恢复的资产文件数
    fn replace_live_data(
        &self,
        manifest: &BackupManifest,
        backup_dir: &Path,
        restore_id: &str,
        touched: &mut Touched,
        progress: &mut dyn FnMut(RestoreProgress),
        should_cancel: &dyn Fn() -> bool,
    ) -> GovernanceResult<usize> {
        let phase = RestorePhase::Restoring;
        let files: Vec<_> = manifest.database_files().collect();
        let asset_files = manifest
            .assets
            .as_ref()
            .map(|a| a.files.as_slice())
            .unwrap_or_default();
        let total = files.len() as u64 + u64::from(!asset_files.is_empty());

        for (idx, (id, file)) in files.iter().enumerate() {
            if should_cancel() {
                return Err(GovernanceError::Cancelled);
            }
            let Some(db) = self.manager.databases().get(*id) else {
                return Err(GovernanceError::Configuration(format!(
                    "备份包含未注册的数据库: {}",
                    id
                )));
            };
            report(
                progress,
                phase,
                idx as f32 / total.max(1) as f32,
                idx as u64,
                total,
                &format!("正在恢复数据库 {}", id),
            );
            touched.databases.push(*id);
            db.restore_from(&backup_dir.join(&file.path)).map_err(|e| {
                error!("[Restore] 数据库 {} 恢复失败: {}", id, e);
                GovernanceError::RestoreFailed(e.to_string())
            })?;
        }

        if asset_files.is_empty() {
            return Ok(0);
        }

        let data_dir = self.manager.data_dir();
        let mut types: Vec<AssetType> = asset_files.iter().map(|a| a.asset_type).collect();
        types.sort();
        types.dedup();
        for asset_type in types {
            let live = data_dir.join(asset_type.relative_path());
            let aside = if live.exists() {
                let aside = data_dir.join(format!(
                    "{}.{}_{}",
                    asset_type.relative_path(),
                    "pre_restore",
                    restore_id
                ));
                fs::rename(&live, &aside)?;
                Some(aside)
            } else {
                None
            };
            touched.asset_dirs.push(AsideDir { live, aside });
        }

        let files_done = files.len() as u64;
        let restored = assets::restore_assets(backup_dir, data_dir, asset_files, |done, count| {
            report(
                progress,
                phase,
                (files_done as f32 + done as f32 / count.max(1) as f32) / total.max(1) as f32,
                files_done,
                total,
                &format!("正在恢复资产 {}/{}", done, count),
            );
            !should_cancel()
        })
        .map_err(|e| match e {
            assets::AssetBackupError::Cancelled => GovernanceError::Cancelled,
            other => GovernanceError::RestoreFailed(other.to_string()),
        })?;
        Ok(restored)
    }

    /// 用安全快照回滚所有已触碰的线上状态
    ///
    /// 回滚成功时返回原始错误（普通失败包装为 RestoreFailed）；回滚失败时返回 RollbackFailed。
    fn roll_back(
        &self,
        cause: GovernanceError,
        phase: RestorePhase,
        touched: &Touched,
        safety: &BackupManifest,
        safety_dir: &Path,
        progress: &mut dyn FnMut(RestoreProgress),
    ) -> GovernanceError {
        debug_assert!(phase.requires_rollback());
        warn!(
            "[Restore] {} 阶段失败，开始回滚: {}",
            phase.as_str(),
            cause
        );
        let mut rollback_errors = Vec::new();

        for id in touched.databases.iter().rev() {
            let Some(db) = self.manager.databases().get(*id) else {
                continue;
            };
            let snapshot = safety
                .database_files()
                .find(|(sid, _)| sid == id)
                .map(|(_, f)| safety_dir.join(&f.path));
            let result = match snapshot {
                Some(path) => db.restore_from(&path),
                // 恢复前不存在的数据库
                None => db.remove(),
            };
            if let Err(e) = result {
                error!("[Restore] 回滚数据库 {} 失败: {}", id, e);
                rollback_errors.push(format!("{}: {}", id, e));
            }
        }

        for dir in touched.asset_dirs.iter().rev() {
            if dir.live.exists() {
                if let Err(e) = fs::remove_dir_all(&dir.live) {
                    rollback_errors.push(format!("{:?}: {}", dir.live, e));
                    continue;
                }
            }
            if let Some(aside) = &dir.aside {
                if let Err(e) = fs::rename(aside, &dir.live) {
                    error!("[Restore] 回滚资产目录失败 {:?}: {}", dir.live, e);
                    rollback_errors.push(format!("{:?}: {}", dir.live, e));
                }
            }
        }

        if !rollback_errors.is_empty() {
            error!(
                "[Restore] 回滚失败，安全快照保留在 {:?}，需要人工处理",
                safety_dir
            );
            return GovernanceError::RollbackFailed {
                restore_error: cause.to_string(),
                rollback_error: format!(
                    "{}（安全快照: {}）",
                    rollback_errors.join("; "),
                    safety_dir.display()
                ),
            };
        }

        if let Err(e) = fs::remove_dir_all(safety_dir) {
            warn!("[Restore] 清理安全快照失败 {:?}: {}", safety_dir, e);
        }
        report(progress, RestorePhase::RolledBack, 1.0, 0, 0, "已回滚到恢复前状态");
        info!("[Restore] 回滚完成，线上数据已恢复到恢复前状态");

        match cause {
            GovernanceError::Cancelled => GovernanceError::Cancelled,
            GovernanceError::Integrity { .. } => cause,
            other => GovernanceError::RestoreFailed(other.to_string()),
        }
    }
}

fn advance(phase: RestorePhase) -> RestorePhase {
    phase.next().unwrap_or(phase)
}

/// 按阶段区间换算进度；`fraction` 为阶段内完成比例
fn report(
    progress: &mut dyn FnMut(RestoreProgress),
    phase: RestorePhase,
    fraction: f32,
    processed_items: u64,
    total_items: u64,
    message: &str,
) {
    let (lo, hi) = phase.progress_range();
    progress(RestoreProgress {
        phase,
        percent: lo + (hi - lo) * fraction.clamp(0.0, 1.0),
        processed_items,
        total_items,
        message: message.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_governance::audit::{AuditDatabase, AuditFilter, AuditStatus};
    use crate::data_governance::backup::test_support::{never, no_progress, seed_data_dir};
    use crate::data_governance::backup::{BackupSelection, BackupTier};
    use crate::data_governance::database::{Database, DatabaseError, DatabaseSet, SqliteDatabase};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// 前 `failures` 次 restore_from 失败的数据库
    struct FlakyDatabase {
        inner: SqliteDatabase,
        failures: AtomicUsize,
    }

    impl Database for FlakyDatabase {
        fn id(&self) -> DatabaseId {
            self.inner.id()
        }

        fn live_path(&self) -> &Path {
            self.inner.live_path()
        }

        fn restore_from(&self, snapshot: &Path) -> Result<(), DatabaseError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DatabaseError::Io {
                    database: self.id().as_str().to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "injected failure"),
                });
            }
            self.inner.restore_from(snapshot)
        }
    }

    fn manager_with(data_dir: &Path, databases: DatabaseSet) -> BackupManager {
        BackupManager::new(data_dir.join("backups"), data_dir.to_path_buf(), databases)
            .with_disk_space_multiplier(1)
    }

    fn flaky_set(data_dir: &Path, id: DatabaseId, failures: usize) -> DatabaseSet {
        let mut set = seed_data_dir(data_dir);
        set.replace(Arc::new(FlakyDatabase {
            inner: SqliteDatabase::in_data_dir(id, data_dir),
            failures: AtomicUsize::new(failures),
        }));
        set
    }

    fn note_count(manager: &BackupManager) -> i64 {
        manager
            .databases()
            .get(DatabaseId::Notes)
            .unwrap()
            .open()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM notes", [], |r| r.get(0))
            .unwrap()
    }

    fn add_note(manager: &BackupManager, id: &str) {
        manager
            .databases()
            .get(DatabaseId::Notes)
            .unwrap()
            .open()
            .unwrap()
            .execute(
                "INSERT INTO notes (id, title, content, created_at, updated_at) VALUES (?1, 't', 'c', '2026-02-01T00:00:00Z', '2026-02-01T00:00:00Z')",
                [id],
            )
            .unwrap();
    }

    fn backup(manager: &BackupManager, selection: &BackupSelection) -> String {
        manager
            .create_backup(selection, true, &mut no_progress(), &never)
            .unwrap()
            .manifest
            .backup_id
    }

    #[test]
    fn test_restore_replaces_live_data_and_audits_once() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(dir.path(), seed_data_dir(dir.path()));
        let backup_id = backup(&manager, &BackupSelection::core_only());
        add_note(&manager, "n2");
        assert_eq!(note_count(&manager), 2);

        let audit = AuditLogger::new(Arc::new(AuditDatabase::open_in_memory().unwrap()));
        let mut phases = Vec::new();
        let mut last_percent = 0.0f32;
        let outcome = RestoreCoordinator::new(&manager)
            .with_audit(&audit)
            .restore(
                &backup_id,
                &mut |p: RestoreProgress| {
                    assert!(p.percent >= last_percent, "进度不应倒退");
                    last_percent = p.percent;
                    if phases.last() != Some(&p.phase) {
                        phases.push(p.phase);
                    }
                },
                &never,
            )
            .unwrap();

        assert!(outcome.restart_required);
        assert_eq!(outcome.restored_databases.len(), 5);
        assert_eq!(note_count(&manager), 1);
        assert_eq!(
            phases,
            vec![
                RestorePhase::PreBackup,
                RestorePhase::Restoring,
                RestorePhase::Verifying,
                RestorePhase::Finalizing,
                RestorePhase::Done,
            ]
        );
        assert_eq!(last_percent, 100.0);

        let logs = audit
            .query_paged(&AuditFilter {
                operation_type: Some("Restore".to_string()),
                ..Default::default()
            })
            .unwrap()
            .logs;
        let completed: Vec<_> = logs
            .iter()
            .filter(|l| l.status == AuditStatus::Completed)
            .collect();
        assert_eq!(completed.len(), 1);
        assert!(completed[0].duration_ms.unwrap() > 0);
        assert!(!manager.pre_restore_dir().join(&outcome.restore_id).exists());
    }

    #[test]
    fn test_failure_mid_restore_rolls_back_every_database() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(dir.path(), flaky_set(dir.path(), DatabaseId::Graph, 1));
        let backup_id = backup(&manager, &BackupSelection::core_only());
        add_note(&manager, "n2");
        let versions_before: Vec<u32> = manager
            .databases()
            .iter()
            .map(|db| db.schema_version().unwrap())
            .collect();

        let result = RestoreCoordinator::new(&manager).restore(&backup_id, &mut |_| {}, &never);
        assert_matches!(result, Err(GovernanceError::RestoreFailed(_)));

        // notes 在 graph 之前被替换，回滚后应回到恢复前状态
        assert_eq!(note_count(&manager), 2);
        let versions_after: Vec<u32> = manager
            .databases()
            .iter()
            .map(|db| db.schema_version().unwrap())
            .collect();
        assert_eq!(versions_before, versions_after);
        for db in manager.databases().iter() {
            db.integrity_check().unwrap();
        }
        assert!(!manager.is_pinned(&backup_id));
    }

    #[test]
    fn test_rollback_failure_is_distinct() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(dir.path(), flaky_set(dir.path(), DatabaseId::Graph, 2));
        let backup_id = backup(&manager, &BackupSelection::core_only());

        let result = RestoreCoordinator::new(&manager).restore(&backup_id, &mut |_| {}, &never);
        assert_matches!(result, Err(GovernanceError::RollbackFailed { .. }));
        let remaining: Vec<_> = fs::read_dir(manager.pre_restore_dir()).unwrap().collect();
        assert_eq!(remaining.len(), 1, "回滚失败时保留安全快照");
    }

    #[test]
    fn test_cancel_during_restore_rolls_back() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(dir.path(), seed_data_dir(dir.path()));
        let backup_id = backup(&manager, &BackupSelection::core_only());
        add_note(&manager, "n2");

        let checks = std::cell::Cell::new(0);
        let cancel = || {
            checks.set(checks.get() + 1);
            // 安全快照 5 次 + PreBackup 1 次之后，在第 3 个数据库前取消
            checks.get() > 8
        };
        let result = RestoreCoordinator::new(&manager).restore(&backup_id, &mut |_| {}, &cancel);
        assert_matches!(result, Err(GovernanceError::Cancelled));
        assert_eq!(note_count(&manager), 2);
    }

    #[test]
    fn test_tier_without_core_is_rejected_before_touching_data() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(dir.path(), seed_data_dir(dir.path()));
        fs::create_dir_all(dir.path().join("subjects")).unwrap();
        fs::write(dir.path().join("subjects/a.json"), b"{}").unwrap();
        let backup_id = backup(&manager, &BackupSelection::tiers(&[BackupTier::Important]));

        let result = RestoreCoordinator::new(&manager).restore(&backup_id, &mut |_| {}, &never);
        assert_matches!(result, Err(GovernanceError::Configuration(_)));
        assert!(!manager.pre_restore_dir().exists());
    }

    #[test]
    fn test_incremental_backup_is_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(dir.path(), seed_data_dir(dir.path()));
        let base = backup(&manager, &BackupSelection::core_only());
        let incr = manager
            .create_incremental_backup(&base, &mut no_progress(), &never)
            .unwrap();

        let result = RestoreCoordinator::new(&manager).restore(
            &incr.manifest.backup_id,
            &mut |_| {},
            &never,
        );
        assert_matches!(result, Err(GovernanceError::Configuration(_)));
    }

    #[test]
    fn test_restore_replaces_asset_directories() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(dir.path(), seed_data_dir(dir.path()));
        let assets_dir = dir.path().join("notes_assets");
        fs::create_dir_all(&assets_dir).unwrap();
        fs::write(assets_dir.join("a.txt"), b"original").unwrap();
        let backup_id = backup(&manager, &BackupSelection::recommended());

        fs::write(assets_dir.join("a.txt"), b"changed").unwrap();
        fs::write(assets_dir.join("c.txt"), b"new").unwrap();

        let outcome = RestoreCoordinator::new(&manager)
            .restore(&backup_id, &mut |_| {}, &never)
            .unwrap();
        assert_eq!(outcome.restored_assets, 1);
        assert_eq!(fs::read(assets_dir.join("a.txt")).unwrap(), b"original");
        assert!(!assets_dir.join("c.txt").exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("pre_restore"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_restore_of_corrupt_backup_never_touches_live_data() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(dir.path(), seed_data_dir(dir.path()));
        let backup_id = backup(&manager, &BackupSelection::core_only());
        let snapshot = manager.backup_path(&backup_id).unwrap().join("notes.db");
        fs::write(&snapshot, b"garbage").unwrap();
        add_note(&manager, "n2");

        let result = RestoreCoordinator::new(&manager).restore(&backup_id, &mut |_| {}, &never);
        assert_matches!(result, Err(GovernanceError::Integrity { database: Some(ref d), .. }) if d == "notes");
        assert_eq!(note_count(&manager), 2);
        assert!(!manager.pre_restore_dir().exists());
    }
}
