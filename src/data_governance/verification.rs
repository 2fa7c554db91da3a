//! # 备份校验
//!
//! 只读地校验备份内容：逐库检查校验和、`PRAGMA integrity_check`、必需表和 schema 版本。
//! 数据库快照以只读方式单独打开，从不触碰线上数据库；单个数据库失败不会中断其它数据库的校验。

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::backup_common::calculate_file_hash;
use crate::data_governance::backup::{
    assets, AssetVerifyError, BackupError, BackupFile, BackupManager, BackupManifest,
    MANIFEST_FILENAME,
};
use crate::data_governance::database::{self, DatabaseSet};
use crate::data_governance::migration;
use crate::data_governance::schema_registry::{self, DatabaseId};

/// 单个数据库的校验结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseVerifyResult {
    pub id: DatabaseId,
    pub is_valid: bool,
    pub schema_version: Option<u32>,
    pub error: Option<String>,
}

impl DatabaseVerifyResult {
    fn ok(id: DatabaseId, schema_version: u32) -> Self {
        Self {
            id,
            is_valid: true,
            schema_version: Some(schema_version),
            error: None,
        }
    }

    fn failed(id: DatabaseId, error: impl Into<String>) -> Self {
        Self {
            id,
            is_valid: false,
            schema_version: None,
            error: Some(error.into()),
        }
    }
}

/// 备份校验结果
///
/// `is_valid` 为所有数据库、附加文件和资产都通过；失败时仍保留每个数据库的结果。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResult {
    pub backup_id: String,
    pub is_valid: bool,
    pub databases_verified: Vec<DatabaseVerifyResult>,
    pub errors: Vec<String>,
    #[serde(default)]
    pub asset_errors: Vec<AssetVerifyError>,
}

impl VerifyResult {
    /// 第一个失败的数据库
    pub fn first_failed_database(&self) -> Option<&DatabaseVerifyResult> {
        self.databases_verified.iter().find(|d| !d.is_valid)
    }

    pub fn total_errors(&self) -> usize {
        self.errors.len() + self.asset_errors.len()
    }
}

/// 备份校验服务
pub struct VerificationService<'a> {
    manager: &'a BackupManager,
}

impl<'a> VerificationService<'a> {
    pub fn new(manager: &'a BackupManager) -> Self {
        Self { manager }
    }

    /// 校验已登记的备份
    ///
    /// 备份正被恢复流程引用时返回 [`BackupError::Pinned`]。
    pub fn verify(&self, backup_id: &str) -> Result<VerifyResult, BackupError> {
        if self.manager.is_pinned(backup_id) {
            return Err(BackupError::Pinned(backup_id.to_string()));
        }
        self.verify_unpinned(backup_id)
    }

    /// 恢复流程持有引用时使用
    pub(crate) fn verify_unpinned(&self, backup_id: &str) -> Result<VerifyResult, BackupError> {
        let manifest = self.manager.load_manifest(backup_id)?;
        let dir = self.manager.backup_path(backup_id)?;
        Ok(verify_backup_dir(&manifest, &dir))
    }
}

/// 校验备份目录（只读）
pub fn verify_backup_dir(manifest: &BackupManifest, backup_dir: &Path) -> VerifyResult {
    info!("[Verify] 开始校验备份: {}", manifest.backup_id);
    let mut databases_verified = Vec::new();
    let mut errors = Vec::new();

    if let Err(e) = manifest.check_format_version() {
        errors.push(e.to_string());
    }
    if !backup_dir.join(MANIFEST_FILENAME).exists() {
        errors.push("清单文件不存在".to_string());
    }

    for file in &manifest.files {
        match file.database_id.as_deref().and_then(DatabaseId::parse) {
            Some(id) if file.path.ends_with(".db") => {
                let result = verify_snapshot_file(id, file, backup_dir);
                if let Some(error) = &result.error {
                    warn!("[Verify] 数据库 {} 校验失败: {}", id, error);
                    errors.push(format!("{}: {}", id, error));
                }
                databases_verified.push(result);
            }
            _ => {
                if let Err(e) = verify_file_checksum(file, backup_dir) {
                    errors.push(e);
                }
            }
        }
    }

    let asset_errors = manifest
        .assets
        .as_ref()
        .map(|a| assets::verify_assets(backup_dir, &a.files))
        .unwrap_or_default();

    let is_valid =
        databases_verified.iter().all(|d| d.is_valid) && errors.is_empty() && asset_errors.is_empty();
    info!(
        "[Verify] 校验完成: {} valid={}, databases={}, errors={}, asset_errors={}",
        manifest.backup_id,
        is_valid,
        databases_verified.len(),
        errors.len(),
        asset_errors.len()
    );

    VerifyResult {
        backup_id: manifest.backup_id.clone(),
        is_valid,
        databases_verified,
        errors,
        asset_errors,
    }
}

fn verify_file_checksum(file: &BackupFile, backup_dir: &Path) -> Result<(), String> {
    let path = backup_dir.join(&file.path);
    if !path.exists() {
        return Err(format!("文件不存在: {}", file.path));
    }
    let actual = calculate_file_hash(&path).map_err(|e| format!("计算校验和失败 {}: {}", file.path, e))?;
    if actual != file.sha256 {
        return Err(format!(
            "校验和不匹配 {}: expected={}, actual={}",
            file.path, file.sha256, actual
        ));
    }
    Ok(())
}

/// 校验单个数据库快照
fn verify_snapshot_file(id: DatabaseId, file: &BackupFile, backup_dir: &Path) -> DatabaseVerifyResult {
    if let Err(e) = verify_file_checksum(file, backup_dir) {
        return DatabaseVerifyResult::failed(id, e);
    }
    let path = backup_dir.join(&file.path);
    let conn = match database::open_snapshot_read_only(id, &path) {
        Ok(conn) => conn,
        Err(e) => return DatabaseVerifyResult::failed(id, format!("无法打开快照: {}", e)),
    };
    match check_structure(id, &conn) {
        Ok(version) => {
            debug!("[Verify] 快照校验通过: {} (v{})", id, version);
            DatabaseVerifyResult::ok(id, version)
        }
        Err(e) => DatabaseVerifyResult::failed(id, e),
    }
}

/// 结构检查：integrity_check、schema 版本上限、必需表
fn check_structure(id: DatabaseId, conn: &rusqlite::Connection) -> Result<u32, String> {
    database::run_integrity_check(id, conn).map_err(|e| e.to_string())?;

    let version = schema_registry::read_schema_version(conn).map_err(|e| e.to_string())?;
    let target = migration::target_version(id);
    if version > target {
        return Err(format!(
            "schema 版本 v{} 高于当前构建支持的 v{}（备份来自更新的版本）",
            version, target
        ));
    }

    let missing: Vec<&str> = migration::get_migration_set(id)
        .migrations
        .iter()
        .filter(|m| m.refinery_version as u32 <= version)
        .flat_map(|m| m.expected_tables.iter().copied())
        .filter(|table| !schema_registry::table_exists(conn, table).unwrap_or(false))
        .collect();
    if !missing.is_empty() {
        return Err(format!("缺少必需的表: {}", missing.join(", ")));
    }
    Ok(version)
}

/// 校验恢复后的线上数据库
///
/// 每个 `expected` 中的数据库都要通过结构检查，且版本与备份清单一致。
pub fn verify_live_databases(
    databases: &DatabaseSet,
    expected: &BackupManifest,
) -> Vec<DatabaseVerifyResult> {
    expected
        .database_files()
        .map(|(id, _)| {
            let Some(db) = databases.get(id) else {
                return DatabaseVerifyResult::failed(id, "数据库未注册");
            };
            let conn = match db.open() {
                Ok(conn) => conn,
                Err(e) => return DatabaseVerifyResult::failed(id, e.to_string()),
            };
            match check_structure(id, &conn) {
                Ok(version) => match expected.schema_versions.get(id.as_str()) {
                    Some(&v) if v != version => DatabaseVerifyResult::failed(
                        id,
                        format!("恢复后版本 v{} 与备份 v{} 不一致", version, v),
                    ),
                    _ => DatabaseVerifyResult::ok(id, version),
                },
                Err(e) => DatabaseVerifyResult::failed(id, e),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_common::calculate_file_hash;
    use crate::data_governance::backup::test_support::{manager, never, no_progress};
    use crate::data_governance::backup::BackupSelection;
    use assert_matches::assert_matches;
    use std::fs;
    use tempfile::TempDir;

    fn create_backup(manager: &BackupManager) -> String {
        manager
            .create_backup(&BackupSelection::core_only(), true, &mut no_progress(), &never)
            .unwrap()
            .manifest
            .backup_id
    }

    /// 修改快照后重写清单中的校验和，只留下结构问题
    fn tamper_snapshot(manager: &BackupManager, backup_id: &str, id: DatabaseId, sql: &str) {
        let dir = manager.backup_path(backup_id).unwrap();
        let path = dir.join(id.file_name());
        rusqlite::Connection::open(&path).unwrap().execute_batch(sql).unwrap();
        let manifest_path = dir.join(MANIFEST_FILENAME);
        let mut manifest = BackupManifest::load_from_file(&manifest_path).unwrap();
        for file in manifest.files.iter_mut() {
            if file.path == id.file_name() {
                file.sha256 = calculate_file_hash(&path).unwrap();
                file.size = fs::metadata(&path).unwrap().len();
            }
        }
        manifest.save_to_file(&manifest_path).unwrap();
    }

    #[test]
    fn test_verify_valid_backup() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        let id = create_backup(&manager);

        let result = VerificationService::new(&manager).verify(&id).unwrap();
        assert!(result.is_valid, "{:?}", result.errors);
        assert_eq!(result.databases_verified.len(), 5);
        assert!(result.databases_verified.iter().all(|d| d.is_valid));
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_one_corrupt_database_keeps_other_results() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        let id = create_backup(&manager);
        let path = manager.backup_path(&id).unwrap().join(DatabaseId::Graph.file_name());
        let mut bytes = fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let result = VerificationService::new(&manager).verify(&id).unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.databases_verified.len(), 5);
        let failed = result.first_failed_database().unwrap();
        assert_eq!(failed.id, DatabaseId::Graph);
        assert!(failed.error.as_deref().unwrap().contains("校验和不匹配"));
        assert_eq!(result.databases_verified.iter().filter(|d| d.is_valid).count(), 4);
    }

    #[test]
    fn test_backup_from_newer_build_is_invalid() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        let id = create_backup(&manager);
        tamper_snapshot(
            &manager,
            &id,
            DatabaseId::Vectors,
            "INSERT INTO refinery_schema_history (version, name, applied_on, checksum) VALUES (29990101, 'future', '2999-01-01', '0');",
        );

        let result = VerificationService::new(&manager).verify(&id).unwrap();
        assert!(!result.is_valid);
        let vectors = result
            .databases_verified
            .iter()
            .find(|d| d.id == DatabaseId::Vectors)
            .unwrap();
        assert!(vectors.error.as_deref().unwrap().contains("高于"));
    }

    #[test]
    fn test_missing_required_table_is_reported() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        let id = create_backup(&manager);
        tamper_snapshot(&manager, &id, DatabaseId::Notes, "DROP TABLE note_versions;");

        let result = VerificationService::new(&manager).verify(&id).unwrap();
        let notes = result
            .databases_verified
            .iter()
            .find(|d| d.id == DatabaseId::Notes)
            .unwrap();
        assert!(!notes.is_valid);
        assert!(notes.error.as_deref().unwrap().contains("note_versions"));
    }

    #[test]
    fn test_verify_refuses_backup_pinned_by_restore() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        let id = create_backup(&manager);
        let _pin = manager.pin(&id);
        assert_matches!(
            VerificationService::new(&manager).verify(&id),
            Err(BackupError::Pinned(_))
        );
    }

    #[test]
    fn test_verify_does_not_modify_backup() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        let id = create_backup(&manager);
        let backup_dir = manager.backup_path(&id).unwrap();
        let before: Vec<_> = fs::read_dir(&backup_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        VerificationService::new(&manager).verify(&id).unwrap();
        let after: Vec<_> = fs::read_dir(&backup_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(before.len(), after.len());
    }
}
