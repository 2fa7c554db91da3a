//! # Backup 模块
//!
//! 原子性备份系统。
//!
//! ## 设计原则
//!
//! 1. **时间点一致**：每个数据库通过 [`Database::dump`] 生成快照（SQLite Backup API）
//! 2. **可验证**：每个文件都有 SHA256 校验和，记录在 `manifest.json`
//! 3. **分层**：Core 层可以单独恢复，其它层级只是附加数据
//! 4. **增量**：基于 `__change_log` 表导出变更（仅用于留档，不能直接恢复）
//! 5. **不完整即不可见**：取消或中断的备份保留 `complete = false` 的清单，永不进入目录
//!
//! ## 目录布局
//!
//! ```text
//! <backup_dir>/
//!   <backup_id>/manifest.json, <db>.db, assets/<type>/...
//!   .staging/<backup_id>/      不登记到目录的输出（仅用于导出）
//!   .pre_restore/<restore_id>/ 恢复前安全快照
//!   .importing/<job_id>/       正在导入的 ZIP 解压目录
//! ```

pub mod assets;
pub mod zip_export;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::backup_common::{self, calculate_file_hash, log_and_skip_entry_err, CommonError};
use crate::data_governance::audit::{AuditLogger, AuditOperation, BackupType as AuditBackupType};
use crate::data_governance::database::{self, Database, DatabaseError, DatabaseSet};
use crate::data_governance::migration;
use crate::data_governance::schema_registry::{self, DatabaseId};

pub use assets::{
    AssetBackupConfig, AssetBackupError, AssetBackupResult, AssetType, AssetTypeStats,
    AssetVerifyError, BackedUpAsset,
};
pub use zip_export::{ZipExportError, ZipExportOptions, ZipExportResult, ZipImportResult};

/// 备份清单格式版本
pub const MANIFEST_VERSION: &str = "1.0.0";

/// 当前构建支持的最大清单主版本号
pub const MANIFEST_MAX_SUPPORTED_MAJOR: u64 = 1;

pub const MANIFEST_FILENAME: &str = "manifest.json";

/// 恢复前安全快照目录
pub const PRE_RESTORE_DIR: &str = ".pre_restore";

/// 不登记到目录的备份输出目录
pub const STAGING_DIR: &str = ".staging";

/// ZIP 导入的解压目录
pub const IMPORTING_DIR: &str = ".importing";

/// 备份 ID 最大长度
const MAX_BACKUP_ID_LEN: usize = 128;

/// 生成备份 ID（目录名）
///
/// 格式 `%Y%m%d_%H%M%S_<rand8>_<ms>`，只含 `[0-9A-Za-z_]`，带时间戳前缀便于排序。
fn generate_backup_id_at(now: chrono::DateTime<chrono::Utc>, suffix: Option<&str>) -> String {
    let timestamp = now.format("%Y%m%d_%H%M%S");
    let millis = now.timestamp_subsec_millis();
    let rand8: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();

    match suffix {
        Some(s) if !s.trim().is_empty() => {
            format!("{}_{}_{:03}_{}", timestamp, rand8, millis, s.trim())
        }
        _ => format!("{}_{}_{:03}", timestamp, rand8, millis),
    }
}

/// 校验备份 ID
///
/// 拒绝空值、路径分隔符、`..`、URL 编码的点以及以 `.` 开头的内部目录名。
pub fn validate_backup_id(backup_id: &str) -> Result<(), BackupError> {
    let invalid = |reason: &str| {
        Err(BackupError::InvalidBackupId(format!(
            "{} ({})",
            reason, backup_id
        )))
    };
    if backup_id.is_empty() || backup_id.len() > MAX_BACKUP_ID_LEN {
        return invalid("长度无效");
    }
    if backup_id.contains("..") || backup_id.to_ascii_lowercase().contains("%2e") {
        return invalid("包含目录穿越");
    }
    if backup_id.starts_with('.') || Path::new(backup_id).is_absolute() {
        return invalid("不允许的前缀");
    }
    if !backup_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return invalid("包含非法字符");
    }
    Ok(())
}

/// 备份类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Full,
    Incremental,
}

/// 备份清单
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    /// 清单格式版本
    pub version: String,
    pub app_version: String,
    pub created_at: String,
    pub platform: String,
    #[serde(default)]
    pub backup_id: String,
    /// 各数据库的 schema 版本
    pub schema_versions: BTreeMap<String, u32>,
    /// 数据库快照与变更文件
    pub files: Vec<BackupFile>,
    pub is_incremental: bool,
    pub incremental_base: Option<String>,
    /// 分层备份的层级（空表示非分层全量备份）
    #[serde(default)]
    pub tiers: Vec<BackupTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<AssetBackupResult>,
    /// 备份是否完整写完（取消/中断时为 false）
    #[serde(default)]
    pub complete: bool,
}

/// 备份文件信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    /// 相对备份目录的路径
    pub path: String,
    pub size: u64,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_id: Option<String>,
}

impl BackupManifest {
    pub fn new(app_version: &str) -> Self {
        let now = chrono::Utc::now();
        Self {
            version: MANIFEST_VERSION.to_string(),
            app_version: app_version.to_string(),
            created_at: now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            platform: std::env::consts::OS.to_string(),
            backup_id: generate_backup_id_at(now, None),
            schema_versions: BTreeMap::new(),
            files: Vec::new(),
            is_incremental: false,
            incremental_base: None,
            tiers: Vec::new(),
            assets: None,
            complete: false,
        }
    }

    pub fn add_file(&mut self, file: BackupFile) {
        self.files.push(file);
    }

    pub fn set_schema_version(&mut self, db_id: DatabaseId, version: u32) {
        self.schema_versions.insert(db_id.as_str().to_string(), version);
    }

    pub fn kind(&self) -> BackupKind {
        if self.is_incremental {
            BackupKind::Incremental
        } else {
            BackupKind::Full
        }
    }

    /// 清单中的数据库快照（`<id>.db`）
    pub fn database_files(&self) -> impl Iterator<Item = (DatabaseId, &BackupFile)> {
        self.files.iter().filter_map(|f| {
            let id = f.database_id.as_deref().and_then(DatabaseId::parse)?;
            f.path.ends_with(".db").then_some((id, f))
        })
    }

    /// 备份涉及的数据库
    pub fn database_ids(&self) -> Vec<DatabaseId> {
        let mut ids: Vec<DatabaseId> = self
            .files
            .iter()
            .filter_map(|f| f.database_id.as_deref().and_then(DatabaseId::parse))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// 有效层级（非分层备份视为 Core）
    pub fn effective_tiers(&self) -> Vec<BackupTier> {
        if self.tiers.is_empty() {
            vec![BackupTier::Core]
        } else {
            self.tiers.clone()
        }
    }

    /// 原子写入：临时文件 + fsync + rename
    pub fn save_to_file(&self, path: &Path) -> Result<(), BackupError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BackupError::Manifest(format!("序列化清单失败: {}", e)))?;

        let temp_path = path.with_extension("json.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;

        fs::rename(&temp_path, path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            BackupError::Io(e)
        })?;
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, BackupError> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| BackupError::Manifest(format!("解析清单失败: {}", e)))
    }

    /// 检查清单格式版本
    pub fn check_format_version(&self) -> Result<(), BackupError> {
        let major = self
            .version
            .split('.')
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| BackupError::Manifest(format!("无法解析清单版本: {}", self.version)))?;
        if major == 0 || major > MANIFEST_MAX_SUPPORTED_MAJOR {
            return Err(BackupError::VersionIncompatible(format!(
                "备份清单版本 {} 不受支持（当前支持 {}.x.x）",
                self.version, MANIFEST_MAX_SUPPORTED_MAJOR
            )));
        }
        Ok(())
    }

    /// 版本兼容性检查
    ///
    /// 1. 清单格式主版本受支持
    /// 2. 不包含未知数据库
    /// 3. schema 版本不超过当前构建已知的最新版本
    pub fn check_compatibility(&self) -> Result<(), BackupError> {
        self.check_format_version()?;

        for file in &self.files {
            if let Some(db) = &file.database_id {
                if DatabaseId::parse(db).is_none() {
                    return Err(BackupError::VersionIncompatible(format!(
                        "备份中包含当前构建未知的数据库 \"{}\"（文件: {}）",
                        db, file.path
                    )));
                }
            }
        }

        for (db_name, &version) in &self.schema_versions {
            let id = DatabaseId::parse(db_name).ok_or_else(|| {
                BackupError::VersionIncompatible(format!("备份中包含未知数据库 \"{}\"", db_name))
            })?;
            let target = migration::target_version(id);
            if version > target {
                return Err(BackupError::VersionIncompatible(format!(
                    "数据库 {} 的 schema 版本 (v{}) 高于当前构建支持的版本 (v{})",
                    db_name, version, target
                )));
            }
        }
        Ok(())
    }

    /// 检查是否可以作为恢复目标
    ///
    /// 增量备份和不含 Core 层的分层备份都不能恢复。
    pub fn check_restorable(&self) -> Result<(), BackupError> {
        if !self.complete {
            return Err(BackupError::Manifest(format!(
                "备份 {} 不完整，不能恢复",
                self.backup_id
            )));
        }
        if self.is_incremental {
            return Err(BackupError::IncrementalRestoreNotSupported);
        }
        if !self.effective_tiers().contains(&BackupTier::Core) {
            return Err(BackupError::InvalidTierSet(format!(
                "层级 {:?} 不包含 Core，不能单独恢复",
                self.tiers
            )));
        }
        if self.database_files().next().is_none() {
            return Err(BackupError::InvalidTierSet(
                "备份中没有任何数据库快照".to_string(),
            ));
        }
        self.check_compatibility()
    }
}

/// 增量备份导出的变更记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: i64,
    pub table_name: String,
    pub record_id: String,
    pub operation: String,
    pub changed_at: String,
    pub sync_version: i64,
}

/// 备份进度阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStage {
    Preparing,
    CopyingDatabase,
    CopyingAssets,
    Finalizing,
    Completed,
}

/// 备份进度信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupProgress {
    pub stage: BackupStage,
    pub current_item: Option<String>,
    pub processed_items: u64,
    pub total_items: u64,
}

/// 备份错误
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Checksum mismatch for {database}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        database: String,
        expected: String,
        actual: String,
    },

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Integrity check failed for {database}: {detail}")]
    IntegrityCheckFailed { database: String, detail: String },

    #[error("Backup directory error: {0}")]
    BackupDirectory(String),

    #[error("Invalid backup id: {0}")]
    InvalidBackupId(String),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Version incompatible: {0}")]
    VersionIncompatible(String),

    #[error("Incremental backups cannot be restored; use a full backup")]
    IncrementalRestoreNotSupported,

    #[error("Invalid tier set: {0}")]
    InvalidTierSet(String),

    #[error("Backup {0} is referenced by an in-flight restore")]
    Pinned(String),

    #[error("Insufficient disk space: required {required} bytes, available {available} bytes")]
    InsufficientDiskSpace { required: u64, available: u64 },

    #[error("Asset error: {0}")]
    Assets(String),

    #[error("Backup cancelled")]
    Cancelled,
}

impl From<rusqlite::Error> for BackupError {
    fn from(err: rusqlite::Error) -> Self {
        BackupError::Database(err.to_string())
    }
}

impl From<DatabaseError> for BackupError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Io { source, .. } => BackupError::Io(source),
            DatabaseError::Integrity { database, detail } => {
                BackupError::IntegrityCheckFailed { database, detail }
            }
            other => BackupError::Database(other.to_string()),
        }
    }
}

impl From<AssetBackupError> for BackupError {
    fn from(err: AssetBackupError) -> Self {
        match err {
            AssetBackupError::Cancelled => BackupError::Cancelled,
            AssetBackupError::Io(e) => BackupError::Io(e),
            other => BackupError::Assets(other.to_string()),
        }
    }
}

impl From<CommonError> for BackupError {
    fn from(err: CommonError) -> Self {
        match err {
            CommonError::InsufficientSpace {
                required,
                available,
            } => BackupError::InsufficientDiskSpace {
                required,
                available,
            },
            other => BackupError::BackupDirectory(other.to_string()),
        }
    }
}

// ============================================================================
// 分层备份
// ============================================================================

/// 备份层级
///
/// - Core: 全部受治理数据库，可以单独恢复
/// - Important: 笔记附件、学科资源、工作空间
/// - Rebuildable: VFS blob（可由资源重建）
/// - LargeAssets: 图片、文档、音视频
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupTier {
    Core,
    Important,
    Rebuildable,
    LargeAssets,
}

impl BackupTier {
    /// 此层级包含的数据库
    pub fn databases(&self) -> Vec<DatabaseId> {
        match self {
            BackupTier::Core => DatabaseId::all_ordered(),
            BackupTier::Important | BackupTier::Rebuildable | BackupTier::LargeAssets => vec![],
        }
    }

    /// 此层级包含的资产类型
    pub fn asset_types(&self) -> Vec<AssetType> {
        AssetType::ALL
            .iter()
            .copied()
            .filter(|t| t.tier() == *self)
            .collect()
    }

    /// 数字越小优先级越高
    pub fn priority(&self) -> u8 {
        match self {
            BackupTier::Core => 0,
            BackupTier::Important => 1,
            BackupTier::Rebuildable => 2,
            BackupTier::LargeAssets => 3,
        }
    }

    pub fn all_ordered() -> Vec<BackupTier> {
        vec![
            BackupTier::Core,
            BackupTier::Important,
            BackupTier::Rebuildable,
            BackupTier::LargeAssets,
        ]
    }
}

/// 备份选择
///
/// 按层级选择，显式包含/排除数据库，可选附带资产。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSelection {
    /// 要备份的层级（空表示非分层全量：全部数据库）
    #[serde(default)]
    pub tiers: Vec<BackupTier>,
    /// 显式包含的数据库（覆盖层级设置）
    #[serde(default)]
    pub include_databases: Vec<DatabaseId>,
    #[serde(default)]
    pub exclude_databases: Vec<DatabaseId>,
    #[serde(default)]
    pub include_assets: bool,
    /// 资产类型过滤（空表示所选层级的全部类型）
    #[serde(default)]
    pub asset_types: Vec<AssetType>,
}

impl Default for BackupSelection {
    fn default() -> Self {
        Self::core_only()
    }
}

impl BackupSelection {
    /// 仅核心数据库
    pub fn core_only() -> Self {
        Self {
            tiers: vec![BackupTier::Core],
            include_databases: vec![],
            exclude_databases: vec![],
            include_assets: false,
            asset_types: vec![],
        }
    }

    /// 核心 + 重要
    pub fn recommended() -> Self {
        Self {
            tiers: vec![BackupTier::Core, BackupTier::Important],
            include_assets: true,
            ..Self::core_only()
        }
    }

    /// 全部层级与资产
    pub fn full() -> Self {
        Self {
            tiers: BackupTier::all_ordered(),
            include_assets: true,
            ..Self::core_only()
        }
    }

    /// 仅指定层级
    pub fn tiers(tiers: &[BackupTier]) -> Self {
        Self {
            tiers: tiers.to_vec(),
            include_assets: tiers.iter().any(|t| *t != BackupTier::Core),
            ..Self::core_only()
        }
    }

    pub fn should_backup_database(&self, db_id: DatabaseId) -> bool {
        if self.exclude_databases.contains(&db_id) {
            return false;
        }
        if self.include_databases.contains(&db_id) {
            return true;
        }
        if self.tiers.is_empty() {
            return true;
        }
        self.tiers.iter().any(|t| t.databases().contains(&db_id))
    }

    /// 需要备份的资产类型
    pub fn selected_asset_types(&self) -> Vec<AssetType> {
        if !self.include_assets {
            return vec![];
        }
        let tier_types: Vec<AssetType> = if self.tiers.is_empty() {
            AssetType::all()
        } else {
            self.tiers.iter().flat_map(|t| t.asset_types()).collect()
        };
        let mut types: Vec<AssetType> = if self.asset_types.is_empty() {
            tier_types
        } else {
            self.asset_types
                .iter()
                .copied()
                .filter(|t| self.tiers.is_empty() || tier_types.contains(t))
                .collect()
        };
        types.sort();
        types.dedup();
        types
    }
}

/// 目录中的备份条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupCatalogEntry {
    pub id: String,
    pub created_at: String,
    pub size_bytes: u64,
    pub backup_type: BackupKind,
    pub tier_set: Vec<BackupTier>,
    pub databases: Vec<DatabaseId>,
    pub includes_assets: bool,
    pub asset_types: Vec<AssetType>,
    pub app_version: String,
    pub incremental_base: Option<String>,
}

impl BackupCatalogEntry {
    pub fn from_manifest(manifest: &BackupManifest, size_bytes: u64) -> Self {
        let asset_types = manifest
            .assets
            .as_ref()
            .map(|a| a.asset_types())
            .unwrap_or_default();
        Self {
            id: manifest.backup_id.clone(),
            created_at: manifest.created_at.clone(),
            size_bytes,
            backup_type: manifest.kind(),
            tier_set: manifest.effective_tiers(),
            databases: manifest.database_ids(),
            includes_assets: !asset_types.is_empty(),
            asset_types,
            app_version: manifest.app_version.clone(),
            incremental_base: manifest.incremental_base.clone(),
        }
    }
}

/// 备份结果
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub manifest: BackupManifest,
    /// 备份目录（登记或暂存）
    pub path: PathBuf,
    /// 已登记到目录时的条目
    pub catalog_entry: Option<BackupCatalogEntry>,
    /// 保留策略删除的旧备份
    pub removed_by_retention: Vec<String>,
}

// ============================================================================
// 备份引用（恢复进行中时禁止删除 / 校验同一备份）
// ============================================================================

/// 备份引用计数
#[derive(Debug, Default)]
pub struct BackupPins {
    pins: Mutex<HashMap<String, usize>>,
}

impl BackupPins {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.pins.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_pinned(&self, backup_id: &str) -> bool {
        self.lock().get(backup_id).copied().unwrap_or(0) > 0
    }

    pub fn pinned_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

/// 备份引用守卫，析构时释放
#[derive(Debug)]
pub struct BackupPin {
    pins: Arc<BackupPins>,
    backup_id: String,
}

impl BackupPin {
    pub fn backup_id(&self) -> &str {
        &self.backup_id
    }
}

impl Drop for BackupPin {
    fn drop(&mut self) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&self.backup_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                pins.remove(&self.backup_id);
            }
        }
    }
}

// ============================================================================
// BackupManager
// ============================================================================

/// 备份管理器
///
/// 负责数据库与资产的全量、增量、分层备份，备份目录维护与保留策略。
pub struct BackupManager {
    backup_dir: PathBuf,
    data_dir: PathBuf,
    databases: DatabaseSet,
    app_version: String,
    asset_config: AssetBackupConfig,
    /// 保留的完整备份数量（None 表示不限制）
    max_backup_count: Option<usize>,
    disk_space_multiplier: u64,
    pins: Arc<BackupPins>,
    audit: Option<AuditLogger>,
}

impl BackupManager {
    pub fn new(backup_dir: PathBuf, data_dir: PathBuf, databases: DatabaseSet) -> Self {
        Self {
            backup_dir,
            data_dir,
            databases,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            asset_config: AssetBackupConfig::default(),
            max_backup_count: None,
            disk_space_multiplier: 2,
            pins: Arc::new(BackupPins::default()),
            audit: None,
        }
    }

    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }

    pub fn with_asset_config(mut self, config: AssetBackupConfig) -> Self {
        self.asset_config = config;
        self
    }

    pub fn with_retention(mut self, max_backup_count: Option<usize>) -> Self {
        self.max_backup_count = max_backup_count;
        self
    }

    pub fn with_disk_space_multiplier(mut self, multiplier: u64) -> Self {
        self.disk_space_multiplier = multiplier.max(1);
        self
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn databases(&self) -> &DatabaseSet {
        &self.databases
    }

    pub fn app_version(&self) -> &str {
        &self.app_version
    }

    pub fn disk_space_multiplier(&self) -> u64 {
        self.disk_space_multiplier
    }

    pub fn pins(&self) -> &Arc<BackupPins> {
        &self.pins
    }

    /// 标记备份被恢复流程引用
    pub fn pin(&self, backup_id: &str) -> BackupPin {
        *self.pins.lock().entry(backup_id.to_string()).or_insert(0) += 1;
        BackupPin {
            pins: self.pins.clone(),
            backup_id: backup_id.to_string(),
        }
    }

    pub fn is_pinned(&self, backup_id: &str) -> bool {
        self.pins.is_pinned(backup_id)
    }

    /// 登记备份的目录路径
    pub fn backup_path(&self, backup_id: &str) -> Result<PathBuf, BackupError> {
        validate_backup_id(backup_id)?;
        Ok(self.backup_dir.join(backup_id))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.backup_dir.join(STAGING_DIR)
    }

    pub fn pre_restore_dir(&self) -> PathBuf {
        self.backup_dir.join(PRE_RESTORE_DIR)
    }

    /// 在 `parent` 下创建不与现有目录冲突的备份子目录
    ///
    /// 使用 `create_dir` 而不是 `create_dir_all`，目录已存在时换一个 ID。
    fn create_unique_subdir(
        &self,
        parent: &Path,
        suffix: Option<&str>,
    ) -> Result<(String, PathBuf), BackupError> {
        fs::create_dir_all(parent)?;
        for _ in 0..10 {
            let backup_id = generate_backup_id_at(chrono::Utc::now(), suffix);
            let dir = parent.join(&backup_id);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((backup_id, dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(BackupError::Io(e)),
            }
        }
        Err(BackupError::BackupDirectory(
            "无法生成唯一备份目录（多次尝试均冲突）".to_string(),
        ))
    }

    /// 预估备份大小
    pub fn estimate_size(&self, selection: &BackupSelection) -> u64 {
        let db_size: u64 = self
            .databases
            .iter()
            .filter(|db| selection.should_backup_database(db.id()))
            .filter_map(|db| fs::metadata(db.live_path()).ok())
            .map(|m| m.len())
            .sum();
        let asset_size: u64 = assets::scan_assets(&self.data_dir, &selection.selected_asset_types())
            .values()
            .map(|s| s.total_size)
            .sum();
        db_size + asset_size
    }

    /// 创建备份
    ///
    /// 1. 预检磁盘空间
    /// 2. 创建目录并写入 `complete = false` 的清单
    /// 3. 逐库生成快照并计算校验和
    /// 4. 复制所选资产
    /// 5. 标记清单完成；登记时执行保留策略
    ///
    /// `add_to_catalog = false` 时输出写入 `.staging/`，不出现在目录中。
    pub fn create_backup(
        &self,
        selection: &BackupSelection,
        add_to_catalog: bool,
        progress: &mut dyn FnMut(BackupProgress),
        should_cancel: &dyn Fn() -> bool,
    ) -> Result<BackupOutcome, BackupError> {
        let selected: Vec<DatabaseId> = self
            .databases
            .ids()
            .into_iter()
            .filter(|id| selection.should_backup_database(*id))
            .collect();
        let asset_types = selection.selected_asset_types();
        if selected.is_empty() && asset_types.is_empty() {
            return Err(BackupError::InvalidTierSet(format!(
                "备份选择为空: tiers={:?}",
                selection.tiers
            )));
        }

        let audit_handle = self.audit.as_ref().map(|audit| {
            audit.start(
                AuditOperation::Backup {
                    backup_type: AuditBackupType::Full,
                    file_count: 0,
                    total_size: 0,
                },
                "backup",
            )
        });

        let result = self.create_backup_inner(
            selection,
            &selected,
            &asset_types,
            add_to_catalog,
            progress,
            should_cancel,
        );

        if let (Some(audit), Some(handle)) = (&self.audit, audit_handle) {
            match &result {
                Ok(outcome) => {
                    let total_size: u64 = outcome.manifest.files.iter().map(|f| f.size).sum::<u64>()
                        + outcome.manifest.assets.as_ref().map(|a| a.total_size).unwrap_or(0);
                    audit.complete(
                        handle,
                        Some(AuditOperation::Backup {
                            backup_type: AuditBackupType::Full,
                            file_count: outcome.manifest.files.len(),
                            total_size,
                        }),
                        serde_json::json!({
                            "backup_id": outcome.manifest.backup_id,
                            "registered": outcome.catalog_entry.is_some(),
                            "tiers": outcome.manifest.tiers,
                            "removed_by_retention": outcome.removed_by_retention,
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

    fn create_backup_inner(
        &self,
        selection: &BackupSelection,
        selected: &[DatabaseId],
        asset_types: &[AssetType],
        add_to_catalog: bool,
        progress: &mut dyn FnMut(BackupProgress),
        should_cancel: &dyn Fn() -> bool,
    ) -> Result<BackupOutcome, BackupError> {
        let total_items = selected.len() as u64 + u64::from(!asset_types.is_empty());
        progress(BackupProgress {
            stage: BackupStage::Preparing,
            current_item: None,
            processed_items: 0,
            total_items,
        });

        let estimated = self.estimate_size(selection);
        fs::create_dir_all(&self.backup_dir)?;
        backup_common::check_disk_space(&self.backup_dir, estimated, self.disk_space_multiplier)?;

        let parent = if add_to_catalog {
            self.backup_dir.clone()
        } else {
            self.staging_dir()
        };
        let (backup_id, dir) = self.create_unique_subdir(&parent, None)?;
        info!(
            "[Backup] 开始备份: id={}, databases={:?}, assets={:?}, catalog={}",
            backup_id, selected, asset_types, add_to_catalog
        );

        let mut manifest = BackupManifest::new(&self.app_version);
        manifest.backup_id = backup_id.clone();
        manifest.tiers = selection.tiers.clone();
        let manifest_path = dir.join(MANIFEST_FILENAME);
        manifest.save_to_file(&manifest_path)?;

        let mut processed = 0u64;
        for id in selected {
            if should_cancel() {
                warn!("[Backup] 备份已取消，保留不完整目录: {:?}", dir);
                return Err(BackupError::Cancelled);
            }
            progress(BackupProgress {
                stage: BackupStage::CopyingDatabase,
                current_item: Some(id.as_str().to_string()),
                processed_items: processed,
                total_items,
            });
            let Some(db) = self.databases.get(*id) else {
                continue;
            };
            if !db.exists() {
                warn!("[Backup] 数据库不存在，跳过: {}", id);
            } else {
                let (file, version) = snapshot_database(db.as_ref(), &dir)?;
                manifest.add_file(file);
                manifest.set_schema_version(*id, version);
            }
            processed += 1;
            // 每个数据库完成后落盘，便于排查中断位置
            manifest.save_to_file(&manifest_path)?;
        }

        if !asset_types.is_empty() {
            progress(BackupProgress {
                stage: BackupStage::CopyingAssets,
                current_item: None,
                processed_items: processed,
                total_items,
            });
            let result = assets::backup_assets(
                &self.data_dir,
                &dir,
                asset_types,
                &self.asset_config,
                should_cancel,
            )?;
            manifest.assets = Some(result);
            processed += 1;
        }

        if should_cancel() {
            return Err(BackupError::Cancelled);
        }

        progress(BackupProgress {
            stage: BackupStage::Finalizing,
            current_item: None,
            processed_items: processed,
            total_items,
        });
        manifest.complete = true;
        manifest.save_to_file(&manifest_path)?;

        let mut outcome = BackupOutcome {
            manifest,
            path: dir.clone(),
            catalog_entry: None,
            removed_by_retention: Vec::new(),
        };
        if add_to_catalog {
            let size = backup_common::directory_size(&dir);
            outcome.catalog_entry = Some(BackupCatalogEntry::from_manifest(&outcome.manifest, size));
            if let Some(keep) = self.max_backup_count {
                outcome.removed_by_retention = self.cleanup_old_backups(keep)?;
            }
        }

        progress(BackupProgress {
            stage: BackupStage::Completed,
            current_item: None,
            processed_items: processed,
            total_items,
        });
        info!(
            "[Backup] 备份完成: id={}, files={}, registered={}",
            backup_id,
            outcome.manifest.files.len(),
            add_to_catalog
        );
        Ok(outcome)
    }

    /// 增量备份
    ///
    /// 导出自基础备份创建以来 `__change_log` 中的变更；没有变更日志表的数据库
    /// 包含完整快照。增量备份会登记到目录，但不能作为恢复目标。
    pub fn create_incremental_backup(
        &self,
        base_id: &str,
        progress: &mut dyn FnMut(BackupProgress),
        should_cancel: &dyn Fn() -> bool,
    ) -> Result<BackupOutcome, BackupError> {
        let base = self.load_manifest(base_id)?;
        if base.is_incremental {
            return Err(BackupError::Manifest(format!(
                "增量备份的基础必须是完整备份: {}",
                base_id
            )));
        }
        info!("[Backup] 开始增量备份，基础备份: {}", base_id);

        let audit_handle = self.audit.as_ref().map(|audit| {
            audit.start(
                AuditOperation::Backup {
                    backup_type: AuditBackupType::Incremental,
                    file_count: 0,
                    total_size: 0,
                },
                base_id,
            )
        });
        let result = self.create_incremental_inner(&base, progress, should_cancel);
        if let (Some(audit), Some(handle)) = (&self.audit, audit_handle) {
            match &result {
                Ok(outcome) => {
                    audit.complete(
                        handle,
                        Some(AuditOperation::Backup {
                            backup_type: AuditBackupType::Incremental,
                            file_count: outcome.manifest.files.len(),
                            total_size: outcome.manifest.files.iter().map(|f| f.size).sum(),
                        }),
                        serde_json::json!({ "backup_id": outcome.manifest.backup_id }),
                    );
                }
                Err(e) => {
                    audit.fail(handle, e.to_string());
                }
            }
        }
        result
    }

    fn create_incremental_inner(
        &self,
        base: &BackupManifest,
        progress: &mut dyn FnMut(BackupProgress),
        should_cancel: &dyn Fn() -> bool,
    ) -> Result<BackupOutcome, BackupError> {
        let (backup_id, dir) = self.create_unique_subdir(&self.backup_dir, Some("incr"))?;
        let mut manifest = BackupManifest::new(&self.app_version);
        manifest.backup_id = backup_id;
        manifest.is_incremental = true;
        manifest.incremental_base = Some(base.backup_id.clone());
        let manifest_path = dir.join(MANIFEST_FILENAME);
        manifest.save_to_file(&manifest_path)?;

        let total_items = self.databases.len() as u64;
        for (idx, db) in self.databases.iter().enumerate() {
            if should_cancel() {
                return Err(BackupError::Cancelled);
            }
            progress(BackupProgress {
                stage: BackupStage::CopyingDatabase,
                current_item: Some(db.id().as_str().to_string()),
                processed_items: idx as u64,
                total_items,
            });
            if !db.exists() {
                continue;
            }
            let conn = db.open()?;
            manifest.set_schema_version(db.id(), schema_registry::read_schema_version(&conn).unwrap_or(0));
            if schema_registry::table_exists(&conn, "__change_log").unwrap_or(false) {
                if let Some(file) = export_changes(db.id(), &conn, &dir, &base.created_at)? {
                    manifest.add_file(file);
                }
            } else {
                drop(conn);
                debug!("[Backup] {} 无变更日志表，包含完整快照", db.id());
                let (file, _) = snapshot_database(db.as_ref(), &dir)?;
                manifest.add_file(file);
            }
        }

        manifest.complete = true;
        manifest.save_to_file(&manifest_path)?;
        let size = backup_common::directory_size(&dir);
        info!(
            "[Backup] 增量备份完成: id={}, files={}",
            manifest.backup_id,
            manifest.files.len()
        );
        Ok(BackupOutcome {
            catalog_entry: Some(BackupCatalogEntry::from_manifest(&manifest, size)),
            manifest,
            path: dir,
            removed_by_retention: Vec::new(),
        })
    }

    /// 恢复前安全快照
    ///
    /// 写入 `.pre_restore/<restore_id>/`，只包含当前存在的数据库；
    /// 清单中缺席的数据库在回滚时会被删除。
    pub fn create_safety_snapshot(
        &self,
        restore_id: &str,
        should_cancel: &dyn Fn() -> bool,
    ) -> Result<(BackupManifest, PathBuf), BackupError> {
        let dir = self.pre_restore_dir().join(restore_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        let estimated: u64 = self
            .databases
            .iter()
            .filter_map(|db| fs::metadata(db.live_path()).ok())
            .map(|m| m.len())
            .sum();
        backup_common::check_disk_space(&dir, estimated, self.disk_space_multiplier)?;

        let mut manifest = BackupManifest::new(&self.app_version);
        manifest.backup_id = restore_id.to_string();
        for db in self.databases.iter() {
            if should_cancel() {
                return Err(BackupError::Cancelled);
            }
            if !db.exists() {
                continue;
            }
            let (file, version) = snapshot_database(db.as_ref(), &dir)?;
            manifest.add_file(file);
            manifest.set_schema_version(db.id(), version);
        }
        manifest.complete = true;
        manifest.save_to_file(&dir.join(MANIFEST_FILENAME))?;
        info!(
            "[Backup] 安全快照完成: {:?}, {} 个数据库",
            dir,
            manifest.files.len()
        );
        Ok((manifest, dir))
    }

    /// 读取已登记备份的清单
    pub fn load_manifest(&self, backup_id: &str) -> Result<BackupManifest, BackupError> {
        let dir = self.backup_path(backup_id)?;
        let manifest_path = dir.join(MANIFEST_FILENAME);
        if !manifest_path.exists() {
            return Err(BackupError::BackupNotFound(backup_id.to_string()));
        }
        let mut manifest = BackupManifest::load_from_file(&manifest_path)?;
        if !manifest.complete {
            return Err(BackupError::BackupNotFound(format!(
                "{}（不完整）",
                backup_id
            )));
        }
        // 以目录名为准
        manifest.backup_id = backup_id.to_string();
        Ok(manifest)
    }

    /// 列出所有完整备份（最新在前）
    pub fn list_backups(&self) -> Result<Vec<BackupManifest>, BackupError> {
        let mut backups = Vec::new();
        if !self.backup_dir.exists() {
            return Ok(backups);
        }

        for entry in fs::read_dir(&self.backup_dir)?.filter_map(log_and_skip_entry_err) {
            let path = entry.path();
            let Some(dir_name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            if dir_name.starts_with('.') || !path.is_dir() {
                continue;
            }
            let manifest_path = path.join(MANIFEST_FILENAME);
            if !manifest_path.exists() {
                continue;
            }
            match BackupManifest::load_from_file(&manifest_path) {
                Ok(mut manifest) if manifest.complete => {
                    if manifest.backup_id != dir_name {
                        warn!(
                            "[Backup] 清单 backup_id 与目录名不一致，以目录名为准: {} vs {}",
                            manifest.backup_id, dir_name
                        );
                        manifest.backup_id = dir_name;
                    }
                    backups.push(manifest);
                }
                Ok(_) => debug!("[Backup] 跳过不完整备份: {}", dir_name),
                Err(e) => warn!("[Backup] 无法加载备份清单 {:?}: {}", manifest_path, e),
            }
        }

        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.backup_id.cmp(&a.backup_id))
        });
        Ok(backups)
    }

    /// 备份目录
    pub fn list_catalog(&self) -> Result<Vec<BackupCatalogEntry>, BackupError> {
        Ok(self
            .list_backups()?
            .iter()
            .map(|m| {
                let size = backup_common::directory_size(&self.backup_dir.join(&m.backup_id));
                BackupCatalogEntry::from_manifest(m, size)
            })
            .collect())
    }

    /// 删除备份（被恢复流程引用时拒绝）
    pub fn delete_backup(&self, backup_id: &str) -> Result<(), BackupError> {
        let dir = self.backup_path(backup_id)?;
        if self.is_pinned(backup_id) {
            return Err(BackupError::Pinned(backup_id.to_string()));
        }
        if !dir.exists() {
            return Err(BackupError::BackupNotFound(backup_id.to_string()));
        }
        fs::remove_dir_all(&dir)?;
        info!("[Backup] 已删除备份: {}", backup_id);
        Ok(())
    }

    /// 保留策略：完整备份超过 `keep_count` 时从最旧的开始删除
    ///
    /// 最新的完整备份和被恢复引用的备份永远不会被删除。
    pub fn cleanup_old_backups(&self, keep_count: usize) -> Result<Vec<String>, BackupError> {
        let keep_count = keep_count.max(1);
        let mut full: Vec<BackupManifest> = self
            .list_backups()?
            .into_iter()
            .filter(|b| !b.is_incremental)
            .collect();
        let mut deleted = Vec::new();
        if full.len() <= keep_count {
            return Ok(deleted);
        }

        // list_backups 最新在前，这里从最旧的开始
        full.reverse();
        let mut remaining = full.len();
        let newest = full.last().map(|b| b.backup_id.clone());
        for backup in &full {
            if remaining <= keep_count {
                break;
            }
            if Some(&backup.backup_id) == newest.as_ref() {
                break;
            }
            if self.is_pinned(&backup.backup_id) {
                debug!("[Backup] 备份被引用，保留: {}", backup.backup_id);
                continue;
            }
            match self.delete_backup(&backup.backup_id) {
                Ok(()) => {
                    deleted.push(backup.backup_id.clone());
                    remaining -= 1;
                }
                Err(e) => warn!("[Backup] 删除旧备份失败 {}: {}", backup.backup_id, e),
            }
        }

        info!("[Backup] 保留策略完成，删除 {} 个旧备份", deleted.len());
        Ok(deleted)
    }

    /// 清理 `.staging/` 下的暂存输出
    pub fn cleanup_staging(&self, backup_id: &str) -> Result<(), BackupError> {
        validate_backup_id(backup_id)?;
        let dir = self.staging_dir().join(backup_id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// 查找登记或暂存的备份目录
    pub fn resolve_backup_dir(&self, backup_id: &str) -> Result<PathBuf, BackupError> {
        let registered = self.backup_path(backup_id)?;
        if registered.join(MANIFEST_FILENAME).exists() {
            return Ok(registered);
        }
        let staged = self.staging_dir().join(backup_id);
        if staged.join(MANIFEST_FILENAME).exists() {
            return Ok(staged);
        }
        Err(BackupError::BackupNotFound(backup_id.to_string()))
    }
}

/// 生成单个数据库快照，返回文件条目和快照内的 schema 版本
fn snapshot_database(db: &dyn Database, dir: &Path) -> Result<(BackupFile, u32), BackupError> {
    let id = db.id();
    let file_name = id.file_name();
    let dest = dir.join(&file_name);
    let size = db.dump(&dest)?;
    let sha256 = calculate_file_hash(&dest).map_err(|e| BackupError::BackupDirectory(e.to_string()))?;
    let version = {
        let conn = database::open_snapshot_read_only(id, &dest)?;
        schema_registry::read_schema_version(&conn)
            .map_err(|e| BackupError::Database(e.to_string()))?
    };
    debug!("[Backup] 快照完成: {} ({} bytes, v{})", id, size, version);
    Ok((
        BackupFile {
            path: file_name,
            size,
            sha256,
            database_id: Some(id.as_str().to_string()),
        },
        version,
    ))
}

/// 导出基础备份之后的变更
fn export_changes(
    id: DatabaseId,
    conn: &rusqlite::Connection,
    dir: &Path,
    since: &str,
) -> Result<Option<BackupFile>, BackupError> {
    let mut stmt = conn.prepare(
        "SELECT id, table_name, record_id, operation, changed_at, sync_version
         FROM __change_log
         WHERE julianday(changed_at) > julianday(?1)
         ORDER BY id ASC",
    )?;
    let changes: Vec<ChangeLogEntry> = stmt
        .query_map([since], |row| {
            Ok(ChangeLogEntry {
                id: row.get(0)?,
                table_name: row.get(1)?,
                record_id: row.get(2)?,
                operation: row.get(3)?,
                changed_at: row.get(4)?,
                sync_version: row.get(5)?,
            })
        })?
        .filter_map(log_and_skip_entry_err)
        .collect();

    if changes.is_empty() {
        debug!("[Backup] {} 无新变更", id);
        return Ok(None);
    }

    let file_name = format!("{}_changes.json", id.as_str());
    let path = dir.join(&file_name);
    let json = serde_json::to_string_pretty(&changes)
        .map_err(|e| BackupError::Manifest(format!("序列化变更日志失败: {}", e)))?;
    let mut file = File::create(&path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;

    let sha256 = calculate_file_hash(&path).map_err(|e| BackupError::BackupDirectory(e.to_string()))?;
    info!("[Backup] 导出 {} 的 {} 条变更记录", id, changes.len());
    Ok(Some(BackupFile {
        path: file_name,
        size: fs::metadata(&path)?.len(),
        sha256,
        database_id: Some(id.as_str().to_string()),
    }))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[test]
    fn test_generate_backup_id_is_valid() {
        let id = generate_backup_id_at(chrono::Utc::now(), None);
        validate_backup_id(&id).unwrap();
        let incr = generate_backup_id_at(chrono::Utc::now(), Some("incr"));
        assert!(incr.ends_with("_incr"));
    }

    #[test]
    fn test_validate_backup_id_rejects_traversal() {
        for bad in ["", "..", "../x", "a/b", "/abs", ".pre_restore", "a%2E%2Eb", "x y"] {
            assert!(validate_backup_id(bad).is_err(), "{:?} should be rejected", bad);
        }
        validate_backup_id("20260101_120000_abcd1234_001").unwrap();
    }

    #[test]
    fn test_selection_presets() {
        let core = BackupSelection::core_only();
        assert!(DatabaseId::ALL.iter().all(|id| core.should_backup_database(*id)));
        assert!(core.selected_asset_types().is_empty());

        let recommended = BackupSelection::recommended();
        assert_eq!(
            recommended.selected_asset_types(),
            vec![AssetType::NotesAssets, AssetType::Subjects, AssetType::Workspaces]
        );

        let important_only = BackupSelection::tiers(&[BackupTier::Important]);
        assert!(!important_only.should_backup_database(DatabaseId::Vfs));

        let mut excluded = BackupSelection::core_only();
        excluded.exclude_databases = vec![DatabaseId::Vectors];
        assert!(!excluded.should_backup_database(DatabaseId::Vectors));

        assert_eq!(BackupSelection::full().selected_asset_types().len(), 8);
    }

    #[test]
    fn test_full_backup_registers_catalog_entry() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        let outcome = manager
            .create_backup(&BackupSelection::core_only(), true, &mut no_progress(), &never)
            .unwrap();

        assert!(outcome.manifest.complete);
        assert_eq!(outcome.manifest.files.len(), 5);
        let entry = outcome.catalog_entry.unwrap();
        assert_eq!(entry.backup_type, BackupKind::Full);
        assert_eq!(entry.databases.len(), 5);
        assert!(entry.size_bytes > 0);

        let catalog = manager.list_catalog().unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].id, outcome.manifest.backup_id);
        assert_eq!(outcome.manifest.schema_versions["notes"], 20260131);
    }

    #[test]
    fn test_unregistered_backup_is_staged() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        let outcome = manager
            .create_backup(&BackupSelection::core_only(), false, &mut no_progress(), &never)
            .unwrap();
        assert!(outcome.catalog_entry.is_none());
        assert!(outcome.path.starts_with(manager.staging_dir()));
        assert!(manager.list_backups().unwrap().is_empty());
        assert_eq!(
            manager.resolve_backup_dir(&outcome.manifest.backup_id).unwrap(),
            outcome.path
        );
    }

    #[test]
    fn test_cancelled_backup_is_never_listed() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        let calls = std::cell::Cell::new(0);
        let cancel_after_two = || {
            calls.set(calls.get() + 1);
            calls.get() > 2
        };
        let result = manager.create_backup(
            &BackupSelection::core_only(),
            true,
            &mut no_progress(),
            &cancel_after_two,
        );
        assert_matches!(result, Err(BackupError::Cancelled));
        assert!(manager.list_backups().unwrap().is_empty());

        // 不完整目录仍在磁盘上，清单标记 complete = false
        let leftover: Vec<_> = fs::read_dir(manager.backup_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert_eq!(leftover.len(), 1);
        let manifest =
            BackupManifest::load_from_file(&leftover[0].path().join(MANIFEST_FILENAME)).unwrap();
        assert!(!manifest.complete);
    }

    #[test]
    fn test_tiered_backup_with_assets() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        fs::create_dir_all(dir.path().join("notes_assets")).unwrap();
        fs::write(dir.path().join("notes_assets/a.png"), b"img").unwrap();
        fs::create_dir_all(dir.path().join("videos")).unwrap();
        fs::write(dir.path().join("videos/v.mp4"), b"video").unwrap();

        let outcome = manager
            .create_backup(&BackupSelection::recommended(), true, &mut no_progress(), &never)
            .unwrap();
        let entry = outcome.catalog_entry.unwrap();
        assert!(entry.includes_assets);
        assert_eq!(entry.asset_types, vec![AssetType::NotesAssets]);
        assert_eq!(entry.tier_set, vec![BackupTier::Core, BackupTier::Important]);
    }

    #[test]
    fn test_important_only_backup_is_not_restorable() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        fs::create_dir_all(dir.path().join("subjects")).unwrap();
        fs::write(dir.path().join("subjects/s.json"), b"{}").unwrap();

        let outcome = manager
            .create_backup(
                &BackupSelection::tiers(&[BackupTier::Important]),
                true,
                &mut no_progress(),
                &never,
            )
            .unwrap();
        assert!(outcome.manifest.files.is_empty());
        assert_matches!(
            outcome.manifest.check_restorable(),
            Err(BackupError::InvalidTierSet(_))
        );
    }

    #[test]
    fn test_incremental_backup_exports_changes() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        let base = manager
            .create_backup(&BackupSelection::core_only(), true, &mut no_progress(), &never)
            .unwrap();

        let notes = manager.databases().get(DatabaseId::Notes).unwrap().open().unwrap();
        notes
            .execute(
                "INSERT INTO __change_log (table_name, record_id, operation, changed_at) VALUES ('notes', 'n1', 'UPDATE', strftime('%Y-%m-%dT%H:%M:%fZ', 'now', '+1 second'))",
                [],
            )
            .unwrap();

        let incr = manager
            .create_incremental_backup(&base.manifest.backup_id, &mut no_progress(), &never)
            .unwrap();
        assert!(incr.manifest.is_incremental);
        assert_eq!(incr.manifest.files.len(), 1);
        assert_eq!(incr.manifest.files[0].path, "notes_changes.json");
        assert_matches!(
            incr.manifest.check_restorable(),
            Err(BackupError::IncrementalRestoreNotSupported)
        );
        assert_eq!(manager.list_backups().unwrap().len(), 2);
    }

    #[test]
    fn test_retention_deletes_oldest_full_and_skips_pinned() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path()).with_retention(Some(2));
        let mut ids = Vec::new();
        for _ in 0..2 {
            let outcome = manager
                .create_backup(&BackupSelection::core_only(), true, &mut no_progress(), &never)
                .unwrap();
            ids.push(outcome.manifest.backup_id);
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        // 最旧的备份被恢复引用，不能删除
        let pin = manager.pin(&ids[0]);
        let third = manager
            .create_backup(&BackupSelection::core_only(), true, &mut no_progress(), &never)
            .unwrap();
        assert!(!third.removed_by_retention.contains(&ids[0]));
        assert_eq!(third.removed_by_retention, vec![ids[1].clone()]);
        assert_matches!(manager.delete_backup(&ids[0]), Err(BackupError::Pinned(_)));

        drop(pin);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let fourth = manager
            .create_backup(&BackupSelection::core_only(), true, &mut no_progress(), &never)
            .unwrap();
        assert_eq!(fourth.removed_by_retention, vec![ids[0].clone()]);
        let remaining: Vec<String> = manager
            .list_backups()
            .unwrap()
            .into_iter()
            .map(|m| m.backup_id)
            .collect();
        assert_eq!(remaining, vec![fourth.manifest.backup_id, third.manifest.backup_id]);
    }

    #[test]
    fn test_manifest_compatibility() {
        let mut manifest = BackupManifest::new("test");
        manifest.complete = true;
        manifest.version = "2.0.0".to_string();
        assert_matches!(
            manifest.check_compatibility(),
            Err(BackupError::VersionIncompatible(_))
        );

        manifest.version = MANIFEST_VERSION.to_string();
        manifest.schema_versions.insert("vfs".to_string(), 29990101);
        assert_matches!(
            manifest.check_compatibility(),
            Err(BackupError::VersionIncompatible(_))
        );

        manifest.schema_versions.clear();
        manifest.schema_versions.insert("lance".to_string(), 1);
        assert_matches!(
            manifest.check_compatibility(),
            Err(BackupError::VersionIncompatible(_))
        );
    }
}
