//! 资产文件备份模块
//!
//! 备份数据目录下按类型划分的资产文件（图片、笔记附件、文档、VFS blob 等）。
//!
//! ## 规则
//!
//! 1. **分类备份**：每种资产类型对应数据目录下的一个子目录，备份到 `assets/<type>/`
//! 2. **安全过滤**：跳过符号链接和敏感文件，所有相对路径都经过规范化
//! 3. **大小限制**：单文件超过 `max_file_size` 时跳过，总大小超限时报错
//! 4. **逐文件校验和**：每个文件记录 SHA256，恢复和校验时比对

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::BackupTier;
use crate::backup_common::{calculate_file_hash, log_and_skip_entry_err};

/// 资产类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Images,
    /// 笔记附件
    NotesAssets,
    Documents,
    /// VFS Blob 存储（可由资源重建）
    VfsBlobs,
    Subjects,
    Workspaces,
    Audio,
    Videos,
}

impl AssetType {
    pub const ALL: [AssetType; 8] = [
        AssetType::Images,
        AssetType::NotesAssets,
        AssetType::Documents,
        AssetType::VfsBlobs,
        AssetType::Subjects,
        AssetType::Workspaces,
        AssetType::Audio,
        AssetType::Videos,
    ];

    /// 资产目录相对路径（相对于数据目录）
    pub fn relative_path(&self) -> &'static str {
        match self {
            AssetType::Images => "images",
            AssetType::NotesAssets => "notes_assets",
            AssetType::Documents => "documents",
            AssetType::VfsBlobs => "vfs_blobs",
            AssetType::Subjects => "subjects",
            AssetType::Workspaces => "workspaces",
            AssetType::Audio => "audio",
            AssetType::Videos => "videos",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            AssetType::Images => "图片",
            AssetType::NotesAssets => "笔记附件",
            AssetType::Documents => "文档",
            AssetType::VfsBlobs => "VFS 存储",
            AssetType::Subjects => "学科资源",
            AssetType::Workspaces => "工作空间",
            AssetType::Audio => "音频",
            AssetType::Videos => "视频",
        }
    }

    /// 所属备份层级
    pub fn tier(&self) -> BackupTier {
        match self {
            AssetType::NotesAssets | AssetType::Subjects | AssetType::Workspaces => {
                BackupTier::Important
            }
            AssetType::VfsBlobs => BackupTier::Rebuildable,
            AssetType::Images | AssetType::Documents | AssetType::Audio | AssetType::Videos => {
                BackupTier::LargeAssets
            }
        }
    }

    pub fn all() -> Vec<AssetType> {
        Self::ALL.to_vec()
    }

    pub fn parse(s: &str) -> Option<AssetType> {
        Self::ALL.iter().copied().find(|t| t.relative_path() == s)
    }

    pub fn as_str(&self) -> &'static str {
        self.relative_path()
    }

    /// 规范化相对路径
    ///
    /// 反斜杠统一为 `/`；拒绝空路径、绝对路径、盘符路径和 `..` 穿越。
    pub fn sanitize_relative_path(path_str: &str) -> Result<String, AssetBackupError> {
        let normalized = path_str.trim().replace('\\', "/");
        let bytes = normalized.as_bytes();
        let has_drive_prefix = bytes.len() >= 3
            && bytes[0].is_ascii_alphabetic()
            && bytes[1] == b':'
            && bytes[2] == b'/';
        let has_parent = normalized.split('/').any(|seg| seg == "..");
        if normalized.is_empty() || normalized.starts_with('/') || has_drive_prefix || has_parent {
            return Err(AssetBackupError::InvalidPath(path_str.to_string()));
        }
        Ok(normalized)
    }
}

/// 在根目录下安全拼接相对路径
pub(crate) fn safe_join_under_root(
    root: &Path,
    unsafe_relative_path: &str,
) -> Result<PathBuf, AssetBackupError> {
    let normalized = AssetType::sanitize_relative_path(unsafe_relative_path)?;
    let mut clean = PathBuf::new();

    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(seg) => clean.push(seg),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(AssetBackupError::InvalidPath(
                    unsafe_relative_path.to_string(),
                ));
            }
        }
    }

    Ok(root.join(clean))
}

/// 资产备份配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetBackupConfig {
    /// 单文件最大大小（字节），超过的文件跳过
    pub max_file_size: u64,
    /// 总大小限制（字节）
    pub max_total_size: u64,
    pub skip_sensitive_files: bool,
    /// 排除的文件扩展名（小写，不带点）
    pub excluded_extensions: Vec<String>,
}

impl Default for AssetBackupConfig {
    fn default() -> Self {
        Self {
            max_file_size: 500 * 1024 * 1024,        // 500MB
            max_total_size: 10 * 1024 * 1024 * 1024, // 10GB
            skip_sensitive_files: true,
            excluded_extensions: Vec::new(),
        }
    }
}

/// 资产备份结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetBackupResult {
    pub files: Vec<BackedUpAsset>,
    pub total_files: usize,
    pub total_size: u64,
    pub skipped_files: usize,
    /// 跳过原因统计
    pub skip_reasons: BTreeMap<String, usize>,
    pub by_asset_type: BTreeMap<String, AssetTypeStats>,
}

impl AssetBackupResult {
    fn skip(&mut self, reason: &str) {
        self.skipped_files += 1;
        *self.skip_reasons.entry(reason.to_string()).or_insert(0) += 1;
    }

    /// 结果中包含的资产类型
    pub fn asset_types(&self) -> Vec<AssetType> {
        let mut types: Vec<AssetType> = self.files.iter().map(|f| f.asset_type).collect();
        types.sort();
        types.dedup();
        types
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetTypeStats {
    pub file_count: usize,
    pub total_size: u64,
}

/// 备份的资产文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackedUpAsset {
    pub asset_type: AssetType,
    /// 相对备份目录的路径（`assets/<type>/...`）
    pub relative_path: String,
    /// 相对数据目录的原始路径
    pub original_path: String,
    pub size: u64,
    pub sha256: String,
}

/// 资产备份错误
#[derive(Debug, thiserror::Error)]
pub enum AssetBackupError {
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("不安全的路径（绝对路径或目录穿越）: {0}")]
    InvalidPath(String),

    #[error("文件复制失败: {src_path} -> {dest_path}, 错误: {message}")]
    CopyFailed {
        src_path: String,
        dest_path: String,
        message: String,
    },

    #[error("超出总大小限制: 当前 {current} 字节，限制 {limit} 字节")]
    TotalSizeLimitExceeded { current: u64, limit: u64 },

    #[error("校验和计算失败: {0}")]
    ChecksumError(String),

    #[error("资产恢复失败: {0}")]
    RestoreFailed(String),

    #[error("操作已取消（资产阶段）")]
    Cancelled,
}

/// 敏感文件名模式
const SENSITIVE_PATTERNS: &[&str] = &[
    ".env",
    "credentials",
    ".pem",
    ".key",
    ".p12",
    ".pfx",
    "id_rsa",
    "id_ed25519",
    "secrets.json",
    "auth.json",
];

/// 检查是否为敏感文件
pub fn is_sensitive_file(path: &Path) -> bool {
    let file_name = match path.file_name() {
        Some(name) => name.to_string_lossy().to_lowercase(),
        None => return false,
    };
    if SENSITIVE_PATTERNS.iter().any(|p| file_name.contains(p)) {
        return true;
    }
    path.components().any(|c| {
        matches!(c, Component::Normal(seg) if {
            let seg = seg.to_string_lossy().to_lowercase();
            seg == ".ssh" || seg == "secrets"
        })
    })
}

/// 复制文件（带重试与大小校验）
///
/// 复制后比对源/目标大小，避免静默写入不完整。
fn copy_file_with_retry(src: &Path, dest: &Path) -> Result<u64, AssetBackupError> {
    const MAX_RETRIES: u32 = 3;
    const RETRY_SLEEP_MS: u64 = 80;

    let mut last_error = String::new();
    for attempt in 0..MAX_RETRIES {
        match fs::copy(src, dest) {
            Ok(copied) => {
                let expected = fs::metadata(src).map(|m| m.len()).unwrap_or(copied);
                if copied == expected {
                    return Ok(copied);
                }
                last_error = format!("复制后大小不一致: expected={}, actual={}", expected, copied);
            }
            Err(e) => last_error = e.to_string(),
        }

        // 清理写了一半的目标文件
        let _ = fs::remove_file(dest);
        if attempt + 1 < MAX_RETRIES {
            std::thread::sleep(Duration::from_millis(RETRY_SLEEP_MS));
        }
    }

    Err(AssetBackupError::CopyFailed {
        src_path: src.to_string_lossy().to_string(),
        dest_path: dest.to_string_lossy().to_string(),
        message: last_error,
    })
}

fn should_backup_file(path: &Path, size: u64, config: &AssetBackupConfig) -> Result<(), &'static str> {
    if size > config.max_file_size {
        return Err("file_too_large");
    }
    if config.skip_sensitive_files && is_sensitive_file(path) {
        return Err("sensitive_file");
    }
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    if config
        .excluded_extensions
        .iter()
        .any(|e| e.to_lowercase() == extension)
    {
        return Err("extension_excluded");
    }
    Ok(())
}

/// 执行资产备份
///
/// 按类型顺序遍历 `<data_dir>/<type>/`，复制到 `<dest_dir>/assets/<type>/`。
/// 文件按路径排序处理，`should_cancel` 在每个文件之前检查。
pub fn backup_assets(
    data_dir: &Path,
    dest_dir: &Path,
    asset_types: &[AssetType],
    config: &AssetBackupConfig,
    should_cancel: &dyn Fn() -> bool,
) -> Result<AssetBackupResult, AssetBackupError> {
    info!(
        "[Backup] 开始资产备份: src={:?}, dest={:?}, types={}",
        data_dir,
        dest_dir,
        asset_types.len()
    );

    let mut result = AssetBackupResult::default();
    let mut types = asset_types.to_vec();
    types.sort();
    types.dedup();

    for asset_type in types {
        let src_root = data_dir.join(asset_type.relative_path());
        if !src_root.is_dir() {
            debug!("[Backup] 资产目录不存在，跳过: {:?}", src_root);
            continue;
        }
        let dest_root = dest_dir.join("assets").join(asset_type.relative_path());

        let walker = walkdir::WalkDir::new(&src_root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(log_and_skip_entry_err);

        for entry in walker {
            if should_cancel() {
                return Err(AssetBackupError::Cancelled);
            }
            if entry.path_is_symlink() {
                debug!("[Backup] 跳过符号链接: {:?}", entry.path());
                result.skip("symlink");
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let size = match entry.metadata() {
                Ok(m) => m.len(),
                Err(e) => {
                    warn!("[Backup] 获取文件元数据失败 {:?}: {}", path, e);
                    result.skip("metadata_error");
                    continue;
                }
            };
            if let Err(reason) = should_backup_file(path, size, config) {
                result.skip(reason);
                continue;
            }
            if result.total_size + size > config.max_total_size {
                return Err(AssetBackupError::TotalSizeLimitExceeded {
                    current: result.total_size + size,
                    limit: config.max_total_size,
                });
            }

            let Ok(relative) = path.strip_prefix(&src_root) else {
                result.skip("outside_root");
                continue;
            };
            let relative_str = relative.to_string_lossy().replace('\\', "/");
            let dest_path = safe_join_under_root(&dest_root, &relative_str)?;
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }
            copy_file_with_retry(path, &dest_path)?;
            let sha256 = calculate_file_hash(&dest_path)
                .map_err(|e| AssetBackupError::ChecksumError(e.to_string()))?;

            result.files.push(BackedUpAsset {
                asset_type,
                relative_path: format!("assets/{}/{}", asset_type.relative_path(), relative_str),
                original_path: format!("{}/{}", asset_type.relative_path(), relative_str),
                size,
                sha256,
            });
            result.total_size += size;
            let stats = result
                .by_asset_type
                .entry(asset_type.as_str().to_string())
                .or_default();
            stats.file_count += 1;
            stats.total_size += size;
        }
    }

    result.total_files = result.files.len();
    info!(
        "[Backup] 资产备份完成: files={}, size={}, skipped={}",
        result.total_files, result.total_size, result.skipped_files
    );
    Ok(result)
}

/// 恢复资产文件（基于 manifest 中的资产列表）
///
/// 调用方负责预先把线上同类型目录移走；`on_progress(已恢复数, 总数)` 返回 false 时取消。
pub fn restore_assets<F>(
    backup_dir: &Path,
    data_dir: &Path,
    assets: &[BackedUpAsset],
    mut on_progress: F,
) -> Result<usize, AssetBackupError>
where
    F: FnMut(usize, usize) -> bool,
{
    info!(
        "[Restore] 开始恢复资产: backup_dir={:?}, count={}",
        backup_dir,
        assets.len()
    );

    let total = assets.len();
    let mut restored = 0;
    for asset in assets {
        let src_path = safe_join_under_root(backup_dir, &asset.relative_path)?;
        let dest_path = safe_join_under_root(data_dir, &asset.original_path)?;
        // 路径校验之后再创建目录
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)?;
        }
        copy_file_with_retry(&src_path, &dest_path)
            .map_err(|e| AssetBackupError::RestoreFailed(e.to_string()))?;
        restored += 1;
        if !on_progress(restored, total) {
            return Err(AssetBackupError::Cancelled);
        }
    }

    info!("[Restore] 资产恢复完成: restored={}", restored);
    Ok(restored)
}

/// 资产校验错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetVerifyError {
    pub path: String,
    /// file_not_found / size_mismatch / checksum_mismatch / checksum_error / invalid_path
    pub error_type: String,
    pub message: String,
}

/// 校验备份中的资产文件（只读）
pub fn verify_assets(backup_dir: &Path, assets: &[BackedUpAsset]) -> Vec<AssetVerifyError> {
    let mut errors = Vec::new();

    for asset in assets {
        let error = |error_type: &str, message: String| AssetVerifyError {
            path: asset.relative_path.clone(),
            error_type: error_type.to_string(),
            message,
        };
        let file_path = match safe_join_under_root(backup_dir, &asset.relative_path) {
            Ok(p) => p,
            Err(e) => {
                errors.push(error("invalid_path", e.to_string()));
                continue;
            }
        };
        let size = match fs::metadata(&file_path) {
            Ok(m) => m.len(),
            Err(_) => {
                errors.push(error("file_not_found", format!("文件不存在: {:?}", file_path)));
                continue;
            }
        };
        if size != asset.size {
            errors.push(error(
                "size_mismatch",
                format!("文件大小不匹配: expected={}, actual={}", asset.size, size),
            ));
            continue;
        }
        match calculate_file_hash(&file_path) {
            Ok(actual) if actual == asset.sha256 => {}
            Ok(actual) => errors.push(error(
                "checksum_mismatch",
                format!("校验和不匹配: expected={}, actual={}", asset.sha256, actual),
            )),
            Err(e) => errors.push(error("checksum_error", e.to_string())),
        }
    }

    debug!(
        "[Verify] 资产校验完成: total={}, errors={}",
        assets.len(),
        errors.len()
    );
    errors
}

/// 扫描数据目录中的资产统计（用于预估备份大小）
pub fn scan_assets(data_dir: &Path, asset_types: &[AssetType]) -> BTreeMap<AssetType, AssetTypeStats> {
    let mut stats = BTreeMap::new();
    for asset_type in asset_types {
        let dir = data_dir.join(asset_type.relative_path());
        if !dir.is_dir() {
            continue;
        }
        let mut type_stats = AssetTypeStats::default();
        for entry in walkdir::WalkDir::new(&dir)
            .follow_links(false)
            .into_iter()
            .filter_map(log_and_skip_entry_err)
            .filter(|e| e.file_type().is_file())
        {
            type_stats.file_count += 1;
            type_stats.total_size += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
        stats.insert(*asset_type, type_stats);
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn never() -> bool {
        false
    }

    fn write(path: &Path, content: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_asset_type_properties() {
        assert_eq!(AssetType::Images.relative_path(), "images");
        assert_eq!(AssetType::parse("vfs_blobs"), Some(AssetType::VfsBlobs));
        assert_eq!(AssetType::parse("textbooks"), None);
        assert_eq!(AssetType::VfsBlobs.tier(), BackupTier::Rebuildable);
        assert_eq!(AssetType::Subjects.tier(), BackupTier::Important);
        assert_eq!(AssetType::Videos.tier(), BackupTier::LargeAssets);
        assert_eq!(AssetType::all().len(), 8);
    }

    #[test]
    fn test_sanitize_relative_path() {
        assert_eq!(
            AssetType::sanitize_relative_path("images\\a\\b.png").unwrap(),
            "images/a/b.png"
        );
        assert!(AssetType::sanitize_relative_path("/etc/passwd").is_err());
        assert!(AssetType::sanitize_relative_path("C:/Windows").is_err());
        assert!(AssetType::sanitize_relative_path("images/../../x").is_err());
        assert!(AssetType::sanitize_relative_path("").is_err());
        // 文件名中包含 ".." 但不是路径段
        assert!(AssetType::sanitize_relative_path("images/a..b.png").is_ok());
    }

    #[test]
    fn test_is_sensitive_file() {
        assert!(is_sensitive_file(Path::new("/path/to/.env")));
        assert!(is_sensitive_file(Path::new("/path/to/credentials.json")));
        assert!(is_sensitive_file(Path::new("/home/u/.ssh/config")));
        assert!(!is_sensitive_file(Path::new("/path/to/photo.png")));
    }

    #[test]
    fn test_backup_verify_and_restore_assets() {
        let data_dir = TempDir::new().unwrap();
        let backup_dir = TempDir::new().unwrap();
        write(&data_dir.path().join("images/a.png"), b"png-data");
        write(&data_dir.path().join("images/sub/b.png"), b"more-png");
        write(&data_dir.path().join("subjects/math.json"), b"{}");
        write(&data_dir.path().join("images/.env"), b"SECRET=1");

        let result = backup_assets(
            data_dir.path(),
            backup_dir.path(),
            &[AssetType::Images, AssetType::Subjects],
            &AssetBackupConfig::default(),
            &never,
        )
        .unwrap();
        assert_eq!(result.total_files, 3);
        assert_eq!(result.skip_reasons.get("sensitive_file"), Some(&1));
        assert_eq!(result.asset_types(), vec![AssetType::Images, AssetType::Subjects]);
        assert!(verify_assets(backup_dir.path(), &result.files).is_empty());

        let target = TempDir::new().unwrap();
        let mut calls = 0;
        let restored = restore_assets(backup_dir.path(), target.path(), &result.files, |_, _| {
            calls += 1;
            true
        })
        .unwrap();
        assert_eq!(restored, 3);
        assert_eq!(calls, 3);
        assert_eq!(fs::read(target.path().join("images/sub/b.png")).unwrap(), b"more-png");
    }

    #[test]
    fn test_verify_detects_tampering() {
        let data_dir = TempDir::new().unwrap();
        let backup_dir = TempDir::new().unwrap();
        write(&data_dir.path().join("documents/a.pdf"), b"original");
        let result = backup_assets(
            data_dir.path(),
            backup_dir.path(),
            &[AssetType::Documents],
            &AssetBackupConfig::default(),
            &never,
        )
        .unwrap();

        fs::write(backup_dir.path().join("assets/documents/a.pdf"), b"tampered").unwrap();
        let errors = verify_assets(backup_dir.path(), &result.files);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, "checksum_mismatch");
    }

    #[test]
    fn test_file_size_limit_and_cancel() {
        let data_dir = TempDir::new().unwrap();
        let backup_dir = TempDir::new().unwrap();
        write(&data_dir.path().join("audio/big.mp3"), &[0u8; 2048]);
        write(&data_dir.path().join("audio/small.mp3"), &[0u8; 16]);

        let config = AssetBackupConfig {
            max_file_size: 1024,
            ..Default::default()
        };
        let result = backup_assets(
            data_dir.path(),
            backup_dir.path(),
            &[AssetType::Audio],
            &config,
            &never,
        )
        .unwrap();
        assert_eq!(result.total_files, 1);
        assert_eq!(result.skip_reasons.get("file_too_large"), Some(&1));

        let cancelled = backup_assets(
            data_dir.path(),
            backup_dir.path(),
            &[AssetType::Audio],
            &config,
            &|| true,
        );
        assert_matches!(cancelled, Err(AssetBackupError::Cancelled));
    }

    #[test]
    fn test_scan_assets() {
        let data_dir = TempDir::new().unwrap();
        write(&data_dir.path().join("videos/v.mp4"), &[1u8; 100]);
        let stats = scan_assets(data_dir.path(), &AssetType::all());
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[&AssetType::Videos].total_size, 100);
    }
}
