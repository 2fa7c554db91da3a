//! ZIP 格式备份导出 / 导入
//!
//! 将备份目录导出为 ZIP 压缩包，便于分享和存储；或从 ZIP 导入为新的备份。
//!
//! ## 功能
//!
//! - 可配置的压缩级别（0-9，0 为存储模式）
//! - 确定性布局：条目按路径排序、固定时间戳与权限，相同输入产生相同字节
//! - `checksums.sha256` 作为最后一个条目，导入时逐文件校验
//! - 断点续传：每 N 个条目写一次检查点，恢复时校验最近一次检查点写入的尾部字节
//!
//! ## 检查点
//!
//! 导出在检查点处调用 `finish()` 写出中央目录，使 `.partial` 文件本身就是合法 ZIP；
//! 继续写入时用 `ZipWriter::new_append` 从中央目录起始处覆盖。恢复时把文件截断到
//! 检查点偏移，再同样以追加模式继续。

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{
    validate_backup_id, BackupCatalogEntry, BackupError, BackupManager, BackupManifest,
    MANIFEST_FILENAME,
};
use crate::backup_common::{
    self, calculate_file_hash, calculate_range_hash, log_and_skip_entry_err,
};

/// 校验和文件名（ZIP 最后一个条目）
pub const CHECKSUMS_FILENAME: &str = "checksums.sha256";

/// 检查点格式版本
pub const CHECKPOINT_VERSION: u32 = 1;

/// 恢复时重新校验的尾部字节数上限
const TAIL_VERIFY_BYTES: u64 = 1024 * 1024;

/// ZIP 条目的固定 Unix 权限
const ENTRY_PERMISSIONS: u32 = 0o644;

const PARTIAL_SUFFIX: &str = "partial";

/// ZIP 导出选项
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZipExportOptions {
    /// 压缩级别 (0-9)
    /// - 0: 不压缩（存储模式）
    /// - 1-3: 快速压缩
    /// - 4-6: 平衡（默认 6）
    /// - 7-9: 最大压缩
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    /// 输出路径（默认 `<backup_dir>/exports/<backup_id>.zip`）
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

fn default_compression_level() -> u32 {
    6
}

impl Default for ZipExportOptions {
    fn default() -> Self {
        Self {
            compression_level: default_compression_level(),
            output_path: None,
        }
    }
}

impl ZipExportOptions {
    pub fn with_level(compression_level: u32) -> Self {
        Self {
            compression_level,
            ..Default::default()
        }
    }

    /// 存储模式（不压缩）
    pub fn store_only() -> Self {
        Self::with_level(0)
    }

    fn file_options(&self, size: u64) -> FileOptions {
        let base = FileOptions::default()
            .last_modified_time(zip::DateTime::default())
            .unix_permissions(ENTRY_PERMISSIONS)
            .large_file(size >= u32::MAX as u64);
        if self.compression_level == 0 {
            base.compression_method(CompressionMethod::Stored)
        } else {
            base.compression_method(CompressionMethod::Deflated)
                .compression_level(Some(self.compression_level as i32))
        }
    }
}

/// ZIP 导出结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZipExportResult {
    pub backup_id: String,
    pub zip_path: PathBuf,
    /// 原始总大小（字节）
    pub total_size: u64,
    /// 压缩后大小（字节）
    pub compressed_size: u64,
    /// 条目数量（含校验和文件）
    pub file_count: usize,
    /// 本次运行实际写入的源数据字节数（续传时不含检查点之前的部分）
    pub bytes_transferred: u64,
    /// 从第几个条目继续（None 表示从头开始）
    pub resumed_from_entry: Option<usize>,
    pub duration_ms: u64,
    /// ZIP 文件的 SHA256 校验和
    pub zip_checksum: String,
}

impl ZipExportResult {
    /// 计算压缩率
    pub fn compression_ratio(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        1.0 - (self.compressed_size as f64 / self.total_size as f64)
    }
}

/// ZIP 导入结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZipImportResult {
    pub backup_id: String,
    pub catalog_entry: BackupCatalogEntry,
    pub file_count: usize,
    pub bytes_extracted: u64,
    /// 导入的备份能否直接恢复（完整备份且包含 Core）
    pub restorable: bool,
}

/// ZIP 导出 / 导入错误
#[derive(Debug, thiserror::Error)]
pub enum ZipExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Invalid compression level: {0} (must be 0-9)")]
    InvalidCompressionLevel(u32),

    #[error("Unsupported backup manifest: {0}")]
    UnsupportedManifest(String),

    #[error("Unsafe archive: {0}")]
    UnsafeArchive(String),

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Insufficient disk space: required {required} bytes, available {available} bytes")]
    InsufficientDiskSpace { required: u64, available: u64 },

    #[error("Export failed: {0}")]
    ExportFailed(String),

    #[error("Transfer cancelled")]
    Cancelled,
}

impl From<BackupError> for ZipExportError {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::Io(e) => ZipExportError::Io(e),
            BackupError::BackupNotFound(id) => ZipExportError::BackupNotFound(id),
            BackupError::Cancelled => ZipExportError::Cancelled,
            BackupError::InsufficientDiskSpace {
                required,
                available,
            } => ZipExportError::InsufficientDiskSpace {
                required,
                available,
            },
            BackupError::VersionIncompatible(msg) | BackupError::Manifest(msg) => {
                ZipExportError::UnsupportedManifest(msg)
            }
            other => ZipExportError::ExportFailed(other.to_string()),
        }
    }
}

impl From<backup_common::CommonError> for ZipExportError {
    fn from(err: backup_common::CommonError) -> Self {
        match err {
            backup_common::CommonError::InsufficientSpace {
                required,
                available,
            } => ZipExportError::InsufficientDiskSpace {
                required,
                available,
            },
            other => ZipExportError::ExportFailed(other.to_string()),
        }
    }
}

// ============================================================================
// 进度与检查点
// ============================================================================

/// 传输阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    Scan,
    Compress,
    Extract,
    Verify,
    Finalize,
    Completed,
}

/// 传输进度
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferProgress {
    pub phase: TransferPhase,
    pub processed_items: u64,
    pub total_items: u64,
    pub bytes_transferred: u64,
    pub current_item: Option<String>,
}

impl TransferProgress {
    /// 0-100 的进度百分比
    pub fn percent(&self) -> f32 {
        match self.phase {
            TransferPhase::Scan => 0.0,
            TransferPhase::Compress | TransferPhase::Extract => {
                if self.total_items == 0 {
                    90.0
                } else {
                    5.0 + 85.0 * self.processed_items as f32 / self.total_items as f32
                }
            }
            TransferPhase::Verify => 90.0,
            TransferPhase::Finalize => 95.0,
            TransferPhase::Completed => 100.0,
        }
    }
}

/// 条目校验和
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryChecksum {
    pub path: String,
    pub sha256: String,
}

/// 导出检查点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportCheckpoint {
    pub version: u32,
    pub backup_id: String,
    pub zip_path: PathBuf,
    pub compression_level: u32,
    /// 已完整写入的条目数
    pub entries_done: usize,
    /// 检查点时 `.partial` 文件长度
    pub offset: u64,
    /// `offset` 之前最后 `tail_len` 字节的哈希
    pub tail_len: u64,
    pub tail_sha256: String,
    pub checksums: Vec<EntryChecksum>,
    /// 累计写入的源数据字节数
    pub bytes_transferred: u64,
}

/// 导入检查点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCheckpoint {
    pub version: u32,
    pub zip_path: PathBuf,
    pub zip_size: u64,
    pub entries_done: usize,
    pub bytes_extracted: u64,
}

/// 可持久化的传输检查点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferCheckpoint {
    Export(ExportCheckpoint),
    Import(ImportCheckpoint),
}

/// 传输观察者：进度、检查点持久化、协作式取消
pub trait TransferObserver {
    fn on_progress(&mut self, _progress: &TransferProgress) {}

    fn on_checkpoint(&mut self, _checkpoint: &TransferCheckpoint) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// 不关心进度的观察者
pub struct NoopObserver;

impl TransferObserver for NoopObserver {}

/// 计算哈希的同时透传数据
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.bytes)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

fn partial_path(zip_path: &Path) -> PathBuf {
    let mut name = zip_path.as_os_str().to_owned();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// 导出条目（相对路径，`/` 分隔，按字典序）
fn collect_entries(backup_dir: &Path) -> Result<Vec<(String, PathBuf)>, ZipExportError> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(backup_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(log_and_skip_entry_err)
    {
        if entry.path_is_symlink() || !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(backup_dir)
            .map_err(|_| ZipExportError::ExportFailed("无法计算相对路径".to_string()))?;
        let relative = relative.to_string_lossy().replace('\\', "/");
        if relative == CHECKSUMS_FILENAME {
            continue;
        }
        entries.push((relative, entry.path().to_path_buf()));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

fn render_checksums(checksums: &[EntryChecksum]) -> String {
    let mut sorted: Vec<&EntryChecksum> = checksums.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));
    sorted
        .iter()
        .map(|c| format!("{}  {}\n", c.sha256, c.path))
        .collect()
}

fn parse_checksums(content: &str) -> Vec<EntryChecksum> {
    content
        .lines()
        .filter_map(|line| {
            let (hash, path) = line.split_once("  ")?;
            Some(EntryChecksum {
                path: path.trim().to_string(),
                sha256: hash.trim().to_string(),
            })
        })
        .collect()
}

// ============================================================================
// 导出
// ============================================================================

/// 备份导出器
pub struct ZipExporter<'a> {
    manager: &'a BackupManager,
    checkpoint_interval: usize,
}

impl<'a> ZipExporter<'a> {
    pub fn new(manager: &'a BackupManager) -> Self {
        Self {
            manager,
            checkpoint_interval: 1,
        }
    }

    /// 每写入多少个条目持久化一次检查点
    pub fn with_checkpoint_interval(mut self, entries: usize) -> Self {
        self.checkpoint_interval = entries.max(1);
        self
    }

    pub fn default_output_path(&self, backup_id: &str) -> PathBuf {
        self.manager
            .backup_dir()
            .join("exports")
            .join(format!("{}.zip", backup_id))
    }

    /// 导出备份为 ZIP
    ///
    /// `resume` 为上一次运行留下的检查点；校验不通过时丢弃并从头开始。
    pub fn export(
        &self,
        backup_id: &str,
        options: &ZipExportOptions,
        resume: Option<ExportCheckpoint>,
        observer: &mut dyn TransferObserver,
    ) -> Result<ZipExportResult, ZipExportError> {
        let start = std::time::Instant::now();

        if options.compression_level > 9 {
            return Err(ZipExportError::InvalidCompressionLevel(
                options.compression_level,
            ));
        }

        let backup_dir = self.manager.resolve_backup_dir(backup_id)?;
        let manifest = BackupManifest::load_from_file(&backup_dir.join(MANIFEST_FILENAME))?;
        if !manifest.complete {
            return Err(ZipExportError::UnsupportedManifest(format!(
                "备份 {} 不完整，不能导出",
                backup_id
            )));
        }

        let zip_path = options
            .output_path
            .clone()
            .unwrap_or_else(|| self.default_output_path(backup_id));
        if let Some(parent) = zip_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let partial = partial_path(&zip_path);

        observer.on_progress(&TransferProgress {
            phase: TransferPhase::Scan,
            processed_items: 0,
            total_items: 0,
            bytes_transferred: 0,
            current_item: None,
        });
        let entries = collect_entries(&backup_dir)?;
        let total_size: u64 = entries
            .iter()
            .filter_map(|(_, p)| fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        let total_items = entries.len() as u64;

        info!(
            "[ZipExport] 开始导出: {} -> {:?}, 压缩级别: {}, 条目: {}",
            backup_id, zip_path, options.compression_level, entries.len()
        );

        let resumed = resume.and_then(|cp| {
            match validate_export_checkpoint(&cp, backup_id, &zip_path, options, &partial, entries.len()) {
                Ok(()) => Some(cp),
                Err(reason) => {
                    warn!("[ZipExport] 检查点无效，从头开始导出: {}", reason);
                    None
                }
            }
        });

        let (mut writer, start_index, mut checksums, mut cumulative_bytes) = match &resumed {
            Some(cp) => {
                let file = OpenOptions::new().read(true).write(true).open(&partial)?;
                file.set_len(cp.offset)?;
                info!(
                    "[ZipExport] 从检查点继续: 条目 {}/{}, offset={}",
                    cp.entries_done,
                    entries.len(),
                    cp.offset
                );
                (
                    ZipWriter::new_append(file)?,
                    cp.entries_done,
                    cp.checksums.clone(),
                    cp.bytes_transferred,
                )
            }
            None => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&partial)?;
                (ZipWriter::new(file), 0, Vec::new(), 0)
            }
        };

        let mut bytes_this_run = 0u64;
        let mut since_checkpoint = 0usize;
        for (index, (name, path)) in entries.iter().enumerate().skip(start_index) {
            if observer.is_cancelled() {
                warn!("[ZipExport] 导出已取消，保留未完成文件: {:?}", partial);
                return Err(ZipExportError::Cancelled);
            }
            observer.on_progress(&TransferProgress {
                phase: TransferPhase::Compress,
                processed_items: index as u64,
                total_items,
                bytes_transferred: cumulative_bytes,
                current_item: Some(name.clone()),
            });

            let file = File::open(path)?;
            let size = file.metadata()?.len();
            writer.start_file(name.as_str(), options.file_options(size))?;
            let mut reader = HashingReader::new(file);
            std::io::copy(&mut reader, &mut writer)?;
            let (sha256, bytes) = reader.finish();
            debug!("[ZipExport] 写入条目: {} ({} bytes)", name, bytes);
            checksums.push(EntryChecksum {
                path: name.clone(),
                sha256,
            });
            bytes_this_run += bytes;
            cumulative_bytes += bytes;

            since_checkpoint += 1;
            if since_checkpoint >= self.checkpoint_interval && index + 1 < entries.len() {
                since_checkpoint = 0;
                let file = writer.finish()?;
                file.sync_all()?;
                let checkpoint = build_export_checkpoint(
                    &partial,
                    backup_id,
                    &zip_path,
                    options.compression_level,
                    index + 1,
                    &checksums,
                    cumulative_bytes,
                )?;
                observer.on_checkpoint(&TransferCheckpoint::Export(checkpoint));
                writer = ZipWriter::new_append(file)?;
            }
        }

        observer.on_progress(&TransferProgress {
            phase: TransferPhase::Finalize,
            processed_items: total_items,
            total_items,
            bytes_transferred: cumulative_bytes,
            current_item: Some(CHECKSUMS_FILENAME.to_string()),
        });
        let checksum_content = render_checksums(&checksums);
        writer.start_file(
            CHECKSUMS_FILENAME,
            options.file_options(checksum_content.len() as u64),
        )?;
        writer.write_all(checksum_content.as_bytes())?;
        let file = writer.finish()?;
        file.sync_all()?;
        drop(file);

        fs::rename(&partial, &zip_path)?;
        let compressed_size = fs::metadata(&zip_path)?.len();
        let zip_checksum = calculate_file_hash(&zip_path)?;
        let duration_ms = start.elapsed().as_millis() as u64;

        observer.on_progress(&TransferProgress {
            phase: TransferPhase::Completed,
            processed_items: total_items,
            total_items,
            bytes_transferred: cumulative_bytes,
            current_item: None,
        });
        info!(
            "[ZipExport] 导出完成: {} 个条目, 原始 {} bytes, 压缩后 {} bytes, 本次写入 {} bytes, 耗时 {}ms",
            entries.len() + 1,
            total_size,
            compressed_size,
            bytes_this_run,
            duration_ms
        );

        Ok(ZipExportResult {
            backup_id: backup_id.to_string(),
            zip_path,
            total_size,
            compressed_size,
            file_count: entries.len() + 1,
            bytes_transferred: bytes_this_run,
            resumed_from_entry: resumed.map(|cp| cp.entries_done),
            duration_ms,
            zip_checksum,
        })
    }
}

fn build_export_checkpoint(
    partial: &Path,
    backup_id: &str,
    zip_path: &Path,
    compression_level: u32,
    entries_done: usize,
    checksums: &[EntryChecksum],
    bytes_transferred: u64,
) -> Result<ExportCheckpoint, ZipExportError> {
    let offset = fs::metadata(partial)?.len();
    let tail_len = offset.min(TAIL_VERIFY_BYTES);
    let tail_sha256 = calculate_range_hash(partial, offset - tail_len, tail_len)?
        .ok_or_else(|| ZipExportError::ExportFailed("检查点尾部哈希计算失败".to_string()))?;
    Ok(ExportCheckpoint {
        version: CHECKPOINT_VERSION,
        backup_id: backup_id.to_string(),
        zip_path: zip_path.to_path_buf(),
        compression_level,
        entries_done,
        offset,
        tail_len,
        tail_sha256,
        checksums: checksums.to_vec(),
        bytes_transferred,
    })
}

/// 校验导出检查点与 `.partial` 文件是否一致
///
/// 文件短于检查点偏移，或最近一次检查点写入的尾部字节哈希不一致，都视为无效。
/// 文件长于偏移时（检查点之后还写过数据）截断到偏移继续。
fn validate_export_checkpoint(
    cp: &ExportCheckpoint,
    backup_id: &str,
    zip_path: &Path,
    options: &ZipExportOptions,
    partial: &Path,
    entry_count: usize,
) -> Result<(), String> {
    if cp.version != CHECKPOINT_VERSION {
        return Err(format!("检查点版本不支持: {}", cp.version));
    }
    if cp.backup_id != backup_id || cp.zip_path != zip_path {
        return Err("检查点与本次导出目标不一致".to_string());
    }
    if cp.compression_level != options.compression_level {
        return Err("压缩级别与检查点不一致".to_string());
    }
    if cp.entries_done == 0 || cp.entries_done > entry_count || cp.checksums.len() != cp.entries_done {
        return Err(format!("检查点条目数无效: {}", cp.entries_done));
    }
    if cp.tail_len > cp.offset {
        return Err("检查点尾部长度无效".to_string());
    }
    let actual = fs::metadata(partial)
        .map_err(|e| format!("未完成文件不可读: {}", e))?
        .len();
    if actual < cp.offset {
        return Err(format!(
            "未完成文件 ({} bytes) 短于检查点偏移 ({} bytes)",
            actual, cp.offset
        ));
    }
    let tail = calculate_range_hash(partial, cp.offset - cp.tail_len, cp.tail_len)
        .map_err(|e| e.to_string())?;
    if tail.as_deref() != Some(cp.tail_sha256.as_str()) {
        return Err("检查点尾部字节哈希不一致".to_string());
    }
    if actual > cp.offset {
        debug!(
            "[ZipExport] 未完成文件长于检查点偏移，将截断: {} > {}",
            actual, cp.offset
        );
    }
    Ok(())
}

// ============================================================================
// 导入
// ============================================================================

/// 备份导入器
pub struct ZipImporter<'a> {
    manager: &'a BackupManager,
    checkpoint_interval: usize,
}

impl<'a> ZipImporter<'a> {
    pub fn new(manager: &'a BackupManager) -> Self {
        Self {
            manager,
            checkpoint_interval: 1,
        }
    }

    pub fn with_checkpoint_interval(mut self, entries: usize) -> Self {
        self.checkpoint_interval = entries.max(1);
        self
    }

    /// 导入的解压目录 `<backup_dir>/.importing/<job_id>`
    pub fn staging_dir(&self, job_id: &str) -> PathBuf {
        self.manager.backup_dir().join(super::IMPORTING_DIR).join(job_id)
    }

    /// 读取 ZIP 内的清单并检查兼容性（不解压）
    pub fn inspect(&self, zip_path: &Path) -> Result<BackupManifest, ZipExportError> {
        let mut archive = ZipArchive::new(File::open(zip_path)?)?;
        read_archive_manifest(&mut archive)
    }

    /// 从 ZIP 导入备份
    ///
    /// 1. 安全检查（ZIP 炸弹、路径穿越）
    /// 2. 校验内部清单（格式版本、schema 版本、完整标记），失败时不留下任何状态
    /// 3. 解压到 `.importing/<job_id>`，按条目写检查点
    /// 4. 逐文件校验 `checksums.sha256`
    /// 5. 重命名进入备份目录
    pub fn import(
        &self,
        zip_path: &Path,
        job_id: &str,
        resume: Option<ImportCheckpoint>,
        observer: &mut dyn TransferObserver,
    ) -> Result<ZipImportResult, ZipExportError> {
        if !zip_path.is_file() {
            return Err(ZipExportError::BackupNotFound(
                zip_path.to_string_lossy().to_string(),
            ));
        }
        info!("[ZipExport] 开始导入: {:?} (job={})", zip_path, job_id);
        observer.on_progress(&TransferProgress {
            phase: TransferPhase::Scan,
            processed_items: 0,
            total_items: 0,
            bytes_transferred: 0,
            current_item: None,
        });

        let security = backup_common::check_zip_security(zip_path)
            .map_err(|e| ZipExportError::UnsafeArchive(e.to_string()))?;
        security
            .validate()
            .map_err(|e| ZipExportError::UnsafeArchive(e.to_string()))?;

        let zip_size = fs::metadata(zip_path)?.len();
        let mut archive = ZipArchive::new(File::open(zip_path)?)?;
        let manifest = read_archive_manifest(&mut archive)?;
        if archive.by_name(CHECKSUMS_FILENAME).is_err() {
            return Err(ZipExportError::UnsupportedManifest(format!(
                "ZIP 中缺少 {}",
                CHECKSUMS_FILENAME
            )));
        }

        fs::create_dir_all(self.manager.backup_dir())?;
        backup_common::check_disk_space(
            self.manager.backup_dir(),
            security.total_uncompressed_size,
            self.manager.disk_space_multiplier(),
        )?;

        let staging = self.staging_dir(job_id);
        let total_items = archive.len();
        let start_index = match resume {
            Some(cp)
                if cp.version == CHECKPOINT_VERSION
                    && cp.zip_path == zip_path
                    && cp.zip_size == zip_size
                    && cp.entries_done <= total_items
                    && staging.is_dir() =>
            {
                info!(
                    "[ZipExport] 从检查点继续导入: 条目 {}/{}",
                    cp.entries_done, total_items
                );
                cp.entries_done
            }
            Some(_) => {
                warn!("[ZipExport] 导入检查点无效，从头开始");
                0
            }
            None => 0,
        };
        if start_index == 0 && staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let mut bytes_extracted = 0u64;
        let mut since_checkpoint = 0usize;
        for index in start_index..total_items {
            if observer.is_cancelled() {
                warn!("[ZipExport] 导入已取消，清理解压目录: {:?}", staging);
                let _ = fs::remove_dir_all(&staging);
                return Err(ZipExportError::Cancelled);
            }
            let mut entry = archive.by_index(index)?;
            let relative = entry
                .enclosed_name()
                .map(|p| p.to_path_buf())
                .ok_or_else(|| ZipExportError::UnsafeArchive(entry.name().to_string()))?;
            observer.on_progress(&TransferProgress {
                phase: TransferPhase::Extract,
                processed_items: index as u64,
                total_items: total_items as u64,
                bytes_transferred: bytes_extracted,
                current_item: Some(entry.name().to_string()),
            });

            let out_path = staging.join(&relative);
            if entry.is_dir() {
                fs::create_dir_all(&out_path)?;
            } else {
                if let Some(parent) = out_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = File::create(&out_path)?;
                bytes_extracted += std::io::copy(&mut entry, &mut out)?;
                out.sync_all()?;
            }
            drop(entry);

            since_checkpoint += 1;
            if since_checkpoint >= self.checkpoint_interval && index + 1 < total_items {
                since_checkpoint = 0;
                observer.on_checkpoint(&TransferCheckpoint::Import(ImportCheckpoint {
                    version: CHECKPOINT_VERSION,
                    zip_path: zip_path.to_path_buf(),
                    zip_size,
                    entries_done: index + 1,
                    bytes_extracted,
                }));
            }
        }

        observer.on_progress(&TransferProgress {
            phase: TransferPhase::Verify,
            processed_items: total_items as u64,
            total_items: total_items as u64,
            bytes_transferred: bytes_extracted,
            current_item: None,
        });
        if let Err(e) = verify_extracted(&staging) {
            warn!("[ZipExport] 导入校验失败，清理解压目录: {}", e);
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        observer.on_progress(&TransferProgress {
            phase: TransferPhase::Finalize,
            processed_items: total_items as u64,
            total_items: total_items as u64,
            bytes_transferred: bytes_extracted,
            current_item: None,
        });
        let backup_id = self.choose_backup_id(&manifest.backup_id);
        let mut imported = manifest;
        imported.backup_id = backup_id.clone();
        imported.save_to_file(&staging.join(MANIFEST_FILENAME))?;

        let dest = self.manager.backup_path(&backup_id)?;
        fs::rename(&staging, &dest)?;
        let size = backup_common::directory_size(&dest);
        let restorable = imported.check_restorable().is_ok();

        observer.on_progress(&TransferProgress {
            phase: TransferPhase::Completed,
            processed_items: total_items as u64,
            total_items: total_items as u64,
            bytes_transferred: bytes_extracted,
            current_item: None,
        });
        info!(
            "[ZipExport] 导入完成: backup_id={}, {} 个条目, {} bytes, 可恢复={}",
            backup_id, total_items, bytes_extracted, restorable
        );

        Ok(ZipImportResult {
            catalog_entry: BackupCatalogEntry::from_manifest(&imported, size),
            backup_id,
            file_count: total_items,
            bytes_extracted,
            restorable,
        })
    }

    /// 清单中的 ID 可用时沿用，否则生成新的
    fn choose_backup_id(&self, original: &str) -> String {
        let taken = |id: &str| {
            self.manager
                .backup_path(id)
                .map(|p| p.exists())
                .unwrap_or(true)
        };
        if validate_backup_id(original).is_ok() && !taken(original) {
            return original.to_string();
        }
        let base = if validate_backup_id(original).is_ok() {
            original.to_string()
        } else {
            chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
        };
        loop {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            let candidate = format!("{}_import_{}", base, &suffix[..8]);
            if !taken(&candidate) {
                return candidate;
            }
        }
    }
}

fn read_archive_manifest(archive: &mut ZipArchive<File>) -> Result<BackupManifest, ZipExportError> {
    let mut content = String::new();
    archive
        .by_name(MANIFEST_FILENAME)
        .map_err(|_| ZipExportError::UnsupportedManifest(format!("ZIP 中缺少 {}", MANIFEST_FILENAME)))?
        .read_to_string(&mut content)?;
    let manifest: BackupManifest = serde_json::from_str(&content)
        .map_err(|e| ZipExportError::UnsupportedManifest(format!("清单解析失败: {}", e)))?;
    if !manifest.complete {
        return Err(ZipExportError::UnsupportedManifest(
            "清单标记为不完整".to_string(),
        ));
    }
    manifest
        .check_compatibility()
        .map_err(|e| ZipExportError::UnsupportedManifest(e.to_string()))?;
    Ok(manifest)
}

/// 校验解压目录中的 `checksums.sha256`，通过后删除该文件
fn verify_extracted(staging: &Path) -> Result<(), ZipExportError> {
    let checksums_path = staging.join(CHECKSUMS_FILENAME);
    let content = fs::read_to_string(&checksums_path)?;
    for expected in parse_checksums(&content) {
        let path = super::assets::safe_join_under_root(staging, &expected.path)
            .map_err(|e| ZipExportError::UnsafeArchive(e.to_string()))?;
        if !path.is_file() {
            return Err(ZipExportError::ChecksumMismatch {
                path: expected.path,
                expected: expected.sha256,
                actual: "missing".to_string(),
            });
        }
        let actual = calculate_file_hash(&path)?;
        if actual != expected.sha256 {
            return Err(ZipExportError::ChecksumMismatch {
                path: expected.path,
                expected: expected.sha256,
                actual,
            });
        }
    }
    fs::remove_file(&checksums_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_governance::backup::test_support::{manager, never, no_progress};
    use crate::data_governance::backup::BackupSelection;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    /// 在第 `cancel_after` 次取消检查时取消，并记录最后一个检查点
    struct RecordingObserver {
        checks: std::cell::Cell<usize>,
        cancel_after: Option<usize>,
        last_checkpoint: Option<TransferCheckpoint>,
        progress_events: usize,
    }

    impl RecordingObserver {
        fn new(cancel_after: Option<usize>) -> Self {
            Self {
                checks: std::cell::Cell::new(0),
                cancel_after,
                last_checkpoint: None,
                progress_events: 0,
            }
        }

        fn export_checkpoint(&self) -> ExportCheckpoint {
            match self.last_checkpoint.clone() {
                Some(TransferCheckpoint::Export(cp)) => cp,
                other => panic!("expected export checkpoint, got {:?}", other),
            }
        }
    }

    impl TransferObserver for RecordingObserver {
        fn on_progress(&mut self, _progress: &TransferProgress) {
            self.progress_events += 1;
        }

        fn on_checkpoint(&mut self, checkpoint: &TransferCheckpoint) {
            self.last_checkpoint = Some(checkpoint.clone());
        }

        fn is_cancelled(&self) -> bool {
            self.checks.set(self.checks.get() + 1);
            self.cancel_after.map(|n| self.checks.get() > n).unwrap_or(false)
        }
    }

    fn backup_with_assets(dir: &Path) -> (BackupManager, String) {
        let manager = manager(dir);
        fs::create_dir_all(dir.join("notes_assets/sub")).unwrap();
        fs::write(dir.join("notes_assets/a.txt"), b"alpha").unwrap();
        fs::write(dir.join("notes_assets/sub/b.txt"), vec![7u8; 4096]).unwrap();
        let outcome = manager
            .create_backup(&BackupSelection::recommended(), true, &mut no_progress(), &never)
            .unwrap();
        let id = outcome.manifest.backup_id;
        (manager, id)
    }

    fn export_to(manager: &BackupManager, id: &str, path: PathBuf, level: u32) -> ZipExportResult {
        let options = ZipExportOptions {
            compression_level: level,
            output_path: Some(path),
        };
        ZipExporter::new(manager)
            .export(id, &options, None, &mut NoopObserver)
            .unwrap()
    }

    #[test]
    fn test_export_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let (manager, id) = backup_with_assets(dir.path());

        for level in [0, 6] {
            let a = export_to(&manager, &id, dir.path().join(format!("a{}.zip", level)), level);
            let b = export_to(&manager, &id, dir.path().join(format!("b{}.zip", level)), level);
            assert_eq!(fs::read(&a.zip_path).unwrap(), fs::read(&b.zip_path).unwrap());
            assert_eq!(a.zip_checksum, b.zip_checksum);
        }
    }

    #[test]
    fn test_checksums_entry_is_last() {
        let dir = TempDir::new().unwrap();
        let (manager, id) = backup_with_assets(dir.path());
        let result = export_to(&manager, &id, dir.path().join("out.zip"), 6);

        let mut archive = ZipArchive::new(File::open(&result.zip_path).unwrap()).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names.last().map(String::as_str), Some(CHECKSUMS_FILENAME));
        let mut sorted = names[..names.len() - 1].to_vec();
        sorted.sort();
        assert_eq!(sorted, names[..names.len() - 1].to_vec());
        assert!(!partial_path(&result.zip_path).exists());
    }

    #[test]
    fn test_invalid_compression_level() {
        let dir = TempDir::new().unwrap();
        let (manager, id) = backup_with_assets(dir.path());
        let result = ZipExporter::new(&manager).export(
            &id,
            &ZipExportOptions::with_level(10),
            None,
            &mut NoopObserver,
        );
        assert_matches!(result, Err(ZipExportError::InvalidCompressionLevel(10)));
    }

    #[test]
    fn test_resume_export_does_not_retransfer_checkpointed_entries() {
        let dir = TempDir::new().unwrap();
        let (manager, id) = backup_with_assets(dir.path());
        let fresh = export_to(&manager, &id, dir.path().join("fresh.zip"), 6);

        let options = ZipExportOptions {
            compression_level: 6,
            output_path: Some(dir.path().join("resumed.zip")),
        };
        let exporter = ZipExporter::new(&manager);
        let mut first = RecordingObserver::new(Some(3));
        let result = exporter.export(&id, &options, None, &mut first);
        assert_matches!(result, Err(ZipExportError::Cancelled));
        let checkpoint = first.export_checkpoint();
        assert_eq!(checkpoint.entries_done, 3);
        assert!(partial_path(&dir.path().join("resumed.zip")).exists());

        let resumed = exporter
            .export(&id, &options, Some(checkpoint.clone()), &mut NoopObserver)
            .unwrap();
        assert_eq!(resumed.resumed_from_entry, Some(3));
        assert_eq!(
            checkpoint.bytes_transferred + resumed.bytes_transferred,
            fresh.total_size
        );
        assert_eq!(
            fs::read(&resumed.zip_path).unwrap(),
            fs::read(&fresh.zip_path).unwrap()
        );
    }

    #[test]
    fn test_resume_with_corrupted_tail_restarts() {
        let dir = TempDir::new().unwrap();
        let (manager, id) = backup_with_assets(dir.path());
        let options = ZipExportOptions {
            compression_level: 0,
            output_path: Some(dir.path().join("out.zip")),
        };
        let exporter = ZipExporter::new(&manager);
        let mut first = RecordingObserver::new(Some(2));
        assert!(exporter.export(&id, &options, None, &mut first).is_err());
        let mut checkpoint = first.export_checkpoint();
        checkpoint.tail_sha256 = "0".repeat(64);

        let result = exporter
            .export(&id, &options, Some(checkpoint), &mut NoopObserver)
            .unwrap();
        assert_eq!(result.resumed_from_entry, None);
        assert_eq!(result.bytes_transferred, result.total_size);
    }

    #[test]
    fn test_resume_truncates_bytes_written_after_checkpoint() {
        let dir = TempDir::new().unwrap();
        let (manager, id) = backup_with_assets(dir.path());
        let fresh = export_to(&manager, &id, dir.path().join("fresh.zip"), 0);
        let options = ZipExportOptions {
            compression_level: 0,
            output_path: Some(dir.path().join("out.zip")),
        };
        let exporter = ZipExporter::new(&manager);
        let mut first = RecordingObserver::new(Some(2));
        assert!(exporter.export(&id, &options, None, &mut first).is_err());

        let partial = partial_path(&dir.path().join("out.zip"));
        let mut file = OpenOptions::new().append(true).open(&partial).unwrap();
        file.write_all(b"torn write").unwrap();
        drop(file);

        let result = exporter
            .export(&id, &options, Some(first.export_checkpoint()), &mut NoopObserver)
            .unwrap();
        assert_eq!(result.resumed_from_entry, Some(2));
        assert_eq!(fs::read(&result.zip_path).unwrap(), fs::read(&fresh.zip_path).unwrap());
    }

    #[test]
    fn test_import_round_trip_registers_new_entry() {
        let dir = TempDir::new().unwrap();
        let (manager, id) = backup_with_assets(dir.path());
        let exported = export_to(&manager, &id, dir.path().join("out.zip"), 6);

        let mut observer = RecordingObserver::new(None);
        let imported = ZipImporter::new(&manager)
            .import(&exported.zip_path, "job-1", None, &mut observer)
            .unwrap();
        assert_ne!(imported.backup_id, id, "ID 冲突时应生成新 ID");
        assert!(imported.restorable);
        assert!(observer.progress_events > 0);

        let original = manager.load_manifest(&id).unwrap();
        let copy = manager.load_manifest(&imported.backup_id).unwrap();
        assert_eq!(original.files, copy.files);
        assert_eq!(imported.catalog_entry.databases, original.database_ids());
        assert!(!manager
            .backup_path(&imported.backup_id)
            .unwrap()
            .join(CHECKSUMS_FILENAME)
            .exists());
        assert!(!ZipImporter::new(&manager).staging_dir("job-1").exists());
    }

    #[test]
    fn test_import_rejects_unsupported_manifest_without_state() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        let zip_path = dir.path().join("future.zip");
        {
            let mut writer = ZipWriter::new(File::create(&zip_path).unwrap());
            let mut manifest = BackupManifest::new("99.0.0");
            manifest.version = "9.0.0".to_string();
            manifest.complete = true;
            writer
                .start_file(MANIFEST_FILENAME, FileOptions::default())
                .unwrap();
            writer
                .write_all(serde_json::to_string(&manifest).unwrap().as_bytes())
                .unwrap();
            writer.finish().unwrap();
        }

        let result = ZipImporter::new(&manager).import(&zip_path, "job-2", None, &mut NoopObserver);
        assert_matches!(result, Err(ZipExportError::UnsupportedManifest(_)));
        assert!(manager.list_backups().unwrap().is_empty());
        assert!(!manager.backup_dir().join(super::super::IMPORTING_DIR).exists());
    }

    #[test]
    fn test_import_detects_tampered_entry() {
        let dir = TempDir::new().unwrap();
        let (manager, id) = backup_with_assets(dir.path());
        let src_dir = manager.backup_path(&id).unwrap();
        let zip_path = dir.path().join("tampered.zip");
        {
            let mut writer = ZipWriter::new(File::create(&zip_path).unwrap());
            for (name, path) in collect_entries(&src_dir).unwrap() {
                writer.start_file(name.as_str(), FileOptions::default()).unwrap();
                writer.write_all(&fs::read(path).unwrap()).unwrap();
            }
            writer.start_file(CHECKSUMS_FILENAME, FileOptions::default()).unwrap();
            writer
                .write_all(format!("{}  assets/notes_assets/a.txt\n", "f".repeat(64)).as_bytes())
                .unwrap();
            writer.finish().unwrap();
        }

        let importer = ZipImporter::new(&manager);
        let result = importer.import(&zip_path, "job-3", None, &mut NoopObserver);
        assert_matches!(result, Err(ZipExportError::ChecksumMismatch { ref path, .. }) if path == "assets/notes_assets/a.txt");
        assert!(!importer.staging_dir("job-3").exists());
        assert_eq!(manager.list_backups().unwrap().len(), 1);
    }

    #[test]
    fn test_import_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path());
        let zip_path = dir.path().join("evil.zip");
        {
            let mut writer = ZipWriter::new(File::create(&zip_path).unwrap());
            writer.start_file("../evil.txt", FileOptions::default()).unwrap();
            writer.write_all(b"x").unwrap();
            writer.finish().unwrap();
        }
        let result = ZipImporter::new(&manager).import(&zip_path, "job-4", None, &mut NoopObserver);
        assert_matches!(result, Err(ZipExportError::UnsafeArchive(_)));
    }
}
