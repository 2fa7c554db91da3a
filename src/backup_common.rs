//! 备份系统共享组件
//!
//! 提供所有备份模块共用的工具函数
//! - SHA256计算: 用于文件完整性校验
//! - 安全防护: ZIP炸弹检测、符号链接防护
//! - 磁盘空间预检

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// 共享组件错误
#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient disk space: required {required} bytes, available {available} bytes")]
    InsufficientSpace { required: u64, available: u64 },
}

type Result<T> = std::result::Result<T, CommonError>;

/// 记录并跳过迭代中的错误，避免 `.flatten()` 静默丢弃
///
/// 适用于 `read_dir` / `WalkDir` 等迭代场景。
pub fn log_and_skip_entry_err<T, E: std::fmt::Display>(
    result: std::result::Result<T, E>,
) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("[BackupCommon] Directory entry read error (skipped): {}", e);
            None
        }
    }
}

// ============================================================================
// 安全常量 - 防止 ZIP 炸弹和资源耗尽攻击
// ============================================================================

/// 最大允许解压总大小: 20GB
pub const MAX_UNCOMPRESSED_SIZE: u64 = 20 * 1024 * 1024 * 1024;

/// 最大允许单条目压缩比 (解压后大小 / 压缩大小)
pub const MAX_ENTRY_COMPRESSION_RATIO: u64 = 200;

/// 小于此大小的条目不做压缩比检查（空库、小文本的压缩比没有意义）
pub const RATIO_CHECK_MIN_SIZE: u64 = 1024 * 1024;

/// 最大允许文件数量
pub const MAX_FILE_COUNT: usize = 100_000;

/// 计算文件的SHA256哈希值
///
/// 使用8KB缓冲区分块读取，适合处理大文件而不会占用过多内存
pub fn calculate_file_hash(path: &Path) -> Result<String> {
    let file = File::open(path)
        .map_err(|e| CommonError::FileSystem(format!("打开文件计算哈希失败 {:?}: {}", path, e)))?;

    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192]; // 8KB 缓冲区

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| CommonError::FileSystem(format!("读取文件失败 {:?}: {}", path, e)))?;

        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// 计算文件前 `len` 字节的SHA256哈希值
///
/// 文件短于 `len` 时返回 `Ok(None)`。
pub fn calculate_prefix_hash(path: &Path, len: u64) -> Result<Option<String>> {
    calculate_range_hash(path, 0, len)
}

/// 计算文件 `[start, start + len)` 区间的SHA256哈希值
///
/// 文件短于 `start + len` 时返回 `Ok(None)`。用于断点续传时校验最近一次检查点写入的字节。
pub fn calculate_range_hash(path: &Path, start: u64, len: u64) -> Result<Option<String>> {
    let mut file = File::open(path)
        .map_err(|e| CommonError::FileSystem(format!("打开文件计算哈希失败 {:?}: {}", path, e)))?;
    let actual = file
        .metadata()
        .map_err(|e| CommonError::FileSystem(format!("读取文件元数据失败 {:?}: {}", path, e)))?
        .len();
    if actual < start.saturating_add(len) {
        return Ok(None);
    }
    file.seek(SeekFrom::Start(start))
        .map_err(|e| CommonError::FileSystem(format!("定位文件失败 {:?}: {}", path, e)))?;

    let mut reader = BufReader::new(file).take(len);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| CommonError::FileSystem(format!("读取文件失败 {:?}: {}", path, e)))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(Some(format!("{:x}", hasher.finalize())))
}

/// 计算字节数组的SHA256哈希值
pub fn calculate_bytes_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// ZIP 炸弹检测
// ============================================================================

/// ZIP 安全验证结果
#[derive(Debug)]
pub struct ZipSecurityCheck {
    pub total_uncompressed_size: u64,
    pub total_compressed_size: u64,
    pub file_count: usize,
    /// 单条目最大压缩比
    pub max_entry_ratio: f64,
    pub max_ratio_entry_name: String,
    /// 存在绝对路径或 `..` 的条目
    pub unsafe_entries: Vec<String>,
}

impl ZipSecurityCheck {
    /// 验证 ZIP 文件是否安全
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = self.unsafe_entries.first() {
            return Err(CommonError::Validation(format!(
                "ZIP 条目路径不安全（绝对路径或包含 ..）: {}",
                name
            )));
        }

        if self.total_uncompressed_size > MAX_UNCOMPRESSED_SIZE {
            return Err(CommonError::Validation(format!(
                "ZIP 文件解压后大小 ({:.2} GB) 超过最大限制 ({:.2} GB)，可能是 ZIP 炸弹",
                self.total_uncompressed_size as f64 / 1024.0 / 1024.0 / 1024.0,
                MAX_UNCOMPRESSED_SIZE as f64 / 1024.0 / 1024.0 / 1024.0
            )));
        }

        if self.max_entry_ratio > MAX_ENTRY_COMPRESSION_RATIO as f64 {
            return Err(CommonError::Validation(format!(
                "ZIP 炸弹检测：条目 '{}' 压缩比 {:.1} 超过阈值 {}",
                self.max_ratio_entry_name, self.max_entry_ratio, MAX_ENTRY_COMPRESSION_RATIO
            )));
        }

        if self.file_count > MAX_FILE_COUNT {
            return Err(CommonError::Validation(format!(
                "ZIP 文件包含 {} 个文件，超过最大限制 {}",
                self.file_count, MAX_FILE_COUNT
            )));
        }

        Ok(())
    }
}

/// 对 ZIP 文件进行安全检查
///
/// 在解压前检测 ZIP 炸弹和路径穿越条目
pub fn check_zip_security(zip_path: &Path) -> Result<ZipSecurityCheck> {
    let file = File::open(zip_path)
        .map_err(|e| CommonError::FileSystem(format!("打开 ZIP 文件失败: {}", e)))?;

    let compressed_size = file.metadata().map(|m| m.len()).unwrap_or(0);

    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| CommonError::FileSystem(format!("解析 ZIP 文件失败: {}", e)))?;

    let file_count = archive.len();
    let mut total_uncompressed = 0u64;
    let mut max_ratio = 0.0f64;
    let mut max_ratio_name = String::new();
    let mut unsafe_entries = Vec::new();

    for i in 0..file_count {
        let entry = archive
            .by_index(i)
            .map_err(|e| CommonError::FileSystem(format!("读取 ZIP 条目失败: {}", e)))?;

        if entry.enclosed_name().is_none() {
            unsafe_entries.push(entry.name().to_string());
        }

        let size = entry.size();
        total_uncompressed = total_uncompressed.saturating_add(size);

        if size >= RATIO_CHECK_MIN_SIZE {
            let ratio = size as f64 / entry.compressed_size().max(1) as f64;
            if ratio > max_ratio {
                max_ratio = ratio;
                max_ratio_name = entry.name().to_string();
            }
        }
    }

    Ok(ZipSecurityCheck {
        total_uncompressed_size: total_uncompressed,
        total_compressed_size: compressed_size,
        file_count,
        max_entry_ratio: max_ratio,
        max_ratio_entry_name: max_ratio_name,
        unsafe_entries,
    })
}

// ============================================================================
// 符号链接检测
// ============================================================================

/// 检查路径是否为符号链接
///
/// 使用 symlink_metadata 而非 metadata，避免跟随符号链接。
/// 无法读取元数据时返回 `true`（视为符号链接）。
pub fn is_symlink(path: &Path) -> bool {
    match fs::symlink_metadata(path) {
        Ok(meta) => meta.file_type().is_symlink(),
        Err(e) => {
            tracing::warn!(
                "[BackupCommon] 无法读取路径元数据 {:?}: {}。视为符号链接并跳过。",
                path,
                e
            );
            true
        }
    }
}

// ============================================================================
// 磁盘空间检查
// ============================================================================

/// 获取指定路径所在磁盘的可用空间（字节）
///
/// 路径不存在时向上查找最近的已存在祖先目录。
pub fn get_available_disk_space(path: &Path) -> Result<u64> {
    let mut check_path = path.to_path_buf();
    while !check_path.exists() {
        match check_path.parent() {
            Some(parent) => check_path = parent.to_path_buf(),
            None => break,
        }
    }

    #[cfg(unix)]
    {
        get_disk_space_statvfs(&check_path)
    }

    #[cfg(not(unix))]
    {
        tracing::warn!(
            "[BackupCommon] 当前平台不支持磁盘空间查询，跳过预检: {:?}",
            check_path
        );
        Ok(u64::MAX)
    }
}

/// Unix: 使用 libc::statvfs 系统调用获取磁盘可用空间
///
/// f_bavail * f_frsize = 非特权用户可用的字节数。
#[cfg(unix)]
fn get_disk_space_statvfs(path: &Path) -> Result<u64> {
    use std::ffi::CString;

    let path_str = path
        .to_str()
        .ok_or_else(|| CommonError::Validation("路径包含无效 UTF-8 字符".to_string()))?;

    let c_path = CString::new(path_str).map_err(|e| {
        CommonError::Validation(format!("路径包含空字节，无法传递给 statvfs: {}", e))
    })?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };

    if ret == 0 {
        #[allow(clippy::unnecessary_cast)]
        let available = stat.f_bavail as u64 * stat.f_frsize as u64;
        tracing::debug!(
            "[BackupCommon] statvfs 成功: path={}, available={} bytes ({:.2} GB)",
            path_str,
            available,
            available as f64 / 1024.0 / 1024.0 / 1024.0
        );
        Ok(available)
    } else {
        let errno = std::io::Error::last_os_error();
        Err(CommonError::FileSystem(format!(
            "statvfs 调用失败 (path={:?}): {}",
            path, errno
        )))
    }
}

/// 检查是否有足够的磁盘空间
///
/// 需要 `estimated_bytes * multiplier` 的可用空间
pub fn check_disk_space(path: &Path, estimated_bytes: u64, multiplier: u64) -> Result<()> {
    let available = get_available_disk_space(path)?;
    let required = estimated_bytes.saturating_mul(multiplier.max(1));

    if available < required {
        tracing::warn!(
            "[BackupCommon] 磁盘空间不足: 需要 {:.2} MB，可用 {:.2} MB",
            required as f64 / 1024.0 / 1024.0,
            available as f64 / 1024.0 / 1024.0
        );
        return Err(CommonError::InsufficientSpace {
            required,
            available,
        });
    }

    Ok(())
}

/// 统计目录总大小（跳过符号链接）
pub fn directory_size(dir: &Path) -> u64 {
    if !dir.exists() {
        return 0;
    }
    walkdir::WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(log_and_skip_entry_err)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

// ============================================================================
// 安全目录复制 - 防止符号链接攻击
// ============================================================================

/// 安全递归复制目录内容，跳过所有符号链接
///
/// 与 `copy_directory_safe` 不同，内容直接复制到 `dst` 下（不创建同名子目录）。
/// 返回复制的总字节数。
pub fn copy_directory_contents_safe(src: &Path, dst: &Path) -> Result<u64> {
    if is_symlink(src) {
        tracing::warn!("[BackupCommon] 跳过符号链接目录: {:?}", src);
        return Ok(0);
    }
    fs::create_dir_all(dst)
        .map_err(|e| CommonError::FileSystem(format!("创建目录失败 {:?}: {}", dst, e)))?;
    copy_directory_recursive_safe(src, dst)
}

/// 递归复制目录内容（内部函数）
fn copy_directory_recursive_safe(src: &Path, dst: &Path) -> Result<u64> {
    let mut total_bytes: u64 = 0;

    let entries = fs::read_dir(src)
        .map_err(|e| CommonError::FileSystem(format!("读取目录失败 {:?}: {}", src, e)))?;

    for entry in entries.filter_map(log_and_skip_entry_err) {
        let path = entry.path();
        let dest_path = dst.join(entry.file_name());

        if is_symlink(&path) {
            tracing::warn!("[BackupCommon] 跳过符号链接: {:?}", path);
            continue;
        }

        if path.is_dir() {
            fs::create_dir_all(&dest_path).map_err(|e| {
                CommonError::FileSystem(format!("创建目录失败 {:?}: {}", dest_path, e))
            })?;
            total_bytes += copy_directory_recursive_safe(&path, &dest_path)?;
        } else if path.is_file() {
            let bytes = fs::copy(&path, &dest_path)
                .map_err(|e| CommonError::FileSystem(format!("复制文件失败 {:?}: {}", path, e)))?;
            total_bytes += bytes;
        }
    }

    Ok(total_bytes)
}
