//! # 数据治理系统 (Data Governance System)
//!
//! 统一的数据库迁移、备份、恢复管理模块。
//!
//! ## 设计目标
//!
//! 1. **统一迁移框架**：基于 Refinery，所有数据库使用同一套迁移机制
//! 2. **原子性备份**：使用 SQLite Backup API，确保快照一致
//! 3. **可回滚恢复**：恢复前自动做安全快照，失败整体回滚
//!
//! ## 模块结构
//!
//! - `schema_registry`: 数据库标识、依赖图、Schema 派生视图
//! - `database`: 数据库句柄抽象（open / checkpoint / dump / restore）
//! - `migration`: 迁移协调器和迁移定义
//! - `backup`: 备份管理器（全量 / 增量 / 分层 / 资产 / ZIP）
//! - `verification`: 备份校验（只读）
//! - `restore`: 分阶段恢复状态机
//! - `audit`: 审计日志
//! - `commands`: 对外控制与查询接口

pub mod audit;
pub mod backup;
pub mod commands;
pub mod commands_types;
pub mod database;
pub mod migration;
pub mod restore;
pub mod schema_registry;
pub mod verification;

pub use commands::GovernanceService;
pub use commands_types::JobStarted;
pub use migration::MigrationCoordinator;
pub use schema_registry::{DatabaseId, SchemaRegistry};

/// 数据治理错误分类
///
/// 各组件内部错误最终都归入以下几类，调用方据此决定是否重试、是否提示用户处理。
#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    /// 配置错误：依赖环、不支持的备份格式、缺少 Core 层级等，不可重试
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 瞬时 I/O 错误：磁盘满、传输中断，可通过 resume_job 继续
    #[error("Transient I/O error: {message}")]
    TransientIo {
        message: String,
        resumable_job_id: Option<String>,
    },

    /// 完整性错误：校验和不匹配、integrity_check 失败
    #[error("Integrity error{}: {message}", database.as_deref().map(|d| format!(" [{}]", d)).unwrap_or_default())]
    Integrity {
        database: Option<String>,
        message: String,
    },

    /// 并发错误：已有任务在运行
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// 恢复失败，已自动回滚
    #[error("Restore failed (rolled back): {0}")]
    RestoreFailed(String),

    /// 恢复失败且回滚失败，需要人工介入
    #[error("Restore failed AND rollback failed: restore error: {restore_error}; rollback error: {rollback_error}")]
    RollbackFailed {
        restore_error: String,
        rollback_error: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GovernanceError {
    pub fn integrity(database: impl Into<String>, message: impl Into<String>) -> Self {
        GovernanceError::Integrity {
            database: Some(database.into()),
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        GovernanceError::TransientIo {
            message: message.into(),
            resumable_job_id: None,
        }
    }

    /// 附加可恢复任务 ID（仅对 TransientIo 生效）
    pub fn with_resumable_job(self, job_id: &str) -> Self {
        match self {
            GovernanceError::TransientIo { message, .. } => GovernanceError::TransientIo {
                message,
                resumable_job_id: Some(job_id.to_string()),
            },
            other => other,
        }
    }

    /// 是否可以通过 resume_job 继续
    pub fn is_resumable(&self) -> bool {
        matches!(self, GovernanceError::TransientIo { .. })
    }

    /// 错误类别名（用于事件和审计详情）
    pub fn category(&self) -> &'static str {
        match self {
            GovernanceError::Configuration(_) => "configuration",
            GovernanceError::TransientIo { .. } => "transient_io",
            GovernanceError::Integrity { .. } => "integrity",
            GovernanceError::Concurrency(_) => "concurrency",
            GovernanceError::RestoreFailed(_) => "restore_failed",
            GovernanceError::RollbackFailed { .. } => "rollback_failed",
            GovernanceError::Cancelled => "cancelled",
            GovernanceError::NotFound(_) => "not_found",
            GovernanceError::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for GovernanceError {
    fn from(err: std::io::Error) -> Self {
        GovernanceError::transient(err.to_string())
    }
}

impl From<rusqlite::Error> for GovernanceError {
    fn from(err: rusqlite::Error) -> Self {
        GovernanceError::Internal(format!("SQLite: {}", err))
    }
}

impl From<serde_json::Error> for GovernanceError {
    fn from(err: serde_json::Error) -> Self {
        GovernanceError::Internal(format!("JSON: {}", err))
    }
}

impl From<database::DatabaseError> for GovernanceError {
    fn from(err: database::DatabaseError) -> Self {
        use database::DatabaseError;
        match err {
            DatabaseError::Io { .. } => GovernanceError::transient(err.to_string()),
            DatabaseError::Integrity { ref database, .. } => {
                GovernanceError::integrity(database.clone(), err.to_string())
            }
            other => GovernanceError::Internal(other.to_string()),
        }
    }
}

impl From<audit::AuditError> for GovernanceError {
    fn from(err: audit::AuditError) -> Self {
        GovernanceError::Internal(err.to_string())
    }
}

impl From<migration::MigrationError> for GovernanceError {
    fn from(err: migration::MigrationError) -> Self {
        use migration::MigrationError;
        match err {
            MigrationError::DependencyCycle(_) | MigrationError::DependencyNotSatisfied { .. } => {
                GovernanceError::Configuration(err.to_string())
            }
            MigrationError::VerificationFailed { ref database, .. } => {
                GovernanceError::integrity(database.clone(), err.to_string())
            }
            MigrationError::Io(e) => GovernanceError::transient(e.to_string()),
            MigrationError::InsufficientDiskSpace { .. } => {
                GovernanceError::transient(err.to_string())
            }
            other => GovernanceError::Internal(other.to_string()),
        }
    }
}

impl From<backup::BackupError> for GovernanceError {
    fn from(err: backup::BackupError) -> Self {
        use backup::BackupError;
        match err {
            BackupError::Io(e) => GovernanceError::transient(e.to_string()),
            BackupError::InsufficientDiskSpace { .. } => GovernanceError::transient(err.to_string()),
            BackupError::ChecksumMismatch { ref database, .. }
            | BackupError::IntegrityCheckFailed { ref database, .. } => {
                GovernanceError::integrity(database.clone(), err.to_string())
            }
            BackupError::VersionIncompatible(_)
            | BackupError::IncrementalRestoreNotSupported
            | BackupError::InvalidTierSet(_)
            | BackupError::Manifest(_) => GovernanceError::Configuration(err.to_string()),
            BackupError::BackupNotFound(id) => GovernanceError::NotFound(id),
            BackupError::Cancelled => GovernanceError::Cancelled,
            BackupError::Pinned(_) => GovernanceError::Concurrency(err.to_string()),
            other => GovernanceError::Internal(other.to_string()),
        }
    }
}

impl From<backup::zip_export::ZipExportError> for GovernanceError {
    fn from(err: backup::zip_export::ZipExportError) -> Self {
        use backup::zip_export::ZipExportError;
        match err {
            ZipExportError::Io(e) => GovernanceError::transient(e.to_string()),
            ZipExportError::Zip(e) => GovernanceError::transient(e.to_string()),
            ZipExportError::InsufficientDiskSpace { .. } => {
                GovernanceError::transient(err.to_string())
            }
            ZipExportError::InvalidCompressionLevel(_)
            | ZipExportError::UnsupportedManifest(_)
            | ZipExportError::UnsafeArchive(_) => GovernanceError::Configuration(err.to_string()),
            ZipExportError::ChecksumMismatch { ref path, .. } => {
                GovernanceError::integrity(path.clone(), err.to_string())
            }
            ZipExportError::BackupNotFound(id) => GovernanceError::NotFound(id),
            ZipExportError::Cancelled => GovernanceError::Cancelled,
            other => GovernanceError::Internal(other.to_string()),
        }
    }
}

impl From<crate::chat_v2::error::ChatV2Error> for GovernanceError {
    fn from(err: crate::chat_v2::error::ChatV2Error) -> Self {
        use crate::chat_v2::error::ChatV2Error;
        match err {
            ChatV2Error::Cancelled => GovernanceError::Cancelled,
            ChatV2Error::Validation(msg) => GovernanceError::Configuration(msg),
            ChatV2Error::IoError(msg) => GovernanceError::transient(msg),
            ChatV2Error::DatabaseCorrupted {
                original_error,
                rollback_error,
            } => GovernanceError::RollbackFailed {
                restore_error: original_error,
                rollback_error,
            },
            other => GovernanceError::Internal(other.to_string()),
        }
    }
}

/// 数据治理系统结果类型
pub type GovernanceResult<T> = Result<T, GovernanceError>;
