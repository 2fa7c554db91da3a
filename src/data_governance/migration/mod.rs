//! # Migration 模块
//!
//! 统一的数据库迁移框架，基于 Refinery 实现。
//!
//! ## 迁移脚本编写规范
//!
//! 1. **步骤原子性**：每个迁移文件在独立事务中执行（`set_grouped(false)`），
//!    失败时数据库停留在最后一个成功的版本
//! 2. **幂等设计**：使用 `IF EXISTS` / `IF NOT EXISTS`
//! 3. **永不修改历史**：已发布的迁移脚本不可修改（Refinery 会检测 checksum 变化），
//!    通过新脚本修复问题
//!
//! ## 版本号规范
//!
//! 采用日期格式，文件名即版本：
//! ```text
//! migrations/<database>/V20260130__init.sql
//! migrations/<database>/V20260131__change_log.sql
//! ```
//!
//! ## 组件
//!
//! - `coordinator`: 多库迁移协调器（依赖排序、审计、最后错误持久化）
//! - `definitions`: 迁移定义（含迁移后验证配置）
//! - `vfs` / `chat_v2` / `notes` / `graph` / `vectors`: 各数据库迁移定义
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use deep_student_governance::data_governance::migration::MigrationCoordinator;
//!
//! let coordinator = MigrationCoordinator::new(data_dir, databases);
//! let report = coordinator.run_all()?;
//! ```

pub mod chat_v2;
pub mod coordinator;
pub mod definitions;
pub mod graph;
pub mod notes;
pub mod vectors;
pub mod vfs;

pub use coordinator::{
    DatabaseMigrationReport, DatabaseMigrationStatus, MigrationCoordinator, MigrationReport,
    MigrationStatusReport,
};
pub use definitions::{MigrationDef, MigrationSet};

pub use chat_v2::CHAT_V2_MIGRATION_SET;
pub use graph::GRAPH_MIGRATION_SET;
pub use notes::NOTES_MIGRATION_SET;
pub use vectors::VECTORS_MIGRATION_SET;
pub use vfs::VFS_MIGRATION_SET;

use super::schema_registry::{DatabaseId, SchemaRegistryError};

/// 所有数据库的迁移集合（按依赖顺序）
pub const ALL_MIGRATION_SETS: &[&MigrationSet] = &[
    &VFS_MIGRATION_SET,
    &CHAT_V2_MIGRATION_SET,
    &NOTES_MIGRATION_SET,
    &GRAPH_MIGRATION_SET,
    &VECTORS_MIGRATION_SET,
];

/// 数据库数量
pub const DATABASE_COUNT: usize = 5;

/// 获取指定数据库的迁移集合
pub fn get_migration_set(id: DatabaseId) -> &'static MigrationSet {
    match id {
        DatabaseId::Vfs => &VFS_MIGRATION_SET,
        DatabaseId::ChatV2 => &CHAT_V2_MIGRATION_SET,
        DatabaseId::Notes => &NOTES_MIGRATION_SET,
        DatabaseId::Graph => &GRAPH_MIGRATION_SET,
        DatabaseId::Vectors => &VECTORS_MIGRATION_SET,
    }
}

/// 当前构建已知的目标版本
pub fn target_version(id: DatabaseId) -> u32 {
    get_migration_set(id).latest_version().max(0) as u32
}

/// 迁移错误
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Refinery error: {0}")]
    Refinery(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Migration {version} failed: {reason}")]
    MigrationFailed { version: u32, reason: String },

    #[error("Verification failed for {database} at version {version}: {reason}")]
    VerificationFailed {
        database: String,
        version: u32,
        reason: String,
    },

    #[error("Dependency cycle detected among: {0:?}")]
    DependencyCycle(Vec<DatabaseId>),

    #[error("Dependency not satisfied: {database} requires {dependency}")]
    DependencyNotSatisfied {
        database: String,
        dependency: String,
    },

    #[error("Unknown database: {0}")]
    UnknownDatabase(String),

    #[error("Insufficient disk space: {available_mb}MB available, need at least {required_mb}MB. Please free up disk space and retry.")]
    InsufficientDiskSpace { available_mb: u64, required_mb: u64 },
}

impl From<SchemaRegistryError> for MigrationError {
    fn from(err: SchemaRegistryError) -> Self {
        match err {
            SchemaRegistryError::Database(msg) => MigrationError::Database(msg),
            SchemaRegistryError::DependencyCycle(ids) => MigrationError::DependencyCycle(ids),
            SchemaRegistryError::DependencyNotSatisfied {
                database,
                missing_dependency,
            } => MigrationError::DependencyNotSatisfied {
                database: database.as_str().to_string(),
                dependency: missing_dependency.as_str().to_string(),
            },
        }
    }
}

impl From<crate::data_governance::database::DatabaseError> for MigrationError {
    fn from(err: crate::data_governance::database::DatabaseError) -> Self {
        use crate::data_governance::database::DatabaseError;
        match err {
            DatabaseError::Io { source, .. } => MigrationError::Io(source),
            other => MigrationError::Database(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_migration_sets_count() {
        assert_eq!(ALL_MIGRATION_SETS.len(), DATABASE_COUNT);
        assert_eq!(DatabaseId::ALL.len(), DATABASE_COUNT);
    }

    #[test]
    fn test_every_database_has_a_set() {
        for id in DatabaseId::ALL {
            let set = get_migration_set(id);
            assert_eq!(set.database, id);
            assert!(!set.migrations.is_empty(), "{} has no migrations", id);
            assert!(target_version(id) > 0);
        }
    }

    #[test]
    fn test_versions_strictly_ascending() {
        for set in ALL_MIGRATION_SETS {
            let versions: Vec<i32> = set.migrations.iter().map(|m| m.refinery_version).collect();
            let mut sorted = versions.clone();
            sorted.sort();
            sorted.dedup();
            assert_eq!(versions, sorted, "{} versions out of order", set.database);
        }
    }

    #[test]
    fn test_migration_sql_embedded() {
        for set in ALL_MIGRATION_SETS {
            for m in set.migrations {
                assert!(!m.sql.trim().is_empty(), "{}:{} empty", set.database, m.name);
            }
        }
    }
}
