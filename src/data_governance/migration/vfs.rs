//! # VFS 数据库迁移定义
//!
//! 虚拟文件系统：统一资源、外部 blob、文件夹组织。

use super::definitions::{MigrationDef, MigrationSet};
use crate::data_governance::schema_registry::DatabaseId;

/// V20260130: VFS 初始化
pub const V20260130_INIT: MigrationDef = MigrationDef::new(
    20260130,
    "init",
    include_str!("../../../migrations/vfs/V20260130__init.sql"),
)
.with_expected_tables(&["resources", "blobs", "folders", "folder_items"])
.with_expected_indexes(&["idx_resources_hash", "idx_folder_items_folder"]);

/// V20260131: 变更日志
pub const V20260131_CHANGE_LOG: MigrationDef = MigrationDef::new(
    20260131,
    "change_log",
    include_str!("../../../migrations/vfs/V20260131__change_log.sql"),
)
.with_expected_tables(&["__change_log"]);

pub static VFS_MIGRATION_SET: MigrationSet = MigrationSet {
    database: DatabaseId::Vfs,
    migrations: &[V20260130_INIT, V20260131_CHANGE_LOG],
};
