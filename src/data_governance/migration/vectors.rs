//! # 向量索引数据库迁移定义

use super::definitions::{MigrationDef, MigrationSet};
use crate::data_governance::schema_registry::DatabaseId;

pub const V20260130_INIT: MigrationDef = MigrationDef::new(
    20260130,
    "init",
    include_str!("../../../migrations/vectors/V20260130__init.sql"),
)
.with_expected_tables(&["vector_index_units", "vector_segments", "vector_embedding_dims"])
.with_expected_indexes(&["idx_vector_units_resource"]);

pub const V20260131_CHANGE_LOG: MigrationDef = MigrationDef::new(
    20260131,
    "change_log",
    include_str!("../../../migrations/vectors/V20260131__change_log.sql"),
)
.with_expected_tables(&["__change_log"]);

pub static VECTORS_MIGRATION_SET: MigrationSet = MigrationSet {
    database: DatabaseId::Vectors,
    migrations: &[V20260130_INIT, V20260131_CHANGE_LOG],
};
