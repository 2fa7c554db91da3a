//! # 知识图谱数据库迁移定义
//!
//! 图谱节点引用笔记 ID，因此依赖 notes 库先完成迁移。

use super::definitions::{MigrationDef, MigrationSet};
use crate::data_governance::schema_registry::DatabaseId;

pub const V20260130_INIT: MigrationDef = MigrationDef::new(
    20260130,
    "init",
    include_str!("../../../migrations/graph/V20260130__init.sql"),
)
.with_expected_tables(&["graph_nodes", "graph_edges"])
.with_expected_indexes(&["idx_graph_edges_source", "idx_graph_edges_target"]);

pub const V20260131_CHANGE_LOG: MigrationDef = MigrationDef::new(
    20260131,
    "change_log",
    include_str!("../../../migrations/graph/V20260131__change_log.sql"),
)
.with_expected_tables(&["__change_log"]);

pub static GRAPH_MIGRATION_SET: MigrationSet = MigrationSet {
    database: DatabaseId::Graph,
    migrations: &[V20260130_INIT, V20260131_CHANGE_LOG],
};
