//! # Chat V2 数据库迁移定义
//!
//! | 表名 | 说明 |
//! |-----|------|
//! | chat_v2_sessions | 会话表 |
//! | chat_v2_messages | 消息表 |
//! | chat_v2_blocks | 块表 |
//! | chat_v2_attachments | 附件表 |
//! | chat_v2_migration_ledger | 旧版聊天迁移台账 |

use super::definitions::{MigrationDef, MigrationSet};
use crate::data_governance::schema_registry::DatabaseId;

const V001_EXPECTED_TABLES: &[&str] = &[
    "chat_v2_sessions",
    "chat_v2_messages",
    "chat_v2_blocks",
    "chat_v2_attachments",
];

const V001_EXPECTED_INDEXES: &[&str] = &[
    "idx_chat_v2_sessions_created_at",
    "idx_chat_v2_messages_session_id",
    "idx_chat_v2_blocks_message_id",
    "idx_chat_v2_attachments_message_id",
];

pub const V20260130_INIT: MigrationDef = MigrationDef::new(
    20260130,
    "init",
    include_str!("../../../migrations/chat_v2/V20260130__init.sql"),
)
.with_expected_tables(V001_EXPECTED_TABLES)
.with_expected_indexes(V001_EXPECTED_INDEXES);

pub const V20260131_CHANGE_LOG: MigrationDef = MigrationDef::new(
    20260131,
    "change_log",
    include_str!("../../../migrations/chat_v2/V20260131__change_log.sql"),
)
.with_expected_tables(&["__change_log"]);

/// V20260215: 旧版聊天迁移台账
pub const V20260215_LEGACY_MIGRATION_LEDGER: MigrationDef = MigrationDef::new(
    20260215,
    "legacy_migration_ledger",
    include_str!("../../../migrations/chat_v2/V20260215__legacy_migration_ledger.sql"),
)
.with_expected_tables(&["chat_v2_migration_ledger"])
.with_expected_indexes(&["idx_chat_v2_migration_ledger_session"]);

pub static CHAT_V2_MIGRATION_SET: MigrationSet = MigrationSet {
    database: DatabaseId::ChatV2,
    migrations: &[
        V20260130_INIT,
        V20260131_CHANGE_LOG,
        V20260215_LEGACY_MIGRATION_LEDGER,
    ],
};
