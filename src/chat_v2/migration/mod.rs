//! Chat V2 数据迁移模块
//!
//! 将旧版 chat_messages（按 mistake_id 平铺的消息）迁移到会话 / 消息 / 块 / 附件模型

mod legacy_migration;
pub mod types;

pub use legacy_migration::{
    check_migration_status, migrate_legacy_chat, rollback_migration, MigrationEventSender,
    MigrationExecutor, MIGRATION_EVENT_CHANNEL,
};
pub use types::{
    MigrationCheckResult, MigrationEvent, MigrationEventType, MigrationProgress, MigrationReport,
    MigrationStatus, MigrationStep,
};
