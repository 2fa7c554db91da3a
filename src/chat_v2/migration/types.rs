//! 迁移相关类型定义

use serde::{Deserialize, Serialize};

/// 块类型
pub mod block_types {
    pub const THINKING: &str = "thinking";
    pub const CONTENT: &str = "content";
    pub const RAG: &str = "rag";
    pub const MEMORY: &str = "memory";
    pub const WEB_SEARCH: &str = "web_search";
    pub const GRAPH: &str = "graph";
    pub const MCP_TOOL: &str = "mcp_tool";
}

/// 块状态
pub mod block_status {
    pub const SUCCESS: &str = "success";
}

/// 迁移状态
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    RolledBack,
    Failed,
    /// 用户取消（已提交的分组保留）
    Cancelled,
}

/// 迁移步骤
///
/// 顺序固定；`CreateSession` 到 `MarkMigrated` 针对每个分组重复执行。
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStep {
    #[default]
    CheckLegacyData,
    GroupByMistakeId,
    CreateSession,
    MigrateMessages,
    CreateBlocks,
    CreateAttachments,
    MarkMigrated,
    Finished,
}

impl MigrationStep {
    /// 下一步；`MarkMigrated` 之后回到下一个分组的 `CreateSession` 由执行器决定
    pub fn next(self) -> Option<MigrationStep> {
        match self {
            MigrationStep::CheckLegacyData => Some(MigrationStep::GroupByMistakeId),
            MigrationStep::GroupByMistakeId => Some(MigrationStep::CreateSession),
            MigrationStep::CreateSession => Some(MigrationStep::MigrateMessages),
            MigrationStep::MigrateMessages => Some(MigrationStep::CreateBlocks),
            MigrationStep::CreateBlocks => Some(MigrationStep::CreateAttachments),
            MigrationStep::CreateAttachments => Some(MigrationStep::MarkMigrated),
            MigrationStep::MarkMigrated => Some(MigrationStep::Finished),
            MigrationStep::Finished => None,
        }
    }

    /// 此步骤之后是否已有会话写入（可以回滚）
    pub fn has_created_sessions(self) -> bool {
        self >= MigrationStep::CreateSession
    }
}

/// 迁移进度
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationProgress {
    pub status: MigrationStatus,
    pub current_step: MigrationStep,
    pub total_messages: usize,
    pub migrated_messages: usize,
    /// 总会话数（按 mistake_id 分组）
    pub total_sessions: usize,
    pub created_sessions: usize,
    /// 进度百分比 (0-100)
    pub percent: u8,
    pub current_mistake_id: Option<String>,
    pub error: Option<String>,
}

impl MigrationProgress {
    pub fn update_percent(&mut self) {
        if self.total_messages > 0 {
            let ratio = self.migrated_messages as f64 / self.total_messages as f64;
            self.percent = (ratio * 100.0).min(100.0) as u8;
        }
    }
}

/// 迁移报告
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub status: MigrationStatus,
    pub sessions_created: usize,
    pub messages_migrated: usize,
    pub blocks_created: usize,
    pub attachments_created: usize,
    /// 已迁移过、本次只补标记的消息数
    pub messages_skipped: usize,
    /// 回滚删除的会话数
    #[serde(default)]
    pub sessions_removed: usize,
    /// 回滚重置标记的消息数
    #[serde(default)]
    pub messages_reset: usize,
    pub errors: Vec<String>,
    /// 开始时间（毫秒时间戳）
    pub started_at: i64,
    pub ended_at: i64,
    pub duration_ms: i64,
}

impl MigrationReport {
    /// 没有任何待迁移数据
    pub fn is_noop(&self) -> bool {
        self.messages_migrated == 0 && self.sessions_created == 0 && self.errors.is_empty()
    }
}

/// 迁移事件（通过 `chat_v2_migration` 通道广播）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationEvent {
    pub event_type: MigrationEventType,
    pub progress: MigrationProgress,
    pub message: String,
}

/// 迁移事件类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationEventType {
    Started,
    Progress,
    StepChanged,
    Completed,
    Failed,
    RollbackStarted,
    RollbackCompleted,
    RollbackFailed,
}

/// 迁移检查结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationCheckResult {
    pub status: MigrationStatus,
    pub needs_migration: bool,
    pub pending_messages: usize,
    /// 未迁移的会话数（按 mistake_id 分组）
    pub pending_sessions: usize,
    pub migrated_messages: usize,
    pub can_rollback: bool,
    /// 上次迁移时间（毫秒时间戳）
    pub last_migration_at: Option<i64>,
}
