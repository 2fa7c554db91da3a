//! 旧版 chat_messages 迁移到 Chat V2 的核心实现
//!
//! 每个 mistake_id 分组在 chat_v2 库的单个事务内完成：会话、消息、块、附件和台账行
//! 要么全部写入，要么全部不写。事务提交后才在旧库标记 `migrated_to_v2`；
//! 标记失败时台账保证重跑不会重复创建会话。

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::broadcast;

use crate::chat_v2::error::ChatV2Error;

use super::types::{
    block_status, block_types, MigrationCheckResult, MigrationEvent, MigrationEventType,
    MigrationProgress, MigrationReport, MigrationStatus, MigrationStep,
};

/// 迁移事件通道名
pub const MIGRATION_EVENT_CHANNEL: &str = "chat_v2_migration";

/// 迁移事件发送端
pub type MigrationEventSender = broadcast::Sender<MigrationEvent>;

const LEDGER_TABLE: &str = "chat_v2_migration_ledger";
const MIGRATED_FROM: &str = "chat_messages";

/// 标题最大长度
const TITLE_MAX_LENGTH: usize = 50;

/// 旧版消息结构（从 chat_messages 表读取）
#[derive(Debug, Clone)]
struct LegacyMessage {
    id: i64,
    mistake_id: String,
    role: String,
    content: String,
    timestamp: String,
    thinking_content: Option<String>,
    rag_sources: Option<String>,
    memory_sources: Option<String>,
    graph_sources: Option<String>,
    web_search_sources: Option<String>,
    image_paths: Option<String>,
    image_base64: Option<String>,
    doc_attachments: Option<String>,
    tool_call: Option<String>,
    tool_result: Option<String>,
    stable_id: Option<String>,
    metadata: Option<String>,
}

/// 待写入的附件行
#[derive(Debug, Clone)]
struct AttachmentRow {
    id: String,
    kind: &'static str,
    name: String,
    mime_type: String,
    size: i64,
    preview_url: Option<String>,
}

impl AttachmentRow {
    fn to_json(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "type": self.kind,
            "mimeType": self.mime_type,
            "size": self.size,
            "status": "ready",
            "previewUrl": self.preview_url,
        })
    }
}

/// 单个分组的迁移结果
#[derive(Debug, Default)]
struct GroupOutcome {
    session_id: String,
    session_created: bool,
    migrated_ids: Vec<i64>,
    skipped_ids: Vec<i64>,
    blocks: usize,
    attachments: usize,
}

/// 迁移执行器
pub struct MigrationExecutor<'a> {
    events: Option<MigrationEventSender>,
    should_cancel: Option<&'a dyn Fn() -> bool>,
    progress: MigrationProgress,
    report: MigrationReport,
}

impl<'a> MigrationExecutor<'a> {
    pub fn new(events: Option<MigrationEventSender>) -> Self {
        Self {
            events,
            should_cancel: None,
            progress: MigrationProgress::default(),
            report: MigrationReport::default(),
        }
    }

    /// 分组之间检查取消标志；已提交的分组保留
    pub fn with_cancel_check(mut self, should_cancel: &'a dyn Fn() -> bool) -> Self {
        self.should_cancel = Some(should_cancel);
        self
    }

    pub fn progress(&self) -> &MigrationProgress {
        &self.progress
    }

    fn emit_event(&self, event_type: MigrationEventType, message: &str) {
        if let Some(ref sender) = self.events {
            let event = MigrationEvent {
                event_type,
                progress: self.progress.clone(),
                message: message.to_string(),
            };
            // 没有订阅者时 send 返回错误，属正常情况
            if sender.send(event).is_err() {
                tracing::trace!("[Migration] 无事件订阅者: {}", message);
            }
        }
    }

    fn enter_step(&mut self, step: MigrationStep, message: &str) {
        self.progress.current_step = step;
        self.progress.update_percent();
        self.emit_event(MigrationEventType::StepChanged, message);
    }

    fn is_cancelled(&self) -> bool {
        self.should_cancel.map(|check| check()).unwrap_or(false)
    }

    /// 执行迁移
    ///
    /// 单个分组失败会记录到报告并继续其他分组（报告状态为 `Failed`）；
    /// 取消返回 `ChatV2Error::Cancelled`；其余错误直接返回。
    pub fn execute(
        &mut self,
        data_conn: &Connection,
        chat_v2_conn: &Connection,
    ) -> Result<MigrationReport, ChatV2Error> {
        self.report.started_at = Utc::now().timestamp_millis();
        self.progress.status = MigrationStatus::InProgress;
        self.emit_event(MigrationEventType::Started, "开始迁移旧版对话数据");

        let result = self.execute_internal(data_conn, chat_v2_conn);

        self.report.ended_at = Utc::now().timestamp_millis();
        self.report.duration_ms = self.report.ended_at - self.report.started_at;

        match result {
            Ok(()) if self.report.errors.is_empty() => {
                self.report.status = MigrationStatus::Completed;
                self.progress.status = MigrationStatus::Completed;
                self.progress.percent = 100;
                self.emit_event(MigrationEventType::Completed, "迁移完成");
                Ok(self.report.clone())
            }
            Ok(()) => {
                self.report.status = MigrationStatus::Failed;
                self.progress.status = MigrationStatus::Failed;
                self.progress.error = self.report.errors.first().cloned();
                let message = format!("{} 个分组迁移失败", self.report.errors.len());
                self.emit_event(MigrationEventType::Failed, &message);
                Ok(self.report.clone())
            }
            Err(ChatV2Error::Cancelled) => {
                self.report.status = MigrationStatus::Cancelled;
                self.progress.status = MigrationStatus::Cancelled;
                self.emit_event(MigrationEventType::Failed, "迁移已取消");
                Err(ChatV2Error::Cancelled)
            }
            Err(e) => {
                self.report.status = MigrationStatus::Failed;
                self.progress.status = MigrationStatus::Failed;
                self.progress.error = Some(e.to_string());
                self.report.errors.push(e.to_string());
                self.emit_event(MigrationEventType::Failed, &format!("迁移失败: {}", e));
                Err(e)
            }
        }
    }

    fn execute_internal(
        &mut self,
        data_conn: &Connection,
        chat_v2_conn: &Connection,
    ) -> Result<(), ChatV2Error> {
        ensure_ledger(chat_v2_conn)?;

        self.enter_step(MigrationStep::CheckLegacyData, "正在检查旧版数据...");
        if !table_exists(data_conn, "chat_messages")? {
            tracing::info!("[Migration] 旧库没有 chat_messages 表，无需迁移");
            self.enter_step(MigrationStep::Finished, "没有需要迁移的数据");
            return Ok(());
        }
        ensure_migration_columns(data_conn)?;
        let legacy_messages = load_legacy_messages(data_conn)?;

        if legacy_messages.is_empty() {
            tracing::info!("[Migration] 没有需要迁移的消息");
            self.enter_step(MigrationStep::Finished, "没有需要迁移的数据");
            return Ok(());
        }

        self.progress.total_messages = legacy_messages.len();
        tracing::info!("[Migration] 发现 {} 条待迁移消息", legacy_messages.len());

        self.enter_step(MigrationStep::GroupByMistakeId, "正在分组消息...");
        let grouped = group_by_mistake_id(legacy_messages);
        self.progress.total_sessions = grouped.len();
        let ledger = load_ledger(chat_v2_conn)?;
        tracing::info!(
            "[Migration] 分组为 {} 个会话（台账已有 {} 个）",
            grouped.len(),
            ledger.len()
        );

        for (mistake_id, messages) in grouped {
            if self.is_cancelled() {
                tracing::info!("[Migration] 迁移在分组 {} 之前被取消", mistake_id);
                return Err(ChatV2Error::Cancelled);
            }
            self.progress.current_mistake_id = Some(mistake_id.clone());
            let existing_session = ledger.get(&mistake_id).cloned();
            let group_size = messages.len();

            match self.migrate_group(
                data_conn,
                chat_v2_conn,
                &mistake_id,
                &messages,
                existing_session,
            ) {
                Ok(outcome) => {
                    self.progress.current_step = MigrationStep::MarkMigrated;
                    let mut to_mark = outcome.migrated_ids.clone();
                    to_mark.extend_from_slice(&outcome.skipped_ids);
                    if let Err(e) = mark_messages_migrated(data_conn, &to_mark, &outcome.session_id)
                    {
                        // 会话已提交且有台账记录，重跑时只会补标记
                        tracing::warn!(
                            "[Migration] 分组 {} 标记失败（V2 数据已保存）: {}",
                            mistake_id,
                            e
                        );
                    }

                    if outcome.session_created {
                        self.report.sessions_created += 1;
                        self.progress.created_sessions += 1;
                    }
                    self.report.messages_migrated += outcome.migrated_ids.len();
                    self.report.messages_skipped += outcome.skipped_ids.len();
                    self.report.blocks_created += outcome.blocks;
                    self.report.attachments_created += outcome.attachments;
                }
                Err(e) => {
                    tracing::error!("[Migration] 分组 {} 迁移失败并已回滚: {}", mistake_id, e);
                    self.report
                        .errors
                        .push(format!("会话 {} 迁移失败: {}", mistake_id, e));
                }
            }

            // 每个分组结束后上报一次进度（失败分组同样计入已处理）
            self.progress.migrated_messages += group_size;
            self.progress.update_percent();
            self.emit_event(
                MigrationEventType::Progress,
                &format!(
                    "已处理 {}/{} 条消息",
                    self.progress.migrated_messages, self.progress.total_messages
                ),
            );
        }

        self.progress.current_mistake_id = None;
        self.enter_step(MigrationStep::Finished, "迁移完成");
        Ok(())
    }

    /// 在单个事务内迁移一个分组
    fn migrate_group(
        &mut self,
        data_conn: &Connection,
        chat_v2_conn: &Connection,
        mistake_id: &str,
        messages: &[LegacyMessage],
        existing_session: Option<String>,
    ) -> Result<GroupOutcome, ChatV2Error> {
        let tx = chat_v2_conn.unchecked_transaction()?;
        let mut outcome = GroupOutcome::default();

        self.progress.current_step = MigrationStep::CreateSession;
        let pending: Vec<&LegacyMessage> = match existing_session {
            Some(session_id) => {
                // 台账已有该分组：只补迁移会话里还没有的消息
                let present = migrated_legacy_ids(&tx, &session_id)?;
                let mut pending = Vec::new();
                for msg in messages {
                    if present.contains(&msg.id) {
                        outcome.skipped_ids.push(msg.id);
                    } else {
                        pending.push(msg);
                    }
                }
                outcome.session_id = session_id;
                pending
            }
            None => {
                let title = session_title(data_conn, mistake_id, messages);
                outcome.session_id = create_session(&tx, mistake_id, &title)?;
                outcome.session_created = true;
                messages.iter().collect()
            }
        };

        self.progress.current_step = MigrationStep::MigrateMessages;
        let mut inserted = Vec::with_capacity(pending.len());
        for msg in &pending {
            let message_id = insert_message(&tx, &outcome.session_id, msg)?;
            inserted.push((message_id, *msg));
        }

        self.progress.current_step = MigrationStep::CreateBlocks;
        for (message_id, msg) in &inserted {
            outcome.blocks += create_blocks(&tx, message_id, msg)?;
        }

        self.progress.current_step = MigrationStep::CreateAttachments;
        for (message_id, msg) in &inserted {
            outcome.attachments += create_attachments(&tx, message_id, msg)?;
        }

        tx.execute(
            "INSERT INTO chat_v2_migration_ledger (mistake_id, session_id, message_count, migrated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(mistake_id) DO UPDATE SET
                message_count = message_count + excluded.message_count,
                migrated_at = excluded.migrated_at",
            params![
                mistake_id,
                outcome.session_id,
                inserted.len() as i64,
                Utc::now().to_rfc3339()
            ],
        )?;

        tx.commit()?;
        outcome.migrated_ids = inserted.iter().map(|(_, msg)| msg.id).collect();
        Ok(outcome)
    }
}

// ============================================================================
// 读取旧数据
// ============================================================================

fn table_exists(conn: &Connection, table: &str) -> Result<bool, ChatV2Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, ChatV2Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn ensure_ledger(chat_v2_conn: &Connection) -> Result<(), ChatV2Error> {
    if table_exists(chat_v2_conn, LEDGER_TABLE)? {
        Ok(())
    } else {
        Err(ChatV2Error::Validation(
            "chat_v2 数据库缺少迁移台账表，请先执行 chat_v2 数据库迁移".to_string(),
        ))
    }
}

/// 旧表按需补充迁移标记列
fn ensure_migration_columns(conn: &Connection) -> Result<(), ChatV2Error> {
    if !has_column(conn, "chat_messages", "migrated_to_v2")? {
        conn.execute(
            "ALTER TABLE chat_messages ADD COLUMN migrated_to_v2 INTEGER DEFAULT 0",
            [],
        )?;
    }
    if !has_column(conn, "chat_messages", "migrated_session_id")? {
        conn.execute(
            "ALTER TABLE chat_messages ADD COLUMN migrated_session_id TEXT",
            [],
        )?;
    }
    Ok(())
}

/// 加载未迁移的旧版消息
fn load_legacy_messages(conn: &Connection) -> Result<Vec<LegacyMessage>, ChatV2Error> {
    let mut stmt = conn.prepare(
        "SELECT id, mistake_id, role, content, timestamp, thinking_content,
                rag_sources, memory_sources, graph_sources, web_search_sources,
                image_paths, image_base64, doc_attachments, tool_call, tool_result,
                stable_id, metadata
         FROM chat_messages
         WHERE migrated_to_v2 = 0 OR migrated_to_v2 IS NULL
         ORDER BY mistake_id, timestamp, id",
    )?;

    let messages = stmt
        .query_map([], |row| {
            Ok(LegacyMessage {
                id: row.get(0)?,
                mistake_id: row.get(1)?,
                role: row.get(2)?,
                content: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                timestamp: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                thinking_content: row.get(5)?,
                rag_sources: row.get(6)?,
                memory_sources: row.get(7)?,
                graph_sources: row.get(8)?,
                web_search_sources: row.get(9)?,
                image_paths: row.get(10)?,
                image_base64: row.get(11)?,
                doc_attachments: row.get(12)?,
                tool_call: row.get(13)?,
                tool_result: row.get(14)?,
                stable_id: row.get(15)?,
                metadata: row.get(16)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(messages)
}

/// 按 mistake_id 分组（有序，保证每次运行的分组顺序一致）
fn group_by_mistake_id(messages: Vec<LegacyMessage>) -> BTreeMap<String, Vec<LegacyMessage>> {
    let mut groups: BTreeMap<String, Vec<LegacyMessage>> = BTreeMap::new();
    for msg in messages {
        groups.entry(msg.mistake_id.clone()).or_default().push(msg);
    }
    groups
}

fn load_ledger(chat_v2_conn: &Connection) -> Result<HashMap<String, String>, ChatV2Error> {
    let mut stmt =
        chat_v2_conn.prepare("SELECT mistake_id, session_id FROM chat_v2_migration_ledger")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<HashMap<String, String>, _>>()?;
    Ok(rows)
}

/// 会话中已存在的旧版消息 ID（来自消息元数据 legacyId）
fn migrated_legacy_ids(conn: &Connection, session_id: &str) -> Result<Vec<i64>, ChatV2Error> {
    let mut stmt = conn.prepare(
        "SELECT json_extract(meta_json, '$.legacyId') FROM chat_v2_messages
         WHERE session_id = ?1 AND json_extract(meta_json, '$.legacyId') IS NOT NULL",
    )?;
    let ids = stmt
        .query_map([session_id], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// 获取会话标题
/// 优先级：1. chat_metadata.title  2. ocr_text  3. user_question  4. 首条用户消息  5. 默认标题
fn session_title(data_conn: &Connection, mistake_id: &str, messages: &[LegacyMessage]) -> String {
    let mistake_info: Option<(Option<String>, Option<String>, Option<String>)> = data_conn
        .query_row(
            "SELECT ocr_text, user_question, chat_metadata FROM mistakes WHERE id = ?1",
            [mistake_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .unwrap_or_else(|e| {
            tracing::debug!("[Migration] 读取错题 {} 信息失败: {}", mistake_id, e);
            None
        });

    if let Some((ocr_text, user_question, chat_metadata)) = mistake_info {
        let meta_title = chat_metadata
            .and_then(|json| serde_json::from_str::<Value>(&json).ok())
            .and_then(|meta| meta.get("title").and_then(Value::as_str).map(str::to_string))
            .filter(|title| !title.is_empty() && title != "新对话");
        if let Some(title) = meta_title {
            return truncate_title(&title);
        }

        for candidate in [ocr_text, user_question].into_iter().flatten() {
            let trimmed = candidate.trim();
            if !trimmed.is_empty() {
                return truncate_title(trimmed);
            }
        }
    }

    if let Some(first_user_msg) = messages.iter().find(|m| m.role == "user") {
        let content = first_user_msg.content.trim();
        if !content.is_empty() {
            return truncate_title(content);
        }
    }

    "对话（迁移）".to_string()
}

/// 只取第一行，按字符截断
fn truncate_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or(text).trim();
    let chars: Vec<char> = first_line.chars().collect();
    if chars.len() <= TITLE_MAX_LENGTH {
        first_line.to_string()
    } else {
        let truncated: String = chars[..TITLE_MAX_LENGTH].iter().collect();
        format!("{}...", truncated)
    }
}

/// 解析时间戳；无法解析时回退到 UNIX_EPOCH，避免旧数据"变成最新"
fn parse_timestamp(ts: &str) -> i64 {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|e| {
            tracing::warn!("[Migration] 无法解析时间戳 '{}': {}，使用 0", ts, e);
            0
        })
}

fn non_empty_sources(sources: &Option<String>) -> Option<&str> {
    sources
        .as_deref()
        .filter(|s| !s.is_empty() && *s != "[]" && *s != "null")
}

// ============================================================================
// 写入 Chat V2
// ============================================================================

fn create_session(conn: &Connection, mistake_id: &str, title: &str) -> Result<String, ChatV2Error> {
    let session_id = format!("sess_{}", uuid::Uuid::new_v4());
    let now = Utc::now();

    let metadata = serde_json::json!({
        "mistakeId": mistake_id,
        "migratedFrom": MIGRATED_FROM,
        "migratedAt": now.timestamp_millis()
    });

    conn.execute(
        "INSERT INTO chat_v2_sessions (id, mode, title, persist_status, created_at, updated_at, metadata_json)
         VALUES (?1, 'analysis', ?2, 'active', ?3, ?3, ?4)",
        params![session_id, title, now.to_rfc3339(), metadata.to_string()],
    )?;

    Ok(session_id)
}

fn message_meta(msg: &LegacyMessage) -> Value {
    let mut meta = serde_json::Map::new();
    meta.insert("migratedFrom".to_string(), Value::from(MIGRATED_FROM));
    meta.insert("legacyId".to_string(), Value::from(msg.id));
    if let Some(legacy) = msg
        .metadata
        .as_deref()
        .and_then(|m| serde_json::from_str::<Value>(m).ok())
    {
        meta.insert("legacyMetadata".to_string(), legacy);
    }
    Value::Object(meta)
}

/// 先以空块列表插入消息，块和附件在后续步骤中补齐
fn insert_message(
    conn: &Connection,
    session_id: &str,
    msg: &LegacyMessage,
) -> Result<String, ChatV2Error> {
    let message_id = format!("msg_{}", uuid::Uuid::new_v4());
    let role = if msg.role == "user" { "user" } else { "assistant" };

    conn.execute(
        "INSERT INTO chat_v2_messages (id, session_id, role, block_ids_json, timestamp, persistent_stable_id, meta_json)
         VALUES (?1, ?2, ?3, '[]', ?4, ?5, ?6)",
        params![
            message_id,
            session_id,
            role,
            parse_timestamp(&msg.timestamp),
            msg.stable_id,
            message_meta(msg).to_string(),
        ],
    )?;

    Ok(message_id)
}

fn insert_block(
    conn: &Connection,
    message_id: &str,
    block_type: &str,
    block_index: usize,
    content: Option<&str>,
    citations_json: Option<&str>,
) -> Result<String, ChatV2Error> {
    let block_id = format!("blk_{}", uuid::Uuid::new_v4());
    let now = Utc::now().timestamp_millis();

    conn.execute(
        "INSERT INTO chat_v2_blocks (id, message_id, block_type, status, block_index, content, citations_json, started_at, ended_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            block_id,
            message_id,
            block_type,
            block_status::SUCCESS,
            block_index as i64,
            content,
            citations_json,
            now,
        ],
    )?;

    Ok(block_id)
}

fn insert_tool_block(
    conn: &Connection,
    message_id: &str,
    block_index: usize,
    tool_call_json: &str,
    tool_output_json: Option<&str>,
) -> Result<String, ChatV2Error> {
    let block_id = format!("blk_{}", uuid::Uuid::new_v4());
    let now = Utc::now().timestamp_millis();

    let tool_name: Option<String> = serde_json::from_str::<Value>(tool_call_json)
        .ok()
        .and_then(|v| v.get("name").and_then(Value::as_str).map(str::to_string));

    conn.execute(
        "INSERT INTO chat_v2_blocks (id, message_id, block_type, status, block_index, tool_name, tool_input_json, tool_output_json, started_at, ended_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            block_id,
            message_id,
            block_types::MCP_TOOL,
            block_status::SUCCESS,
            block_index as i64,
            tool_name,
            tool_call_json,
            tool_output_json,
            now,
        ],
    )?;

    Ok(block_id)
}

/// 按固定顺序创建块：thinking → content → rag → memory → web_search → graph → mcp_tool
fn create_blocks(conn: &Connection, message_id: &str, msg: &LegacyMessage) -> Result<usize, ChatV2Error> {
    let mut block_ids = Vec::new();

    if let Some(thinking) = msg.thinking_content.as_deref().filter(|t| !t.is_empty()) {
        block_ids.push(insert_block(
            conn,
            message_id,
            block_types::THINKING,
            block_ids.len(),
            Some(thinking),
            None,
        )?);
    }

    if !msg.content.is_empty() {
        block_ids.push(insert_block(
            conn,
            message_id,
            block_types::CONTENT,
            block_ids.len(),
            Some(&msg.content),
            None,
        )?);
    }

    let citation_blocks = [
        (block_types::RAG, &msg.rag_sources),
        (block_types::MEMORY, &msg.memory_sources),
        (block_types::WEB_SEARCH, &msg.web_search_sources),
        (block_types::GRAPH, &msg.graph_sources),
    ];
    for (block_type, sources) in citation_blocks {
        if let Some(sources) = non_empty_sources(sources) {
            block_ids.push(insert_block(
                conn,
                message_id,
                block_type,
                block_ids.len(),
                None,
                Some(sources),
            )?);
        }
    }

    if let Some(tool_call) = non_empty_sources(&msg.tool_call) {
        block_ids.push(insert_tool_block(
            conn,
            message_id,
            block_ids.len(),
            tool_call,
            msg.tool_result.as_deref(),
        )?);
    }

    if !block_ids.is_empty() {
        conn.execute(
            "UPDATE chat_v2_messages SET block_ids_json = ?1 WHERE id = ?2",
            params![serde_json::to_string(&block_ids)?, message_id],
        )?;
    }

    Ok(block_ids.len())
}

fn collect_attachments(msg: &LegacyMessage) -> Vec<AttachmentRow> {
    let mut rows = Vec::new();

    let parse_list = |raw: &Option<String>| -> Vec<String> {
        raw.as_deref()
            .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
            .unwrap_or_default()
    };

    for (i, path) in parse_list(&msg.image_paths).into_iter().enumerate() {
        rows.push(AttachmentRow {
            id: format!("att_{}", uuid::Uuid::new_v4()),
            kind: "image",
            name: format!("image_{}.jpg", i + 1),
            mime_type: "image/jpeg".to_string(),
            size: 0,
            preview_url: Some(path),
        });
    }

    for (i, b64) in parse_list(&msg.image_base64).into_iter().enumerate() {
        rows.push(AttachmentRow {
            id: format!("att_{}", uuid::Uuid::new_v4()),
            kind: "image",
            name: format!("image_{}.jpg", i + 1),
            mime_type: "image/jpeg".to_string(),
            size: b64.len() as i64,
            preview_url: Some(format!("data:image/jpeg;base64,{}", b64)),
        });
    }

    let docs = msg
        .doc_attachments
        .as_deref()
        .and_then(|s| serde_json::from_str::<Vec<Value>>(s).ok())
        .unwrap_or_default();
    for doc in docs {
        rows.push(AttachmentRow {
            id: format!("att_{}", uuid::Uuid::new_v4()),
            kind: "document",
            name: doc
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("document")
                .to_string(),
            mime_type: doc
                .get("mimeType")
                .and_then(Value::as_str)
                .unwrap_or("application/octet-stream")
                .to_string(),
            size: doc.get("size").and_then(Value::as_i64).unwrap_or(0),
            preview_url: None,
        });
    }

    rows
}

/// 写入附件行，并同步消息上的 attachments_json
fn create_attachments(
    conn: &Connection,
    message_id: &str,
    msg: &LegacyMessage,
) -> Result<usize, ChatV2Error> {
    let rows = collect_attachments(msg);
    if rows.is_empty() {
        return Ok(0);
    }

    let now = Utc::now().timestamp_millis();
    for row in &rows {
        conn.execute(
            "INSERT INTO chat_v2_attachments (id, message_id, type, name, mime_type, size, preview_url, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'ready', ?8)",
            params![
                row.id,
                message_id,
                row.kind,
                row.name,
                row.mime_type,
                row.size,
                row.preview_url,
                now
            ],
        )?;
    }

    let json: Vec<Value> = rows.iter().map(AttachmentRow::to_json).collect();
    conn.execute(
        "UPDATE chat_v2_messages SET attachments_json = ?1 WHERE id = ?2",
        params![serde_json::to_string(&json)?, message_id],
    )?;

    Ok(rows.len())
}

/// 标记旧版消息已迁移（单个事务）
fn mark_messages_migrated(
    conn: &Connection,
    legacy_ids: &[i64],
    session_id: &str,
) -> Result<(), ChatV2Error> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "UPDATE chat_messages SET migrated_to_v2 = 1, migrated_session_id = ?1 WHERE id = ?2",
        )?;
        for id in legacy_ids {
            stmt.execute(params![session_id, id])?;
        }
    }
    tx.commit()?;
    Ok(())
}

// ============================================================================
// 公开函数
// ============================================================================

/// 检查迁移状态
pub fn check_migration_status(
    data_conn: &Connection,
    chat_v2_conn: &Connection,
) -> Result<MigrationCheckResult, ChatV2Error> {
    let mut result = MigrationCheckResult::default();

    if !table_exists(data_conn, "chat_messages")? {
        return Ok(result);
    }

    if has_column(data_conn, "chat_messages", "migrated_to_v2")? {
        result.pending_messages = data_conn.query_row(
            "SELECT COUNT(*) FROM chat_messages WHERE migrated_to_v2 = 0 OR migrated_to_v2 IS NULL",
            [],
            |row| row.get(0),
        )?;
        result.migrated_messages = data_conn.query_row(
            "SELECT COUNT(*) FROM chat_messages WHERE migrated_to_v2 = 1",
            [],
            |row| row.get(0),
        )?;
        result.pending_sessions = data_conn.query_row(
            "SELECT COUNT(DISTINCT mistake_id) FROM chat_messages WHERE migrated_to_v2 = 0 OR migrated_to_v2 IS NULL",
            [],
            |row| row.get(0),
        )?;
    } else {
        result.pending_messages =
            data_conn.query_row("SELECT COUNT(*) FROM chat_messages", [], |row| row.get(0))?;
        result.pending_sessions = data_conn.query_row(
            "SELECT COUNT(DISTINCT mistake_id) FROM chat_messages",
            [],
            |row| row.get(0),
        )?;
    }

    result.needs_migration = result.pending_messages > 0;

    let migrated_sessions = migrated_session_ids(chat_v2_conn)?;
    result.can_rollback = !migrated_sessions.is_empty() || result.migrated_messages > 0;

    result.last_migration_at = chat_v2_conn
        .query_row(
            "SELECT MAX(json_extract(metadata_json, '$.migratedAt')) FROM chat_v2_sessions
             WHERE json_extract(metadata_json, '$.migratedFrom') = ?1",
            [MIGRATED_FROM],
            |row| row.get::<_, Option<i64>>(0),
        )?;

    result.status = match (result.migrated_messages, result.pending_messages) {
        (0, _) if migrated_sessions.is_empty() => MigrationStatus::NotStarted,
        (_, 0) => MigrationStatus::Completed,
        _ => MigrationStatus::InProgress,
    };

    Ok(result)
}

/// 执行迁移
pub fn migrate_legacy_chat(
    data_conn: &Connection,
    chat_v2_conn: &Connection,
    events: Option<MigrationEventSender>,
) -> Result<MigrationReport, ChatV2Error> {
    MigrationExecutor::new(events).execute(data_conn, chat_v2_conn)
}

/// 台账与会话元数据中记录的迁移会话（去重）
fn migrated_session_ids(chat_v2_conn: &Connection) -> Result<Vec<String>, ChatV2Error> {
    let mut sql = String::from(
        "SELECT id FROM chat_v2_sessions WHERE json_extract(metadata_json, '$.migratedFrom') = ?1",
    );
    if table_exists(chat_v2_conn, LEDGER_TABLE)? {
        sql.push_str(" UNION SELECT session_id FROM chat_v2_migration_ledger");
    }
    let mut stmt = chat_v2_conn.prepare(&sql)?;
    let ids = stmt
        .query_map([MIGRATED_FROM], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

fn delete_sessions(chat_v2_conn: &Connection, session_ids: &[String]) -> Result<usize, ChatV2Error> {
    let has_ledger = table_exists(chat_v2_conn, LEDGER_TABLE)?;
    let tx = chat_v2_conn.unchecked_transaction()?;
    let mut removed = 0;
    for session_id in session_ids {
        tx.execute(
            "DELETE FROM chat_v2_attachments WHERE message_id IN
                (SELECT id FROM chat_v2_messages WHERE session_id = ?1)",
            [session_id],
        )?;
        tx.execute(
            "DELETE FROM chat_v2_blocks WHERE message_id IN
                (SELECT id FROM chat_v2_messages WHERE session_id = ?1)",
            [session_id],
        )?;
        tx.execute("DELETE FROM chat_v2_messages WHERE session_id = ?1", [session_id])?;
        if has_ledger {
            tx.execute(
                "DELETE FROM chat_v2_migration_ledger WHERE session_id = ?1",
                [session_id],
            )?;
        }
        removed += tx.execute("DELETE FROM chat_v2_sessions WHERE id = ?1", [session_id])?;
    }
    tx.commit()?;
    Ok(removed)
}

/// 回滚迁移，使系统回到未迁移状态
///
/// 先重置旧表标记，再删除新表数据：
/// - 重置标记失败时不删除新数据，可重试
/// - 删除新数据失败时旧表标记已重置，返回 `DatabaseCorrupted`，两侧错误都保留
pub fn rollback_migration(
    data_conn: &Connection,
    chat_v2_conn: &Connection,
    events: Option<MigrationEventSender>,
) -> Result<MigrationReport, ChatV2Error> {
    let emit = |event_type: MigrationEventType, status: MigrationStatus, message: String| {
        if let Some(ref sender) = events {
            let event = MigrationEvent {
                event_type,
                progress: MigrationProgress {
                    status,
                    ..Default::default()
                },
                message,
            };
            if sender.send(event).is_err() {
                tracing::trace!("[Migration::Rollback] 无事件订阅者");
            }
        }
    };

    let mut report = MigrationReport {
        started_at: Utc::now().timestamp_millis(),
        ..Default::default()
    };
    emit(
        MigrationEventType::RollbackStarted,
        MigrationStatus::InProgress,
        "开始回滚迁移".to_string(),
    );

    let migrated_sessions = migrated_session_ids(chat_v2_conn)?;

    let reset_result = if table_exists(data_conn, "chat_messages")?
        && has_column(data_conn, "chat_messages", "migrated_to_v2")?
    {
        data_conn
            .execute(
                "UPDATE chat_messages SET migrated_to_v2 = 0, migrated_session_id = NULL WHERE migrated_to_v2 = 1",
                [],
            )
            .map_err(ChatV2Error::from)
    } else {
        Ok(0)
    };
    report.messages_reset = match reset_result {
        Ok(count) => count,
        Err(e) => {
            tracing::error!("[Migration::Rollback] 重置迁移标记失败: {}", e);
            emit(
                MigrationEventType::RollbackFailed,
                MigrationStatus::Failed,
                format!("重置迁移标记失败: {}", e),
            );
            return Err(e);
        }
    };
    tracing::info!(
        "[Migration::Rollback] 已重置 {} 条消息的迁移标记",
        report.messages_reset
    );

    report.sessions_removed = match delete_sessions(chat_v2_conn, &migrated_sessions) {
        Ok(count) => count,
        Err(e) => {
            tracing::error!("[Migration::Rollback] 删除迁移会话失败: {}", e);
            emit(
                MigrationEventType::RollbackFailed,
                MigrationStatus::Failed,
                format!("删除迁移会话失败: {}", e),
            );
            return Err(ChatV2Error::DatabaseCorrupted {
                original_error: "rollback of legacy chat migration".to_string(),
                rollback_error: e.to_string(),
            });
        }
    };

    report.ended_at = Utc::now().timestamp_millis();
    report.duration_ms = report.ended_at - report.started_at;
    report.status = MigrationStatus::RolledBack;

    emit(
        MigrationEventType::RollbackCompleted,
        MigrationStatus::RolledBack,
        format!(
            "回滚完成，删除 {} 个会话，重置 {} 条消息",
            report.sessions_removed, report.messages_reset
        ),
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_governance::migration::chat_v2::CHAT_V2_MIGRATION_SET;
    use assert_matches::assert_matches;
    use std::cell::Cell;

    fn chat_v2_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        for migration in CHAT_V2_MIGRATION_SET.migrations {
            conn.execute_batch(migration.sql).unwrap();
        }
        conn
    }

    fn legacy_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE mistakes (
                id TEXT PRIMARY KEY,
                ocr_text TEXT,
                user_question TEXT,
                chat_metadata TEXT
            );
            CREATE TABLE chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mistake_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                thinking_content TEXT,
                rag_sources TEXT,
                memory_sources TEXT,
                graph_sources TEXT,
                web_search_sources TEXT,
                image_paths TEXT,
                image_base64 TEXT,
                doc_attachments TEXT,
                tool_call TEXT,
                tool_result TEXT,
                stable_id TEXT,
                metadata TEXT
            );",
        )
        .unwrap();
        conn
    }

    fn insert_legacy(conn: &Connection, mistake_id: &str, role: &str, content: &str) {
        conn.execute(
            "INSERT INTO chat_messages (mistake_id, role, content, timestamp) VALUES (?1, ?2, ?3, '2025-06-01T08:00:00Z')",
            params![mistake_id, role, content],
        )
        .unwrap();
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    fn seed_two_groups(legacy: &Connection) {
        legacy
            .execute(
                "INSERT INTO mistakes (id, ocr_text) VALUES ('m1', '二次函数求最值')",
                [],
            )
            .unwrap();
        insert_legacy(legacy, "m1", "user", "这道题怎么做？");
        legacy
            .execute(
                "INSERT INTO chat_messages (mistake_id, role, content, timestamp, thinking_content, rag_sources, image_paths)
                 VALUES ('m1', 'assistant', '先配方', '2025-06-01T08:01:00Z', '思考中', '[{\"id\":1}]', '[\"images/a.png\"]')",
                [],
            )
            .unwrap();
        insert_legacy(legacy, "m2", "user", "第二题");
    }

    #[test]
    fn test_migrates_groups_into_sessions() {
        let legacy = legacy_db();
        let chat = chat_v2_db();
        seed_two_groups(&legacy);

        let report = migrate_legacy_chat(&legacy, &chat, None).unwrap();

        assert_eq!(report.status, MigrationStatus::Completed);
        assert_eq!(report.sessions_created, 2);
        assert_eq!(report.messages_migrated, 3);
        // m1: content; thinking + content + rag; m2: content
        assert_eq!(report.blocks_created, 5);
        assert_eq!(report.attachments_created, 1);
        assert_eq!(count(&chat, "SELECT COUNT(*) FROM chat_v2_sessions"), 2);
        assert_eq!(count(&chat, "SELECT COUNT(*) FROM chat_v2_attachments"), 1);
        assert_eq!(count(&chat, "SELECT COUNT(*) FROM chat_v2_migration_ledger"), 2);
        assert_eq!(
            count(&legacy, "SELECT COUNT(*) FROM chat_messages WHERE migrated_to_v2 = 1"),
            3
        );

        let title: String = chat
            .query_row(
                "SELECT s.title FROM chat_v2_sessions s JOIN chat_v2_migration_ledger l ON l.session_id = s.id WHERE l.mistake_id = 'm1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(title, "二次函数求最值");
    }

    #[test]
    fn test_second_run_is_noop() {
        let legacy = legacy_db();
        let chat = chat_v2_db();
        seed_two_groups(&legacy);

        migrate_legacy_chat(&legacy, &chat, None).unwrap();
        let second = migrate_legacy_chat(&legacy, &chat, None).unwrap();

        assert_eq!(second.status, MigrationStatus::Completed);
        assert!(second.is_noop());
        assert_eq!(count(&chat, "SELECT COUNT(*) FROM chat_v2_sessions"), 2);
        assert_eq!(count(&chat, "SELECT COUNT(*) FROM chat_v2_messages"), 3);
    }

    #[test]
    fn test_unmarked_rows_with_ledger_are_not_duplicated() {
        let legacy = legacy_db();
        let chat = chat_v2_db();
        seed_two_groups(&legacy);
        migrate_legacy_chat(&legacy, &chat, None).unwrap();

        // 模拟提交后、标记前进程退出
        legacy
            .execute(
                "UPDATE chat_messages SET migrated_to_v2 = 0, migrated_session_id = NULL",
                [],
            )
            .unwrap();
        insert_legacy(&legacy, "m2", "assistant", "后来追加的回答");

        let report = migrate_legacy_chat(&legacy, &chat, None).unwrap();

        assert_eq!(report.sessions_created, 0);
        assert_eq!(report.messages_migrated, 1);
        assert_eq!(report.messages_skipped, 3);
        assert_eq!(count(&chat, "SELECT COUNT(*) FROM chat_v2_sessions"), 2);
        assert_eq!(count(&chat, "SELECT COUNT(*) FROM chat_v2_messages"), 4);
        assert_eq!(
            count(
                &chat,
                "SELECT message_count FROM chat_v2_migration_ledger WHERE mistake_id = 'm2'"
            ),
            2
        );
        assert_eq!(
            count(&legacy, "SELECT COUNT(*) FROM chat_messages WHERE migrated_to_v2 = 0"),
            0
        );
    }

    #[test]
    fn test_failed_group_leaves_no_partial_rows() {
        let legacy = legacy_db();
        let chat = chat_v2_db();
        seed_two_groups(&legacy);
        insert_legacy(&legacy, "m3", "user", "boom");
        chat.execute_batch(
            "CREATE TRIGGER fail_block BEFORE INSERT ON chat_v2_blocks
             WHEN NEW.content = 'boom'
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
        )
        .unwrap();

        let report = migrate_legacy_chat(&legacy, &chat, None).unwrap();

        assert_eq!(report.status, MigrationStatus::Failed);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("m3"));
        assert_eq!(report.sessions_created, 2);
        assert_eq!(
            count(
                &chat,
                "SELECT COUNT(*) FROM chat_v2_sessions WHERE json_extract(metadata_json, '$.mistakeId') = 'm3'"
            ),
            0
        );
        assert_eq!(count(&chat, "SELECT COUNT(*) FROM chat_v2_messages"), 3);
        assert_eq!(
            count(
                &legacy,
                "SELECT COUNT(*) FROM chat_messages WHERE mistake_id = 'm3' AND migrated_to_v2 = 1"
            ),
            0
        );
    }

    #[test]
    fn test_cancel_between_groups_keeps_committed_groups() {
        let legacy = legacy_db();
        let chat = chat_v2_db();
        seed_two_groups(&legacy);

        let calls = Cell::new(0);
        let cancel_after_first = || {
            calls.set(calls.get() + 1);
            calls.get() > 1
        };
        let result = MigrationExecutor::new(None)
            .with_cancel_check(&cancel_after_first)
            .execute(&legacy, &chat);

        assert_matches!(result, Err(ChatV2Error::Cancelled));
        assert_eq!(count(&chat, "SELECT COUNT(*) FROM chat_v2_sessions"), 1);

        let resumed = migrate_legacy_chat(&legacy, &chat, None).unwrap();
        assert_eq!(resumed.sessions_created, 1);
        assert_eq!(count(&chat, "SELECT COUNT(*) FROM chat_v2_sessions"), 2);
    }

    #[test]
    fn test_rollback_returns_to_not_started() {
        let legacy = legacy_db();
        let chat = chat_v2_db();
        seed_two_groups(&legacy);
        migrate_legacy_chat(&legacy, &chat, None).unwrap();

        let status = check_migration_status(&legacy, &chat).unwrap();
        assert_eq!(status.status, MigrationStatus::Completed);
        assert!(status.can_rollback);
        assert!(status.last_migration_at.is_some());

        let report = rollback_migration(&legacy, &chat, None).unwrap();
        assert_eq!(report.status, MigrationStatus::RolledBack);
        assert_eq!(report.sessions_removed, 2);
        assert_eq!(report.messages_reset, 3);

        for table in [
            "chat_v2_sessions",
            "chat_v2_messages",
            "chat_v2_blocks",
            "chat_v2_attachments",
            "chat_v2_migration_ledger",
        ] {
            assert_eq!(count(&chat, &format!("SELECT COUNT(*) FROM {}", table)), 0, "{}", table);
        }

        let status = check_migration_status(&legacy, &chat).unwrap();
        assert_eq!(status.status, MigrationStatus::NotStarted);
        assert!(status.needs_migration);
        assert_eq!(status.pending_messages, 3);
        assert_eq!(status.pending_sessions, 2);
    }

    #[test]
    fn test_events_report_once_per_group() {
        let legacy = legacy_db();
        let chat = chat_v2_db();
        seed_two_groups(&legacy);
        let (tx, mut rx) = broadcast::channel(64);

        migrate_legacy_chat(&legacy, &chat, Some(tx)).unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.first().map(|e| e.event_type), Some(MigrationEventType::Started));
        assert_eq!(events.last().map(|e| e.event_type), Some(MigrationEventType::Completed));
        let progress = events
            .iter()
            .filter(|e| e.event_type == MigrationEventType::Progress)
            .count();
        assert_eq!(progress, 2);
        let last = events.last().unwrap();
        assert_eq!(last.progress.percent, 100);
        assert_eq!(last.progress.current_step, MigrationStep::Finished);
    }

    #[test]
    fn test_missing_ledger_is_rejected() {
        let legacy = legacy_db();
        let chat = Connection::open_in_memory().unwrap();
        let result = migrate_legacy_chat(&legacy, &chat, None);
        assert_matches!(result, Err(ChatV2Error::Validation(_)));
    }

    #[test]
    fn test_missing_legacy_table_needs_nothing() {
        let legacy = Connection::open_in_memory().unwrap();
        let chat = chat_v2_db();
        let status = check_migration_status(&legacy, &chat).unwrap();
        assert!(!status.needs_migration);
        let report = migrate_legacy_chat(&legacy, &chat, None).unwrap();
        assert!(report.is_noop());
    }

    #[test]
    fn test_truncate_title_counts_chars() {
        let long = "题".repeat(60);
        let title = truncate_title(&long);
        assert_eq!(title.chars().count(), TITLE_MAX_LENGTH + 3);
        assert_eq!(truncate_title("第一行\n第二行"), "第一行");
    }
}
