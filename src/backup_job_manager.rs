//! 后台任务管理
//!
//! - 全局单任务槽：同一时刻最多一个修改型任务（备份 / 导出 / 导入 / 恢复 / 聊天迁移）
//! - 事件通道：进度事件走有界通道（满时丢弃），终态事件走独立通道，保证不丢
//! - 任务持久化：`<data_dir>/jobs/<job_id>.json`，用于进程中断后的续传

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::data_governance::backup::zip_export::{
    TransferCheckpoint, TransferObserver, TransferPhase, TransferProgress,
};
use crate::data_governance::backup::BackupSelection;
use crate::data_governance::{GovernanceError, GovernanceResult};

// ============================================================================
// 安全锁访问辅助函数（处理锁中毒问题）
// ============================================================================

/// 安全地获取 Mutex 锁，在中毒时恢复锁并返回 guard
fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!(
                "[JobManager] Mutex poisoned! Attempting recovery for type: {:?}",
                std::any::type_name::<T>()
            );
            poisoned.into_inner()
        }
    }
}

/// 安全地获取 Option<T> 类型的 Mutex 锁值的拷贝
fn safe_lock_option<T: Copy>(mutex: &Mutex<Option<T>>) -> Option<T> {
    *safe_lock(mutex)
}

/// 任务持久化目录名
const JOBS_DIR: &str = "jobs";

/// 已结束任务在内存中的默认保留时间（秒）
pub const DEFAULT_JOB_RETENTION_SECS: u64 = 300;

/// 进度事件通道默认容量
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 64;

/// 任务类型
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackupJobKind {
    Backup,
    Export,
    Import,
    Restore,
    ChatMigration,
    /// 备份校验（只读，不占用任务槽，仅用于事件通知）
    Verify,
}

impl BackupJobKind {
    /// 是否支持通过 resume_job 继续
    ///
    /// 恢复失败会整体回滚，聊天迁移按组幂等，两者都应重新发起而不是续传。
    pub fn supports_resume(&self) -> bool {
        matches!(
            self,
            BackupJobKind::Backup | BackupJobKind::Export | BackupJobKind::Import
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupJobKind::Backup => "backup",
            BackupJobKind::Export => "export",
            BackupJobKind::Import => "import",
            BackupJobKind::Restore => "restore",
            BackupJobKind::ChatMigration => "chat_migration",
            BackupJobKind::Verify => "verify",
        }
    }
}

/// 任务状态机：排队、运行、完成、失败、已取消。
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupJobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BackupJobStatus {
    /// 是否为终态（完成/失败/已取消）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BackupJobStatus::Completed | BackupJobStatus::Failed | BackupJobStatus::Cancelled
        )
    }

    /// 验证状态转换是否合法
    ///
    /// - Queued → Running / Failed / Cancelled
    /// - Running → Completed / Failed / Cancelled
    /// - 终态不允许转换
    pub fn can_transition_to(&self, target: BackupJobStatus) -> bool {
        if *self == target {
            return !self.is_terminal();
        }
        match self {
            BackupJobStatus::Queued => matches!(
                target,
                BackupJobStatus::Running | BackupJobStatus::Failed | BackupJobStatus::Cancelled
            ),
            BackupJobStatus::Running => matches!(
                target,
                BackupJobStatus::Completed | BackupJobStatus::Failed | BackupJobStatus::Cancelled
            ),
            BackupJobStatus::Completed | BackupJobStatus::Failed | BackupJobStatus::Cancelled => {
                false
            }
        }
    }
}

/// 任务阶段
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupJobPhase {
    Queued,
    Scan,
    /// 数据库快照
    Snapshot,
    /// 资产复制
    Assets,
    Compress,
    Extract,
    Verify,
    /// 恢复前安全快照
    PreBackup,
    Restoring,
    Finalizing,
    /// 聊天迁移步骤执行中
    Migrating,
    Completed,
    Failed,
    Cancelled,
}

impl From<TransferPhase> for BackupJobPhase {
    fn from(phase: TransferPhase) -> Self {
        match phase {
            TransferPhase::Scan => BackupJobPhase::Scan,
            TransferPhase::Compress => BackupJobPhase::Compress,
            TransferPhase::Extract => BackupJobPhase::Extract,
            TransferPhase::Verify => BackupJobPhase::Verify,
            TransferPhase::Finalize | TransferPhase::Completed => BackupJobPhase::Finalizing,
        }
    }
}

/// 任务执行结果，用于完成后的事件与查询。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BackupJobResultPayload {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    pub message: Option<String>,
    pub error: Option<String>,
    /// 错误类别（configuration / transient_io / integrity / ...）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
    pub duration_ms: Option<u64>,
    /// 可选的统计信息（如文件数、传输字节数等）。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
    /// 恢复完成后需要重启应用
    #[serde(default)]
    pub requires_restart: bool,
    /// 可通过 resume_job 继续的任务 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumable_job_id: Option<String>,
}

impl BackupJobResultPayload {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_backup_id(mut self, backup_id: impl Into<String>) -> Self {
        self.backup_id = Some(backup_id.into());
        self
    }

    pub fn with_output_path(mut self, path: &Path) -> Self {
        self.output_path = Some(path.to_string_lossy().to_string());
        self
    }

    pub fn with_stats(mut self, stats: serde_json::Value) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn with_restart_required(mut self) -> Self {
        self.requires_restart = true;
        self
    }
}

/// 任务事件载荷。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupJobEvent {
    pub job_id: String,
    pub kind: BackupJobKind,
    pub status: BackupJobStatus,
    pub phase: BackupJobPhase,
    pub progress: f32,
    pub message: Option<String>,
    pub processed_items: u64,
    pub total_items: u64,
    pub eta_seconds: Option<u64>,
    pub cancellable: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<BackupJobResultPayload>,
}

impl BackupJobEvent {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 列表查询返回的任务摘要。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupJobSummary {
    pub job_id: String,
    pub kind: BackupJobKind,
    pub status: BackupJobStatus,
    pub phase: BackupJobPhase,
    pub progress: f32,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<BackupJobResultPayload>,
    /// 是否可恢复（仅在失败状态下有效）
    #[serde(default)]
    pub resumable: bool,
}

// ============================================================================
// 任务持久化相关结构
// ============================================================================

/// 任务参数（用于恢复任务）
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupJobParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<BackupSelection>,
    /// 增量备份的基准备份
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    /// 导入的 ZIP 路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_path: Option<PathBuf>,
    /// 导出的目标路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<u32>,
    /// 备份只写入暂存目录，不登记到目录
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stage_only: bool,
}

/// 持久化的任务状态
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedJob {
    pub job_id: String,
    pub kind: BackupJobKind,
    pub status: BackupJobStatus,
    pub phase: BackupJobPhase,
    pub progress: f32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// 任务参数（用于恢复）
    #[serde(default)]
    pub params: BackupJobParams,
    /// 断点信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<TransferCheckpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
}

impl PersistedJob {
    /// 是否可以继续
    ///
    /// 瞬时错误导致的失败可以继续；停留在 Queued / Running 的记录说明进程在执行中退出。
    pub fn is_resumable(&self) -> bool {
        if !self.kind.supports_resume() {
            return false;
        }
        match self.status {
            BackupJobStatus::Failed => self.error_category.as_deref() == Some("transient_io"),
            BackupJobStatus::Queued | BackupJobStatus::Running => true,
            BackupJobStatus::Completed | BackupJobStatus::Cancelled => false,
        }
    }
}

// ============================================================================
// 单任务槽
// ============================================================================

/// 当前占用任务槽的任务
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveJob {
    pub job_id: String,
    pub kind: BackupJobKind,
}

/// 全局单任务槽
#[derive(Debug, Default)]
pub struct JobSlot {
    active: Mutex<Option<ActiveJob>>,
}

impl JobSlot {
    /// 占用任务槽；已被占用时立即返回 Concurrency 错误
    pub fn try_acquire(
        self: &Arc<Self>,
        job_id: &str,
        kind: BackupJobKind,
    ) -> GovernanceResult<JobSlotGuard> {
        let mut active = safe_lock(&self.active);
        if let Some(current) = active.as_ref() {
            return Err(GovernanceError::Concurrency(format!(
                "已有任务在运行: {} ({})",
                current.job_id,
                current.kind.as_str()
            )));
        }
        *active = Some(ActiveJob {
            job_id: job_id.to_string(),
            kind,
        });
        Ok(JobSlotGuard {
            slot: Arc::clone(self),
            job_id: job_id.to_string(),
        })
    }

    pub fn active(&self) -> Option<ActiveJob> {
        safe_lock(&self.active).clone()
    }

    pub fn is_busy(&self) -> bool {
        safe_lock(&self.active).is_some()
    }
}

/// 任务槽令牌，释放时归还任务槽
#[derive(Debug)]
pub struct JobSlotGuard {
    slot: Arc<JobSlot>,
    job_id: String,
}

impl Drop for JobSlotGuard {
    fn drop(&mut self) {
        let mut active = safe_lock(&self.slot.active);
        if active.as_ref().map(|a| a.job_id == self.job_id).unwrap_or(false) {
            *active = None;
            debug!("[JobManager] 任务槽已释放: {}", self.job_id);
        }
    }
}

// ============================================================================
// 事件通道
// ============================================================================

/// 任务事件接收端（单消费者）
///
/// 进度事件在通道满时会被丢弃；终态事件走无界通道，接收时先取完已排队的进度事件。
pub struct JobEventReceiver {
    progress: mpsc::Receiver<BackupJobEvent>,
    terminal: mpsc::UnboundedReceiver<BackupJobEvent>,
}

impl JobEventReceiver {
    pub async fn recv(&mut self) -> Option<BackupJobEvent> {
        tokio::select! {
            biased;
            Some(event) = self.progress.recv() => Some(event),
            Some(event) = self.terminal.recv() => Some(event),
            else => None,
        }
    }

    /// 非阻塞接收
    pub fn try_recv(&mut self) -> Option<BackupJobEvent> {
        self.progress
            .try_recv()
            .ok()
            .or_else(|| self.terminal.try_recv().ok())
    }

    /// 等待指定任务的终态事件，途中的其他事件被丢弃
    pub async fn wait_terminal(&mut self, job_id: &str) -> Option<BackupJobEvent> {
        while let Some(event) = self.recv().await {
            if event.job_id == job_id && event.is_terminal() {
                return Some(event);
            }
        }
        None
    }
}

#[derive(Clone)]
struct EventSender {
    progress: mpsc::Sender<BackupJobEvent>,
    terminal: mpsc::UnboundedSender<BackupJobEvent>,
}

impl EventSender {
    fn send(&self, event: BackupJobEvent) {
        if event.is_terminal() {
            if self.terminal.send(event).is_err() {
                debug!("[JobManager] 事件接收端已关闭，终态事件未投递");
            }
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(event)) = self.progress.try_send(event) {
            debug!(
                "[JobManager] 进度通道已满，丢弃中间事件: job={}, progress={:.1}",
                event.job_id, event.progress
            );
        }
    }
}

// ============================================================================
// 任务状态
// ============================================================================

struct JobRuntimeState {
    status: BackupJobStatus,
    phase: BackupJobPhase,
    progress: f32,
    message: Option<String>,
    processed_items: u64,
    total_items: u64,
    result: Option<BackupJobResultPayload>,
    params: BackupJobParams,
    checkpoint: Option<TransferCheckpoint>,
}

impl JobRuntimeState {
    fn new(params: BackupJobParams) -> Self {
        Self {
            status: BackupJobStatus::Queued,
            phase: BackupJobPhase::Queued,
            progress: 0.0,
            message: None,
            processed_items: 0,
            total_items: 0,
            result: None,
            params,
            checkpoint: None,
        }
    }
}

struct JobState {
    id: String,
    kind: BackupJobKind,
    cancel_flag: AtomicBool,
    created_at: DateTime<Utc>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    started_instant: Mutex<Option<Instant>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    runtime: Mutex<JobRuntimeState>,
    /// 终态事件发出后释放
    slot_guard: Mutex<Option<JobSlotGuard>>,
}

impl JobState {
    fn new(id: String, kind: BackupJobKind, params: BackupJobParams, guard: JobSlotGuard) -> Self {
        Self {
            id,
            kind,
            cancel_flag: AtomicBool::new(false),
            created_at: Utc::now(),
            started_at: Mutex::new(None),
            started_instant: Mutex::new(None),
            finished_at: Mutex::new(None),
            runtime: Mutex::new(JobRuntimeState::new(params)),
            slot_guard: Mutex::new(Some(guard)),
        }
    }

    fn set_started(&self) {
        {
            let mut started_at = safe_lock(&self.started_at);
            if started_at.is_none() {
                *started_at = Some(Utc::now());
            }
        }
        let mut started_instant = safe_lock(&self.started_instant);
        if started_instant.is_none() {
            *started_instant = Some(Instant::now());
        }
    }

    fn set_finished(&self) {
        let mut finished_at = safe_lock(&self.finished_at);
        if finished_at.is_none() {
            *finished_at = Some(Utc::now());
        }
    }

    fn elapsed_ms(&self) -> Option<u64> {
        safe_lock_option(&self.started_instant).map(|s| s.elapsed().as_millis() as u64)
    }

    fn compute_eta(&self, progress: f32) -> Option<u64> {
        if progress <= 0.0 || progress >= 100.0 {
            return None;
        }
        let started = safe_lock_option(&self.started_instant)?;
        let elapsed = started.elapsed().as_secs_f32();
        if elapsed <= 0.0 {
            return None;
        }
        let ratio = (100.0 - progress) / progress;
        Some((elapsed * ratio).max(0.0) as u64)
    }

    fn snapshot(&self) -> BackupJobEvent {
        let runtime = safe_lock(&self.runtime);
        BackupJobEvent {
            job_id: self.id.clone(),
            kind: self.kind,
            status: runtime.status,
            phase: runtime.phase,
            progress: runtime.progress.clamp(0.0, 100.0),
            message: runtime.message.clone(),
            processed_items: runtime.processed_items,
            total_items: runtime.total_items,
            eta_seconds: self.compute_eta(runtime.progress),
            cancellable: !runtime.status.is_terminal(),
            created_at: self.created_at,
            started_at: safe_lock_option(&self.started_at),
            finished_at: safe_lock_option(&self.finished_at),
            result: runtime.result.clone(),
        }
    }

    fn summary(&self) -> BackupJobSummary {
        let runtime = safe_lock(&self.runtime);
        let resumable = runtime
            .result
            .as_ref()
            .and_then(|r| r.resumable_job_id.as_ref())
            .is_some();
        BackupJobSummary {
            job_id: self.id.clone(),
            kind: self.kind,
            status: runtime.status,
            phase: runtime.phase,
            progress: runtime.progress.clamp(0.0, 100.0),
            message: runtime.message.clone(),
            created_at: self.created_at,
            started_at: safe_lock_option(&self.started_at),
            finished_at: safe_lock_option(&self.finished_at),
            result: runtime.result.clone(),
            resumable,
        }
    }

    fn to_persisted(&self) -> PersistedJob {
        let runtime = safe_lock(&self.runtime);
        PersistedJob {
            job_id: self.id.clone(),
            kind: self.kind,
            status: runtime.status,
            phase: runtime.phase,
            progress: runtime.progress,
            created_at: self.created_at,
            started_at: safe_lock_option(&self.started_at),
            updated_at: Utc::now(),
            params: runtime.params.clone(),
            checkpoint: runtime.checkpoint.clone(),
            error_message: runtime.result.as_ref().and_then(|r| r.error.clone()),
            error_category: runtime.result.as_ref().and_then(|r| r.error_category.clone()),
        }
    }
}

// ============================================================================
// 任务上下文
// ============================================================================

/// 任务上下文，提供进度更新、取消检测、检查点持久化等能力。
#[derive(Clone)]
pub struct BackupJobContext {
    manager: BackupJobManager,
    pub job_id: String,
}

impl std::fmt::Debug for BackupJobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupJobContext")
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

impl BackupJobContext {
    fn new(manager: BackupJobManager, job_id: String) -> Self {
        Self { manager, job_id }
    }

    pub fn kind(&self) -> Option<BackupJobKind> {
        self.manager.with_state(&self.job_id, |state| state.kind)
    }

    pub fn params(&self) -> BackupJobParams {
        self.manager
            .with_state(&self.job_id, |state| safe_lock(&state.runtime).params.clone())
            .unwrap_or_default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.manager
            .with_state(&self.job_id, |state| state.cancel_flag.load(Ordering::Relaxed))
            .unwrap_or(true)
    }

    /// 已取消时返回 `GovernanceError::Cancelled`
    pub fn check_continue(&self) -> GovernanceResult<()> {
        if self.is_cancelled() {
            Err(GovernanceError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn mark_running(
        &self,
        phase: BackupJobPhase,
        progress: f32,
        message: Option<String>,
        processed: u64,
        total: u64,
    ) {
        self.manager.update_runtime(
            &self.job_id,
            BackupJobStatus::Running,
            phase,
            progress,
            message,
            Some((processed, total)),
            None,
        );
    }

    /// 记录检查点并立即持久化
    pub fn record_checkpoint(&self, checkpoint: TransferCheckpoint) {
        self.manager.with_state(&self.job_id, |state| {
            safe_lock(&state.runtime).checkpoint = Some(checkpoint);
        });
        if let Err(e) = self.manager.persist_job(&self.job_id) {
            warn!("[JobManager] 检查点持久化失败 {}: {}", self.job_id, e);
        }
    }

    pub fn checkpoint(&self) -> Option<TransferCheckpoint> {
        self.manager
            .with_state(&self.job_id, |state| safe_lock(&state.runtime).checkpoint.clone())
            .flatten()
    }

    fn restore_checkpoint(&self, checkpoint: Option<TransferCheckpoint>) {
        self.manager.with_state(&self.job_id, |state| {
            safe_lock(&state.runtime).checkpoint = checkpoint;
        });
    }

    pub fn complete(&self, mut result: BackupJobResultPayload) {
        result.success = true;
        if result.duration_ms.is_none() {
            result.duration_ms = self
                .manager
                .with_state(&self.job_id, |state| state.elapsed_ms())
                .flatten();
        }
        let message = result.message.clone();
        self.manager.update_runtime(
            &self.job_id,
            BackupJobStatus::Completed,
            BackupJobPhase::Completed,
            100.0,
            message,
            None,
            Some(result),
        );
        let _ = self.manager.delete_persisted_job(&self.job_id);
        self.manager.finish_job(&self.job_id);
    }

    /// 标记失败
    ///
    /// 可续传的失败保留持久化记录并在结果中带上任务 ID；其余失败删除记录。
    pub fn fail(&self, err: &GovernanceError) {
        let resumable = err.is_resumable()
            && self.kind().map(|k| k.supports_resume()).unwrap_or(false);
        // 保留失败时的进度，便于判断中断位置
        let progress = self
            .manager
            .with_state(&self.job_id, |state| safe_lock(&state.runtime).progress)
            .unwrap_or(0.0);

        self.manager.update_runtime(
            &self.job_id,
            BackupJobStatus::Failed,
            BackupJobPhase::Failed,
            progress,
            Some(err.to_string()),
            None,
            Some(BackupJobResultPayload {
                success: false,
                error: Some(err.to_string()),
                error_category: Some(err.category().to_string()),
                duration_ms: self
                    .manager
                    .with_state(&self.job_id, |state| state.elapsed_ms())
                    .flatten(),
                resumable_job_id: resumable.then(|| self.job_id.clone()),
                ..Default::default()
            }),
        );

        if resumable {
            if let Err(e) = self.manager.persist_job(&self.job_id) {
                warn!("[JobManager] 持久化失败任务时出错: {}", e);
            }
        } else {
            let _ = self.manager.delete_persisted_job(&self.job_id);
        }
        self.manager.finish_job(&self.job_id);
    }

    pub fn cancelled(&self, message: Option<String>) {
        let progress = self
            .manager
            .with_state(&self.job_id, |state| safe_lock(&state.runtime).progress)
            .unwrap_or(0.0);
        self.manager.update_runtime(
            &self.job_id,
            BackupJobStatus::Cancelled,
            BackupJobPhase::Cancelled,
            progress,
            message.clone(),
            None,
            Some(BackupJobResultPayload {
                success: false,
                message,
                error: Some("任务已取消".to_string()),
                error_category: Some(GovernanceError::Cancelled.category().to_string()),
                ..Default::default()
            }),
        );
        let _ = self.manager.delete_persisted_job(&self.job_id);
        self.manager.finish_job(&self.job_id);
    }

    /// 按执行结果写入终态
    pub fn finish(&self, result: GovernanceResult<BackupJobResultPayload>) {
        match result {
            Ok(payload) => self.complete(payload),
            Err(GovernanceError::Cancelled) => self.cancelled(Some("任务已取消".to_string())),
            Err(e) => {
                error!("[JobManager] 任务失败 {}: {}", self.job_id, e);
                self.fail(&e);
            }
        }
    }
}

impl TransferObserver for BackupJobContext {
    fn on_progress(&mut self, progress: &TransferProgress) {
        self.mark_running(
            progress.phase.into(),
            progress.percent(),
            progress.current_item.clone(),
            progress.processed_items,
            progress.total_items,
        );
    }

    fn on_checkpoint(&mut self, checkpoint: &TransferCheckpoint) {
        self.record_checkpoint(checkpoint.clone());
    }

    fn is_cancelled(&self) -> bool {
        BackupJobContext::is_cancelled(self)
    }
}

// ============================================================================
// 任务管理器
// ============================================================================

#[derive(Clone)]
pub struct BackupJobManager {
    jobs: Arc<DashMap<String, Arc<JobState>>>,
    slot: Arc<JobSlot>,
    events: EventSender,
    receiver: Arc<Mutex<Option<JobEventReceiver>>>,
    persist_dir: PathBuf,
    retention: Duration,
}

impl BackupJobManager {
    /// `data_dir` 下的 `jobs/` 用于任务持久化
    pub fn new(data_dir: &Path, event_capacity: usize) -> Self {
        let (progress_tx, progress_rx) = mpsc::channel(event_capacity.max(1));
        let (terminal_tx, terminal_rx) = mpsc::unbounded_channel();
        Self {
            jobs: Arc::new(DashMap::new()),
            slot: Arc::new(JobSlot::default()),
            events: EventSender {
                progress: progress_tx,
                terminal: terminal_tx,
            },
            receiver: Arc::new(Mutex::new(Some(JobEventReceiver {
                progress: progress_rx,
                terminal: terminal_rx,
            }))),
            persist_dir: data_dir.join(JOBS_DIR),
            retention: Duration::from_secs(DEFAULT_JOB_RETENTION_SECS),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// 取走事件接收端（只能取一次）
    pub fn take_event_receiver(&self) -> Option<JobEventReceiver> {
        safe_lock(&self.receiver).take()
    }

    pub fn persist_dir(&self) -> &Path {
        &self.persist_dir
    }

    pub fn active_job(&self) -> Option<ActiveJob> {
        self.slot.active()
    }

    /// 创建任务并占用任务槽
    ///
    /// 任务槽被占用时立即返回 `GovernanceError::Concurrency`，不排队。
    pub fn create_job(
        &self,
        kind: BackupJobKind,
        params: BackupJobParams,
    ) -> GovernanceResult<BackupJobContext> {
        self.create_job_with_id(Uuid::new_v4().to_string(), kind, params)
    }

    /// 使用指定的 ID 创建任务（用于恢复任务）
    pub fn create_job_with_id(
        &self,
        job_id: String,
        kind: BackupJobKind,
        params: BackupJobParams,
    ) -> GovernanceResult<BackupJobContext> {
        self.cleanup_completed_jobs(self.retention);
        let guard = self.slot.try_acquire(&job_id, kind)?;
        let state = Arc::new(JobState::new(job_id.clone(), kind, params, guard));
        self.jobs.insert(job_id.clone(), state);
        info!("[JobManager] 创建任务: {} ({})", job_id, kind.as_str());
        self.emit(&job_id);
        Ok(BackupJobContext::new(self.clone(), job_id))
    }

    /// 请求取消当前运行的任务；空闲时返回 false
    pub fn cancel_active(&self) -> bool {
        match self.slot.active() {
            Some(active) => self.request_cancel(&active.job_id),
            None => false,
        }
    }

    pub fn request_cancel(&self, job_id: &str) -> bool {
        self.with_state(job_id, |state| {
            if state
                .cancel_flag
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                info!("[JobManager] 请求取消任务 {}", job_id);
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    pub fn list_jobs(&self) -> Vec<BackupJobSummary> {
        self.cleanup_completed_jobs(self.retention);
        let mut jobs: Vec<BackupJobSummary> = self
            .jobs
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn get_job(&self, job_id: &str) -> Option<BackupJobSummary> {
        self.jobs.get(job_id).map(|state| state.summary())
    }

    /// 当前占用任务槽的任务参数
    pub fn active_params(&self) -> Option<(ActiveJob, BackupJobParams)> {
        let active = self.slot.active()?;
        let params = self.with_state(&active.job_id, |state| {
            safe_lock(&state.runtime).params.clone()
        })?;
        Some((active, params))
    }

    /// 更新任务状态并发出事件
    ///
    /// `counts` 为 None 时保留原有的已处理 / 总数。
    fn update_runtime(
        &self,
        job_id: &str,
        status: BackupJobStatus,
        phase: BackupJobPhase,
        progress: f32,
        message: Option<String>,
        counts: Option<(u64, u64)>,
        result: Option<BackupJobResultPayload>,
    ) {
        let Some(state) = self.jobs.get(job_id).map(|s| Arc::clone(s.value())) else {
            warn!("[JobManager] 尝试更新不存在的任务状态，job_id={}", job_id);
            return;
        };
        {
            let mut guard = safe_lock(&state.runtime);
            if !guard.status.can_transition_to(status) {
                warn!(
                    "[JobManager] 无效的状态转换: {:?} -> {:?}, job_id={}",
                    guard.status, status, job_id
                );
                return;
            }
            guard.status = status;
            guard.phase = phase;
            guard.progress = progress;
            guard.message = message;
            if let Some((processed, total)) = counts {
                guard.processed_items = processed;
                guard.total_items = total;
            }
            if let Some(res) = result {
                guard.result = Some(res);
            }
        }
        // 在 runtime 锁释放后设置时间戳（避免嵌套锁）
        if status == BackupJobStatus::Running {
            state.set_started();
        } else if status.is_terminal() {
            state.set_finished();
        }
        self.events.send(state.snapshot());
    }

    /// 发出一次校验状态事件
    ///
    /// 校验是只读操作，不创建任务也不占用任务槽；事件的 job_id 为 `verify-<backup_id>`。
    pub fn emit_verification_status(
        &self,
        backup_id: &str,
        status: BackupJobStatus,
        message: impl Into<String>,
    ) {
        let now = Utc::now();
        let terminal = status.is_terminal();
        self.events.send(BackupJobEvent {
            job_id: format!("verify-{}", backup_id),
            kind: BackupJobKind::Verify,
            status,
            phase: if terminal {
                match status {
                    BackupJobStatus::Completed => BackupJobPhase::Completed,
                    BackupJobStatus::Cancelled => BackupJobPhase::Cancelled,
                    _ => BackupJobPhase::Failed,
                }
            } else {
                BackupJobPhase::Verify
            },
            progress: if terminal { 100.0 } else { 0.0 },
            message: Some(message.into()),
            processed_items: 0,
            total_items: 0,
            eta_seconds: None,
            cancellable: false,
            created_at: now,
            started_at: Some(now),
            finished_at: terminal.then_some(now),
            result: None,
        });
    }

    fn emit(&self, job_id: &str) {
        if let Some(state) = self.jobs.get(job_id).map(|s| Arc::clone(s.value())) {
            self.events.send(state.snapshot());
        }
    }

    /// 终态事件发出后释放任务槽，并安排从内存中移除
    fn finish_job(&self, job_id: &str) {
        if let Some(state) = self.jobs.get(job_id).map(|s| Arc::clone(s.value())) {
            let guard = safe_lock(&state.slot_guard).take();
            drop(guard);
        }
        self.schedule_job_removal(job_id);
    }

    fn with_state<F, R>(&self, job_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&JobState) -> R,
    {
        self.jobs.get(job_id).map(|state| f(&state))
    }

    // ========================================================================
    // 任务持久化方法
    // ========================================================================

    fn job_file(&self, job_id: &str) -> PathBuf {
        self.persist_dir.join(format!("{}.json", job_id))
    }

    /// 保存任务状态到文件（临时文件 + 原子重命名）
    pub fn persist_job(&self, job_id: &str) -> GovernanceResult<()> {
        let persisted = self
            .with_state(job_id, |state| state.to_persisted())
            .ok_or_else(|| GovernanceError::NotFound(format!("任务不存在: {}", job_id)))?;

        fs::create_dir_all(&self.persist_dir)?;
        let file_path = self.job_file(job_id);
        let json = serde_json::to_string_pretty(&persisted)?;
        let temp_path = file_path.with_extension("json.tmp");
        fs::write(&temp_path, &json)?;
        fs::rename(&temp_path, &file_path)?;

        debug!("[JobManager] 任务已持久化: {} -> {:?}", job_id, file_path);
        Ok(())
    }

    /// 加载所有持久化的任务
    pub fn load_persisted_jobs(&self) -> GovernanceResult<Vec<PersistedJob>> {
        if !self.persist_dir.exists() {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.persist_dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("[JobManager] 读取目录条目失败: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            // 临时文件的扩展名是 tmp，这里一并跳过
            if !path.is_file() || path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(GovernanceError::from)
                .and_then(|content| Ok(serde_json::from_str::<PersistedJob>(&content)?))
            {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("[JobManager] 解析持久化任务失败 {:?}: {}", path, e),
            }
        }
        jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(jobs)
    }

    pub fn load_persisted_job(&self, job_id: &str) -> GovernanceResult<PersistedJob> {
        let path = self.job_file(job_id);
        if !path.exists() {
            return Err(GovernanceError::NotFound(format!("可恢复任务不存在: {}", job_id)));
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }

    /// 删除持久化文件
    pub fn delete_persisted_job(&self, job_id: &str) -> GovernanceResult<()> {
        let file_path = self.job_file(job_id);
        if file_path.exists() {
            fs::remove_file(&file_path)?;
            debug!("[JobManager] 已删除持久化文件: {:?}", file_path);
        }
        Ok(())
    }

    /// 获取可恢复的任务列表（不含当前正在运行的任务）
    pub fn list_resumable_jobs(&self) -> GovernanceResult<Vec<PersistedJob>> {
        let active = self.slot.active().map(|a| a.job_id);
        Ok(self
            .load_persisted_jobs()?
            .into_iter()
            .filter(|job| job.is_resumable() && active.as_deref() != Some(job.job_id.as_str()))
            .collect())
    }

    /// 从持久化记录重新创建任务，保留原任务 ID、参数与检查点
    pub fn resume_job(&self, job_id: &str) -> GovernanceResult<(BackupJobContext, PersistedJob)> {
        let persisted = self.load_persisted_job(job_id)?;
        if !persisted.is_resumable() {
            return Err(GovernanceError::Configuration(format!(
                "任务不可恢复: {} ({:?})",
                job_id, persisted.status
            )));
        }
        // 旧的内存记录（已失败）让位给新的执行
        if let Some(existing) = self.jobs.get(job_id).map(|s| Arc::clone(s.value())) {
            if !safe_lock(&existing.runtime).status.is_terminal() {
                return Err(GovernanceError::Concurrency(format!("任务正在运行: {}", job_id)));
            }
            self.jobs.remove(job_id);
        }
        let ctx = self.create_job_with_id(
            persisted.job_id.clone(),
            persisted.kind,
            persisted.params.clone(),
        )?;
        ctx.restore_checkpoint(persisted.checkpoint.clone());
        info!(
            "[JobManager] 恢复任务: {} ({}), checkpoint={}",
            job_id,
            persisted.kind.as_str(),
            persisted.checkpoint.is_some()
        );
        Ok((ctx, persisted))
    }

    /// 清理不可恢复的持久化任务
    pub fn cleanup_finished_persisted_jobs(&self) -> GovernanceResult<usize> {
        let mut cleaned = 0;
        for job in self.load_persisted_jobs()? {
            if job.is_resumable() {
                continue;
            }
            match self.delete_persisted_job(&job.job_id) {
                Ok(()) => cleaned += 1,
                Err(e) => warn!("[JobManager] 清理持久化任务失败 {}: {}", job.job_id, e),
            }
        }
        if cleaned > 0 {
            info!("[JobManager] 清理了 {} 个不可恢复的持久化任务", cleaned);
        }
        Ok(cleaned)
    }

    /// 延迟从内存中移除任务（需要 tokio 运行时；否则由下次清理处理）
    fn schedule_job_removal(&self, job_id: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let jobs = Arc::clone(&self.jobs);
        let job_id_owned = job_id.to_string();
        let retention = self.retention;
        handle.spawn(async move {
            tokio::time::sleep(retention).await;
            let expired = jobs
                .get(&job_id_owned)
                .map(|s| safe_lock(&s.runtime).status.is_terminal())
                .unwrap_or(false);
            if expired && jobs.remove(&job_id_owned).is_some() {
                debug!("[JobManager] 任务已从内存移除（延迟清理）: {}", job_id_owned);
            }
        });
    }

    /// 移除内存中结束超过 `max_age` 的任务
    pub fn cleanup_completed_jobs(&self, max_age: Duration) {
        let now = Utc::now();

        // 先收集 Arc，释放 DashMap shard 锁后再检查
        let entries: Vec<(String, Arc<JobState>)> = self
            .jobs
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut removed = 0;
        for (job_id, state) in entries {
            if !safe_lock(&state.runtime).status.is_terminal() {
                continue;
            }
            if let Some(finished) = safe_lock_option(&state.finished_at) {
                let expired = (now - finished)
                    .to_std()
                    .map(|age| age >= max_age)
                    .unwrap_or(true);
                if expired {
                    self.jobs.remove(&job_id);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!("[JobManager] 清理了 {} 个过期任务", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_governance::backup::zip_export::ImportCheckpoint;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn manager(dir: &Path) -> BackupJobManager {
        BackupJobManager::new(dir, 4)
    }

    fn import_checkpoint() -> TransferCheckpoint {
        TransferCheckpoint::Import(ImportCheckpoint {
            version: 1,
            zip_path: PathBuf::from("/tmp/a.zip"),
            zip_size: 10,
            entries_done: 1,
            bytes_extracted: 5,
        })
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        assert!(BackupJobStatus::Queued.can_transition_to(BackupJobStatus::Running));
        assert!(BackupJobStatus::Running.can_transition_to(BackupJobStatus::Running));
        assert!(!BackupJobStatus::Completed.can_transition_to(BackupJobStatus::Running));
        assert!(!BackupJobStatus::Failed.can_transition_to(BackupJobStatus::Failed));
        assert!(!BackupJobStatus::Cancelled.can_transition_to(BackupJobStatus::Completed));
    }

    #[test]
    fn test_second_job_is_rejected_while_slot_held() {
        let dir = TempDir::new().unwrap();
        let jobs = manager(dir.path());
        let first = jobs
            .create_job(BackupJobKind::Backup, BackupJobParams::default())
            .unwrap();

        let second = jobs.create_job(BackupJobKind::Restore, BackupJobParams::default());
        assert_matches!(second, Err(GovernanceError::Concurrency(_)));
        assert_eq!(jobs.active_job().unwrap().job_id, first.job_id);

        // 第一个任务不受影响，正常结束后释放任务槽
        first.mark_running(BackupJobPhase::Snapshot, 50.0, None, 1, 2);
        first.complete(BackupJobResultPayload::success("ok"));
        assert!(jobs.active_job().is_none());
        assert!(jobs
            .create_job(BackupJobKind::Restore, BackupJobParams::default())
            .is_ok());
    }

    #[test]
    fn test_terminal_event_survives_full_progress_channel() {
        let dir = TempDir::new().unwrap();
        let jobs = manager(dir.path());
        let mut rx = jobs.take_event_receiver().unwrap();
        assert!(jobs.take_event_receiver().is_none());

        let ctx = jobs
            .create_job(BackupJobKind::Export, BackupJobParams::default())
            .unwrap();
        for i in 0..100 {
            ctx.mark_running(BackupJobPhase::Compress, i as f32, None, i, 100);
        }
        ctx.complete(BackupJobResultPayload::success("done"));

        let mut events = Vec::new();
        while let Some(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events.len() < 102, "中间事件应被丢弃");
        let last = events.last().unwrap();
        assert_eq!(last.status, BackupJobStatus::Completed);
        assert!(!last.cancellable);
        assert_eq!(
            events.iter().filter(|e| e.is_terminal()).count(),
            1,
            "终态事件只发一次"
        );
    }

    #[test]
    fn test_wait_terminal_skips_other_jobs() {
        let dir = TempDir::new().unwrap();
        let jobs = manager(dir.path());
        let mut rx = jobs.take_event_receiver().unwrap();

        let first = jobs
            .create_job(BackupJobKind::Backup, BackupJobParams::default())
            .unwrap();
        first.fail(&GovernanceError::Internal("boom".to_string()));
        let second = jobs
            .create_job(BackupJobKind::Import, BackupJobParams::default())
            .unwrap();
        second.complete(BackupJobResultPayload::success("ok"));

        let terminal = tokio_test::block_on(rx.wait_terminal(&second.job_id)).unwrap();
        assert_eq!(terminal.job_id, second.job_id);
        assert_eq!(terminal.status, BackupJobStatus::Completed);
    }

    #[test]
    fn test_cancel_flag_and_cancelled_terminal_state() {
        let dir = TempDir::new().unwrap();
        let jobs = manager(dir.path());
        assert!(!jobs.cancel_active());

        let ctx = jobs
            .create_job(BackupJobKind::Backup, BackupJobParams::default())
            .unwrap();
        assert!(jobs.cancel_active());
        assert!(!jobs.request_cancel(&ctx.job_id), "重复取消返回 false");
        assert_matches!(ctx.check_continue(), Err(GovernanceError::Cancelled));

        ctx.finish(Err(GovernanceError::Cancelled));
        let summary = jobs.get_job(&ctx.job_id).unwrap();
        assert_eq!(summary.status, BackupJobStatus::Cancelled);
        assert!(!summary.resumable);
        assert!(!jobs.job_file(&ctx.job_id).exists());
    }

    #[test]
    fn test_transient_failure_is_persisted_and_resumable() {
        let dir = TempDir::new().unwrap();
        let jobs = manager(dir.path());
        let params = BackupJobParams {
            backup_id: Some("b1".into()),
            compression_level: Some(6),
            ..Default::default()
        };
        let ctx = jobs.create_job(BackupJobKind::Import, params.clone()).unwrap();
        ctx.mark_running(BackupJobPhase::Extract, 40.0, None, 1, 3);
        ctx.record_checkpoint(import_checkpoint());
        ctx.fail(&GovernanceError::transient("disk full"));

        let summary = jobs.get_job(&ctx.job_id).unwrap();
        assert!(summary.resumable);
        assert_eq!(
            summary.result.unwrap().resumable_job_id.as_deref(),
            Some(ctx.job_id.as_str())
        );

        // 模拟重启：新的管理器从磁盘加载
        let reloaded = manager(dir.path());
        let resumable = reloaded.list_resumable_jobs().unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].params, params);

        let (resumed, persisted) = reloaded.resume_job(&ctx.job_id).unwrap();
        assert_eq!(resumed.job_id, ctx.job_id);
        assert_eq!(persisted.kind, BackupJobKind::Import);
        assert_eq!(resumed.checkpoint(), Some(import_checkpoint()));
        assert_eq!(resumed.params(), params);
    }

    #[test]
    fn test_non_transient_failure_is_not_resumable() {
        let dir = TempDir::new().unwrap();
        let jobs = manager(dir.path());
        let ctx = jobs
            .create_job(BackupJobKind::Export, BackupJobParams::default())
            .unwrap();
        ctx.record_checkpoint(import_checkpoint());
        assert!(jobs.job_file(&ctx.job_id).exists());
        ctx.fail(&GovernanceError::integrity("notes", "bad checksum"));

        assert!(!jobs.get_job(&ctx.job_id).unwrap().resumable);
        assert!(jobs.list_resumable_jobs().unwrap().is_empty());
        assert_matches!(jobs.resume_job(&ctx.job_id), Err(GovernanceError::NotFound(_)));
    }

    #[test]
    fn test_interrupted_job_record_is_resumable() {
        let dir = TempDir::new().unwrap();
        let jobs = manager(dir.path());
        let ctx = jobs
            .create_job(BackupJobKind::Export, BackupJobParams::default())
            .unwrap();
        ctx.mark_running(BackupJobPhase::Compress, 30.0, None, 1, 3);
        ctx.record_checkpoint(import_checkpoint());
        // 进程在此退出：记录停留在 Running

        let reloaded = manager(dir.path());
        let resumable = reloaded.list_resumable_jobs().unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].status, BackupJobStatus::Running);
    }

    #[test]
    fn test_cleanup_finished_persisted_jobs_keeps_resumable() {
        let dir = TempDir::new().unwrap();
        let jobs = manager(dir.path());
        fs::create_dir_all(jobs.persist_dir()).unwrap();
        let base = PersistedJob {
            job_id: "a".into(),
            kind: BackupJobKind::Export,
            status: BackupJobStatus::Completed,
            phase: BackupJobPhase::Completed,
            progress: 100.0,
            created_at: Utc::now(),
            started_at: None,
            updated_at: Utc::now(),
            params: BackupJobParams::default(),
            checkpoint: None,
            error_message: None,
            error_category: None,
        };
        let restore = PersistedJob {
            job_id: "b".into(),
            kind: BackupJobKind::Restore,
            status: BackupJobStatus::Running,
            ..base.clone()
        };
        let interrupted = PersistedJob {
            job_id: "c".into(),
            status: BackupJobStatus::Running,
            ..base.clone()
        };
        for job in [&base, &restore, &interrupted] {
            fs::write(
                jobs.job_file(&job.job_id),
                serde_json::to_string(job).unwrap(),
            )
            .unwrap();
        }
        fs::write(jobs.persist_dir().join("d.json.tmp"), b"{").unwrap();

        assert_eq!(jobs.cleanup_finished_persisted_jobs().unwrap(), 2);
        let left: Vec<String> = jobs
            .load_persisted_jobs()
            .unwrap()
            .into_iter()
            .map(|j| j.job_id)
            .collect();
        assert_eq!(left, vec!["c".to_string()]);
    }

    #[test]
    fn test_finished_jobs_are_evicted_after_retention() {
        let dir = TempDir::new().unwrap();
        let jobs = manager(dir.path()).with_retention(Duration::from_secs(3600));
        let ctx = jobs
            .create_job(BackupJobKind::Backup, BackupJobParams::default())
            .unwrap();
        ctx.complete(BackupJobResultPayload::success("ok"));
        assert_eq!(jobs.list_jobs().len(), 1);

        jobs.cleanup_completed_jobs(Duration::ZERO);
        assert!(jobs.list_jobs().is_empty());
    }

    #[test]
    fn test_verification_events_do_not_take_the_slot() {
        let dir = TempDir::new().unwrap();
        let jobs = manager(dir.path());
        let mut rx = jobs.take_event_receiver().unwrap();
        jobs.emit_verification_status("b1", BackupJobStatus::Running, "校验中");
        assert!(jobs.active_job().is_none());
        jobs.emit_verification_status("b1", BackupJobStatus::Completed, "校验通过");

        let first = rx.try_recv().unwrap();
        assert_eq!(first.kind, BackupJobKind::Verify);
        assert_eq!(first.job_id, "verify-b1");
        assert!(!first.cancellable);
        let last = rx.try_recv().unwrap();
        assert!(last.is_terminal());
        assert_eq!(last.phase, BackupJobPhase::Completed);
        assert!(!BackupJobKind::Verify.supports_resume());
    }

    #[tokio::test]
    async fn test_receiver_delivers_progress_before_terminal() {
        let dir = TempDir::new().unwrap();
        let jobs = manager(dir.path());
        let mut rx = jobs.take_event_receiver().unwrap();
        let ctx = jobs
            .create_job(BackupJobKind::Backup, BackupJobParams::default())
            .unwrap();
        ctx.mark_running(BackupJobPhase::Snapshot, 10.0, None, 0, 1);
        ctx.complete(BackupJobResultPayload::success("ok"));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status, BackupJobStatus::Queued);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.status, BackupJobStatus::Running);
        let terminal = rx.wait_terminal(&ctx.job_id).await.unwrap();
        assert_eq!(terminal.status, BackupJobStatus::Completed);
        assert!(terminal.result.unwrap().success);
    }
}
