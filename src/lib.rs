// Deep Student 数据治理库入口
//
// 本地多数据库的 Schema 迁移、备份 / 恢复、ZIP 导入导出、旧版聊天迁移与审计。
// 对外入口为 `GovernanceService`。

pub mod backup_common;
pub mod backup_config;
pub mod backup_job_manager;
pub mod chat_v2;
pub mod data_governance;

pub use backup_config::GovernanceConfig;
pub use backup_job_manager::{BackupJobEvent, BackupJobKind, BackupJobPhase, BackupJobStatus};
pub use data_governance::{GovernanceError, GovernanceResult, GovernanceService};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// 初始化日志（RUST_LOG 优先，默认 INFO）
///
/// 宿主程序已安装全局 subscriber 时静默跳过。
pub fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
