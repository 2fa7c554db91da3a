//! Chat V2 统一错误类型

use serde::Serialize;
use thiserror::Error;

/// Chat V2 统一错误类型
#[derive(Debug, Error, Serialize)]
pub enum ChatV2Error {
    /// 会话未找到
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// 数据库错误
    #[error("Database error: {0}")]
    Database(String),

    /// 操作被取消
    #[error("Cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 验证错误（如 chat_v2 数据库尚未迁移到所需版本）
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Other(String),

    #[error("IO error: {0}")]
    IoError(String),

    /// 数据库损坏（迁移失败且回滚也失败）
    #[error("DATABASE CORRUPTED - Original error: {original_error}, Rollback error: {rollback_error}. Database may be in inconsistent state.")]
    DatabaseCorrupted {
        original_error: String,
        rollback_error: String,
    },
}

impl ChatV2Error {
    /// 稳定的错误码，便于调用方按 code 差异化处理
    pub fn code(&self) -> &'static str {
        match self {
            ChatV2Error::SessionNotFound(_) => "SESSION_NOT_FOUND",
            ChatV2Error::Database(_) => "DATABASE_ERROR",
            ChatV2Error::Cancelled => "CANCELLED",
            ChatV2Error::Serialization(_) => "SERIALIZATION_ERROR",
            ChatV2Error::Validation(_) => "VALIDATION_ERROR",
            ChatV2Error::Other(_) => "OTHER",
            ChatV2Error::IoError(_) => "IO_ERROR",
            ChatV2Error::DatabaseCorrupted { .. } => "DATABASE_CORRUPTED",
        }
    }
}

impl From<rusqlite::Error> for ChatV2Error {
    fn from(e: rusqlite::Error) -> Self {
        ChatV2Error::Database(format!("{:#}", e))
    }
}

impl From<serde_json::Error> for ChatV2Error {
    fn from(e: serde_json::Error) -> Self {
        ChatV2Error::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for ChatV2Error {
    fn from(e: std::io::Error) -> Self {
        ChatV2Error::IoError(e.to_string())
    }
}

/// Result 类型别名
pub type ChatV2Result<T> = Result<T, ChatV2Error>;
