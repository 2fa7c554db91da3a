//! Chat V2：旧版聊天记录的迁移

pub mod error;
pub mod migration;

pub use error::{ChatV2Error, ChatV2Result};
