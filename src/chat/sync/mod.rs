//! 远端同步模块
//!
//! 本地会话与远端会话 API 之间的尽力而为同步

pub mod api;
pub mod service;
pub mod single_flight;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{HttpConversationApi, RemoteConversationApi};
pub use service::{DrainReport, PushOutcome, SyncAdapter};
pub use single_flight::KeyedLocks;
