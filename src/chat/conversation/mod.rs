//! 会话模块
//!
//! 本地优先的会话、消息与文件夹存储

pub mod dao;
pub mod models;
pub mod store;

pub use dao::{ConversationDao, FolderDao};
pub use models::{LocalConversation, LocalFolder, RemoteConversation};
pub use store::ConversationStore;
