pub mod chat;

// 重新导出常用类型，方便外部使用
pub use chat::{
    auth::{AuthCapability, SessionAuth},
    client::{ChatClient, ClientConfig},
    conversation::{ConversationStore, LocalConversation, LocalFolder},
    diagnostics::{Notice, NoticeKind},
    error::EngineError,
    message::{LocalMessage, Role},
    session::{ChatListener, ChatSession, EmptyChatListener, SendOutcome},
    stream::{RetryPolicy, Snapshot, StreamState},
};
