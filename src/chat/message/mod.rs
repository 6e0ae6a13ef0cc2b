//! 消息模块

pub mod dao;
pub mod models;

pub use dao::MessageDao;
pub use models::{LocalMessage, RemoteMessage, Role};
