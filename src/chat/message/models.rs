//! 消息本地模型定义

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(anyhow!("未知的消息角色: {}", other)),
        }
    }
}

/// 本地消息记录
///
/// 提交后只允许 `synced` 从 false 变为 true，`seq` 即创建顺序。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMessage {
    pub seq: i64,
    #[serde(rename = "conversationLocalID")]
    pub conversation_local_id: String,
    pub role: Role,
    pub text: String,
    pub created_at: i64,
    pub synced: bool,
}

/// 发往/来自服务端的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    pub role: Role,
    pub text: String,
    #[serde(default)]
    pub created_at: i64,
}

impl From<&LocalMessage> for RemoteMessage {
    fn from(msg: &LocalMessage) -> Self {
        Self {
            role: msg.role,
            text: msg.text.clone(),
            created_at: msg.created_at,
        }
    }
}
