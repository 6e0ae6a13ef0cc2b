//! 会话本地模型定义

use serde::{Deserialize, Serialize};

/// 本地会话
///
/// `local_id` 创建时生成且永不改变；`remote_id` 首次与服务端往返成功后写入，之后不再清除。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalConversation {
    #[serde(rename = "localID")]
    pub local_id: String,
    #[serde(rename = "remoteID")]
    pub remote_id: Option<String>,
    pub title: String,
    #[serde(rename = "folderID")]
    pub folder_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl LocalConversation {
    /// 尚未与服务端建立映射的纯本地会话
    pub fn is_local_only(&self) -> bool {
        self.remote_id.is_none()
    }
}

/// 文件夹
///
/// `conversation_count` 每次读取时按成员关系现算，不落库。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalFolder {
    pub id: String,
    pub name: String,
    pub color: String,
    pub icon: String,
    pub conversation_count: i64,
}

/// 服务端会话（`/conversation/list` 的条目）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConversation {
    #[serde(rename = "conversationID")]
    pub remote_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}
