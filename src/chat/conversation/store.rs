//! 本地会话存储
//!
//! 界面渲染所需的一切数据都从这里读取，从不直接读网络。所有写入都经过这里的方法，
//! 由方法本身维护 `local_id` 不变、`remote_id` 只写一次、消息只追加等约束。

use crate::chat::conversation::dao::{ConversationDao, FolderDao};
use crate::chat::conversation::models::{LocalConversation, LocalFolder, RemoteConversation};
use crate::chat::message::dao::MessageDao;
use crate::chat::message::models::{LocalMessage, RemoteMessage, Role};
use crate::chat::serialization::{generate_local_id, MonotonicClock};
use anyhow::{anyhow, Result};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info, warn};

/// 新会话的默认标题
pub const DEFAULT_TITLE: &str = "新对话";

/// 本地会话存储
pub struct ConversationStore {
    conversation_dao: ConversationDao,
    message_dao: MessageDao,
    folder_dao: FolderDao,
    clock: MonotonicClock,
}

impl ConversationStore {
    /// 使用已初始化表结构的连接池创建存储
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self {
            conversation_dao: ConversationDao::new(db.clone()),
            message_dao: MessageDao::new(db.clone()),
            folder_dao: FolderDao::new(db),
            clock: MonotonicClock::new(),
        }
    }

    /// 创建会话，立即返回本地 ID（不等待网络）
    pub async fn create_conversation(&self, title: Option<&str>) -> Result<String> {
        let now = self.clock.now();
        let conv = LocalConversation {
            local_id: generate_local_id(),
            remote_id: None,
            title: title
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or(DEFAULT_TITLE)
                .to_string(),
            folder_id: None,
            created_at: now,
            updated_at: now,
        };
        self.conversation_dao.insert_conversation(&conv).await?;
        info!("[ConvStore] 🆕 创建会话: {}", conv.local_id);
        Ok(conv.local_id)
    }

    /// 追加消息，返回已落库的消息
    ///
    /// 调用方必须等待此方法返回后才能发起任何网络请求。
    pub async fn append_message(
        &self,
        local_id: &str,
        role: Role,
        text: &str,
    ) -> Result<LocalMessage> {
        let now = self.clock.now();
        self.message_dao.append(local_id, role, text, now).await
    }

    /// 列出会话，按 `updated_at` 倒序
    pub async fn list_conversations(
        &self,
        folder_id: Option<&str>,
    ) -> Result<Vec<LocalConversation>> {
        self.conversation_dao.list_conversations(folder_id).await
    }

    pub async fn get_conversation(&self, local_id: &str) -> Result<Option<LocalConversation>> {
        self.conversation_dao.get_conversation(local_id).await
    }

    pub async fn get_by_remote_id(&self, remote_id: &str) -> Result<Option<LocalConversation>> {
        self.conversation_dao.get_by_remote_id(remote_id).await
    }

    pub async fn rename_conversation(&self, local_id: &str, title: &str) -> Result<()> {
        let now = self.clock.now();
        if !self.conversation_dao.update_title(local_id, title, now).await? {
            return Err(anyhow!("会话不存在: {}", local_id));
        }
        Ok(())
    }

    /// 删除本地会话
    ///
    /// 若已映射远端 ID，则写入远端删除队列，由同步适配器尽力删除；远端失败不回滚本地删除。
    /// 返回被删除会话的远端 ID（如有）。
    pub async fn delete_conversation(&self, local_id: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let remote_id = self
            .conversation_dao
            .delete_conversation(local_id, now)
            .await?;
        info!(
            "[ConvStore] 🗑️ 删除会话: {}, 远端ID: {:?}",
            local_id, remote_id
        );
        Ok(remote_id)
    }

    /// 批量移动会话到文件夹（`None` 表示移出文件夹），返回实际移动的数量
    ///
    /// 每个会话的移动互相独立，重复调用结果相同；不存在的会话被跳过。
    pub async fn move_to_folder(&self, local_ids: &[String], folder_id: Option<&str>) -> Result<usize> {
        if let Some(folder_id) = folder_id {
            if !self.folder_dao.folder_exists(folder_id).await? {
                return Err(anyhow!("文件夹不存在: {}", folder_id));
            }
        }

        let mut moved = 0;
        for local_id in local_ids {
            if self.conversation_dao.set_folder(local_id, folder_id).await? {
                moved += 1;
            } else {
                warn!("[ConvStore] 移动会话时未找到会话: {}", local_id);
            }
        }
        debug!(
            "[ConvStore] 移动 {} 个会话到文件夹 {:?}",
            moved, folder_id
        );
        Ok(moved)
    }

    /// 全部消息（创建顺序）
    pub async fn messages(&self, local_id: &str) -> Result<Vec<LocalMessage>> {
        self.message_dao.list_messages(local_id).await
    }

    pub async fn message_count(&self, local_id: &str) -> Result<i64> {
        self.message_dao.count_messages(local_id).await
    }

    // ========== 同步适配器使用的接口 ==========

    /// 写入远端 ID（只写一次），返回最终落库的远端 ID
    pub async fn set_remote_id(&self, local_id: &str, remote_id: &str) -> Result<String> {
        let stored = self
            .conversation_dao
            .set_remote_id(local_id, remote_id)
            .await?
            .ok_or_else(|| anyhow!("会话不存在: {}", local_id))?;
        if stored != remote_id {
            warn!(
                "[ConvStore] 会话 {} 已映射到 {}，忽略新的远端ID {}",
                local_id, stored, remote_id
            );
        }
        Ok(stored)
    }

    /// 为服务端已有但本地未知的会话创建影子记录
    pub async fn insert_shadow(
        &self,
        remote: &RemoteConversation,
        messages: &[RemoteMessage],
    ) -> Result<LocalConversation> {
        let now = self.clock.now();
        let conv = LocalConversation {
            local_id: generate_local_id(),
            remote_id: Some(remote.remote_id.clone()),
            title: if remote.title.is_empty() {
                DEFAULT_TITLE.to_string()
            } else {
                remote.title.clone()
            },
            folder_id: None,
            created_at: if remote.created_at > 0 { remote.created_at } else { now },
            updated_at: if remote.updated_at > 0 { remote.updated_at } else { now },
        };
        self.message_dao.insert_shadow(&conv, messages).await?;
        Ok(conv)
    }

    pub async fn unsynced_messages(&self, local_id: &str) -> Result<Vec<LocalMessage>> {
        self.message_dao.unsynced_messages(local_id).await
    }

    pub async fn conversations_with_outbox(&self) -> Result<Vec<String>> {
        self.message_dao.conversations_with_outbox().await
    }

    pub async fn mark_synced(&self, seq: i64) -> Result<()> {
        self.message_dao.mark_synced(seq).await
    }

    pub async fn pending_remote_deletions(&self) -> Result<Vec<String>> {
        self.conversation_dao.pending_remote_deletions().await
    }

    pub async fn is_pending_deletion(&self, remote_id: &str) -> Result<bool> {
        self.conversation_dao.is_pending_deletion(remote_id).await
    }

    pub async fn clear_remote_deletion(&self, remote_id: &str) -> Result<()> {
        self.conversation_dao.clear_remote_deletion(remote_id).await
    }

    // ========== 文件夹 ==========

    pub async fn create_folder(&self, name: &str, color: &str, icon: &str) -> Result<String> {
        let folder = LocalFolder {
            id: format!("folder-{}", uuid::Uuid::new_v4().simple()),
            name: name.to_string(),
            color: color.to_string(),
            icon: icon.to_string(),
            conversation_count: 0,
        };
        self.folder_dao.insert_folder(&folder).await?;
        Ok(folder.id)
    }

    pub async fn update_folder(&self, id: &str, name: &str, color: &str, icon: &str) -> Result<()> {
        if !self.folder_dao.update_folder(id, name, color, icon).await? {
            return Err(anyhow!("文件夹不存在: {}", id));
        }
        Ok(())
    }

    pub async fn delete_folder(&self, id: &str) -> Result<bool> {
        self.folder_dao.delete_folder(id).await
    }

    pub async fn list_folders(&self) -> Result<Vec<LocalFolder>> {
        self.folder_dao.list_folders().await
    }
}
