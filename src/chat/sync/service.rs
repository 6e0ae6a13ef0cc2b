//! 远端同步适配器
//!
//! 在本地 ID 与远端 ID 之间架桥，所有远端写入都是尽力而为：失败只记日志，
//! 未同步的消息留在 outbox（`synced = 0`）里，下次同步时按顺序重试。
//! 未登录时所有调用都返回 [`SyncError::Unavailable`]，调用方按无操作处理。

use crate::chat::auth::AuthCapability;
use crate::chat::conversation::models::LocalConversation;
use crate::chat::conversation::store::ConversationStore;
use crate::chat::error::SyncError;
use crate::chat::message::models::{LocalMessage, RemoteMessage};
use crate::chat::sync::api::RemoteConversationApi;
use crate::chat::sync::single_flight::KeyedLocks;
use anyhow::anyhow;
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 单条消息推送结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    Failed,
    Unavailable,
}

/// 一次 outbox 清理的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// 成功删除的远端会话数
    pub deleted: usize,
    /// 成功推送的消息数
    pub pushed: usize,
    /// 推送中途失败的会话（其余消息留待下次）
    pub failed_conversations: Vec<String>,
    pub unavailable: bool,
}

/// 远端同步适配器
pub struct SyncAdapter {
    store: Arc<ConversationStore>,
    api: Arc<dyn RemoteConversationApi>,
    auth: Arc<dyn AuthCapability>,
    /// 远端会话创建的 single-flight 锁
    create_locks: KeyedLocks,
    /// 每个会话的 outbox 推送串行锁
    push_locks: KeyedLocks,
}

impl SyncAdapter {
    pub fn new(
        store: Arc<ConversationStore>,
        api: Arc<dyn RemoteConversationApi>,
        auth: Arc<dyn AuthCapability>,
    ) -> Self {
        Self {
            store,
            api,
            auth,
            create_locks: KeyedLocks::new(),
            push_locks: KeyedLocks::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.auth.is_authenticated()
    }

    /// 确保本地会话已映射远端会话，返回远端 ID
    ///
    /// 同一 `local_id` 的并发调用只会触发一次远端创建，后来者等待并复用结果。
    /// 创建请求在独立任务中执行并持有锁直到映射落库，调用方被取消也不会丢失已发出的创建。
    pub async fn ensure_remote_conversation(&self, local_id: &str) -> Result<String, SyncError> {
        if !self.is_available() {
            return Err(SyncError::Unavailable);
        }

        if let Some(remote_id) = self.mapped_remote_id(local_id).await? {
            return Ok(remote_id);
        }

        let guard = self.create_locks.lock(local_id).await;

        // 等锁期间可能已被前一个调用创建
        let conv = self
            .store
            .get_conversation(local_id)
            .await?
            .ok_or_else(|| anyhow!("会话不存在: {}", local_id))?;
        if let Some(remote_id) = conv.remote_id {
            debug!("[Sync] 复用已创建的远端会话: {} -> {}", local_id, remote_id);
            return Ok(remote_id);
        }

        info!("[Sync] 📡 为本地会话创建远端会话: {}", local_id);
        let api = self.api.clone();
        let store = self.store.clone();
        let local_id = local_id.to_string();
        let title = conv.title;
        let task = tokio::spawn(async move {
            let _guard = guard;
            let created = api.create_conversation(&title).await?;
            let stored = store.set_remote_id(&local_id, &created).await?;
            info!("[Sync] ✅ 会话映射: {} -> {}", local_id, stored);
            Ok::<String, SyncError>(stored)
        });
        task.await
            .map_err(|e| SyncError::Remote(anyhow!("远端会话创建任务异常: {}", e)))?
    }

    async fn mapped_remote_id(&self, local_id: &str) -> Result<Option<String>, SyncError> {
        let conv = self
            .store
            .get_conversation(local_id)
            .await?
            .ok_or_else(|| anyhow!("会话不存在: {}", local_id))?;
        Ok(conv.remote_id)
    }

    /// 拉取服务端已有会话，为本地未知的会话创建影子记录
    ///
    /// 按 `remote_id` 合并：已知会话保持本地版本不动，纯本地会话永不被覆盖。
    /// 返回新建的影子会话。
    pub async fn pull_remote_conversations(&self) -> Result<Vec<LocalConversation>, SyncError> {
        if !self.is_available() {
            return Err(SyncError::Unavailable);
        }

        let remote_list = self.api.list_conversations().await?;
        info!("[Sync] 🔄 拉取远端会话，共 {} 个", remote_list.len());

        let mut created = Vec::new();
        for remote in &remote_list {
            if self.store.get_by_remote_id(&remote.remote_id).await?.is_some() {
                continue;
            }
            // 用户已删除、远端删除尚未完成的会话不能被拉回来
            if self.store.is_pending_deletion(&remote.remote_id).await? {
                debug!("[Sync] 跳过待删除的远端会话: {}", remote.remote_id);
                continue;
            }

            // 消息拉取失败时跳过该会话，下次拉取再试，避免留下空壳
            let messages = match self.api.fetch_messages(&remote.remote_id).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(
                        "[Sync] 拉取远端会话消息失败，跳过: remote={}, err={}",
                        remote.remote_id, e
                    );
                    continue;
                }
            };

            let conv = self.store.insert_shadow(remote, &messages).await?;
            debug!(
                "[Sync] 🆕 影子会话: {} -> {} ({} 条消息)",
                conv.local_id,
                remote.remote_id,
                messages.len()
            );
            created.push(conv);
        }

        info!("[Sync] ✅ 远端会话合并完成，新增 {} 个", created.len());
        Ok(created)
    }

    /// 推送单条消息
    ///
    /// 为保持会话内顺序，先推送该消息之前仍在 outbox 中的消息。
    pub async fn push_message(&self, local_id: &str, message: &LocalMessage) -> PushOutcome {
        if !self.is_available() {
            return PushOutcome::Unavailable;
        }
        if message.synced {
            return PushOutcome::Pushed;
        }

        match self.drain_conversation(local_id).await {
            Ok(_) => PushOutcome::Pushed,
            Err(SyncError::Unavailable) => PushOutcome::Unavailable,
            Err(e) => {
                warn!(
                    "[Sync] 推送消息失败，留在 outbox 等待重试: conversation={}, seq={}, err={}",
                    local_id, message.seq, e
                );
                PushOutcome::Failed
            }
        }
    }

    /// 按顺序推送一个会话的 outbox，遇到失败立即停止，返回推送条数
    pub async fn drain_conversation(&self, local_id: &str) -> Result<usize, SyncError> {
        let _guard = self.push_locks.lock(local_id).await;

        let pending = self.store.unsynced_messages(local_id).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let remote_id = self.ensure_remote_conversation(local_id).await?;
        let mut pushed = 0;
        for message in &pending {
            self.api
                .append_message(&remote_id, &RemoteMessage::from(message))
                .await?;
            self.store.mark_synced(message.seq).await?;
            pushed += 1;
        }
        debug!(
            "[Sync] 会话 {} 推送 {} 条消息到 {}",
            local_id, pushed, remote_id
        );
        Ok(pushed)
    }

    /// 清理 outbox：先处理远端删除，再并发推送各会话的未同步消息
    ///
    /// 同一会话内严格按创建顺序推送，不同会话之间没有顺序保证。
    pub async fn drain_outbox(&self) -> DrainReport {
        let mut report = DrainReport::default();
        if !self.is_available() {
            report.unavailable = true;
            return report;
        }

        report.deleted = self.drain_remote_deletions().await;

        let conversations = match self.store.conversations_with_outbox().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("[Sync] 读取待同步会话失败: {}", e);
                return report;
            }
        };

        let results = join_all(
            conversations
                .iter()
                .map(|local_id| self.drain_conversation(local_id)),
        )
        .await;

        for (local_id, result) in conversations.into_iter().zip(results) {
            match result {
                Ok(pushed) => report.pushed += pushed,
                Err(e) => {
                    warn!("[Sync] 会话 {} 同步中断: {}", local_id, e);
                    report.failed_conversations.push(local_id);
                }
            }
        }

        if report.pushed > 0 || report.deleted > 0 {
            info!(
                "[Sync] ✅ outbox 清理完成: 推送 {} 条, 删除 {} 个, 失败会话 {}",
                report.pushed,
                report.deleted,
                report.failed_conversations.len()
            );
        }
        report
    }

    /// 处理远端删除队列，返回成功删除的数量；失败的留在队列中
    pub async fn drain_remote_deletions(&self) -> usize {
        if !self.is_available() {
            return 0;
        }
        let pending = match self.store.pending_remote_deletions().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("[Sync] 读取远端删除队列失败: {}", e);
                return 0;
            }
        };
        let mut deleted = 0;
        for remote_id in pending {
            match self.delete_remote(&remote_id).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!("[Sync] 删除远端会话失败: {}, err={}", remote_id, e),
            }
        }
        deleted
    }

    async fn delete_remote(&self, remote_id: &str) -> Result<(), SyncError> {
        self.api.delete_conversation(remote_id).await?;
        self.store.clear_remote_deletion(remote_id).await?;
        Ok(())
    }

    /// 删除会话：本地立即删除，远端删除在后台尽力完成
    pub async fn delete_conversation(self: &Arc<Self>, local_id: &str) -> anyhow::Result<()> {
        let remote_id = self.store.delete_conversation(local_id).await?;
        if let Some(remote_id) = remote_id {
            if self.is_available() {
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.delete_remote(&remote_id).await {
                        warn!(
                            "[Sync] 后台删除远端会话失败，保留在删除队列: {}, err={}",
                            remote_id, e
                        );
                    }
                });
            }
        }
        Ok(())
    }

    /// 后台清理 outbox（不等待结果）
    pub fn spawn_drain(self: &Arc<Self>) -> JoinHandle<DrainReport> {
        let this = self.clone();
        tokio::spawn(async move { this.drain_outbox().await })
    }
}
