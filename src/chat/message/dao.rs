//! 消息数据访问层（DAO）
//!
//! 消息只追加不修改，唯一允许的更新是把 `synced` 置为 1。
//! `synced = 0` 的消息就是待推送到服务端的 outbox。

use crate::chat::conversation::models::LocalConversation;
use crate::chat::message::models::{LocalMessage, RemoteMessage, Role};
use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use tracing::debug;

/// 消息 DAO（基于 sqlx）
#[derive(Clone)]
pub struct MessageDao {
    db: Pool<Sqlite>,
}

impl MessageDao {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    fn row_to_message(row: SqliteRow) -> Result<LocalMessage> {
        let role: String = row.get("role");
        let synced: i64 = row.get("synced");
        Ok(LocalMessage {
            seq: row.get("seq"),
            conversation_local_id: row.get("conversation_local_id"),
            role: role.parse()?,
            text: row.get("text"),
            created_at: row.get("created_at"),
            synced: synced != 0,
        })
    }

    /// 追加消息并刷新会话的 `updated_at`（同一事务）
    pub async fn append(
        &self,
        conversation_local_id: &str,
        role: Role,
        text: &str,
        created_at: i64,
    ) -> Result<LocalMessage> {
        let mut tx = self.db.begin().await.context("开启事务失败")?;

        let touched = sqlx::query("UPDATE conversations SET updated_at = ? WHERE local_id = ?")
            .bind(created_at)
            .bind(conversation_local_id)
            .execute(&mut *tx)
            .await
            .context("刷新会话时间失败")?;
        if touched.rows_affected() == 0 {
            return Err(anyhow!("会话不存在: {}", conversation_local_id));
        }

        let res = sqlx::query(
            r#"
            INSERT INTO messages (conversation_local_id, role, text, created_at, synced)
            VALUES (?, ?, ?, ?, 0)
            "#,
        )
        .bind(conversation_local_id)
        .bind(role.as_str())
        .bind(text)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .context("插入消息失败")?;
        let seq = res.last_insert_rowid();

        tx.commit().await.context("提交消息事务失败")?;
        debug!(
            "[MsgDAO] 追加消息: conversation={}, seq={}, role={}",
            conversation_local_id, seq, role
        );

        Ok(LocalMessage {
            seq,
            conversation_local_id: conversation_local_id.to_string(),
            role,
            text: text.to_string(),
            created_at,
            synced: false,
        })
    }

    /// 插入服务端已有的会话及其消息（消息直接标记为已同步）
    pub async fn insert_shadow(
        &self,
        conv: &LocalConversation,
        messages: &[RemoteMessage],
    ) -> Result<()> {
        let mut tx = self.db.begin().await.context("开启事务失败")?;

        sqlx::query(
            r#"
            INSERT INTO conversations (local_id, remote_id, title, folder_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&conv.local_id)
        .bind(&conv.remote_id)
        .bind(&conv.title)
        .bind(&conv.folder_id)
        .bind(conv.created_at)
        .bind(conv.updated_at)
        .execute(&mut *tx)
        .await
        .context("插入影子会话失败")?;

        for msg in messages {
            sqlx::query(
                r#"
                INSERT INTO messages (conversation_local_id, role, text, created_at, synced)
                VALUES (?, ?, ?, ?, 1)
                "#,
            )
            .bind(&conv.local_id)
            .bind(msg.role.as_str())
            .bind(&msg.text)
            .bind(msg.created_at)
            .execute(&mut *tx)
            .await
            .context("插入影子消息失败")?;
        }

        tx.commit().await.context("提交影子会话事务失败")?;
        Ok(())
    }

    /// 会话的全部消息（按创建顺序）
    pub async fn list_messages(&self, conversation_local_id: &str) -> Result<Vec<LocalMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, conversation_local_id, role, text, created_at, synced
            FROM messages WHERE conversation_local_id = ?
            ORDER BY seq
            "#,
        )
        .bind(conversation_local_id)
        .fetch_all(&self.db)
        .await
        .context("查询消息失败")?;
        rows.into_iter().map(Self::row_to_message).collect()
    }

    /// 会话中尚未推送的消息（按创建顺序）
    pub async fn unsynced_messages(&self, conversation_local_id: &str) -> Result<Vec<LocalMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, conversation_local_id, role, text, created_at, synced
            FROM messages WHERE conversation_local_id = ? AND synced = 0
            ORDER BY seq
            "#,
        )
        .bind(conversation_local_id)
        .fetch_all(&self.db)
        .await
        .context("查询未同步消息失败")?;
        rows.into_iter().map(Self::row_to_message).collect()
    }

    /// 有未同步消息的会话（按最早待推送消息排序）
    pub async fn conversations_with_outbox(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT conversation_local_id, MIN(seq) AS first_seq
            FROM messages WHERE synced = 0
            GROUP BY conversation_local_id
            ORDER BY first_seq
            "#,
        )
        .fetch_all(&self.db)
        .await
        .context("查询待同步会话失败")?;
        Ok(rows
            .into_iter()
            .map(|row| row.get("conversation_local_id"))
            .collect())
    }

    pub async fn mark_synced(&self, seq: i64) -> Result<()> {
        sqlx::query("UPDATE messages SET synced = 1 WHERE seq = ?")
            .bind(seq)
            .execute(&self.db)
            .await
            .context("标记消息已同步失败")?;
        Ok(())
    }

    pub async fn count_messages(&self, conversation_local_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM messages WHERE conversation_local_id = ?")
            .bind(conversation_local_id)
            .fetch_one(&self.db)
            .await
            .context("统计消息数失败")?;
        Ok(row.get("total"))
    }
}
