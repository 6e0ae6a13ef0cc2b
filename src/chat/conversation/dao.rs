//! 会话数据访问层（DAO）
//!
//! 负责会话、文件夹以及待删除远端会话（outbox）的数据库操作，
//! 将数据访问逻辑与业务逻辑分离。

use crate::chat::conversation::models::{LocalConversation, LocalFolder};
use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

const CONVERSATION_COLUMNS: &str =
    "local_id, remote_id, title, folder_id, created_at, updated_at";

/// 会话 DAO（基于 sqlx）
#[derive(Clone)]
pub struct ConversationDao {
    db: Pool<Sqlite>,
}

impl ConversationDao {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// 使用共享连接初始化数据库表结构（静态方法）
    pub async fn init_db_with_connection(db: &Pool<Sqlite>) -> Result<()> {
        info!("[ConvDAO/DB] 初始化会话数据库表结构");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                local_id   TEXT PRIMARY KEY,
                remote_id  TEXT UNIQUE,
                title      TEXT NOT NULL DEFAULT '',
                folder_id  TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_conversations_updated_at
                ON conversations(updated_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                seq                   INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_local_id TEXT NOT NULL,
                role                  TEXT NOT NULL,
                text                  TEXT NOT NULL,
                created_at            INTEGER NOT NULL,
                synced                INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_local_id, seq)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS folders (
                id    TEXT PRIMARY KEY,
                name  TEXT NOT NULL,
                color TEXT NOT NULL DEFAULT '',
                icon  TEXT NOT NULL DEFAULT ''
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS remote_deletions (
                remote_id    TEXT PRIMARY KEY,
                requested_at INTEGER NOT NULL
            )
            "#,
        ];

        for sql in statements {
            sqlx::query(sql)
                .execute(db)
                .await
                .context("创建数据库表失败")?;
        }

        info!("[ConvDAO/DB] 数据库表初始化完成");
        Ok(())
    }

    fn row_to_conversation(row: SqliteRow) -> LocalConversation {
        LocalConversation {
            local_id: row.get("local_id"),
            remote_id: row.get("remote_id"),
            title: row.get("title"),
            folder_id: row.get("folder_id"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    pub async fn insert_conversation(&self, conv: &LocalConversation) -> Result<()> {
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
        .execute(&self.db)
        .await
        .context("插入会话失败")?;
        Ok(())
    }

    pub async fn get_conversation(&self, local_id: &str) -> Result<Option<LocalConversation>> {
        let sql = format!(
            "SELECT {} FROM conversations WHERE local_id = ?",
            CONVERSATION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(local_id)
            .fetch_optional(&self.db)
            .await
            .context("查询单个会话失败")?;
        Ok(row.map(Self::row_to_conversation))
    }

    pub async fn get_by_remote_id(&self, remote_id: &str) -> Result<Option<LocalConversation>> {
        let sql = format!(
            "SELECT {} FROM conversations WHERE remote_id = ?",
            CONVERSATION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(remote_id)
            .fetch_optional(&self.db)
            .await
            .context("按远端ID查询会话失败")?;
        Ok(row.map(Self::row_to_conversation))
    }

    /// 按 `updated_at` 倒序列出会话，`folder_id` 为 None 时列出全部
    pub async fn list_conversations(
        &self,
        folder_id: Option<&str>,
    ) -> Result<Vec<LocalConversation>> {
        let rows = match folder_id {
            Some(folder_id) => {
                let sql = format!(
                    "SELECT {} FROM conversations WHERE folder_id = ? \
                     ORDER BY updated_at DESC, created_at DESC",
                    CONVERSATION_COLUMNS
                );
                sqlx::query(&sql)
                    .bind(folder_id)
                    .fetch_all(&self.db)
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM conversations ORDER BY updated_at DESC, created_at DESC",
                    CONVERSATION_COLUMNS
                );
                sqlx::query(&sql).fetch_all(&self.db).await
            }
        }
        .context("查询会话列表失败")?;

        let conversations: Vec<LocalConversation> =
            rows.into_iter().map(Self::row_to_conversation).collect();
        debug!(
            "[ConvDAO] 获取本地会话列表，共 {} 个会话",
            conversations.len()
        );
        Ok(conversations)
    }

    /// 只在 `remote_id` 为空时写入，返回最终落库的远端 ID
    pub async fn set_remote_id(&self, local_id: &str, remote_id: &str) -> Result<Option<String>> {
        sqlx::query(
            r#"
            UPDATE conversations SET remote_id = ?
            WHERE local_id = ? AND remote_id IS NULL
            "#,
        )
        .bind(remote_id)
        .bind(local_id)
        .execute(&self.db)
        .await
        .context("写入远端会话ID失败")?;

        let row = sqlx::query("SELECT remote_id FROM conversations WHERE local_id = ?")
            .bind(local_id)
            .fetch_optional(&self.db)
            .await
            .context("读取远端会话ID失败")?;
        Ok(row.and_then(|row| row.get::<Option<String>, _>("remote_id")))
    }

    pub async fn update_title(&self, local_id: &str, title: &str, updated_at: i64) -> Result<bool> {
        let res = sqlx::query("UPDATE conversations SET title = ?, updated_at = ? WHERE local_id = ?")
            .bind(title)
            .bind(updated_at)
            .bind(local_id)
            .execute(&self.db)
            .await
            .context("更新会话标题失败")?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn set_folder(&self, local_id: &str, folder_id: Option<&str>) -> Result<bool> {
        let res = sqlx::query("UPDATE conversations SET folder_id = ? WHERE local_id = ?")
            .bind(folder_id)
            .bind(local_id)
            .execute(&self.db)
            .await
            .context("移动会话到文件夹失败")?;
        Ok(res.rows_affected() > 0)
    }

    /// 在同一事务中删除会话及其消息；若存在远端映射则写入待删除队列
    ///
    /// 返回被删除会话的远端 ID（如有）。
    pub async fn delete_conversation(&self, local_id: &str, requested_at: i64) -> Result<Option<String>> {
        let mut tx = self.db.begin().await.context("开启事务失败")?;

        let row = sqlx::query("SELECT remote_id FROM conversations WHERE local_id = ?")
            .bind(local_id)
            .fetch_optional(&mut *tx)
            .await
            .context("查询待删除会话失败")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let remote_id: Option<String> = row.get("remote_id");

        sqlx::query("DELETE FROM messages WHERE conversation_local_id = ?")
            .bind(local_id)
            .execute(&mut *tx)
            .await
            .context("删除会话消息失败")?;
        sqlx::query("DELETE FROM conversations WHERE local_id = ?")
            .bind(local_id)
            .execute(&mut *tx)
            .await
            .context("删除会话失败")?;

        if let Some(remote_id) = &remote_id {
            sqlx::query(
                "INSERT OR IGNORE INTO remote_deletions (remote_id, requested_at) VALUES (?, ?)",
            )
            .bind(remote_id)
            .bind(requested_at)
            .execute(&mut *tx)
            .await
            .context("写入远端删除队列失败")?;
        }

        tx.commit().await.context("提交删除事务失败")?;
        Ok(remote_id)
    }

    /// 待删除的远端会话 ID（按申请时间）
    pub async fn pending_remote_deletions(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT remote_id FROM remote_deletions ORDER BY requested_at")
            .fetch_all(&self.db)
            .await
            .context("查询远端删除队列失败")?;
        Ok(rows.into_iter().map(|row| row.get("remote_id")).collect())
    }

    /// 远端会话是否仍在删除队列中
    pub async fn is_pending_deletion(&self, remote_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM remote_deletions WHERE remote_id = ?")
            .bind(remote_id)
            .fetch_one(&self.db)
            .await
            .context("查询远端删除记录失败")?;
        let total: i64 = row.get("total");
        Ok(total > 0)
    }

    pub async fn clear_remote_deletion(&self, remote_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM remote_deletions WHERE remote_id = ?")
            .bind(remote_id)
            .execute(&self.db)
            .await
            .context("清除远端删除记录失败")?;
        Ok(())
    }
}

/// 文件夹 DAO
#[derive(Clone)]
pub struct FolderDao {
    db: Pool<Sqlite>,
}

impl FolderDao {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    pub async fn insert_folder(&self, folder: &LocalFolder) -> Result<()> {
        sqlx::query("INSERT INTO folders (id, name, color, icon) VALUES (?, ?, ?, ?)")
            .bind(&folder.id)
            .bind(&folder.name)
            .bind(&folder.color)
            .bind(&folder.icon)
            .execute(&self.db)
            .await
            .context("插入文件夹失败")?;
        Ok(())
    }

    pub async fn update_folder(&self, id: &str, name: &str, color: &str, icon: &str) -> Result<bool> {
        let res = sqlx::query("UPDATE folders SET name = ?, color = ?, icon = ? WHERE id = ?")
            .bind(name)
            .bind(color)
            .bind(icon)
            .bind(id)
            .execute(&self.db)
            .await
            .context("更新文件夹失败")?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn folder_exists(&self, id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM folders WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .context("查询文件夹失败")?;
        Ok(row.is_some())
    }

    /// 删除文件夹，其中的会话回到“未分组”
    pub async fn delete_folder(&self, id: &str) -> Result<bool> {
        let mut tx = self.db.begin().await.context("开启事务失败")?;
        sqlx::query("UPDATE conversations SET folder_id = NULL WHERE folder_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("清空文件夹成员失败")?;
        let res = sqlx::query("DELETE FROM folders WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("删除文件夹失败")?;
        tx.commit().await.context("提交删除事务失败")?;
        Ok(res.rows_affected() > 0)
    }

    /// 列出文件夹，会话数按成员关系实时统计
    pub async fn list_folders(&self) -> Result<Vec<LocalFolder>> {
        let rows = sqlx::query(
            r#"
            SELECT f.id, f.name, f.color, f.icon, COUNT(c.local_id) AS conversation_count
            FROM folders f
            LEFT JOIN conversations c ON c.folder_id = f.id
            GROUP BY f.id, f.name, f.color, f.icon
            ORDER BY f.name
            "#,
        )
        .fetch_all(&self.db)
        .await
        .context("查询文件夹列表失败")?;

        Ok(rows
            .into_iter()
            .map(|row| LocalFolder {
                id: row.get("id"),
                name: row.get("name"),
                color: row.get("color"),
                icon: row.get("icon"),
                conversation_count: row.get("conversation_count"),
            })
            .collect())
    }
}
