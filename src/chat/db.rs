//! SQLite 数据库工具：统一创建连接池并初始化表结构
//!
//! 表结构由各 DAO 的 `init_db_with_connection` 负责创建（`CREATE TABLE IF NOT EXISTS`），
//! 这里只负责连接池本身。

use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use tracing::info;

use crate::chat::conversation::dao::ConversationDao;

/// 创建 SQLite 连接池并初始化所有表
///
/// 内存数据库（`sqlite::memory:`）每个连接都是独立的库，因此只保留一个常驻连接。
pub async fn create_sqlite_pool(db_url: &str) -> Result<Pool<Sqlite>> {
    let in_memory = db_url.contains(":memory:") || db_url.contains("mode=memory");

    let options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };

    info!("[DB] 🔗 创建 SQLite 连接池: {}", db_url);
    let pool = options
        .connect(db_url)
        .await
        .with_context(|| format!("连接SQLite数据库失败: {}", db_url))?;

    ConversationDao::init_db_with_connection(&pool).await?;
    Ok(pool)
}
