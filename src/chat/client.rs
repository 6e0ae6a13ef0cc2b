//! 客户端门面：组装存储、同步适配器和传输，发放 [`ChatSession`]

use crate::chat::auth::{AuthCapability, SessionAuth};
use crate::chat::conversation::store::ConversationStore;
use crate::chat::db::create_sqlite_pool;
use crate::chat::session::{ChatListener, ChatSession, SessionConfig};
use crate::chat::stream::fallback::HttpFallbackTransport;
use crate::chat::stream::retry::RetryPolicy;
use crate::chat::stream::transport::{PullTransport, PushTransport, TransportManager};
use crate::chat::stream::websocket::WebSocketTransport;
use crate::chat::sync::api::{HttpConversationApi, RemoteConversationApi};
use crate::chat::sync::service::SyncAdapter;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// 用户 ID
    pub user_id: String,
    /// 认证 token，为空表示未登录（纯本地模式）
    pub token: String,
    /// HTTP API 基础地址（远端会话 API）
    pub api_base_url: String,
    /// 推送通道 WebSocket 地址
    pub stream_url: String,
    /// 降级通道地址（POST，响应体按空行分帧）
    pub fallback_url: String,
    /// 本地 SQLite 数据库 URL
    ///
    /// 例如：`sqlite://assistant_chat.db?mode=rwc`
    pub db_url: String,
    /// 日志查看器地址，用于生成按关联 ID 过滤的链接
    pub log_viewer_url: Option<String>,
    pub retry: RetryPolicy,
    /// 看门狗超时
    pub watchdog_timeout: Duration,
}

impl ClientConfig {
    /// 创建默认配置
    pub fn new(user_id: String, token: String) -> Self {
        Self {
            user_id,
            token,
            api_base_url: "http://localhost:10002".to_string(),
            stream_url: "ws://localhost:10001/stream".to_string(),
            fallback_url: "http://localhost:10002/chat/stream".to_string(),
            db_url: "sqlite://assistant_chat.db?mode=rwc".to_string(),
            log_viewer_url: None,
            retry: RetryPolicy::default(),
            watchdog_timeout: Duration::from_secs(15),
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            watchdog_timeout: self.watchdog_timeout,
            log_viewer_url: self.log_viewer_url.clone(),
        }
    }
}

/// 聊天客户端
pub struct ChatClient {
    config: ClientConfig,
    store: Arc<ConversationStore>,
    sync: Arc<SyncAdapter>,
    auth: Arc<SessionAuth>,
    push: Arc<dyn PushTransport>,
    pull: Arc<dyn PullTransport>,
}

impl ChatClient {
    /// 打开本地数据库、组装 HTTP/WebSocket 传输并执行启动同步
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let pool = create_sqlite_pool(&config.db_url).await?;
        let store = Arc::new(ConversationStore::new(pool));

        let http = HttpConversationApi::build_http_client(&config.token)?;
        let api = Arc::new(HttpConversationApi::new(
            http.clone(),
            config.api_base_url.clone(),
        ));
        let auth = Arc::new(SessionAuth::new(!config.token.is_empty()));
        let push = Arc::new(WebSocketTransport::new(
            config.stream_url.clone(),
            config.token.clone(),
            config.user_id.clone(),
        ));
        let pull = Arc::new(HttpFallbackTransport::new(http, config.fallback_url.clone()));

        info!(
            "[Client] 🔗 初始化聊天客户端 (user={}, authenticated={})",
            config.user_id,
            auth.is_authenticated()
        );
        Ok(Self::with_components(config, store, api, auth, push, pull).await)
    }

    /// 用现成的组件组装客户端（测试或嵌入时替换传输/远端 API）
    pub async fn with_components(
        config: ClientConfig,
        store: Arc<ConversationStore>,
        api: Arc<dyn RemoteConversationApi>,
        auth: Arc<SessionAuth>,
        push: Arc<dyn PushTransport>,
        pull: Arc<dyn PullTransport>,
    ) -> Self {
        let sync = Arc::new(SyncAdapter::new(store.clone(), api, auth.clone()));
        let client = Self {
            config,
            store,
            sync,
            auth,
            push,
            pull,
        };
        client.bootstrap().await;
        client
    }

    /// 启动同步：已登录时先完成遗留的远端删除，再合并远端会话，最后清理 outbox
    async fn bootstrap(&self) {
        if !self.sync.is_available() {
            info!("[Client] 未登录，以纯本地模式运行");
            return;
        }
        let deleted = self.sync.drain_remote_deletions().await;
        if deleted > 0 {
            info!("[Client] 🗑️ 启动时完成 {} 个遗留的远端删除", deleted);
        }
        match self.sync.pull_remote_conversations().await {
            Ok(created) => info!("[Client] ✅ 启动同步完成，新增 {} 个远端会话", created.len()),
            Err(e) => warn!("[Client] 启动同步失败（忽略）: {}", e),
        }
        self.sync.spawn_drain();
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn sync(&self) -> &Arc<SyncAdapter> {
        &self.sync
    }

    /// 外部登录模块更新登录态
    pub fn set_authenticated(&self, authenticated: bool) {
        self.auth.set_authenticated(authenticated);
        if authenticated {
            self.sync.spawn_drain();
        }
    }

    /// 新建会话并返回其聊天控制器
    pub async fn new_session(
        &self,
        title: Option<&str>,
        listener: Arc<dyn ChatListener>,
    ) -> Result<ChatSession> {
        let local_id = self.store.create_conversation(title).await?;
        Ok(self.session_for(local_id, listener))
    }

    /// 打开已有会话
    pub async fn open_session(
        &self,
        local_id: &str,
        listener: Arc<dyn ChatListener>,
    ) -> Result<ChatSession> {
        if self.store.get_conversation(local_id).await?.is_none() {
            return Err(anyhow!("会话不存在: {}", local_id));
        }
        Ok(self.session_for(local_id.to_string(), listener))
    }

    /// 删除会话：本地立即删除，远端尽力删除
    pub async fn delete_conversation(&self, local_id: &str) -> Result<()> {
        self.sync.delete_conversation(local_id).await
    }

    fn session_for(&self, local_id: String, listener: Arc<dyn ChatListener>) -> ChatSession {
        let transports = TransportManager::new(
            self.push.clone(),
            self.pull.clone(),
            self.config.retry.clone(),
        );
        ChatSession::new(
            local_id,
            self.store.clone(),
            self.sync.clone(),
            transports,
            listener,
            self.config.session_config(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::conversation::models::RemoteConversation;
    use crate::chat::conversation::store::tests::memory_store;
    use crate::chat::message::models::{RemoteMessage, Role};
    use crate::chat::session::{EmptyChatListener, SendOutcome};
    use crate::chat::stream::testing::{Script, ScriptedTransport};
    use crate::chat::sync::testing::MockRemoteApi;

    async fn client(
        api: Arc<MockRemoteApi>,
        authenticated: bool,
        push: ScriptedTransport,
    ) -> ChatClient {
        let store = Arc::new(memory_store().await);
        let mut config = ClientConfig::new("u1".to_string(), "token".to_string());
        config.watchdog_timeout = Duration::from_secs(2);
        config.retry = RetryPolicy::no_retry();
        ChatClient::with_components(
            config,
            store,
            api,
            Arc::new(SessionAuth::new(authenticated)),
            Arc::new(push),
            Arc::new(ScriptedTransport::offline()),
        )
        .await
    }

    #[test]
    fn default_config() {
        let config = ClientConfig::new("u1".to_string(), String::new());
        assert_eq!(config.watchdog_timeout, Duration::from_secs(15));
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(config.db_url.starts_with("sqlite://"));
    }

    #[tokio::test]
    async fn bootstrap_pulls_remote_conversations_when_authenticated() {
        let api = Arc::new(MockRemoteApi::new());
        api.seed_remote(
            RemoteConversation {
                remote_id: "r-remote".to_string(),
                title: "Reise".to_string(),
                created_at: 10,
                updated_at: 20,
            },
            vec![RemoteMessage {
                role: Role::User,
                text: "Hallo".to_string(),
                created_at: 10,
            }],
        );

        let c = client(api.clone(), true, ScriptedTransport::offline()).await;
        let shadow = c.store().get_by_remote_id("r-remote").await.unwrap().unwrap();
        assert_eq!(shadow.title, "Reise");
        assert_eq!(c.store().message_count(&shadow.local_id).await.unwrap(), 1);

        let offline = client(api, false, ScriptedTransport::offline()).await;
        assert!(offline.store().list_conversations(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bootstrap_finishes_pending_deletions_before_pulling() {
        let api = Arc::new(MockRemoteApi::new());
        api.seed_remote(
            RemoteConversation {
                remote_id: "r-gone".to_string(),
                title: "Geheim".to_string(),
                created_at: 10,
                updated_at: 20,
            },
            Vec::new(),
        );
        let store = Arc::new(memory_store().await);
        let local_id = store.create_conversation(Some("Geheim")).await.unwrap();
        store.set_remote_id(&local_id, "r-gone").await.unwrap();
        store.delete_conversation(&local_id).await.unwrap();

        let mut config = ClientConfig::new("u1".to_string(), "token".to_string());
        config.retry = RetryPolicy::no_retry();
        let c = ChatClient::with_components(
            config,
            store,
            api.clone(),
            Arc::new(SessionAuth::new(true)),
            Arc::new(ScriptedTransport::offline()),
            Arc::new(ScriptedTransport::offline()),
        )
        .await;

        assert_eq!(api.deleted(), vec!["r-gone".to_string()]);
        assert!(c.store().list_conversations(None).await.unwrap().is_empty());
        assert!(c.store().pending_remote_deletions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_round_trip() {
        let push = ScriptedTransport::new(vec![Script::frames(&[
            r#"{"type":"delta","text":"Hi"}"#,
            r#"{"type":"delta","text":" there"}"#,
            r#"{"type":"done"}"#,
        ])]);
        let c = client(Arc::new(MockRemoteApi::new()), false, push).await;

        let session = c
            .new_session(Some("Neu"), Arc::new(EmptyChatListener))
            .await
            .unwrap();
        assert_eq!(session.send("Hallo").await.unwrap(), SendOutcome::Accepted);
        session.wait_settled().await;

        let messages = c.store().messages(session.conversation_id()).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text, "Hi there");

        let reopened = c
            .open_session(session.conversation_id(), Arc::new(EmptyChatListener))
            .await;
        assert!(reopened.is_ok());
        assert!(c
            .open_session("local-missing", Arc::new(EmptyChatListener))
            .await
            .is_err());
    }
}
