//! 远端会话 HTTP API 客户端
//!
//! 负责所有远端会话相关的 HTTP 请求。服务端行为不归本引擎定义，
//! 这里只约定请求/响应的形状。

use crate::chat::conversation::models::RemoteConversation;
use crate::chat::message::models::RemoteMessage;
use crate::chat::serialization::generate_operation_id;
use crate::chat::types::{handle_http_response, require_data};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

/// 远端会话 API
///
/// 除 `create_conversation` 外，所有调用对调用方而言都是幂等的；
/// `create_conversation` 由同步适配器的 single-flight 保证不重复调用。
#[async_trait]
pub trait RemoteConversationApi: Send + Sync {
    /// 创建远端会话，返回远端 ID
    async fn create_conversation(&self, title: &str) -> Result<String>;

    /// 列出远端会话
    async fn list_conversations(&self) -> Result<Vec<RemoteConversation>>;

    /// 追加消息到远端会话
    async fn append_message(&self, remote_id: &str, message: &RemoteMessage) -> Result<()>;

    /// 删除远端会话
    async fn delete_conversation(&self, remote_id: &str) -> Result<()>;

    /// 拉取远端会话的消息
    async fn fetch_messages(&self, remote_id: &str) -> Result<Vec<RemoteMessage>>;
}

/// 基于 reqwest 的远端会话 API
pub struct HttpConversationApi {
    client: reqwest::Client,
    api_base_url: String,
}

impl HttpConversationApi {
    /// `client` 应该已经在外部配置好认证头
    pub fn new(client: reqwest::Client, api_base_url: String) -> Self {
        Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// 创建带认证头的 HTTP 客户端（token 通过 default_headers 自动添加）
    pub fn build_http_client(token: &str) -> Result<reqwest::Client> {
        let mut headers = reqwest::header::HeaderMap::new();
        if !token.is_empty() {
            headers.insert(
                reqwest::header::HeaderName::from_static("token"),
                reqwest::header::HeaderValue::from_str(token).context("无效的 token")?,
            );
        }
        reqwest::ClientBuilder::new()
            .default_headers(headers)
            .build()
            .context("创建 HTTP 客户端失败")
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
        operation_name: &str,
    ) -> Result<crate::chat::types::ApiResponse<T>> {
        let operation_id = generate_operation_id();
        let url = format!("{}{}", self.api_base_url, path);
        debug!(
            "[ConvAPI] 📡 {} 请求URL: {}, 操作ID: {}",
            operation_name, url, operation_id
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("operationID", &operation_id)
            .json(&body)
            .send()
            .await
            .context("请求失败")?;

        handle_http_response::<T>(response, operation_name).await
    }
}

#[derive(Deserialize)]
struct CreateConversationData {
    #[serde(rename = "conversationID")]
    conversation_id: String,
}

#[derive(Deserialize)]
struct ConversationListData {
    #[serde(default)]
    conversations: Vec<RemoteConversation>,
}

#[derive(Deserialize)]
struct MessageListData {
    #[serde(default)]
    messages: Vec<RemoteMessage>,
}

#[async_trait]
impl RemoteConversationApi for HttpConversationApi {
    async fn create_conversation(&self, title: &str) -> Result<String> {
        let resp = self
            .post::<CreateConversationData>(
                "/conversation/create",
                json!({ "title": title }),
                "创建远端会话",
            )
            .await?;
        let data = require_data(resp)?;
        info!("[ConvAPI] ✅ 远端会话已创建: {}", data.conversation_id);
        Ok(data.conversation_id)
    }

    async fn list_conversations(&self) -> Result<Vec<RemoteConversation>> {
        let resp = self
            .post::<ConversationListData>("/conversation/list", json!({}), "远端会话列表")
            .await?;
        let data = require_data(resp)?;
        info!(
            "[ConvAPI] ✅ 远端会话列表响应，会话数: {}",
            data.conversations.len()
        );
        Ok(data.conversations)
    }

    async fn append_message(&self, remote_id: &str, message: &RemoteMessage) -> Result<()> {
        self.post::<serde_json::Value>(
            "/conversation/append_message",
            json!({
                "conversationID": remote_id,
                "role": message.role,
                "text": message.text,
                "createdAt": message.created_at,
            }),
            "推送消息",
        )
        .await?;
        Ok(())
    }

    async fn delete_conversation(&self, remote_id: &str) -> Result<()> {
        self.post::<serde_json::Value>(
            "/conversation/delete",
            json!({ "conversationID": remote_id }),
            "删除远端会话",
        )
        .await?;
        Ok(())
    }

    async fn fetch_messages(&self, remote_id: &str) -> Result<Vec<RemoteMessage>> {
        let resp = self
            .post::<MessageListData>(
                "/conversation/messages",
                json!({ "conversationID": remote_id }),
                "拉取远端消息",
            )
            .await?;
        Ok(resp.data.map(|d| d.messages).unwrap_or_default())
    }
}
