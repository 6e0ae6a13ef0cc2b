//! 推送通道：WebSocket 实时连接

use crate::chat::error::TransportError;
use crate::chat::serialization::generate_operation_id;
use crate::chat::stream::transport::{FrameSource, PushTransport, StreamRequest};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketTransport {
    stream_url: String,
    token: String,
    user_id: String,
}

impl WebSocketTransport {
    pub fn new(stream_url: String, token: String, user_id: String) -> Self {
        Self {
            stream_url: stream_url.trim_end_matches('/').to_string(),
            token,
            user_id,
        }
    }

    /// 构建 WebSocket 连接 URL
    fn build_url(&self, operation_id: &str) -> Result<String, TransportError> {
        reqwest::Url::parse_with_params(
            &self.stream_url,
            &[
                ("token", self.token.as_str()),
                ("sendID", self.user_id.as_str()),
                ("operationID", operation_id),
            ],
        )
        .map(|url| url.to_string())
        .map_err(|e| TransportError::rejected("bad_url", format!("无效的流地址 {}: {}", self.stream_url, e)))
    }
}

/// 握手阶段的 HTTP 拒绝按状态码分类，其余一律视为网络问题
fn classify_connect_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            TransportError::from_status(status.as_u16(), format!("WebSocket 握手被拒绝: {}", status))
        }
        other => TransportError::transient(format!("WebSocket 连接失败: {}", other)),
    }
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn connect(&self, request: &StreamRequest) -> Result<Box<dyn FrameSource>, TransportError> {
        let operation_id = generate_operation_id();
        let url = self.build_url(&operation_id)?;

        debug!(
            "[WS] 🔗 连接回复流: conversation={}, operationID={}",
            request.conversation_local_id, operation_id
        );
        let (mut ws, response) = connect_async(url.as_str())
            .await
            .map_err(classify_connect_error)?;
        info!("[WS] ✅ WebSocket 连接成功, 状态: {}", response.status());

        let body = json!({
            "type": "send",
            "operationID": operation_id,
            "conversationID": request.remote_conversation_id,
            "clientConversationID": request.conversation_local_id,
            "text": request.text,
        });
        ws.send(WsMessage::Text(body.to_string()))
            .await
            .map_err(|e| TransportError::transient(format!("发送请求失败: {}", e)))?;

        Ok(Box::new(WebSocketSource { ws, closed: false }))
    }
}

struct WebSocketSource {
    ws: WsStream,
    closed: bool,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn next_payload(&mut self) -> Option<Result<String, TransportError>> {
        if self.closed {
            return None;
        }
        while let Some(msg_result) = self.ws.next().await {
            match msg_result {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => debug!("[WS] 丢弃非 UTF-8 二进制帧"),
                },
                Ok(WsMessage::Close(frame)) => {
                    warn!("[WS] 👋 连接关闭: {:?}", frame);
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    return Some(Err(TransportError::transient(format!(
                        "WebSocket 错误: {}",
                        e
                    ))))
                }
            }
        }
        None
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.ws.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::transient(format!("关闭 WebSocket 失败: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_carries_session_params() {
        let transport = WebSocketTransport::new(
            "ws://localhost:10001/stream/".to_string(),
            "tok en".to_string(),
            "u1".to_string(),
        );
        let url = transport.build_url("op-1").unwrap();
        assert_eq!(
            url,
            "ws://localhost:10001/stream?token=tok+en&sendID=u1&operationID=op-1"
        );
    }

    #[test]
    fn bad_url_is_not_retryable() {
        let transport = WebSocketTransport::new("not a url".into(), String::new(), String::new());
        let err = transport.build_url("op").unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        // 端口 9 (discard) 在测试环境里不会有 WebSocket 服务
        let transport = WebSocketTransport::new(
            "ws://127.0.0.1:9/stream".to_string(),
            String::new(),
            String::new(),
        );
        let request = StreamRequest {
            conversation_local_id: "local-1".into(),
            remote_conversation_id: None,
            text: "Hallo".into(),
        };
        let err = transport.connect(&request).await.err().unwrap();
        assert!(err.is_retryable());
    }
}
