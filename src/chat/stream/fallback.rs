//! 降级通道：单个长 HTTP 请求，响应体按空行分帧增量解析

use crate::chat::error::TransportError;
use crate::chat::serialization::generate_operation_id;
use crate::chat::stream::decoder::FrameDecoder;
use crate::chat::stream::transport::{FrameSource, PullTransport, StreamRequest};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::json;
use std::collections::VecDeque;
use tracing::{debug, info};

pub struct HttpFallbackTransport {
    client: reqwest::Client,
    fallback_url: String,
}

impl HttpFallbackTransport {
    /// `client` 应该已经在外部配置好认证头
    pub fn new(client: reqwest::Client, fallback_url: String) -> Self {
        Self {
            client,
            fallback_url,
        }
    }
}

#[async_trait]
impl PullTransport for HttpFallbackTransport {
    async fn request(&self, request: &StreamRequest) -> Result<Box<dyn FrameSource>, TransportError> {
        let operation_id = generate_operation_id();
        debug!(
            "[Fallback] 📡 请求URL: {}, 操作ID: {}",
            self.fallback_url, operation_id
        );

        let response = self
            .client
            .post(&self.fallback_url)
            .header("operationID", &operation_id)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&json!({
                "conversationID": request.remote_conversation_id,
                "clientConversationID": request.conversation_local_id,
                "text": request.text,
            }))
            .send()
            .await
            .map_err(|e| TransportError::transient(format!("降级请求失败: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::from_status(
                status.as_u16(),
                format!("降级请求 HTTP 错误: {}", status),
            ));
        }
        info!("[Fallback] ✅ 降级通道已建立, 状态: {}", status);

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(Box::new(BodyFrameSource::new(body)))
    }
}

type ByteStream<E> = BoxStream<'static, Result<Vec<u8>, E>>;

/// 把字节流切成帧负载
struct BodyFrameSource<E> {
    body: Option<ByteStream<E>>,
    decoder: FrameDecoder,
    ready: VecDeque<String>,
}

impl<E> BodyFrameSource<E> {
    fn new(body: ByteStream<E>) -> Self {
        Self {
            body: Some(body),
            decoder: FrameDecoder::new(),
            ready: VecDeque::new(),
        }
    }
}

#[async_trait]
impl<E: std::fmt::Display + Send + 'static> FrameSource for BodyFrameSource<E> {
    async fn next_payload(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            if let Some(payload) = self.ready.pop_front() {
                return Some(Ok(payload));
            }
            let body = self.body.as_mut()?;
            match body.next().await {
                Some(Ok(chunk)) => self.ready.extend(self.decoder.push(&chunk)),
                Some(Err(e)) => {
                    self.body = None;
                    return Some(Err(TransportError::transient(format!(
                        "读取响应体失败: {}",
                        e
                    ))));
                }
                None => {
                    self.body = None;
                    self.ready.extend(self.decoder.finish());
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // 丢弃响应体即关闭底层连接
        self.body = None;
        self.ready.clear();
        Ok(())
    }
}
