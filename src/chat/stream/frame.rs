//! 流式协议的帧
//!
//! 每个帧的负载是一段 JSON：`{"type": "delta", "text": "..."}`，
//! 任意帧都可以携带 `correlationId`。完全不是 JSON 的负载按原始增量文本处理；
//! 是 JSON 但形状不认识的负载视为畸形帧，由调用方静默丢弃。

use serde_json::{Map, Value};

/// 帧类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// 追加到缓冲区
    Delta(String),
    /// 用快照整体替换缓冲区
    Full(String),
    /// 结束帧，带文本时替换缓冲区
    Done(Option<String>),
    /// 错误结束帧
    Error { code: String, detail: Option<String> },
    /// 只携带元数据（关联 ID）
    Meta,
}

/// 一个完整的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub correlation_id: Option<String>,
}

impl Frame {
    pub fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            correlation_id: None,
        }
    }

    pub fn delta(text: impl Into<String>) -> Self {
        Self::new(FrameKind::Delta(text.into()))
    }

    pub fn full(text: impl Into<String>) -> Self {
        Self::new(FrameKind::Full(text.into()))
    }

    pub fn done(final_text: Option<&str>) -> Self {
        Self::new(FrameKind::Done(final_text.map(str::to_string)))
    }

    pub fn error(code: impl Into<String>, detail: Option<&str>) -> Self {
        Self::new(FrameKind::Error {
            code: code.into(),
            detail: detail.map(str::to_string),
        })
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, FrameKind::Done(_) | FrameKind::Error { .. })
    }

    /// 解析帧负载，畸形帧返回 None
    pub fn parse(payload: &str) -> Option<Frame> {
        let trimmed = payload.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed == "[DONE]" {
            return Some(Frame::done(None));
        }

        let value = match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => value,
            // 非 JSON 负载是原始增量文本
            Err(_) => return Some(Frame::delta(payload)),
        };

        match value {
            Value::Object(obj) => Self::parse_object(&obj),
            Value::String(text) => Some(Frame::delta(text)),
            _ => Some(Frame::delta(payload)),
        }
    }

    fn parse_object(obj: &Map<String, Value>) -> Option<Frame> {
        let correlation_id = ["correlationId", "correlation_id", "requestId"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        let text = ["text", "content", "delta"]
            .iter()
            .find_map(|key| obj.get(*key))
            .map(|v| v.as_str().map(str::to_string));

        let frame_type = obj
            .get("type")
            .or_else(|| obj.get("event"))
            .and_then(Value::as_str);

        let kind = match frame_type {
            Some("delta") | Some("chunk") => FrameKind::Delta(text??),
            Some("full") | Some("snapshot") => FrameKind::Full(text??),
            Some("done") | Some("end") | Some("complete") => FrameKind::Done(text.flatten()),
            Some("error") => {
                let code = match obj.get("code") {
                    Some(Value::String(code)) if !code.is_empty() => code.clone(),
                    Some(Value::Number(code)) => code.to_string(),
                    _ => "unknown".to_string(),
                };
                let detail = ["detail", "message"]
                    .iter()
                    .find_map(|key| obj.get(*key).and_then(Value::as_str))
                    .map(str::to_string);
                FrameKind::Error { code, detail }
            }
            _ if correlation_id.is_some() => FrameKind::Meta,
            _ => return None,
        };

        Some(Frame {
            kind,
            correlation_id,
        })
    }
}
