//! 关联 ID 与错误提示
//!
//! 只负责把 [`EngineError`] 翻译成用户可见的提示和可复制的诊断信息，
//! 不做布局，不做上报。

use crate::chat::error::EngineError;
use serde::Serialize;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorClass {
    /// 网络/超时，重试和降级都失败前不提示
    Transient,
    /// 鉴权/配额，立即提示，不重试
    Rejected,
    /// 无法解析，静默丢弃
    Malformed,
}

pub fn classify(err: &EngineError) -> ErrorClass {
    match err {
        EngineError::TransportTransient(_)
        | EngineError::TransportFatal(_)
        | EngineError::Timeout(_)
        | EngineError::SyncFailure(_) => ErrorClass::Transient,
        EngineError::ProtocolRejected { .. } => ErrorClass::Rejected,
        EngineError::ProtocolMalformed(_) => ErrorClass::Malformed,
    }
}

/// 错误帧里的 code 是否属于可重试的服务端瞬时故障
pub fn is_transient_code(code: &str) -> bool {
    let code = code.trim().to_ascii_lowercase();
    matches!(
        code.as_str(),
        "timeout" | "unavailable" | "overloaded" | "internal" | "network"
    ) || (code.len() == 3 && code.starts_with('5') && code.chars().all(|c| c.is_ascii_digit()))
        || code.starts_with("http_5")
}

/// 非阻塞提示的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoticeKind {
    /// 重试与降级均失败
    ConnectionFailed,
    /// 看门狗超时
    Stalled,
    /// 鉴权或配额拒绝
    Rejected,
}

/// 提示横幅
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
    pub correlation_id: Option<String>,
    pub log_link: Option<String>,
}

impl Notice {
    /// 为需要提示的错误生成横幅；`Malformed` 和同步失败不提示
    pub fn from_error(
        err: &EngineError,
        correlation_id: Option<&str>,
        log_viewer_url: Option<&str>,
    ) -> Option<Notice> {
        let (kind, message) = match err {
            EngineError::TransportFatal(_) | EngineError::TransportTransient(_) => (
                NoticeKind::ConnectionFailed,
                "无法连接到助手服务，消息已保存在本地，请稍后重试".to_string(),
            ),
            EngineError::Timeout(_) => (
                NoticeKind::Stalled,
                "连接似乎卡住了，已停止等待回复，可以重新发送".to_string(),
            ),
            EngineError::ProtocolRejected { code, detail } => (
                NoticeKind::Rejected,
                rejected_message(code, detail),
            ),
            EngineError::ProtocolMalformed(_) | EngineError::SyncFailure(_) => return None,
        };

        let log_link = match (correlation_id, log_viewer_url) {
            (Some(id), Some(base)) => log_link(base, id),
            _ => None,
        };

        Some(Notice {
            kind,
            message,
            correlation_id: correlation_id.map(str::to_string),
            log_link,
        })
    }

    /// 复制到剪贴板用的诊断文本
    pub fn diagnostic_text(&self) -> String {
        let mut text = self.message.clone();
        if let Some(id) = &self.correlation_id {
            text.push_str(&format!("\ncorrelationId: {}", id));
        }
        if let Some(link) = &self.log_link {
            text.push_str(&format!("\nlogs: {}", link));
        }
        text
    }
}

fn rejected_message(code: &str, detail: &str) -> String {
    let base = match code {
        "unauthorized" | "forbidden" => "登录状态已失效或无权限，请重新登录",
        "quota_exceeded" => "请求过于频繁或额度已用完，请稍后再试",
        _ => "请求被服务端拒绝",
    };
    if detail.is_empty() {
        base.to_string()
    } else {
        format!("{}（{}）", base, detail)
    }
}

/// 按关联 ID 过滤的日志查看器链接
pub fn log_link(log_viewer_url: &str, correlation_id: &str) -> Option<String> {
    reqwest::Url::parse_with_params(log_viewer_url, &[("correlationId", correlation_id)])
        .ok()
        .map(|url| url.to_string())
}
