//! 引擎错误分类
//!
//! 存储层和 HTTP 工具沿用 `anyhow`，这里只定义会跨越模块边界、需要按类别处理的错误。

use std::time::Duration;
use thiserror::Error;

/// 一次对话交换的最终错误（用户可见与否由 [`crate::chat::diagnostics`] 决定）
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// 瞬时传输错误，会被重试，重试和降级都失败后才升级为 `TransportFatal`
    #[error("临时传输错误: {0}")]
    TransportTransient(String),

    /// 降级通道也失败，本次交换放弃
    #[error("传输失败: {0}")]
    TransportFatal(String),

    /// 鉴权/配额拒绝，不重试
    #[error("请求被拒绝 ({code}): {detail}")]
    ProtocolRejected { code: String, detail: String },

    /// 无法解析的帧，静默丢弃
    #[error("无法解析的帧: {0}")]
    ProtocolMalformed(String),

    /// 远端同步失败，只记日志
    #[error("同步失败: {0}")]
    SyncFailure(String),

    /// 看门狗超时
    #[error("{0:?} 内未收到结束帧")]
    Timeout(Duration),
}

/// 传输层错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// 网络中断、连接失败、服务端 5xx，可重试
    Transient,
    /// 401/403/429 等，不重试
    Rejected,
}

/// 传输层错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub code: String,
    pub message: String,
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Transient,
            code: "network".to_string(),
            message: message.into(),
        }
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Rejected,
            code: code.into(),
            message: message.into(),
        }
    }

    /// 按 HTTP 状态码分类
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 => Self::rejected("unauthorized", message),
            403 => Self::rejected("forbidden", message),
            429 => Self::rejected("quota_exceeded", message),
            _ => Self {
                kind: TransportErrorKind::Transient,
                code: format!("http_{}", status),
                message: message.into(),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == TransportErrorKind::Transient
    }
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        match err.kind {
            TransportErrorKind::Transient => EngineError::TransportTransient(err.message),
            TransportErrorKind::Rejected => EngineError::ProtocolRejected {
                code: err.code,
                detail: err.message,
            },
        }
    }
}

/// 远端会话 API 错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 未登录，适配器降级为纯本地模式
    #[error("远端同步不可用（未登录）")]
    Unavailable,

    #[error("远端请求失败: {0}")]
    Remote(#[from] anyhow::Error),
}

impl From<SyncError> for EngineError {
    fn from(err: SyncError) -> Self {
        EngineError::SyncFailure(err.to_string())
    }
}
