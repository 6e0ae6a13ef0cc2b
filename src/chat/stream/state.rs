//! 流式传输状态机
//!
//! 传输回调（连接成功、收到结束帧、连接出错……）都建模为状态迁移，
//! 而不是散落的事件处理函数，这样重试/降级逻辑可以穷举测试。

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StreamState {
    Idle,
    Connecting,
    Streaming,
    Finalizing,
    Retrying,
    FallbackActive,
    Error,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Idle => "Idle",
            StreamState::Connecting => "Connecting",
            StreamState::Streaming => "Streaming",
            StreamState::Finalizing => "Finalizing",
            StreamState::Retrying => "Retrying",
            StreamState::FallbackActive => "FallbackActive",
            StreamState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// 驱动状态迁移的传输事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// 开始一次交换
    Open,
    /// 底层连接已建立
    Connected,
    /// 收到结束帧
    TerminalFrame,
    /// 连接出错；`retryable` 为 false 表示鉴权/配额拒绝
    TransportFailed { retryable: bool },
    /// 退避等待结束；`attempts_left` 为 false 表示重试次数已用完
    RetryElapsed { attempts_left: bool },
    /// 结束帧已处理完毕
    Finished,
    /// 调用方关闭
    Closed,
}

/// 计算下一个状态；不合法的事件保持原状态
///
/// `on_fallback` 表示当前连接是降级通道，降级通道上的任何失败都是致命的。
pub fn transition(state: StreamState, event: TransportEvent, on_fallback: bool) -> StreamState {
    use StreamState::*;
    use TransportEvent::*;

    match (state, event) {
        (_, Closed) => Idle,
        (Idle | Error, Open) => Connecting,
        (Connecting | FallbackActive, Connected) => Streaming,
        (Streaming, TerminalFrame) => Finalizing,
        (Finalizing, Finished) => Idle,
        (Connecting | Streaming | FallbackActive, TransportFailed { retryable: false }) => Error,
        (FallbackActive, TransportFailed { retryable: true }) => Error,
        (Connecting | Streaming, TransportFailed { retryable: true }) => {
            if on_fallback {
                Error
            } else {
                Retrying
            }
        }
        (Retrying, RetryElapsed { attempts_left: true }) => Connecting,
        (Retrying, RetryElapsed { attempts_left: false }) => FallbackActive,
        (state, _) => state,
    }
}
