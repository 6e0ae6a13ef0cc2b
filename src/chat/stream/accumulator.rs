//! 增量累加器：按到达顺序把帧拼成回复缓冲区
//!
//! 纯状态机，无副作用。结束帧之后的任何帧都是无操作，
//! 因此重复投递的 `done` 帧不会改变结果。

use crate::chat::stream::frame::{Frame, FrameKind};
use serde::Serialize;

/// 缓冲区状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SnapshotStatus {
    Open,
    Done,
    Failed { code: String, detail: Option<String> },
}

/// 某一时刻的缓冲区快照（供界面渲染）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub buffer: String,
    pub status: SnapshotStatus,
    pub correlation_id: Option<String>,
}

impl Snapshot {
    pub fn is_terminal(&self) -> bool {
        self.status != SnapshotStatus::Open
    }
}

#[derive(Debug, Clone)]
pub struct DeltaAccumulator {
    buffer: String,
    status: SnapshotStatus,
    correlation_id: Option<String>,
}

impl Default for DeltaAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            status: SnapshotStatus::Open,
            correlation_id: None,
        }
    }

    /// 沿用上一次连接拿到的关联 ID
    pub fn with_correlation(correlation_id: Option<String>) -> Self {
        Self {
            correlation_id,
            ..Self::new()
        }
    }

    pub fn apply(&mut self, frame: Frame) -> Snapshot {
        if self.is_terminal() {
            return self.snapshot();
        }

        if self.correlation_id.is_none() {
            self.correlation_id = frame.correlation_id;
        }

        match frame.kind {
            FrameKind::Delta(text) => self.buffer.push_str(&text),
            FrameKind::Full(text) => self.buffer = text,
            FrameKind::Done(final_text) => {
                if let Some(text) = final_text {
                    self.buffer = text;
                }
                self.status = SnapshotStatus::Done;
            }
            // 缓冲区保留用于展示失败前的部分回复，但不会被提交
            FrameKind::Error { code, detail } => {
                self.status = SnapshotStatus::Failed { code, detail };
            }
            FrameKind::Meta => {}
        }
        self.snapshot()
    }

    /// 解析并应用原始负载，畸形帧被丢弃且不改变状态
    pub fn apply_payload(&mut self, payload: &str) -> Snapshot {
        match Frame::parse(payload) {
            Some(frame) => self.apply(frame),
            None => self.snapshot(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            buffer: self.buffer.clone(),
            status: self.status.clone(),
            correlation_id: self.correlation_id.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != SnapshotStatus::Open
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// 只有正常结束的回复才可提交
    pub fn committable_text(&self) -> Option<&str> {
        match self.status {
            SnapshotStatus::Done => Some(&self.buffer),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_then_done_commit_concatenation() {
        let mut acc = DeltaAccumulator::new();
        acc.apply(Frame::delta("Hi"));
        acc.apply(Frame::delta(" there"));
        let snap = acc.apply(Frame::done(None));
        assert_eq!(snap.buffer, "Hi there");
        assert_eq!(acc.committable_text(), Some("Hi there"));
    }

    #[test]
    fn repeated_done_is_idempotent() {
        let mut once = DeltaAccumulator::new();
        once.apply(Frame::delta("abc"));
        let a = once.apply(Frame::done(Some("final")));

        let mut twice = DeltaAccumulator::new();
        twice.apply(Frame::delta("abc"));
        twice.apply(Frame::done(Some("final")));
        let b = twice.apply(Frame::done(Some("final")));

        assert_eq!(a, b);
        // 结束后的不同结束帧同样被忽略
        assert_eq!(twice.apply(Frame::done(Some("other"))).buffer, "final");
        assert_eq!(twice.apply(Frame::delta("more")).buffer, "final");
    }

    #[test]
    fn full_snapshot_replaces_buffer() {
        let mut acc = DeltaAccumulator::new();
        acc.apply(Frame::delta("Hel"));
        acc.apply(Frame::full("Hello"));
        acc.apply(Frame::delta("!"));
        assert_eq!(acc.snapshot().buffer, "Hello!");
    }

    #[test]
    fn error_keeps_buffer_for_display_but_not_commit() {
        let mut acc = DeltaAccumulator::new();
        acc.apply(Frame::delta("partial"));
        let snap = acc.apply(Frame::error("quota_exceeded", Some("limit")));
        assert_eq!(snap.buffer, "partial");
        assert!(snap.is_terminal());
        assert_eq!(acc.committable_text(), None);
    }

    #[test]
    fn malformed_payload_does_not_change_state() {
        let mut acc = DeltaAccumulator::new();
        acc.apply_payload(r#"{"type":"delta","text":"ok"}"#);
        let before = acc.snapshot();
        let after = acc.apply_payload(r#"{"type":"delta","text":{"nested":true}}"#);
        assert_eq!(before, after);
    }

    #[test]
    fn first_correlation_id_sticks() {
        let mut acc = DeltaAccumulator::new();
        acc.apply(Frame::delta("a").with_correlation("c-1"));
        acc.apply(Frame::delta("b").with_correlation("c-2"));
        assert_eq!(acc.correlation_id(), Some("c-1"));
    }
}
