//! 流式回复：帧解析、增量累加、传输生命周期

pub mod accumulator;
pub mod decoder;
pub mod fallback;
pub mod format;
pub mod frame;
pub mod retry;
pub mod state;
pub mod transport;
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;

pub use accumulator::{DeltaAccumulator, Snapshot, SnapshotStatus};
pub use decoder::FrameDecoder;
pub use fallback::HttpFallbackTransport;
pub use format::normalize_reply;
pub use frame::{Frame, FrameKind};
pub use retry::RetryPolicy;
pub use state::{transition, StreamState, TransportEvent};
pub use transport::{
    FrameSource, PullTransport, PushTransport, StreamCloser, StreamEvent, StreamHandle,
    StreamOutcome, StreamRequest, TransportManager,
};
pub use websocket::WebSocketTransport;
