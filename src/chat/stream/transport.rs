//! 流式传输管理器
//!
//! 负责一次回复流的连接生命周期：建立推送连接、按退避策略重连、
//! 重试用完后切换到拉取式降级通道、关闭。每个连接的帧都交给一个新的
//! [`DeltaAccumulator`]，关联 ID 跨连接保留。

use crate::chat::diagnostics::is_transient_code;
use crate::chat::error::{EngineError, TransportError};
use crate::chat::stream::accumulator::{DeltaAccumulator, Snapshot, SnapshotStatus};
use crate::chat::stream::frame::Frame;
use crate::chat::stream::retry::RetryPolicy;
use crate::chat::stream::state::{transition, StreamState, TransportEvent};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// 打开一次回复流所需的参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub conversation_local_id: String,
    /// 远端会话尚未建立（离线或未登录）时为 None
    pub remote_conversation_id: Option<String>,
    pub text: String,
}

/// 已建立的连接，按到达顺序交付帧负载
#[async_trait]
pub trait FrameSource: Send {
    /// `None` 表示对端正常关闭
    async fn next_payload(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// 推送式实时连接（WebSocket）
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, request: &StreamRequest)
        -> Result<Box<dyn FrameSource>, TransportError>;
}

/// 拉取式降级通道（单个长请求，响应体按空行分帧）
#[async_trait]
pub trait PullTransport: Send + Sync {
    async fn request(&self, request: &StreamRequest)
        -> Result<Box<dyn FrameSource>, TransportError>;
}

/// 一次回复流的最终结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed {
        text: String,
        correlation_id: Option<String>,
    },
    Failed {
        error: EngineError,
        partial: Snapshot,
    },
    /// 被调用方关闭
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    State { state: StreamState, attempt: u32 },
    Snapshot(Snapshot),
    Correlation(String),
    Finished(StreamOutcome),
}

/// 可克隆的关闭句柄，多次关闭无副作用
#[derive(Clone)]
pub struct StreamCloser {
    shutdown: Arc<watch::Sender<bool>>,
}

impl StreamCloser {
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// 一次打开的回复流
pub struct StreamHandle {
    id: u64,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    closer: StreamCloser,
}

impl StreamHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 下一个事件；`Finished` 之后返回 None
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn closer(&self) -> StreamCloser {
        self.closer.clone()
    }

    pub fn close(&self) {
        self.closer.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }
}

struct ActiveStream {
    id: u64,
    closer: StreamCloser,
    task: JoinHandle<()>,
}

/// 传输管理器：同一时刻最多一个底层连接
pub struct TransportManager {
    push: Arc<dyn PushTransport>,
    pull: Arc<dyn PullTransport>,
    policy: RetryPolicy,
    current: Mutex<Option<ActiveStream>>,
    next_id: AtomicU64,
}

impl TransportManager {
    pub fn new(
        push: Arc<dyn PushTransport>,
        pull: Arc<dyn PullTransport>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            push,
            pull,
            policy,
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 打开新的回复流；先关闭并等待上一个流结束
    pub async fn open(&self, request: StreamRequest) -> StreamHandle {
        let mut current = self.current.lock().await;
        if let Some(prev) = current.take() {
            debug!("[Stream] 打开新流前关闭旧流: id={}", prev.id);
            Self::shutdown(prev).await;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let closer = StreamCloser {
            shutdown: Arc::new(shutdown_tx),
        };

        info!(
            "[Stream] 🚀 打开回复流: id={}, conversation={}, remote={:?}",
            id, request.conversation_local_id, request.remote_conversation_id
        );

        let driver = Driver {
            id,
            push: self.push.clone(),
            pull: self.pull.clone(),
            policy: self.policy.clone(),
            request,
            events: events_tx,
            shutdown: shutdown_rx,
            rng: StdRng::from_entropy(),
            state: StreamState::Idle,
            attempt: 0,
            on_fallback: false,
            correlation_id: None,
            last_snapshot: None,
        };
        let task = tokio::spawn(driver.run());

        *current = Some(ActiveStream {
            id,
            closer: closer.clone(),
            task,
        });

        StreamHandle {
            id,
            events: events_rx,
            closer,
        }
    }

    /// 关闭指定的流；对已关闭的句柄调用也是安全的
    pub async fn close(&self, handle: &StreamHandle) {
        handle.close();
        let mut current = self.current.lock().await;
        if current.as_ref().map(|active| active.id) == Some(handle.id) {
            if let Some(active) = current.take() {
                Self::shutdown(active).await;
            }
        }
    }

    async fn shutdown(active: ActiveStream) {
        active.closer.close();
        if let Err(e) = active.task.await {
            warn!("[Stream] 回复流任务异常退出: id={}, err={}", active.id, e);
        }
    }
}

enum Pump {
    Completed(Snapshot),
    ErrorFrame {
        code: String,
        detail: String,
        partial: Snapshot,
    },
    Lost(TransportError, Snapshot),
    Closed,
}

struct Driver {
    id: u64,
    push: Arc<dyn PushTransport>,
    pull: Arc<dyn PullTransport>,
    policy: RetryPolicy,
    request: StreamRequest,
    events: mpsc::UnboundedSender<StreamEvent>,
    shutdown: watch::Receiver<bool>,
    rng: StdRng,
    state: StreamState,
    /// 推送通道已失败的次数
    attempt: u32,
    on_fallback: bool,
    correlation_id: Option<String>,
    last_snapshot: Option<Snapshot>,
}

impl Driver {
    async fn run(mut self) {
        self.step(TransportEvent::Open);
        let outcome = self.drive().await;
        if outcome == StreamOutcome::Closed {
            info!("[Stream] 回复流已关闭: id={}", self.id);
            self.step(TransportEvent::Closed);
        }
        self.emit(StreamEvent::Finished(outcome));
    }

    async fn drive(&mut self) -> StreamOutcome {
        loop {
            let opened = tokio::select! {
                biased;
                _ = wait_closed(&mut self.shutdown) => return StreamOutcome::Closed,
                opened = open_source(&*self.push, &*self.pull, self.on_fallback, &self.request) => opened,
            };

            let pumped = match opened {
                Ok(mut source) => {
                    self.step(TransportEvent::Connected);
                    let pumped = self.pump(source.as_mut()).await;
                    close_source(source.as_mut()).await;
                    pumped
                }
                Err(err) => Pump::Lost(err, self.empty_snapshot()),
            };

            let (err, partial) = match pumped {
                Pump::Closed => return StreamOutcome::Closed,
                Pump::Completed(snapshot) => {
                    self.step(TransportEvent::TerminalFrame);
                    info!(
                        "[Stream] ✅ 收到结束帧: id={}, len={}, correlation={:?}",
                        self.id,
                        snapshot.buffer.len(),
                        snapshot.correlation_id
                    );
                    return StreamOutcome::Completed {
                        text: snapshot.buffer,
                        correlation_id: snapshot.correlation_id,
                    };
                }
                Pump::ErrorFrame {
                    code,
                    detail,
                    partial,
                } => {
                    if is_transient_code(&code) {
                        let mut err = TransportError::transient(detail);
                        err.code = code;
                        (err, partial)
                    } else {
                        (TransportError::rejected(code, detail), partial)
                    }
                }
                Pump::Lost(err, partial) => (err, partial),
            };

            if let Some(outcome) = self.on_failure(err, partial).await {
                return outcome;
            }
        }
    }

    /// 处理一次失败：可重试则退避后返回 None，否则返回最终结果
    async fn on_failure(&mut self, err: TransportError, partial: Snapshot) -> Option<StreamOutcome> {
        let retryable = err.is_retryable();
        self.step(TransportEvent::TransportFailed { retryable });

        if self.state != StreamState::Retrying {
            let error = if !retryable {
                warn!(
                    "[Stream] ❌ 请求被拒绝，不重试: id={}, code={}, msg={}",
                    self.id, err.code, err.message
                );
                EngineError::from(err)
            } else {
                warn!(
                    "[Stream] ❌ 降级通道失败，放弃本次交换: id={}, err={}",
                    self.id, err
                );
                EngineError::TransportFatal(err.message)
            };
            return Some(StreamOutcome::Failed { error, partial });
        }

        self.attempt += 1;
        let attempts_left = self.policy.has_attempts_left(self.attempt);
        if attempts_left {
            let delay = self.policy.delay_for(self.attempt - 1, &mut self.rng);
            warn!(
                "[Stream] ⚠️ 连接失败，{:?} 后重试: id={}, attempt={}/{}, err={}",
                delay, self.id, self.attempt, self.policy.max_attempts, err
            );
            tokio::select! {
                biased;
                _ = wait_closed(&mut self.shutdown) => return Some(StreamOutcome::Closed),
                _ = tokio::time::sleep(delay) => {}
            }
        } else {
            warn!(
                "[Stream] ⚠️ 重试次数用完，切换到降级通道: id={}, err={}",
                self.id, err
            );
        }

        self.step(TransportEvent::RetryElapsed { attempts_left });
        if self.state == StreamState::FallbackActive {
            self.on_fallback = true;
        }
        None
    }

    async fn pump(&mut self, source: &mut dyn FrameSource) -> Pump {
        let mut acc = DeltaAccumulator::with_correlation(self.correlation_id.clone());
        loop {
            let next = tokio::select! {
                biased;
                _ = wait_closed(&mut self.shutdown) => return Pump::Closed,
                next = source.next_payload() => next,
            };

            let payload = match next {
                Some(Ok(payload)) => payload,
                Some(Err(err)) => return Pump::Lost(err, acc.snapshot()),
                None => {
                    return Pump::Lost(
                        TransportError::transient("连接在收到结束帧前关闭"),
                        acc.snapshot(),
                    )
                }
            };

            let Some(frame) = Frame::parse(&payload) else {
                debug!("[Stream] 丢弃无法解析的帧: id={}, payload={}", self.id, payload);
                continue;
            };
            let snapshot = acc.apply(frame);
            self.observe(&snapshot);

            match &snapshot.status {
                SnapshotStatus::Open => {}
                SnapshotStatus::Done => return Pump::Completed(snapshot),
                SnapshotStatus::Failed { code, detail } => {
                    return Pump::ErrorFrame {
                        code: code.clone(),
                        detail: detail.clone().unwrap_or_default(),
                        partial: snapshot,
                    }
                }
            }
        }
    }

    fn observe(&mut self, snapshot: &Snapshot) {
        if let Some(id) = &snapshot.correlation_id {
            if self.correlation_id.as_deref() != Some(id.as_str()) {
                debug!("[Stream] 关联 ID: id={}, correlation={}", self.id, id);
                self.correlation_id = Some(id.clone());
                self.emit(StreamEvent::Correlation(id.clone()));
            }
        }
        if self.last_snapshot.as_ref() != Some(snapshot) {
            self.last_snapshot = Some(snapshot.clone());
            self.emit(StreamEvent::Snapshot(snapshot.clone()));
        }
    }

    fn empty_snapshot(&self) -> Snapshot {
        DeltaAccumulator::with_correlation(self.correlation_id.clone()).snapshot()
    }

    fn step(&mut self, event: TransportEvent) {
        let next = transition(self.state, event, self.on_fallback);
        if next != self.state {
            debug!(
                "[Stream] 状态 {} -> {}: id={}, attempt={}",
                self.state, next, self.id, self.attempt
            );
            self.state = next;
            self.emit(StreamEvent::State {
                state: next,
                attempt: self.attempt,
            });
        }
    }

    fn emit(&self, event: StreamEvent) {
        // 接收端已丢弃时事件无人关心
        let _ = self.events.send(event);
    }
}

async fn open_source(
    push: &dyn PushTransport,
    pull: &dyn PullTransport,
    on_fallback: bool,
    request: &StreamRequest,
) -> Result<Box<dyn FrameSource>, TransportError> {
    if on_fallback {
        pull.request(request).await
    } else {
        push.connect(request).await
    }
}

async fn close_source(source: &mut dyn FrameSource) {
    match tokio::time::timeout(CLOSE_TIMEOUT, source.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("[Stream] 关闭连接出错（忽略）: {}", e),
        Err(_) => debug!("[Stream] 关闭连接超时（忽略）"),
    }
}

/// 关闭信号；所有关闭句柄都被丢弃时同样视为关闭
async fn wait_closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}
