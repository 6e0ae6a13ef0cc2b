//! 测试用的脚本化传输

use crate::chat::error::TransportError;
use crate::chat::stream::transport::{FrameSource, PullTransport, PushTransport, StreamRequest};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// 单次连接的剧本
#[derive(Clone)]
pub enum Script {
    /// 建立连接失败
    Fail(TransportError),
    /// 连接成功后依次交付负载，`gap` 为每帧之间的间隔；`hang` 为 true 时交付完不再结束
    Frames {
        items: Vec<Result<String, TransportError>>,
        gap: Duration,
        hang: bool,
    },
}

impl Script {
    pub fn frames(payloads: &[&str]) -> Self {
        Script::Frames {
            items: payloads.iter().map(|p| Ok(p.to_string())).collect(),
            gap: Duration::ZERO,
            hang: false,
        }
    }

    pub fn hanging(payloads: &[&str]) -> Self {
        Script::Frames {
            items: payloads.iter().map(|p| Ok(p.to_string())).collect(),
            gap: Duration::ZERO,
            hang: true,
        }
    }

    pub fn offline() -> Self {
        Script::Fail(TransportError::transient("network unreachable"))
    }
}

type ConnectHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// 按剧本应答的传输，剧本用完后重复 `default`
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    default: Script,
    calls: Mutex<Vec<Instant>>,
    requests: Mutex<Vec<StreamRequest>>,
    open: Arc<AtomicUsize>,
    max_open: Arc<AtomicUsize>,
    on_connect: Option<ConnectHook>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            default: Script::offline(),
            calls: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            open: Arc::new(AtomicUsize::new(0)),
            max_open: Arc::new(AtomicUsize::new(0)),
            on_connect: None,
        }
    }

    pub fn offline() -> Self {
        Self::new(Vec::new())
    }

    pub fn with_default(mut self, script: Script) -> Self {
        self.default = script;
        self
    }

    /// 每次连接前执行的钩子（在连接计数之前运行）
    pub fn with_on_connect(mut self, hook: ConnectHook) -> Self {
        self.on_connect = Some(hook);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn max_open_connections(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    async fn start(&self, request: &StreamRequest) -> Result<Box<dyn FrameSource>, TransportError> {
        if let Some(hook) = &self.on_connect {
            hook().await;
        }
        self.calls.lock().unwrap().push(Instant::now());
        self.requests.lock().unwrap().push(request.clone());

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        match script {
            Script::Fail(err) => Err(err),
            Script::Frames { items, gap, hang } => {
                let now_open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_open.fetch_max(now_open, Ordering::SeqCst);
                Ok(Box::new(ScriptedSource {
                    items: items.into(),
                    gap,
                    hang,
                    open: self.open.clone(),
                    closed: false,
                }))
            }
        }
    }
}

#[async_trait]
impl PushTransport for ScriptedTransport {
    async fn connect(&self, request: &StreamRequest) -> Result<Box<dyn FrameSource>, TransportError> {
        self.start(request).await
    }
}

#[async_trait]
impl PullTransport for ScriptedTransport {
    async fn request(&self, request: &StreamRequest) -> Result<Box<dyn FrameSource>, TransportError> {
        self.start(request).await
    }
}

struct ScriptedSource {
    items: VecDeque<Result<String, TransportError>>,
    gap: Duration,
    hang: bool,
    open: Arc<AtomicUsize>,
    closed: bool,
}

impl ScriptedSource {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn next_payload(&mut self) -> Option<Result<String, TransportError>> {
        if !self.gap.is_zero() {
            tokio::time::sleep(self.gap).await;
        }
        match self.items.pop_front() {
            Some(item) => Some(item),
            None if self.hang => std::future::pending().await,
            None => None,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.release();
        Ok(())
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.release();
    }
}
