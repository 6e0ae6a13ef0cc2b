//! 发送/看门狗控制器
//!
//! 一个 [`ChatSession`] 绑定一个会话，同一时刻最多一个进行中的交换：
//! 用户消息先落库，再确保远端会话，再打开回复流；收到结束帧后提交助手消息。
//! 看门狗在发送时布防，超时后强制关闭连接、释放进行中标记并提示用户。

use crate::chat::conversation::store::ConversationStore;
use crate::chat::diagnostics::Notice;
use crate::chat::error::{EngineError, SyncError};
use crate::chat::message::models::{LocalMessage, Role};
use crate::chat::stream::accumulator::Snapshot;
use crate::chat::stream::format::normalize_reply;
use crate::chat::stream::state::{transition, StreamState, TransportEvent};
use crate::chat::stream::transport::{
    StreamCloser, StreamEvent, StreamOutcome, StreamRequest, TransportManager,
};
use crate::chat::sync::service::SyncAdapter;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// `send` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    /// 已有进行中的交换，本次调用被忽略
    Busy,
    /// 空白输入被忽略
    Empty,
}

/// 会话事件回调（渲染层实现）
#[async_trait]
pub trait ChatListener: Send + Sync {
    /// 流状态变化
    async fn on_state_changed(&self, state: StreamState);

    /// 回复预览（未提交）
    async fn on_preview(&self, snapshot: Snapshot);

    /// 消息已落库（用户消息和助手消息）
    async fn on_message_committed(&self, message: LocalMessage);

    /// 非阻塞提示横幅
    async fn on_notice(&self, notice: Notice);
}

/// 空实现（默认监听器）
pub struct EmptyChatListener;

#[async_trait]
impl ChatListener for EmptyChatListener {
    async fn on_state_changed(&self, _state: StreamState) {}
    async fn on_preview(&self, _snapshot: Snapshot) {}
    async fn on_message_committed(&self, _message: LocalMessage) {}
    async fn on_notice(&self, _notice: Notice) {}
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub watchdog_timeout: Duration,
    pub log_viewer_url: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout: Duration::from_secs(15),
            log_viewer_url: None,
        }
    }
}

/// 当前交换的临时状态（不落库）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSession {
    pub correlation_id: Option<String>,
    pub buffer: String,
    pub state: StreamState,
    pub attempt: u32,
    pub deadline_at: Option<Instant>,
    pub in_flight: bool,
    generation: u64,
}

impl StreamSession {
    fn new() -> Self {
        Self {
            correlation_id: None,
            buffer: String::new(),
            state: StreamState::Idle,
            attempt: 0,
            deadline_at: None,
            in_flight: false,
            generation: 0,
        }
    }
}

enum ExchangeEnd {
    Finished(StreamOutcome),
    Timeout,
    Cancelled,
}

struct SessionInner {
    conversation_local_id: String,
    store: Arc<ConversationStore>,
    sync: Arc<SyncAdapter>,
    transports: TransportManager,
    listener: Arc<dyn ChatListener>,
    config: SessionConfig,
    session: Mutex<StreamSession>,
    /// 当前交换的取消信号（带交换代号）
    cancel: Mutex<Option<(u64, oneshot::Sender<()>)>>,
    in_flight: watch::Sender<bool>,
}

/// 单个会话的聊天控制器
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    pub fn new(
        conversation_local_id: String,
        store: Arc<ConversationStore>,
        sync: Arc<SyncAdapter>,
        transports: TransportManager,
        listener: Arc<dyn ChatListener>,
        config: SessionConfig,
    ) -> Self {
        let (in_flight, _) = watch::channel(false);
        Self {
            inner: Arc::new(SessionInner {
                conversation_local_id,
                store,
                sync,
                transports,
                listener,
                config,
                session: Mutex::new(StreamSession::new()),
                cancel: Mutex::new(None),
                in_flight,
            }),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.inner.conversation_local_id
    }

    /// 发送一条用户消息
    ///
    /// 用户消息落库后才返回 `Accepted`；回复在后台流式接收。
    /// 落库失败时返回错误且不发起任何网络请求。
    pub async fn send(&self, text: &str) -> Result<SendOutcome> {
        if text.trim().is_empty() {
            return Ok(SendOutcome::Empty);
        }

        let inner = &self.inner;
        let (generation, deadline) = {
            let mut s = inner.lock_session();
            if s.in_flight {
                debug!(
                    "[Session] 已有进行中的交换，忽略发送: conversation={}",
                    inner.conversation_local_id
                );
                return Ok(SendOutcome::Busy);
            }
            let deadline = Instant::now() + inner.config.watchdog_timeout;
            s.generation += 1;
            s.in_flight = true;
            s.correlation_id = None;
            s.buffer.clear();
            s.attempt = 0;
            s.deadline_at = Some(deadline);
            (s.generation, deadline)
        };
        inner.in_flight.send_replace(true);

        let message = match inner
            .store
            .append_message(&inner.conversation_local_id, Role::User, text)
            .await
        {
            Ok(message) => message,
            Err(e) => {
                error!(
                    "[Session] ❌ 用户消息落库失败: conversation={}, err={}",
                    inner.conversation_local_id, e
                );
                inner.release(generation);
                return Err(e);
            }
        };
        info!(
            "[Session] 📤 用户消息已落库: conversation={}, seq={}",
            inner.conversation_local_id, message.seq
        );
        inner.listener.on_message_committed(message).await;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        *inner.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some((generation, cancel_tx));

        let task_inner = inner.clone();
        let text = text.to_string();
        tokio::spawn(async move {
            task_inner
                .run_exchange(generation, text, deadline, cancel_rx)
                .await
        });

        Ok(SendOutcome::Accepted)
    }

    /// 取消进行中的交换：关闭连接、解除看门狗、立即释放进行中标记
    ///
    /// 已落库的用户消息保留，部分回复不提交。没有进行中的交换时返回 false。
    pub fn cancel(&self) -> bool {
        let inner = &self.inner;
        let sender = inner
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let was_in_flight = {
            let mut s = inner.lock_session();
            let was = s.in_flight;
            if was {
                s.in_flight = false;
                s.state = transition(s.state, TransportEvent::Closed, false);
                s.deadline_at = None;
                s.buffer.clear();
            }
            was
        };
        inner.in_flight.send_replace(false);

        if let Some((_, sender)) = sender {
            let _ = sender.send(());
        }
        if was_in_flight {
            info!(
                "[Session] 用户取消交换: conversation={}",
                inner.conversation_local_id
            );
        }
        was_in_flight
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock_session().state
    }

    /// 当前交换状态的副本（预览缓冲区、关联 ID、重试次数等）
    pub fn snapshot(&self) -> StreamSession {
        self.inner.lock_session().clone()
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.lock_session().in_flight
    }

    /// 等待当前交换结束
    pub async fn wait_settled(&self) {
        let mut rx = self.inner.in_flight.subscribe();
        let _ = rx.wait_for(|in_flight| !*in_flight).await;
    }
}

impl SessionInner {
    fn lock_session(&self) -> std::sync::MutexGuard<'_, StreamSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 只有仍在进行中的同一代交换才能修改会话状态
    fn update<F: FnOnce(&mut StreamSession)>(&self, generation: u64, f: F) -> bool {
        let mut s = self.lock_session();
        if s.generation == generation && s.in_flight {
            f(&mut s);
            true
        } else {
            false
        }
    }

    fn release(&self, generation: u64) {
        let released = {
            let mut s = self.lock_session();
            if s.generation == generation && s.in_flight {
                s.in_flight = false;
                s.deadline_at = None;
                true
            } else {
                false
            }
        };
        if released {
            self.in_flight.send_replace(false);
        }
    }

    async fn run_exchange(
        self: Arc<Self>,
        generation: u64,
        text: String,
        deadline: Instant,
        cancel_rx: oneshot::Receiver<()>,
    ) {
        let closer_slot: Mutex<Option<StreamCloser>> = Mutex::new(None);

        let end = {
            let exchange = self.exchange(generation, &text, &closer_slot);
            tokio::pin!(exchange);
            tokio::select! {
                outcome = &mut exchange => ExchangeEnd::Finished(outcome),
                _ = tokio::time::sleep_until(deadline) => ExchangeEnd::Timeout,
                _ = cancel_rx => ExchangeEnd::Cancelled,
            }
        };

        if !matches!(end, ExchangeEnd::Finished(_)) {
            let closer = closer_slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(closer) = closer {
                closer.close();
            }
        }

        match end {
            ExchangeEnd::Finished(StreamOutcome::Completed {
                text,
                correlation_id,
            }) => self.commit(generation, &text, correlation_id).await,
            ExchangeEnd::Finished(StreamOutcome::Failed { error, partial }) => {
                self.fail(generation, error, partial.correlation_id).await
            }
            ExchangeEnd::Finished(StreamOutcome::Closed) => {
                self.settle_state(generation, StreamState::Idle).await;
            }
            ExchangeEnd::Timeout => {
                let timeout = self.config.watchdog_timeout;
                warn!(
                    "[Session] ⏰ 看门狗超时，强制关闭连接: conversation={}, timeout={:?}",
                    self.conversation_local_id, timeout
                );
                let correlation_id = self.lock_session().correlation_id.clone();
                if self.settle_state(generation, StreamState::Idle).await {
                    self.notify(&EngineError::Timeout(timeout), correlation_id.as_deref())
                        .await;
                }
            }
            ExchangeEnd::Cancelled => {
                debug!(
                    "[Session] 交换已取消: conversation={}",
                    self.conversation_local_id
                );
            }
        }

        {
            let mut cancel = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            if cancel.as_ref().map(|(g, _)| *g) == Some(generation) {
                cancel.take();
            }
        }
        self.release(generation);
        self.sync.spawn_drain();
    }

    async fn exchange(
        &self,
        generation: u64,
        text: &str,
        closer_slot: &Mutex<Option<StreamCloser>>,
    ) -> StreamOutcome {
        let remote_conversation_id = match self
            .sync
            .ensure_remote_conversation(&self.conversation_local_id)
            .await
        {
            Ok(remote_id) => Some(remote_id),
            Err(SyncError::Unavailable) => None,
            Err(e) => {
                warn!(
                    "[Session] 远端会话不可用，继续以本地会话发送: conversation={}, err={}",
                    self.conversation_local_id, e
                );
                None
            }
        };

        let mut handle = self
            .transports
            .open(StreamRequest {
                conversation_local_id: self.conversation_local_id.clone(),
                remote_conversation_id,
                text: text.to_string(),
            })
            .await;
        *closer_slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle.closer());

        while let Some(event) = handle.next_event().await {
            match event {
                StreamEvent::State { state, attempt } => {
                    if self.update(generation, |s| {
                        s.state = state;
                        s.attempt = attempt;
                    }) {
                        self.listener.on_state_changed(state).await;
                    }
                }
                StreamEvent::Snapshot(snapshot) => {
                    if self.update(generation, |s| s.buffer = snapshot.buffer.clone()) {
                        self.listener.on_preview(snapshot).await;
                    }
                }
                StreamEvent::Correlation(id) => {
                    self.update(generation, |s| s.correlation_id = Some(id));
                }
                StreamEvent::Finished(outcome) => return outcome,
            }
        }
        StreamOutcome::Closed
    }

    async fn commit(&self, generation: u64, text: &str, correlation_id: Option<String>) {
        if !self.update(generation, |_| {}) {
            debug!("[Session] 交换已失效，丢弃回复: generation={}", generation);
            return;
        }

        let reply = normalize_reply(text);
        if reply.is_empty() {
            warn!(
                "[Session] 回复为空，不提交: conversation={}, correlation={:?}",
                self.conversation_local_id, correlation_id
            );
        } else {
            match self
                .store
                .append_message(&self.conversation_local_id, Role::Assistant, &reply)
                .await
            {
                Ok(message) => {
                    info!(
                        "[Session] ✅ 助手消息已提交: conversation={}, seq={}, correlation={:?}",
                        self.conversation_local_id, message.seq, correlation_id
                    );
                    self.listener.on_message_committed(message).await;
                }
                Err(e) => error!(
                    "[Session] ❌ 助手消息落库失败: conversation={}, err={}",
                    self.conversation_local_id, e
                ),
            }
        }

        let next = transition(StreamState::Finalizing, TransportEvent::Finished, false);
        self.settle_state(generation, next).await;
    }

    async fn fail(&self, generation: u64, error: EngineError, correlation_id: Option<String>) {
        warn!(
            "[Session] ❌ 交换失败: conversation={}, err={}, correlation={:?}",
            self.conversation_local_id, error, correlation_id
        );
        let correlation_id =
            correlation_id.or_else(|| self.lock_session().correlation_id.clone());
        if self.settle_state(generation, StreamState::Error).await {
            self.notify(&error, correlation_id.as_deref()).await;
        }
    }

    /// 设置交换结束时的状态并清空预览；交换已失效时返回 false
    async fn settle_state(&self, generation: u64, state: StreamState) -> bool {
        let mut previous = None;
        let owned = self.update(generation, |s| {
            previous = Some(s.state);
            s.state = state;
            s.buffer.clear();
            s.deadline_at = None;
        });
        if owned && previous != Some(state) {
            self.listener.on_state_changed(state).await;
        }
        owned
    }

    async fn notify(&self, error: &EngineError, correlation_id: Option<&str>) {
        if let Some(notice) =
            Notice::from_error(error, correlation_id, self.config.log_viewer_url.as_deref())
        {
            self.listener.on_notice(notice).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::auth::SessionAuth;
    use crate::chat::conversation::store::tests::memory_store;
    use crate::chat::diagnostics::NoticeKind;
    use crate::chat::error::TransportError;
    use crate::chat::stream::retry::RetryPolicy;
    use crate::chat::stream::testing::{Script, ScriptedTransport};
    use crate::chat::sync::testing::MockRemoteApi;
    use futures_util::FutureExt;
    use std::sync::Once;

    static INIT_LOGGER: Once = Once::new();

    fn init_test_logger() {
        INIT_LOGGER.call_once(|| {
            use tracing_subscriber::prelude::*;
            use tracing_subscriber::EnvFilter;

            let filter_layer = EnvFilter::new("info,assistant_chat_core=debug,sqlx=warn");

            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(false)
                .with_test_writer();

            tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer)
                .init();
        });
    }

    #[derive(Default)]
    struct RecordingListener {
        states: Mutex<Vec<StreamState>>,
        previews: Mutex<Vec<String>>,
        committed: Mutex<Vec<LocalMessage>>,
        notices: Mutex<Vec<Notice>>,
    }

    #[async_trait]
    impl ChatListener for RecordingListener {
        async fn on_state_changed(&self, state: StreamState) {
            self.states.lock().unwrap().push(state);
        }
        async fn on_preview(&self, snapshot: Snapshot) {
            self.previews.lock().unwrap().push(snapshot.buffer);
        }
        async fn on_message_committed(&self, message: LocalMessage) {
            self.committed.lock().unwrap().push(message);
        }
        async fn on_notice(&self, notice: Notice) {
            self.notices.lock().unwrap().push(notice);
        }
    }

    struct Fixture {
        store: Arc<ConversationStore>,
        api: Arc<MockRemoteApi>,
        sync: Arc<SyncAdapter>,
        push: Arc<ScriptedTransport>,
        pull: Arc<ScriptedTransport>,
        listener: Arc<RecordingListener>,
        session: ChatSession,
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
            max_attempts: 3,
            jitter: Duration::from_millis(5),
        }
    }

    async fn fixture_with(
        store: Arc<ConversationStore>,
        local_id: String,
        api: Arc<MockRemoteApi>,
        push: ScriptedTransport,
        pull: ScriptedTransport,
        authenticated: bool,
        watchdog: Duration,
    ) -> Fixture {
        let sync = Arc::new(SyncAdapter::new(
            store.clone(),
            api.clone(),
            Arc::new(SessionAuth::new(authenticated)),
        ));
        let push = Arc::new(push);
        let pull = Arc::new(pull);
        let listener = Arc::new(RecordingListener::default());
        let session = ChatSession::new(
            local_id,
            store.clone(),
            sync.clone(),
            TransportManager::new(push.clone(), pull.clone(), fast_policy()),
            listener.clone(),
            SessionConfig {
                watchdog_timeout: watchdog,
                log_viewer_url: Some("https://logs.example.com/search".to_string()),
            },
        );
        Fixture {
            store,
            api,
            sync,
            push,
            pull,
            listener,
            session,
        }
    }

    async fn fixture(push: ScriptedTransport, watchdog: Duration) -> Fixture {
        init_test_logger();
        let store = Arc::new(memory_store().await);
        let local_id = store.create_conversation(Some("Test")).await.unwrap();
        fixture_with(
            store,
            local_id,
            Arc::new(MockRemoteApi::new()),
            push,
            ScriptedTransport::offline(),
            false,
            watchdog,
        )
        .await
    }

    async fn texts(f: &Fixture) -> Vec<(Role, String)> {
        f.store
            .messages(f.session.conversation_id())
            .await
            .unwrap()
            .into_iter()
            .map(|m| (m.role, m.text))
            .collect()
    }

    #[tokio::test]
    async fn user_message_is_durable_before_network() {
        init_test_logger();
        let store = Arc::new(memory_store().await);
        let local_id = store.create_conversation(None).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let hook_store = store.clone();
        let hook_seen = seen.clone();
        let hook_id = local_id.clone();
        let push = ScriptedTransport::new(vec![Script::frames(&[r#"{"type":"done","text":"ok"}"#])])
            .with_on_connect(Arc::new(move || {
                let store = hook_store.clone();
                let seen = hook_seen.clone();
                let id = hook_id.clone();
                async move {
                    let count = store.message_count(&id).await.unwrap();
                    seen.lock().unwrap().push(count);
                }
                .boxed()
            }));

        let f = fixture_with(
            store,
            local_id,
            Arc::new(MockRemoteApi::new()),
            push,
            ScriptedTransport::offline(),
            false,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(f.session.send("Hallo").await.unwrap(), SendOutcome::Accepted);
        f.session.wait_settled().await;

        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn deltas_commit_concatenated_reply() {
        let push = ScriptedTransport::new(vec![Script::frames(&[
            r#"{"type":"delta","text":"Hi","correlationId":"req-7"}"#,
            r#"{"type":"delta","text":" there"}"#,
            r#"{"type":"done"}"#,
        ])]);
        let f = fixture(push, Duration::from_secs(2)).await;

        assert_eq!(f.session.send("Hallo").await.unwrap(), SendOutcome::Accepted);
        f.session.wait_settled().await;

        assert_eq!(
            texts(&f).await,
            vec![
                (Role::User, "Hallo".to_string()),
                (Role::Assistant, "Hi there".to_string())
            ]
        );
        assert_eq!(f.session.state(), StreamState::Idle);
        assert!(f.listener.previews.lock().unwrap().contains(&"Hi".to_string()));
        assert_eq!(f.listener.committed.lock().unwrap().len(), 2);
        assert!(f.listener.notices.lock().unwrap().is_empty());
        assert_eq!(
            f.session.snapshot().correlation_id.as_deref(),
            Some("req-7")
        );
    }

    #[tokio::test]
    async fn second_send_while_in_flight_is_ignored() {
        let push = ScriptedTransport::new(vec![Script::hanging(&[r#"{"type":"delta","text":"…"}"#])]);
        let f = fixture(push, Duration::from_secs(2)).await;

        assert_eq!(f.session.send("first").await.unwrap(), SendOutcome::Accepted);
        assert_eq!(f.session.send("second").await.unwrap(), SendOutcome::Busy);
        assert_eq!(f.session.send("   ").await.unwrap(), SendOutcome::Empty);

        assert_eq!(texts(&f).await, vec![(Role::User, "first".to_string())]);
        f.session.cancel();
    }

    #[tokio::test]
    async fn watchdog_returns_session_to_idle() {
        let push = ScriptedTransport::new(vec![Script::hanging(&[r#"{"type":"delta","text":"stuck"}"#])])
            .with_default(Script::frames(&[r#"{"type":"done","text":"recovered"}"#]));
        let f = fixture(push, Duration::from_millis(300)).await;

        assert_eq!(f.session.send("Hallo").await.unwrap(), SendOutcome::Accepted);
        f.session.wait_settled().await;

        assert_eq!(f.session.state(), StreamState::Idle);
        assert!(!f.session.is_in_flight());
        {
            let notices = f.listener.notices.lock().unwrap();
            assert_eq!(notices.len(), 1);
            assert_eq!(notices[0].kind, NoticeKind::Stalled);
        }
        // 部分回复不提交
        assert_eq!(texts(&f).await.len(), 1);

        assert_eq!(f.session.send("again").await.unwrap(), SendOutcome::Accepted);
        f.session.wait_settled().await;
        assert_eq!(texts(&f).await.last().unwrap().1, "recovered");
        assert_eq!(f.push.max_open_connections(), 1);
    }

    #[tokio::test]
    async fn offline_send_keeps_user_message_and_reports_error() {
        let f = fixture(ScriptedTransport::offline(), Duration::from_secs(2)).await;

        assert_eq!(f.session.send("Hallo").await.unwrap(), SendOutcome::Accepted);
        f.session.wait_settled().await;

        assert_eq!(f.session.state(), StreamState::Error);
        assert_eq!(texts(&f).await, vec![(Role::User, "Hallo".to_string())]);
        assert_eq!(f.push.calls(), 4);
        assert_eq!(f.pull.calls(), 1);
        {
            let notices = f.listener.notices.lock().unwrap();
            assert_eq!(notices.len(), 1);
            assert_eq!(notices[0].kind, NoticeKind::ConnectionFailed);
        }

        // Error 状态可以重新发送
        assert_eq!(f.session.send("nochmal").await.unwrap(), SendOutcome::Accepted);
        f.session.wait_settled().await;
        assert_eq!(texts(&f).await.len(), 2);
    }

    #[tokio::test]
    async fn rejection_surfaces_immediately() {
        let push = ScriptedTransport::new(vec![Script::Fail(TransportError::from_status(
            429,
            "slow down",
        ))]);
        let f = fixture(push, Duration::from_secs(2)).await;

        f.session.send("Hallo").await.unwrap();
        f.session.wait_settled().await;

        assert_eq!(f.session.state(), StreamState::Error);
        assert_eq!(f.push.calls(), 1);
        assert_eq!(f.pull.calls(), 0);
        let notices = f.listener.notices.lock().unwrap();
        assert_eq!(notices[0].kind, NoticeKind::Rejected);
    }

    #[tokio::test]
    async fn cancel_keeps_user_message_and_drops_partial_reply() {
        let push = ScriptedTransport::new(vec![Script::hanging(&[r#"{"type":"delta","text":"par"}"#])])
            .with_default(Script::frames(&[r#"{"type":"done","text":"fine"}"#]));
        let f = fixture(push, Duration::from_secs(5)).await;

        f.session.send("Hallo").await.unwrap();
        while f.listener.previews.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(f.session.cancel());
        assert!(!f.session.cancel());
        assert_eq!(f.session.state(), StreamState::Idle);
        assert!(f.session.snapshot().deadline_at.is_none());

        assert_eq!(f.session.send("weiter").await.unwrap(), SendOutcome::Accepted);
        f.session.wait_settled().await;

        assert_eq!(
            texts(&f).await,
            vec![
                (Role::User, "Hallo".to_string()),
                (Role::User, "weiter".to_string()),
                (Role::Assistant, "fine".to_string()),
            ]
        );
        assert!(f.listener.notices.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_during_remote_creation_reuses_created_conversation() {
        init_test_logger();
        let store = Arc::new(memory_store().await);
        let local_id = store.create_conversation(Some("Sync")).await.unwrap();
        let api = Arc::new(MockRemoteApi::new().with_create_delay(Duration::from_millis(200)));
        let push = ScriptedTransport::new(vec![Script::frames(&[r#"{"type":"done","text":"ok"}"#])]);
        let f = fixture_with(
            store,
            local_id,
            api,
            push,
            ScriptedTransport::offline(),
            true,
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(f.session.send("eins").await.unwrap(), SendOutcome::Accepted);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.session.cancel());
        assert_eq!(f.session.send("zwei").await.unwrap(), SendOutcome::Accepted);
        f.session.wait_settled().await;

        assert_eq!(f.api.create_calls(), 1);
        let conv = f
            .store
            .get_conversation(f.session.conversation_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conv.remote_id.as_deref(), Some("r-0"));
        assert_eq!(f.push.calls(), 1);
        assert_eq!(
            f.push.requests()[0].remote_conversation_id.as_deref(),
            Some("r-0")
        );
    }

    #[tokio::test]
    async fn user_text_is_stored_as_typed() {
        let push = ScriptedTransport::new(vec![Script::frames(&[r#"{"type":"done","text":"ok"}"#])]);
        let f = fixture(push, Duration::from_secs(2)).await;

        let typed = "    fn main() {}\n";
        assert_eq!(f.session.send(typed).await.unwrap(), SendOutcome::Accepted);
        f.session.wait_settled().await;

        assert_eq!(texts(&f).await[0], (Role::User, typed.to_string()));
        assert_eq!(f.push.requests()[0].text, typed);
    }

    #[tokio::test]
    async fn reply_is_normalized_before_commit() {
        let push = ScriptedTransport::new(vec![Script::frames(&[
            r###"{"type":"full","text":"## **Antwort**\n\n\n---\nZeile\nZeile"}"###,
            r#"{"type":"done"}"#,
        ])]);
        let f = fixture(push, Duration::from_secs(2)).await;

        f.session.send("Hallo").await.unwrap();
        f.session.wait_settled().await;

        assert_eq!(texts(&f).await.last().unwrap().1, "Antwort\n\nZeile");
    }

    #[tokio::test]
    async fn committed_exchange_is_pushed_in_order() {
        let store = Arc::new(memory_store().await);
        let local_id = store.create_conversation(Some("Sync")).await.unwrap();
        let push = ScriptedTransport::new(vec![Script::frames(&[
            r#"{"type":"done","text":"Hi there"}"#,
        ])]);
        let f = fixture_with(
            store,
            local_id,
            Arc::new(MockRemoteApi::new()),
            push,
            ScriptedTransport::offline(),
            true,
            Duration::from_secs(2),
        )
        .await;

        f.session.send("Hallo").await.unwrap();
        f.session.wait_settled().await;
        f.sync.drain_outbox().await;

        let conv = f
            .store
            .get_conversation(f.session.conversation_id())
            .await
            .unwrap()
            .unwrap();
        let remote_id = conv.remote_id.expect("remote id mapped");
        let pushed: Vec<String> = f
            .api
            .appended(&remote_id)
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(pushed, vec!["Hallo".to_string(), "Hi there".to_string()]);
        assert_eq!(
            f.push.requests()[0].remote_conversation_id.as_deref(),
            Some(remote_id.as_str())
        );
        assert!(f.store.unsynced_messages(&conv.local_id).await.unwrap().is_empty());
    }
}
