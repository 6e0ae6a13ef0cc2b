//! 测试用的内存远端会话 API

use crate::chat::conversation::models::RemoteConversation;
use crate::chat::message::models::RemoteMessage;
use crate::chat::sync::api::RemoteConversationApi;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct MockRemoteApi {
    failing: AtomicBool,
    create_delay: Duration,
    append_delay: Duration,
    next_id: AtomicUsize,
    creates: AtomicUsize,
    calls: Mutex<Vec<String>>,
    conversations: Mutex<Vec<RemoteConversation>>,
    messages: Mutex<HashMap<String, Vec<RemoteMessage>>>,
    deleted: Mutex<Vec<String>>,
}

impl MockRemoteApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn with_append_delay(mut self, delay: Duration) -> Self {
        self.append_delay = delay;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn seed_remote(&self, conv: RemoteConversation, messages: Vec<RemoteMessage>) {
        self.messages
            .lock()
            .unwrap()
            .insert(conv.remote_id.clone(), messages);
        self.conversations.lock().unwrap().push(conv);
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn appended(&self, remote_id: &str) -> Vec<RemoteMessage> {
        self.messages
            .lock()
            .unwrap()
            .get(remote_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    fn record(&self, call: &str) -> Result<()> {
        self.calls.lock().unwrap().push(call.to_string());
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("模拟网络错误: {}", call));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteConversationApi for MockRemoteApi {
    async fn create_conversation(&self, title: &str) -> Result<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        self.record("create")?;
        let id = format!("r-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.conversations.lock().unwrap().push(RemoteConversation {
            remote_id: id.clone(),
            title: title.to_string(),
            created_at: 0,
            updated_at: 0,
        });
        Ok(id)
    }

    async fn list_conversations(&self) -> Result<Vec<RemoteConversation>> {
        self.record("list")?;
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn append_message(&self, remote_id: &str, message: &RemoteMessage) -> Result<()> {
        if !self.append_delay.is_zero() {
            tokio::time::sleep(self.append_delay).await;
        }
        self.record("append")?;
        self.messages
            .lock()
            .unwrap()
            .entry(remote_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn delete_conversation(&self, remote_id: &str) -> Result<()> {
        self.record("delete")?;
        self.deleted.lock().unwrap().push(remote_id.to_string());
        self.conversations
            .lock()
            .unwrap()
            .retain(|c| c.remote_id != remote_id);
        Ok(())
    }

    async fn fetch_messages(&self, remote_id: &str) -> Result<Vec<RemoteMessage>> {
        self.record("fetch")?;
        Ok(self.appended(remote_id))
    }
}
