//! 登录态能力标记
//!
//! 引擎本身不做认证，只消费外部会话模块提供的“是否已登录”信号。

use std::sync::atomic::{AtomicBool, Ordering};

/// 登录态能力（由外部会话/认证模块实现）
pub trait AuthCapability: Send + Sync {
    fn is_authenticated(&self) -> bool;
}

/// 基于原子布尔值的登录态
#[derive(Debug, Default)]
pub struct SessionAuth {
    authenticated: AtomicBool,
}

impl SessionAuth {
    pub fn new(authenticated: bool) -> Self {
        Self {
            authenticated: AtomicBool::new(authenticated),
        }
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }
}

impl AuthCapability for SessionAuth {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }
}
