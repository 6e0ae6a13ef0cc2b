//! 助手聊天 CLI（测试版）
//!
//! 非交互式 CLI，用于测试流式对话引擎：
//! 通过 `--message` 发送一条消息，或从 stdin 逐行读取消息，逐条等待回复。

use anyhow::Result;
use assistant_chat_core::chat::diagnostics::Notice;
use assistant_chat_core::chat::stream::Snapshot;
use assistant_chat_core::{
    ChatClient, ChatListener, ClientConfig, LocalMessage, Role, SendOutcome, StreamState,
};
use clap::Parser;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// 助手聊天 CLI
#[derive(Parser, Debug)]
#[command(name = "assistant-chat-cli")]
#[command(about = "助手聊天 CLI - 用于测试流式对话引擎", long_about = None)]
struct Args {
    /// 用户 ID
    #[arg(short, long, default_value = "cli-user")]
    user_id: String,

    /// 认证 token，为空时以纯本地模式运行
    #[arg(short, long, env = "ASSISTANT_TOKEN", default_value = "")]
    token: String,

    /// HTTP API 基础地址
    #[arg(long, default_value = "http://localhost:10002")]
    api_base_url: String,

    /// 推送通道 WebSocket 地址
    #[arg(long, default_value = "ws://localhost:10001/stream")]
    stream_url: String,

    /// 降级通道地址
    #[arg(long, default_value = "http://localhost:10002/chat/stream")]
    fallback_url: String,

    /// 本地数据库
    #[arg(long, default_value = "sqlite://assistant_chat.db?mode=rwc")]
    db_url: String,

    /// 日志查看器地址
    #[arg(long)]
    log_viewer_url: Option<String>,

    /// 继续已有会话（本地 ID），不指定则新建会话
    #[arg(short, long)]
    conversation: Option<String>,

    /// 要发送的消息，不指定则从 stdin 逐行读取
    #[arg(short, long)]
    message: Option<String>,

    /// 看门狗超时（秒）
    #[arg(long, default_value = "15")]
    watchdog_secs: u64,

    /// 日志级别（默认: info,assistant_chat_core=debug）
    #[arg(long, default_value = "info,assistant_chat_core=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")?;

    // 日志走 stderr，stdout 只留给回复文本
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
    Ok(())
}

/// 把预览增量打印到 stdout
#[derive(Default)]
struct CliChatListener {
    printed: Mutex<String>,
}

impl CliChatListener {
    fn print_delta(&self, buffer: &str) {
        let mut printed = self.printed.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = std::io::stdout();
        if let Some(rest) = buffer.strip_prefix(printed.as_str()) {
            let _ = write!(out, "{}", rest);
        } else {
            // 整体替换（full 帧或重连）时重新打印
            let _ = write!(out, "\n{}", buffer);
        }
        let _ = out.flush();
        *printed = buffer.to_string();
    }
}

#[async_trait::async_trait]
impl ChatListener for CliChatListener {
    async fn on_state_changed(&self, state: StreamState) {
        info!("[CLI/Session] 🔄 状态: {}", state);
        if matches!(state, StreamState::Idle | StreamState::Error) {
            self.printed.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
    }

    async fn on_preview(&self, snapshot: Snapshot) {
        self.print_delta(&snapshot.buffer);
    }

    async fn on_message_committed(&self, message: LocalMessage) {
        if message.role == Role::Assistant {
            println!();
            info!(
                "[CLI/Session] ✅ 回复已保存: seq={}, {} 字",
                message.seq,
                message.text.chars().count()
            );
        }
    }

    async fn on_notice(&self, notice: Notice) {
        eprintln!("\n⚠️  {}", notice.diagnostic_text());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logger(&args.log_level)?;

    info!("[CLI] 🚀 助手聊天 CLI（测试模式）");

    let mut config = ClientConfig::new(args.user_id.clone(), args.token.clone());
    config.api_base_url = args.api_base_url.clone();
    config.stream_url = args.stream_url.clone();
    config.fallback_url = args.fallback_url.clone();
    config.db_url = args.db_url.clone();
    config.log_viewer_url = args.log_viewer_url.clone();
    config.watchdog_timeout = Duration::from_secs(args.watchdog_secs);

    let client = ChatClient::connect(config).await?;
    let listener = Arc::new(CliChatListener::default());

    let session = match &args.conversation {
        Some(local_id) => client.open_session(local_id, listener).await?,
        None => client.new_session(None, listener).await?,
    };
    info!("[CLI] 💬 会话: {}", session.conversation_id());

    let mut pending: Vec<String> = Vec::new();
    if let Some(message) = &args.message {
        pending.push(message.clone());
    } else {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            pending.push(line);
        }
    }

    for text in pending {
        match session.send(&text).await? {
            SendOutcome::Accepted => session.wait_settled().await,
            SendOutcome::Busy => warn!("[CLI] 上一条消息仍在处理中，跳过: {}", text),
            SendOutcome::Empty => {}
        }
    }

    // 等待后台同步把本轮消息推送出去
    let report = client.sync().drain_outbox().await;
    info!(
        "[CLI] 👋 程序退出 (已推送 {} 条, 未登录={})",
        report.pushed, report.unavailable
    );
    Ok(())
}
