//! Chat Hub Client - Entry Point
//!
//! Connects to the public channel or a room, prints the transcript and
//! notices, and posts every line read from stdin.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hub_chat_client::{
    ChannelKind, ChatClient, ChatScope, ChatUpdate, ClientConfig, NoticeLevel, RoomId,
    TransportKind, WebSocketConnector, WireEncoding,
};

/// Command typed at the prompt to leave the room and exit
const LEAVE_COMMAND: &str = "/leave";

#[derive(Parser, Debug)]
#[command(name = "hub_chat_client")]
#[command(about = "Terminal client for the real-time chat hub")]
#[command(version)]
struct Args {
    /// JSON configuration file (CHAT_* environment variables still apply)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Room to join; the public channel is used when omitted
    #[arg(long)]
    room: Option<String>,

    /// Display name
    #[arg(long)]
    username: String,

    /// websockets, server-sent-events or long-polling
    #[arg(long)]
    transport: Option<TransportKind>,

    /// text or binary
    #[arg(long)]
    encoding: Option<WireEncoding>,

    /// Bearer token for the hub
    #[arg(long)]
    token: Option<String>,
}

fn load_config(args: &Args) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::from_env()?,
    };

    if let Some(transport) = args.transport {
        config.transport = transport;
    }
    if let Some(encoding) = args.encoding {
        config.encoding = encoding;
    }
    if let Some(token) = &args.token {
        config.access_token = Some(token.clone());
    }
    Ok(config)
}

fn render(update: &ChatUpdate) {
    match update {
        ChatUpdate::Message(envelope) => println!("{}: {}", envelope.sender, envelope.payload),
        ChatUpdate::HistoryReplaced { room_id, len } => {
            println!("-- {} earlier messages in {} --", len, room_id)
        }
        ChatUpdate::Joined(room_id) => println!("-- joined {} --", room_id),
        ChatUpdate::Notice(notice) => match notice.level {
            NoticeLevel::Info => println!("[info] {}", notice.text),
            NoticeLevel::Warning => println!("[warn] {}", notice.text),
            NoticeLevel::Terminal => println!("[error] {}", notice.text),
        },
        ChatUpdate::State(_) => {}
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so they don't interleave with the transcript
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=hub_chat_client=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("hub_chat_client=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let (scope, channel) = match &args.room {
        Some(room) => (ChatScope::Room(RoomId::new(room.as_str())), ChannelKind::Room),
        None => (ChatScope::Public, ChannelKind::Public),
    };
    let descriptor = config.descriptor(channel)?;
    let session = config.session_manager(Arc::new(WebSocketConnector));
    let mut client = ChatClient::new(session, config.codec()?, args.username.as_str(), scope);

    info!("Connecting to {} as {}", descriptor.endpoint, args.username);
    if let Err(e) = client.connect(descriptor).await {
        error!("Failed to connect: {}", e);
        return Err(e.into());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            update = client.next_update() => match update {
                Some(update) => render(&update),
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.trim() == LEAVE_COMMAND => {
                    if let Err(e) = client.leave().await {
                        error!("Leave failed: {}", e);
                    }
                }
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if let Err(e) = client.send(&line).await {
                        println!("[warn] {}", e);
                    }
                }
                None => {
                    stdin_open = false;
                    client.disconnect().await;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                client.disconnect().await;
            }
        }
    }

    info!("Bye");
    Ok(())
}
