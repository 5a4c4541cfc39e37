//! Join many channels through one pooled client and print what arrives.
//!
//! Usage:
//!   cargo run --example join_many -- --channel forsen --channel pajlada \
//!     --max-channels 50
//!
//! Features demonstrated:
//!   - Batched joins spread over as many connections as the ceiling needs
//!   - Per-channel join outcomes
//!   - Automatic rejoin when a connection drops
//!   - Whispers surfaced once, however many connections are open

use anyhow::Result;
use clap::Parser;
use freeq_pool::{ChatClient, ClientConfig, ClientEvent};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "join-many", about = "Pooled chat client example")]
struct Args {
    #[arg(long, default_value = freeq_pool::config::DEFAULT_SERVER)]
    server: String,
    /// Login name; a random anonymous one when omitted.
    #[arg(long)]
    username: Option<String>,
    /// OAuth token for `--username`.
    #[arg(long, env = "CHAT_OAUTH_TOKEN")]
    password: Option<String>,
    /// Channel to join; repeatable.
    #[arg(long = "channel", required = true)]
    channels: Vec<String>,
    #[arg(long, default_value_t = 90)]
    max_channels: usize,
    /// Skip TLS certificate verification.
    #[arg(long)]
    tls_insecure: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("freeq_pool=info")),
        )
        .init();
    let args = Args::parse();

    let mut config = ClientConfig::anonymous();
    if let Some(username) = args.username {
        config.username = username;
    }
    config.password = args.password;
    config.server_addr = args.server;
    config.tls_insecure = args.tls_insecure;
    config.max_channel_count_per_connection = args.max_channels;

    let client = ChatClient::new(config)?;
    let mut events = client.subscribe();

    let results = client.join_all(&args.channels).await?;
    for (channel, outcome) in &results {
        match outcome {
            None => println!("joined #{channel}"),
            Some(e) => println!("could not join #{channel}: {e}"),
        }
    }
    println!(
        "{} channel(s) on {} connection(s)",
        client.joined_channels().len(),
        client.connections().len()
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::Message(msg)) => match msg.command.as_str() {
                    "PRIVMSG" => println!(
                        "[#{}] {}: {}",
                        msg.channel().unwrap_or("?"),
                        msg.nick().unwrap_or("?"),
                        msg.trailing().unwrap_or("")
                    ),
                    "WHISPER" => println!(
                        "[whisper] {}: {}",
                        msg.nick().unwrap_or("?"),
                        msg.trailing().unwrap_or("")
                    ),
                    _ => {}
                },
                Some(ClientEvent::Reconnect { connection_id }) => {
                    println!("connection {connection_id} dropped, channels moved");
                }
                Some(ClientEvent::Error(e)) => eprintln!("error: {e}"),
                Some(ClientEvent::Close(cause)) => {
                    println!("client closed{}", cause.map(|e| format!(": {e}")).unwrap_or_default());
                    break;
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                client.close();
            }
        }
    }
    Ok(())
}
