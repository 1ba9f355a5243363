use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Result};
use clap::Parser;
use realtime_client::{
    config::DEFAULT_SETTINGS_FILE, load_settings, ConnectOutcome, ConnectionEvent, RealtimeClient,
    StaticTokenProvider, ThreadEvent,
};
use shared::domain::ThreadId;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

/// Connects to the broker as one user and prints everything received on the
/// user channel and the given threads.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    #[arg(long)]
    user_id: String,
    /// Bearer token for `broadcasting/auth`; falls back to REALTIME_TOKEN.
    #[arg(long)]
    token: Option<String>,
    #[arg(long = "thread")]
    threads: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let settings = load_settings(&args.config);
    let token = args
        .token
        .or_else(|| std::env::var("REALTIME_TOKEN").ok());
    let client = RealtimeClient::new(settings, Arc::new(StaticTokenProvider(token)))?;

    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::UserNotification { event, data, .. }) => {
                    println!("[user] {event}: {data}");
                }
                Ok(event) => println!("[connection] {event:?}"),
                Err(RecvError::Lagged(skipped)) => println!("[connection] skipped {skipped} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for thread in args.threads {
        let thread_id = ThreadId::from(thread);
        let (outcome, mut stream) = client.subscribe_thread_stream(thread_id.clone()).await;
        info!(%thread_id, ?outcome, "thread subscription registered");
        tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                match event {
                    ThreadEvent::NewMessage(message) => println!(
                        "[thread {thread_id}] {}: {}",
                        message.sender_id,
                        message.text.as_deref().unwrap_or_default()
                    ),
                    ThreadEvent::MessageRead(read) => {
                        println!("[thread {thread_id}] {} read {}", read.user_id, read.message_id)
                    }
                    ThreadEvent::Typing(typing) => println!(
                        "[thread {thread_id}] {} typing={}",
                        typing.user_name, typing.is_typing
                    ),
                }
            }
        });
    }

    match client.connect(args.user_id.as_str()).await {
        ConnectOutcome::NoCredential => bail!("no auth token: pass --token or set REALTIME_TOKEN"),
        outcome => info!(?outcome, user_id = %args.user_id, "connecting"),
    }

    tokio::signal::ctrl_c().await?;
    client.disconnect().await;
    Ok(())
}
