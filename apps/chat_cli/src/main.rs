use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chat_core::{
    load_settings_from, ChatBackend, ConversationHost, HttpChatBackend, MissingRealtimeChannel,
    TimelineEntry, TimelineEvent, UploadFile,
};
use clap::{Parser, Subcommand};
use shared::domain::{ConversationId, MessageId, UserId};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; defaults to ./chat_client.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the newest page and follow new messages until interrupted.
    Tail { conversation: String },
    Send {
        conversation: String,
        #[arg(long)]
        text: Option<String>,
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        #[arg(long)]
        reply_to: Option<String>,
    },
    Search {
        conversation: String,
        query: String,
    },
    /// Load older pages and print the whole timeline.
    Older {
        conversation: String,
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
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

    let path = args
        .config
        .clone()
        .unwrap_or_else(chat_core::config::default_settings_path);
    let mut settings = load_settings_from(Some(&path))?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(user_id) = args.user_id {
        settings.user_id = user_id;
    }
    settings.validate()?;

    let backend: Arc<dyn ChatBackend> = Arc::new(HttpChatBackend::new(
        &settings.server_url,
        UserId::new(settings.user_id.clone()),
    )?);
    let host = ConversationHost::new(backend, Arc::new(MissingRealtimeChannel), settings);

    let result = run(&host, args.command).await;
    host.shutdown().await;
    result
}

async fn run(host: &Arc<ConversationHost>, command: Command) -> Result<()> {
    match command {
        Command::Tail { conversation } => tail(host, ConversationId::new(conversation)).await,
        Command::Send {
            conversation,
            text,
            files,
            reply_to,
        } => {
            send(
                host,
                ConversationId::new(conversation),
                text,
                files,
                reply_to.map(MessageId::new),
            )
            .await
        }
        Command::Search {
            conversation,
            query,
        } => {
            let conversation_id = ConversationId::new(conversation);
            host.mount(&conversation_id).await?;
            let snapshot = host.get_timeline(&conversation_id).await?;
            for hit in host.search(&conversation_id, &query).await? {
                if let Some(entry) = snapshot.entries.iter().find(|e| e.id() == &hit.message_id) {
                    print_entry(entry);
                }
            }
            Ok(())
        }
        Command::Older {
            conversation,
            pages,
        } => {
            let conversation_id = ConversationId::new(conversation);
            host.mount(&conversation_id).await?;
            for _ in 0..pages {
                let outcome = host.load_older(&conversation_id).await?;
                info!(added = outcome.added, has_more = outcome.has_more, "older page");
                if !outcome.has_more {
                    break;
                }
            }
            for entry in host.get_timeline(&conversation_id).await?.entries {
                print_entry(&entry);
            }
            Ok(())
        }
    }
}

async fn tail(host: &Arc<ConversationHost>, conversation_id: ConversationId) -> Result<()> {
    let mut events = host.mount(&conversation_id).await?;
    for entry in host.get_timeline(&conversation_id).await?.entries {
        print_entry(&entry);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(TimelineEvent::Inserted { ids }) => {
                    let snapshot = host.get_timeline(&conversation_id).await?;
                    for entry in snapshot.entries.iter().filter(|entry| ids.contains(entry.id())) {
                        print_entry(entry);
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

async fn send(
    host: &Arc<ConversationHost>,
    conversation_id: ConversationId,
    text: Option<String>,
    files: Vec<PathBuf>,
    reply_to: Option<MessageId>,
) -> Result<()> {
    host.mount(&conversation_id).await?;
    if let Some(text) = text {
        host.set_text(&conversation_id, text).await?;
    }
    let mut uploads = Vec::with_capacity(files.len());
    for path in files {
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read '{}'", path.display()))?;
        uploads.push(upload_file(&path, bytes));
    }
    for rejection in host.add_files(&conversation_id, uploads).await? {
        eprintln!("skipped {rejection}");
    }
    if let Some(parent) = reply_to {
        host.reply_to(&conversation_id, &parent).await?;
    }

    let report = host.send(&conversation_id).await?;
    if let Some(result) = &report.attachments {
        match result {
            Ok(ids) => println!("attachments sent as {} message(s)", ids.len()),
            Err(reason) => eprintln!("attachments failed: {reason}"),
        }
    }
    if let Some(result) = &report.text {
        match result {
            Ok(id) => println!("text sent as {id}"),
            Err(reason) => eprintln!("text failed: {reason}"),
        }
    }
    if !report.is_success() {
        anyhow::bail!("message not fully sent");
    }
    Ok(())
}

fn upload_file(path: &Path, bytes: Vec<u8>) -> UploadFile {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    UploadFile {
        mime_type: mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string(),
        name,
        bytes,
    }
}

fn print_entry(entry: &TimelineEntry) {
    let message = &entry.message;
    let body = message
        .body
        .text_content()
        .map(str::to_string)
        .unwrap_or_else(|| format!("[{} attachment(s)]", message.body.attachments().len()));
    println!(
        "{} {} {}: {}",
        message.sent_at.format("%Y-%m-%d %H:%M:%S"),
        message.id,
        message.sender_id,
        body
    );
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
