use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, AttachmentUpload, ClientEvent, Collaborators, ConversationSession,
    HttpCommentApi, MissingRealtimeChannel, RealtimeChannel, SendRequest, StaticIdentity,
    WsRealtimeChannel,
};
use shared::{
    domain::{CurrentUser, MessageId, ProjectId, TaskId, UserId},
    protocol::Message,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    api_url: String,
    /// Realtime endpoint; without it the conversation runs on polling alone.
    #[arg(long)]
    ws_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    project: String,
    #[arg(long)]
    task: String,
    #[arg(long)]
    user_id: String,
    #[arg(long, default_value = "me")]
    name: String,
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the conversation and follow it until interrupted.
    Tail,
    /// Post a comment, optionally with attachments.
    Send {
        #[arg(default_value = "")]
        text: String,
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
        #[arg(long)]
        reply_to: Option<String>,
    },
    Pin {
        id: String,
        #[arg(long)]
        off: bool,
    },
    Delete {
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();
    let settings = load_settings(args.config.as_deref())?;
    let send_fallback = settings.send_fallback;
    let event_capacity = settings.event_capacity;

    let mut api = HttpCommentApi::new(args.api_url.clone());
    let realtime: Arc<dyn RealtimeChannel> = match &args.ws_url {
        Some(ws_url) => {
            let mut channel = WsRealtimeChannel::new(ws_url.clone(), event_capacity);
            if let Some(token) = &args.token {
                channel = channel.with_token(token.clone());
            }
            Arc::new(channel)
        }
        None => Arc::new(MissingRealtimeChannel),
    };
    if let Some(token) = &args.token {
        api = api.with_token(token.clone());
    }
    let identity = StaticIdentity(CurrentUser {
        id: UserId::new(args.user_id.clone()),
        display_name: args.name.clone(),
    });

    let task_id = TaskId::new(args.task.clone());
    let session = ConversationSession::open(
        Collaborators {
            api: Arc::new(api),
            realtime,
            identity: Arc::new(identity),
        },
        ProjectId::new(args.project.clone()),
        vec![task_id.clone()],
        settings,
    )
    .await?;
    let mut events = session.subscribe_events();
    session.select_task(task_id.clone()).await?;

    match args.command {
        Command::Tail => {
            for message in session.snapshot().await {
                print_message(&message);
            }
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event) => print_event(&event),
                        Err(err) => {
                            tracing::warn!("event stream: {err}");
                            if matches!(err, tokio::sync::broadcast::error::RecvError::Closed) {
                                break;
                            }
                        }
                    },
                }
            }
        }
        Command::Send {
            text,
            attachments,
            reply_to,
        } => {
            let mut request = SendRequest::text(text);
            request.parent_id = reply_to.map(MessageId::new);
            for path in attachments {
                request.attachments.push(read_attachment(&path).await?);
            }
            let report = session.send(request).await?;
            for failure in &report.upload_failures {
                println!(
                    "upload failed: {} ({})",
                    failure.attachment.filename, failure.reason
                );
            }
            if !report.acknowledged.is_empty() {
                tokio::time::sleep(send_fallback).await;
            }
            println!(
                "sent: {} confirmed, {} acknowledged, {} failed",
                report.confirmed.len(),
                report.acknowledged.len(),
                report.failed.len()
            );
            for message in session.snapshot().await {
                print_message(&message);
            }
        }
        Command::Pin { id, off } => {
            session.set_pinned(&MessageId::new(id), !off).await?;
            for message in session.pinned().await {
                print_message(&message);
            }
        }
        Command::Delete { id } => {
            session.delete(&MessageId::new(id)).await?;
            println!("deleted");
        }
    }

    session.dispose().await;
    Ok(())
}

async fn read_attachment(path: &Path) -> Result<AttachmentUpload> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read attachment '{}'", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("attachment")
        .to_string();
    Ok(AttachmentUpload {
        filename,
        mime_type: None,
        bytes,
    })
}

fn print_message(message: &Message) {
    let author = message
        .author_name
        .clone()
        .or_else(|| message.author.as_ref().map(|a| a.id().to_string()))
        .unwrap_or_else(|| "?".to_string());
    let pin = if message.pinned { " [pinned]" } else { "" };
    let attachment = message
        .attachment_url
        .as_deref()
        .map(|url| format!(" <{url}>"))
        .unwrap_or_default();
    println!(
        "{} {} {}: {}{}{}",
        message.created_at.format("%H:%M:%S"),
        message.id,
        author,
        message.body,
        attachment,
        pin
    );
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::RemoteMessage(message) => print_message(message),
        ClientEvent::RemoteActivity { task_id } => println!("* new activity in {task_id}"),
        ClientEvent::SendFailed {
            temp_id, reason, ..
        } => println!("* send {temp_id} failed: {reason}"),
        ClientEvent::UploadFailed { filename, reason } => {
            println!("* upload of {filename} failed: {reason}")
        }
        ClientEvent::TypingChanged { typists, .. } if !typists.is_empty() => {
            println!("* {} typing", typists.join(", "))
        }
        ClientEvent::RealtimeStatusChanged(status) => println!("* realtime {status:?}"),
        ClientEvent::Error(err) => println!("* error: {err}"),
        _ => {}
    }
}
