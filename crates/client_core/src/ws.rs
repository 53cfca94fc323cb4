//! Websocket transport for the realtime channel.
//!
//! One socket per project. Row events and typing broadcasts arrive as JSON
//! text frames and are fanned out to every subscriber; connection trouble is
//! reported in-band as [`SubscriptionStatus`] events so the session can fall
//! back to polling.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::{json, Value};
use shared::{
    domain::ProjectId,
    normalize::realtime_event_from_value,
    protocol::{RealtimeEvent, SubscriptionStatus, TypingBroadcast},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, Mutex},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::RealtimeChannel;

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct ProjectSocket {
    writer: Arc<Mutex<WsWriter>>,
    events: broadcast::Sender<RealtimeEvent>,
    open: Arc<AtomicBool>,
}

pub struct WsRealtimeChannel {
    server_url: String,
    token: Option<String>,
    event_capacity: usize,
    sockets: Mutex<HashMap<ProjectId, ProjectSocket>>,
}

impl WsRealtimeChannel {
    /// `event_capacity` bounds each project's event channel; a subscriber
    /// further behind than that sees a lag.
    pub fn new(server_url: impl Into<String>, event_capacity: usize) -> Self {
        Self {
            server_url: server_url.into(),
            token: None,
            event_capacity: event_capacity.max(1),
            sockets: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn realtime_url(&self, project_id: &ProjectId) -> Result<Url> {
        let server_url = self.server_url.trim_end_matches('/');
        let ws_url = if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else if server_url.starts_with("ws://") || server_url.starts_with("wss://") {
            server_url.to_string()
        } else {
            return Err(anyhow!("server_url must start with http(s):// or ws(s)://"));
        };
        let mut url = Url::parse(&format!("{ws_url}/realtime"))
            .with_context(|| format!("invalid realtime url: {ws_url}"))?;
        url.query_pairs_mut()
            .append_pair("project_id", project_id.as_str());
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }

    async fn connect(
        &self,
        project_id: &ProjectId,
    ) -> Result<(ProjectSocket, broadcast::Receiver<RealtimeEvent>)> {
        let url = self.realtime_url(project_id)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket for project {project_id}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let join = json!({"op": "subscribe", "projectId": project_id});
        ws_writer
            .send(Message::Text(join.to_string()))
            .await
            .context("failed to send realtime subscribe frame")?;

        let (events, receiver) = broadcast::channel(self.event_capacity);
        let _ = events.send(RealtimeEvent::Status(SubscriptionStatus::Subscribed));
        let sender = events.clone();
        let project = project_id.clone();
        let open = Arc::new(AtomicBool::new(true));
        let reader_open = Arc::clone(&open);
        tokio::spawn(async move {
            let mut final_status = SubscriptionStatus::Closed;
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let event = serde_json::from_str::<Value>(&text)
                            .ok()
                            .as_ref()
                            .and_then(realtime_event_from_value);
                        match event {
                            Some(event) => {
                                let _ = sender.send(event);
                            }
                            None => debug!(project_id = %project, "realtime: ignored frame"),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(project_id = %project, "realtime: receive failed: {err}");
                        final_status = SubscriptionStatus::Error;
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            info!(project_id = %project, status = ?final_status, "realtime: socket ended");
            let _ = sender.send(RealtimeEvent::Status(final_status));
        });

        let socket = ProjectSocket {
            writer: Arc::new(Mutex::new(ws_writer)),
            events,
            open,
        };
        Ok((socket, receiver))
    }
}

#[async_trait]
impl RealtimeChannel for WsRealtimeChannel {
    async fn subscribe(&self, project_id: &ProjectId) -> Result<broadcast::Receiver<RealtimeEvent>> {
        let mut sockets = self.sockets.lock().await;
        if let Some(socket) = sockets.get(project_id) {
            if socket.open.load(Ordering::SeqCst) {
                return Ok(socket.events.subscribe());
            }
        }
        let (socket, receiver) = self.connect(project_id).await?;
        info!(project_id = %project_id, "realtime: subscribed");
        sockets.insert(project_id.clone(), socket);
        Ok(receiver)
    }

    async fn broadcast_typing(&self, project_id: &ProjectId, typing: &TypingBroadcast) -> Result<()> {
        let writer = {
            let sockets = self.sockets.lock().await;
            let socket = sockets
                .get(project_id)
                .ok_or_else(|| anyhow!("no realtime socket for project {project_id}"))?;
            Arc::clone(&socket.writer)
        };
        let mut writer = writer.lock().await;
        writer
            .send(Message::Text(typing.to_frame().to_string()))
            .await
            .context("failed to send typing frame")
    }
}

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod tests;
