use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{CurrentUser, MessageId, ProjectId, TaskId},
    protocol::{CommentPatch, Message, NewComment, RealtimeEvent, SubscriptionStatus, TypingBroadcast},
};
use tokio::sync::broadcast;

pub mod config;
pub mod error;
pub mod http;
pub mod matching;
pub mod optimistic;
pub mod polling;
pub mod realtime;
pub mod send;
pub mod session;
pub mod store;
pub mod typing;
pub mod ws;

pub use config::{load_settings, SyncSettings};
pub use error::SyncError;
pub use http::HttpCommentApi;
pub use send::{AttachmentUpload, SendRequest};
pub use session::{Collaborators, ConversationSession, SendReport};
pub use ws::WsRealtimeChannel;

/// Backend comment endpoints.
#[async_trait]
pub trait CommentApi: Send + Sync {
    async fn list_comments(&self, task_id: &TaskId) -> Result<Vec<Message>>;
    /// `None` when the backend acknowledged without returning the entity.
    async fn create_comment(&self, task_id: &TaskId, comment: &NewComment)
        -> Result<Option<Message>>;
    async fn update_comment(
        &self,
        task_id: &TaskId,
        id: &MessageId,
        patch: &CommentPatch,
    ) -> Result<Option<Message>>;
    async fn delete_comment(&self, task_id: &TaskId, id: &MessageId) -> Result<()>;
    /// Returns the public URL of the stored file.
    async fn upload_attachment(&self, task_id: &TaskId, attachment: &AttachmentUpload)
        -> Result<String>;
}

/// Push channel for comment rows and typing broadcasts of one project.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn subscribe(&self, project_id: &ProjectId) -> Result<broadcast::Receiver<RealtimeEvent>>;
    async fn broadcast_typing(&self, project_id: &ProjectId, typing: &TypingBroadcast)
        -> Result<()>;
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_user(&self) -> Result<CurrentUser>;
}

/// Realtime stand-in for deployments without a push endpoint; the session
/// then runs on polling alone.
pub struct MissingRealtimeChannel;

#[async_trait]
impl RealtimeChannel for MissingRealtimeChannel {
    async fn subscribe(&self, project_id: &ProjectId) -> Result<broadcast::Receiver<RealtimeEvent>> {
        Err(anyhow!("realtime unavailable for project {project_id}"))
    }

    async fn broadcast_typing(
        &self,
        project_id: &ProjectId,
        _typing: &TypingBroadcast,
    ) -> Result<()> {
        Err(anyhow!("realtime unavailable for project {project_id}"))
    }
}

pub struct StaticIdentity(pub CurrentUser);

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Result<CurrentUser> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The snapshot of the active task changed.
    ConversationUpdated { task_id: TaskId },
    /// Transient notification for a message from someone else.
    RemoteMessage(Message),
    /// New message in a known task that is not on screen.
    RemoteActivity { task_id: TaskId },
    SendFailed {
        temp_id: MessageId,
        body: String,
        reason: String,
    },
    UploadFailed { filename: String, reason: String },
    TypingChanged {
        task_id: TaskId,
        typists: Vec<String>,
    },
    RealtimeStatusChanged(SubscriptionStatus),
    Error(String),
}
