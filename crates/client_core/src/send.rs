//! Upload fan-out and the split of a user send into logical messages.

use std::path::Path;

use futures::future::join_all;
use shared::domain::{MessageId, MessageKind, TaskId};
use tracing::{info, warn};

use crate::CommentApi;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "svg", "heic"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl AttachmentUpload {
    pub fn kind(&self) -> MessageKind {
        infer_kind(self.mime_type.as_deref(), &self.filename)
    }
}

/// Image when the MIME type or the file extension says so, file otherwise.
pub fn infer_kind(mime_type: Option<&str>, filename: &str) -> MessageKind {
    if let Some(mime) = mime_type {
        if mime.trim().to_ascii_lowercase().starts_with("image/") {
            return MessageKind::Image;
        }
    }
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension {
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => MessageKind::Image,
        _ => MessageKind::File,
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub text: String,
    pub attachments: Vec<AttachmentUpload>,
    pub parent_id: Option<MessageId>,
}

impl SendRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.attachments.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedAttachment {
    pub filename: String,
    pub kind: MessageKind,
    pub url: String,
}

/// An attachment whose upload failed, handed back for a retry.
#[derive(Debug, Clone)]
pub struct UploadFailure {
    pub attachment: AttachmentUpload,
    pub reason: String,
}

/// One message the pipeline will create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendUnit {
    pub body: String,
    pub kind: MessageKind,
    pub attachment_url: Option<String>,
}

/// Caption plus first attachment form one message, every further attachment
/// its own message, bare text one message.
pub fn plan_units(text: &str, uploaded: &[UploadedAttachment]) -> Vec<SendUnit> {
    let caption = text.trim();
    let Some((first, rest)) = uploaded.split_first() else {
        if caption.is_empty() {
            return Vec::new();
        }
        return vec![SendUnit {
            body: caption.to_string(),
            kind: MessageKind::Text,
            attachment_url: None,
        }];
    };

    let mut units = Vec::with_capacity(uploaded.len());
    units.push(SendUnit {
        body: if caption.is_empty() {
            first.filename.clone()
        } else {
            caption.to_string()
        },
        kind: first.kind,
        attachment_url: Some(first.url.clone()),
    });
    units.extend(rest.iter().map(|attachment| SendUnit {
        body: attachment.filename.clone(),
        kind: attachment.kind,
        attachment_url: Some(attachment.url.clone()),
    }));
    units
}

/// Uploads every attachment concurrently. Order of the successes follows the
/// order of the request.
pub async fn upload_all(
    api: &dyn CommentApi,
    task_id: &TaskId,
    attachments: Vec<AttachmentUpload>,
) -> (Vec<UploadedAttachment>, Vec<UploadFailure>) {
    let results = join_all(
        attachments
            .iter()
            .map(|attachment| api.upload_attachment(task_id, attachment)),
    )
    .await;

    let mut uploaded = Vec::new();
    let mut failed = Vec::new();
    for (attachment, result) in attachments.into_iter().zip(results) {
        match result {
            Ok(url) => {
                info!(task_id = %task_id, filename = %attachment.filename, "send: attachment uploaded");
                uploaded.push(UploadedAttachment {
                    kind: attachment.kind(),
                    filename: attachment.filename,
                    url,
                });
            }
            Err(err) => {
                warn!(
                    task_id = %task_id,
                    filename = %attachment.filename,
                    error = %err,
                    "send: attachment upload failed"
                );
                failed.push(UploadFailure {
                    attachment,
                    reason: format!("{err:#}"),
                });
            }
        }
    }
    (uploaded, failed)
}

#[cfg(test)]
#[path = "tests/send_tests.rs"]
mod tests;
