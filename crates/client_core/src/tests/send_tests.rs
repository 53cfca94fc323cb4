use super::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::protocol::{CommentPatch, Message, NewComment};

fn uploaded(filename: &str, kind: MessageKind) -> UploadedAttachment {
    UploadedAttachment {
        filename: filename.to_string(),
        kind,
        url: format!("https://cdn.test/{filename}"),
    }
}

fn attachment(filename: &str, mime_type: Option<&str>) -> AttachmentUpload {
    AttachmentUpload {
        filename: filename.to_string(),
        mime_type: mime_type.map(str::to_string),
        bytes: filename.as_bytes().to_vec(),
    }
}

/// Uploads succeed unless the filename starts with `bad`.
struct UploadOnlyApi;

#[async_trait]
impl CommentApi for UploadOnlyApi {
    async fn list_comments(&self, _task_id: &TaskId) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }

    async fn create_comment(&self, _task_id: &TaskId, _comment: &NewComment) -> Result<Option<Message>> {
        Ok(None)
    }

    async fn update_comment(
        &self,
        _task_id: &TaskId,
        _id: &MessageId,
        _patch: &CommentPatch,
    ) -> Result<Option<Message>> {
        Ok(None)
    }

    async fn delete_comment(&self, _task_id: &TaskId, _id: &MessageId) -> Result<()> {
        Ok(())
    }

    async fn upload_attachment(&self, task_id: &TaskId, attachment: &AttachmentUpload) -> Result<String> {
        if attachment.filename.starts_with("bad") {
            return Err(anyhow!("storage rejected {}", attachment.filename));
        }
        Ok(format!("https://cdn.test/{task_id}/{}", attachment.filename))
    }
}

#[test]
fn text_only_is_a_single_trimmed_message() {
    let units = plan_units("  hello there \n", &[]);
    assert_eq!(
        units,
        vec![SendUnit {
            body: "hello there".to_string(),
            kind: MessageKind::Text,
            attachment_url: None,
        }]
    );
    assert!(plan_units("   ", &[]).is_empty());
}

#[test]
fn caption_travels_with_the_first_attachment_only() {
    let units = plan_units(
        "see attached",
        &[
            uploaded("shot.png", MessageKind::Image),
            uploaded("report.pdf", MessageKind::File),
        ],
    );

    assert_eq!(units.len(), 2);
    assert_eq!(units[0].body, "see attached");
    assert_eq!(units[0].kind, MessageKind::Image);
    assert_eq!(units[0].attachment_url.as_deref(), Some("https://cdn.test/shot.png"));
    assert_eq!(units[1].body, "report.pdf");
    assert_eq!(units[1].kind, MessageKind::File);
}

#[test]
fn attachments_without_caption_use_their_filenames() {
    let units = plan_units("", &[uploaded("a.txt", MessageKind::File)]);
    assert_eq!(units[0].body, "a.txt");
    assert_eq!(units[0].attachment_url.as_deref(), Some("https://cdn.test/a.txt"));
}

#[test]
fn kind_prefers_mime_type_then_extension() {
    assert_eq!(infer_kind(Some("image/png"), "blob"), MessageKind::Image);
    assert_eq!(infer_kind(Some(" IMAGE/JPEG "), "blob"), MessageKind::Image);
    assert_eq!(infer_kind(None, "Photo.JPG"), MessageKind::Image);
    assert_eq!(infer_kind(Some("application/pdf"), "scan.pdf"), MessageKind::File);
    assert_eq!(infer_kind(None, "README"), MessageKind::File);
    assert!(SendRequest::default().is_empty());
    assert!(SendRequest::text(" \t").is_empty());
    assert!(!SendRequest::text("hi").is_empty());
}

#[tokio::test]
async fn upload_all_keeps_request_order_and_reports_failures() {
    let task = TaskId::from("task-1");
    let (ok, failed) = upload_all(
        &UploadOnlyApi,
        &task,
        vec![
            attachment("one.png", None),
            attachment("bad.txt", Some("text/plain")),
            attachment("two.txt", Some("text/plain")),
        ],
    )
    .await;

    assert_eq!(
        ok,
        vec![
            UploadedAttachment {
                filename: "one.png".to_string(),
                kind: MessageKind::Image,
                url: "https://cdn.test/task-1/one.png".to_string(),
            },
            UploadedAttachment {
                filename: "two.txt".to_string(),
                kind: MessageKind::File,
                url: "https://cdn.test/task-1/two.txt".to_string(),
            },
        ]
    );
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attachment.filename, "bad.txt");
    assert!(failed[0].reason.contains("storage rejected bad.txt"));
}
