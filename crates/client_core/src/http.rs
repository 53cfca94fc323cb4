//! REST adapter for the comment endpoints.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use shared::{
    domain::{MessageId, TaskId},
    error::ApiException,
    normalize::{comment_from_envelope, comments_from_envelope, upload_url_from_envelope},
    protocol::{CommentPatch, Message, NewComment},
};
use tracing::debug;

use crate::{send::AttachmentUpload, CommentApi};

pub struct HttpCommentApi {
    http: Client,
    server_url: String,
    token: Option<String>,
}

impl HttpCommentApi {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn comments_url(&self, task_id: &TaskId) -> String {
        format!("{}/tasks/{}/comments", self.server_url, task_id)
    }

    fn comment_url(&self, task_id: &TaskId, id: &MessageId) -> String {
        format!("{}/{}", self.comments_url(task_id), id)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiException::from_response(status.as_u16(), &body).into())
    }

    /// Body as JSON, `None` for an empty body.
    async fn json_body(response: Response) -> Result<Option<Value>> {
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        let value = serde_json::from_str(&text).context("response is not valid JSON")?;
        Ok(Some(value))
    }
}

#[async_trait]
impl CommentApi for HttpCommentApi {
    async fn list_comments(&self, task_id: &TaskId) -> Result<Vec<Message>> {
        let response = self
            .execute(self.http.get(self.comments_url(task_id)))
            .await
            .with_context(|| format!("failed to list comments of task {task_id}"))?;
        let messages = Self::json_body(response)
            .await?
            .map(|body| comments_from_envelope(&body, Utc::now()))
            .unwrap_or_default();
        debug!(task_id = %task_id, count = messages.len(), "http: listed comments");
        Ok(messages)
    }

    async fn create_comment(
        &self,
        task_id: &TaskId,
        comment: &NewComment,
    ) -> Result<Option<Message>> {
        let response = self
            .execute(self.http.post(self.comments_url(task_id)).json(comment))
            .await
            .with_context(|| format!("failed to create comment in task {task_id}"))?;
        Ok(Self::json_body(response)
            .await?
            .and_then(|body| comment_from_envelope(&body, Utc::now())))
    }

    async fn update_comment(
        &self,
        task_id: &TaskId,
        id: &MessageId,
        patch: &CommentPatch,
    ) -> Result<Option<Message>> {
        let response = self
            .execute(self.http.patch(self.comment_url(task_id, id)).json(patch))
            .await
            .with_context(|| format!("failed to update comment {id}"))?;
        Ok(Self::json_body(response)
            .await?
            .and_then(|body| comment_from_envelope(&body, Utc::now())))
    }

    async fn delete_comment(&self, task_id: &TaskId, id: &MessageId) -> Result<()> {
        self.execute(self.http.delete(self.comment_url(task_id, id)))
            .await
            .with_context(|| format!("failed to delete comment {id}"))?;
        Ok(())
    }

    async fn upload_attachment(
        &self,
        task_id: &TaskId,
        attachment: &AttachmentUpload,
    ) -> Result<String> {
        let request = self
            .http
            .post(format!("{}/tasks/{}/attachments", self.server_url, task_id))
            .query(&[
                ("filename", attachment.filename.clone()),
                (
                    "mime_type",
                    attachment
                        .mime_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                ),
            ])
            .body(attachment.bytes.clone());
        let response = self
            .execute(request)
            .await
            .with_context(|| format!("failed to upload {}", attachment.filename))?;
        Self::json_body(response)
            .await?
            .as_ref()
            .and_then(upload_url_from_envelope)
            .with_context(|| format!("upload of {} returned no url", attachment.filename))
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
