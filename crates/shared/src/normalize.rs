//! Tolerant parsing of backend and realtime payloads.
//!
//! The comment endpoints have answered with several envelope shapes over time
//! (bare row, `{data: row}`, `{comment: row}`, `[row]`, `{data: [row]}`), and
//! rows use both snake_case and camelCase keys. Everything here accepts the
//! known variants and produces the canonical types from [`crate::protocol`].

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::{
    domain::{MessageId, MessageKind, Principal, TaskId, UserId},
    protocol::{Message, MessageRow, RealtimeEvent, SubscriptionStatus, TypingBroadcast},
};

const SINGLE_ENVELOPE_KEYS: &[&str] = &["data", "comment", "record", "result", "new", "row"];
const LIST_ENVELOPE_KEYS: &[&str] = &["data", "comments", "items", "results", "rows"];

/// Extracts the created/updated comment from a response body. Returns `None`
/// when the body acknowledges the write without carrying the entity.
pub fn comment_from_envelope(value: &Value, now: DateTime<Utc>) -> Option<Message> {
    match value {
        Value::Array(items) => items
            .iter()
            .find_map(|item| comment_from_envelope(item, now)),
        Value::Object(map) => {
            if map.contains_key("id") {
                return row_from_map(map).and_then(|row| Message::from_row(&row, now));
            }
            SINGLE_ENVELOPE_KEYS
                .iter()
                .filter_map(|key| map.get(*key))
                .find_map(|inner| comment_from_envelope(inner, now))
        }
        _ => None,
    }
}

/// Extracts a comment list. Rows that cannot be placed in a conversation are
/// skipped.
pub fn comments_from_envelope(value: &Value, now: DateTime<Utc>) -> Vec<Message> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(row_from_value)
            .filter_map(|row| Message::from_row(&row, now))
            .collect(),
        Value::Object(map) => {
            if map.contains_key("id") {
                return comment_from_envelope(value, now).into_iter().collect();
            }
            LIST_ENVELOPE_KEYS
                .iter()
                .filter_map(|key| map.get(*key))
                .map(|inner| comments_from_envelope(inner, now))
                .find(|messages| !messages.is_empty())
                .unwrap_or_default()
        }
        _ => Vec::new(),
    }
}

/// Public URL of an uploaded attachment (`{url}`, `{publicUrl}`,
/// `{data: {url}}` or a bare string).
pub fn upload_url_from_envelope(value: &Value) -> Option<String> {
    match value {
        Value::String(url) if !url.trim().is_empty() => Some(url.trim().to_string()),
        Value::Object(map) => {
            first_string(map, &["url", "publicUrl", "public_url", "file_url", "fileUrl"]).or_else(
                || {
                    SINGLE_ENVELOPE_KEYS
                        .iter()
                        .filter_map(|key| map.get(*key))
                        .find_map(upload_url_from_envelope)
                },
            )
        }
        _ => None,
    }
}

pub fn row_from_value(value: &Value) -> Option<MessageRow> {
    match value {
        Value::Object(map) => row_from_map(map),
        _ => None,
    }
}

fn row_from_map(map: &Map<String, Value>) -> Option<MessageRow> {
    let author = first_id(map, &["user_id", "userId", "author_id", "authorId"])
        .map(|id| Principal::User(UserId(id)))
        .or_else(|| {
            first_id(map, &["employee_id", "employeeId"]).map(|id| Principal::Employee(UserId(id)))
        });
    let attachment_url = first_string(
        map,
        &["attachment_url", "attachmentUrl", "file_url", "fileUrl"],
    );
    let kind = first_string(map, &["kind", "type", "message_type", "messageType"])
        .and_then(|raw| MessageKind::parse(&raw));

    Some(MessageRow {
        id: first_id(map, &["id"]).map(MessageId),
        task_id: first_id(map, &["task_id", "taskId"]).map(TaskId),
        author,
        author_name: first_string(
            map,
            &["author_name", "authorName", "user_name", "userName", "display_name"],
        ),
        body: first_raw_string(map, &["body", "content", "message", "text"]),
        kind,
        attachment_url,
        parent_id: first_id(map, &["parent_id", "parentId", "reply_to", "replyTo"]).map(MessageId),
        pinned: first_bool(map, &["pinned", "is_pinned", "isPinned"]),
        created_at: first_timestamp(map, &["created_at", "createdAt", "inserted_at"]),
        updated_at: first_timestamp(map, &["updated_at", "updatedAt"]),
    })
}

/// Parses one realtime frame. Row events are `{op|eventType, row|new|record}`
/// (deletes may carry the row under `old`), typing broadcasts are
/// `{op: "typing", userId, displayName, taskId, isTyping}` and status frames
/// are `{op: "status", status}`.
pub fn realtime_event_from_value(value: &Value) -> Option<RealtimeEvent> {
    let map = value.as_object()?;
    let op = first_string(map, &["op", "eventType", "event_type", "type"])?.to_ascii_lowercase();
    match op.as_str() {
        "insert" => row_payload(map, &["row", "new", "record", "data"]).map(RealtimeEvent::Insert),
        "update" => row_payload(map, &["row", "new", "record", "data"]).map(RealtimeEvent::Update),
        "delete" => {
            let row = row_payload(map, &["old", "row", "record", "data"])?;
            Some(RealtimeEvent::Delete {
                id: row.id?,
                task_id: row.task_id,
            })
        }
        "typing" => {
            let payload = map
                .get("payload")
                .and_then(Value::as_object)
                .unwrap_or(map);
            Some(RealtimeEvent::Typing(TypingBroadcast {
                user_id: UserId(first_id(payload, &["userId", "user_id"])?),
                display_name: first_string(payload, &["displayName", "display_name", "userName"])
                    .unwrap_or_default(),
                task_id: TaskId(first_id(payload, &["taskId", "task_id"])?),
                is_typing: first_bool(payload, &["isTyping", "is_typing"]).unwrap_or(false),
            }))
        }
        "status" | "system" => {
            let status = first_string(map, &["status", "state"])?.to_ascii_lowercase();
            let status = match status.as_str() {
                "subscribed" | "ok" | "joined" => SubscriptionStatus::Subscribed,
                "timed_out" | "timeout" => SubscriptionStatus::Timeout,
                "closed" => SubscriptionStatus::Closed,
                _ => SubscriptionStatus::Error,
            };
            Some(RealtimeEvent::Status(status))
        }
        _ => None,
    }
}

fn row_payload(map: &Map<String, Value>, keys: &[&str]) -> Option<MessageRow> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find_map(row_from_value)
        .filter(|row| row.id.is_some())
}

fn first_raw_string(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find_map(|value| value.as_str().map(str::to_string))
}

fn first_string(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    first_raw_string(map, keys)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn first_id(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find_map(id_string)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) => {
            let raw = raw.trim();
            (!raw.is_empty()).then(|| raw.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn first_bool(map: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find_map(|value| match value {
            Value::Bool(flag) => Some(*flag),
            Value::Number(number) => number.as_i64().map(|n| n != 0),
            Value::String(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        })
}

fn first_timestamp(map: &Map<String, Value>, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find_map(parse_timestamp)
}

/// Accepts RFC 3339, Postgres-style timestamps without an offset (read as
/// UTC) and epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => {
            let raw = raw.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                return Some(parsed.with_timezone(&Utc));
            }
            ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Number(number) => number
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/normalize_tests.rs"]
mod tests;
