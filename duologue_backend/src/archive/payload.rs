use chrono::DateTime;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::conversation::Message;

/// Every archive shape that has been written over time. Deserialized once at the
/// read boundary and immediately normalized to `Vec<Message>`.
///
/// Entries stay as raw JSON so one odd record (duplicate field spellings, nested
/// content, a bare string) cannot make the whole archive unreadable.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ArchivePayload {
    Messages { messages: Vec<Value> },
    Conversation { conversation: Vec<Value> },
    Memories { memories: Vec<Value> },
    Raw(Vec<Value>),
}

const ID_KEYS: &[&str] = &["id"];
const TIMESTAMP_KEYS: &[&str] = &["timestamp", "createdAt", "created_at", "time"];
const ENTITY_KEYS: &[&str] = &["entity", "persona", "agent", "speaker", "role"];
const CONTENT_KEYS: &[&str] = &["content", "text", "message"];
const IMAGE_KEYS: &[&str] = &["image", "imageUrl", "image_url"];

impl ArchivePayload {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ArchivePayload::Messages { .. } => "messages",
            ArchivePayload::Conversation { .. } => "conversation",
            ArchivePayload::Memories { .. } => "memories",
            ArchivePayload::Raw(_) => "raw",
        }
    }

    pub fn into_messages(self) -> Vec<Message> {
        let entries = match self {
            ArchivePayload::Messages { messages } => messages,
            ArchivePayload::Conversation { conversation } => conversation,
            ArchivePayload::Memories { memories } => memories,
            ArchivePayload::Raw(entries) => entries,
        };
        entries
            .iter()
            .enumerate()
            .map(|(index, entry)| normalize_entry(entry, index))
            .collect()
    }
}

/// Malformed entries still produce a message so the array keeps its length.
fn normalize_entry(entry: &Value, index: usize) -> Message {
    let fields = match entry {
        Value::Object(map) => Some(map),
        _ => None,
    };
    let pick = |keys: &[&str]| pick_fields(fields, keys);

    let id = pick(ID_KEYS)
        .into_iter()
        .find_map(|value| match value {
            Value::String(id) if !id.is_empty() => Some(id.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| format!("archived_{}", index));

    let content = match entry {
        Value::String(text) => Some(text.clone()),
        _ => pick(CONTENT_KEYS).into_iter().find_map(content_text),
    };

    Message {
        id,
        timestamp: pick(TIMESTAMP_KEYS)
            .into_iter()
            .find_map(timestamp_ms)
            .unwrap_or(0),
        entity: pick(ENTITY_KEYS)
            .into_iter()
            .find_map(|value| value.as_str().map(str::trim).filter(|e| !e.is_empty()))
            .unwrap_or("unknown")
            .to_string(),
        content: content.unwrap_or_default(),
        image: pick(IMAGE_KEYS)
            .into_iter()
            .find_map(|value| value.as_str().filter(|url| !url.is_empty()))
            .map(str::to_string),
    }
}

/// Values present under `keys`, in priority order.
fn pick_fields<'a>(fields: Option<&'a Map<String, Value>>, keys: &[&str]) -> Vec<&'a Value> {
    fields
        .map(|map| keys.iter().filter_map(|key| map.get(*key)).collect())
        .unwrap_or_default()
}

/// Plain string, or the `{"text": ...}` object agent memories use.
fn content_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Object(map) => ["text", "content"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

/// Epoch millis from a number or an RFC 3339 / numeric string.
fn timestamp_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(raw) => raw.trim().parse::<i64>().ok().or_else(|| {
            DateTime::parse_from_rfc3339(raw.trim())
                .ok()
                .map(|dt| dt.timestamp_millis())
        }),
        _ => None,
    }
}
