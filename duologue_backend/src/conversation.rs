use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::persona::{Persona, PersonaId};

/// Live history bound. Older messages only survive in archives.
pub const MAX_MESSAGES: usize = 100;

pub const SYSTEM_ENTITY: &str = "SYSTEM";

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub timestamp: i64,
    pub entity: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Message {
    pub fn new(entity: impl Into<String>, content: impl Into<String>, image: Option<String>) -> Self {
        let timestamp = now_ms();
        Self {
            id: new_message_id(timestamp),
            timestamp,
            entity: entity.into(),
            content: content.into(),
            image,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(SYSTEM_ENTITY, content, None)
    }

    pub fn is_system(&self) -> bool {
        self.entity == SYSTEM_ENTITY
    }

    pub fn is_from(&self, persona: &Persona) -> bool {
        self.entity == persona.name
    }
}

fn new_message_id(timestamp: i64) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("msg_{}_{}", timestamp, &suffix[..8])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub current_turn: PersonaId,
    #[serde(default)]
    pub total_exchanges: u64,
    #[serde(default = "now_ms")]
    pub started_at: i64,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            is_running: false,
            current_turn: PersonaId::A,
            total_exchanges: 0,
            started_at: now_ms(),
        }
    }
}

impl ConversationState {
    /// Append and drop the oldest entries past `MAX_MESSAGES`.
    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        if self.messages.len() > MAX_MESSAGES {
            let excess = self.messages.len() - MAX_MESSAGES;
            self.messages.drain(..excess);
        }
    }

    /// Append a persona message: flips the turn and counts the exchange exactly once.
    pub fn commit_turn(&mut self, message: Message) {
        self.push_message(message);
        self.current_turn = self.current_turn.other();
        self.total_exchanges += 1;
    }

    pub fn recent(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Single JSON document mirroring the live conversation.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    path: PathBuf,
}

impl ConversationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Missing or unreadable state starts a fresh, stopped conversation.
    pub fn load(&self) -> ConversationState {
        match self.try_load() {
            Ok(Some(state)) => {
                tracing::info!(
                    "Restored conversation from {:?} ({} messages, {} exchanges)",
                    self.path,
                    state.messages.len(),
                    state.total_exchanges
                );
                state
            }
            Ok(None) => {
                tracing::info!("No conversation state at {:?}, starting fresh", self.path);
                ConversationState::default()
            }
            Err(e) => {
                tracing::warn!("Ignoring unreadable conversation state: {:#}", e);
                ConversationState::default()
            }
        }
    }

    fn try_load(&self) -> Result<Option<ConversationState>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", self.path)),
        };
        let mut state: ConversationState = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse {:?}", self.path))?;
        if state.messages.len() > MAX_MESSAGES {
            let excess = state.messages.len() - MAX_MESSAGES;
            state.messages.drain(..excess);
        }
        Ok(Some(state))
    }

    /// Best effort: failures are logged and dropped.
    pub fn save(&self, state: &ConversationState) {
        if let Err(e) = self.try_save(state) {
            tracing::error!("Failed to save conversation state: {:#}", e);
        }
    }

    pub fn try_save(&self, state: &ConversationState) -> Result<()> {
        write_json_atomic(&self.path, state)
    }
}

/// Pretty JSON through a sibling temp file and rename, creating parent dirs.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }
    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, json).with_context(|| format!("Failed to write {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to move {:?} into place", tmp))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persona_message(n: usize) -> Message {
        Message::new("Aurora", format!("line {}", n), None)
    }

    #[test]
    fn history_is_capped_oldest_first() {
        let mut state = ConversationState::default();
        for n in 0..(MAX_MESSAGES + 7) {
            state.push_message(persona_message(n));
        }
        assert_eq!(state.messages.len(), MAX_MESSAGES);
        assert_eq!(state.messages[0].content, "line 7");
        assert_eq!(
            state.last_message().map(|m| m.content.as_str()),
            Some("line 106")
        );
    }

    #[test]
    fn commit_turn_flips_and_counts_once() {
        let mut state = ConversationState::default();
        state.push_message(Message::system("hello"));
        assert_eq!(state.total_exchanges, 0);
        assert_eq!(state.current_turn, PersonaId::A);

        state.commit_turn(persona_message(1));
        assert_eq!(state.total_exchanges, 1);
        assert_eq!(state.current_turn, PersonaId::B);

        state.commit_turn(persona_message(2));
        assert_eq!(state.total_exchanges, 2);
        assert_eq!(state.current_turn, PersonaId::A);
    }

    #[test]
    fn recent_returns_tail() {
        let mut state = ConversationState::default();
        for n in 0..4 {
            state.push_message(persona_message(n));
        }
        let tail: Vec<_> = state.recent(2).iter().map(|m| m.content.clone()).collect();
        assert_eq!(tail, vec!["line 2", "line 3"]);
        assert_eq!(state.recent(10).len(), 4);
    }

    #[test]
    fn message_ids_are_unique() {
        let a = Message::system("x");
        let b = Message::system("x");
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("msg_"));
    }

    #[test]
    fn state_serializes_camel_case_and_omits_missing_image() {
        let mut state = ConversationState::default();
        state.commit_turn(persona_message(0));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["isRunning"], false);
        assert_eq!(json["currentTurn"], "B");
        assert_eq!(json["totalExchanges"], 1);
        assert!(json["startedAt"].is_i64());
        assert!(json["messages"][0].get("image").is_none());
    }

    #[test]
    fn save_then_load_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path().join("nested/state.json"));
        let mut state = ConversationState::default();
        state.is_running = true;
        state.commit_turn(Message::new("Basalt", "hi", Some("https://img".to_string())));
        store.save(&state);

        let loaded = store.load();
        assert_eq!(loaded, state);
    }

    #[test]
    fn corrupt_file_loads_fresh_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        let loaded = ConversationStore::new(&path).load();
        assert!(!loaded.is_running);
        assert!(loaded.messages.is_empty());
        assert_eq!(loaded.current_turn, PersonaId::A);
        assert_eq!(loaded.total_exchanges, 0);
    }

    #[test]
    fn missing_file_loads_fresh_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = ConversationStore::new(dir.path().join("absent.json")).load();
        assert!(!loaded.is_running);
        assert!(loaded.messages.is_empty());
    }
}
