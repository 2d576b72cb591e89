pub mod github;
pub mod local;
pub mod payload;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::{ConversationState, Message};
use crate::memory::{MemoryRecord, PersonaMemory};
use crate::persona::PersonaId;

pub use self::github::GithubArchiveSink;
pub use self::local::LocalArchiveSink;
pub use self::payload::ArchivePayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveReason {
    Hourly,
    Daily,
    Manual,
    Emergency,
    Shutdown,
}

impl ArchiveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveReason::Hourly => "hourly",
            ArchiveReason::Daily => "daily",
            ArchiveReason::Manual => "manual",
            ArchiveReason::Emergency => "emergency",
            ArchiveReason::Shutdown => "shutdown",
        }
    }
}

/// Immutable snapshot of the conversation at archive time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveDocument {
    pub archived_at: DateTime<Utc>,
    pub reason: ArchiveReason,
    pub message_count: usize,
    pub total_exchanges: u64,
    pub current_turn: PersonaId,
    pub started_at: i64,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memories: Option<Vec<MemoryRecord>>,
}

impl ArchiveDocument {
    pub fn from_state(
        state: &ConversationState,
        reason: ArchiveReason,
        archived_at: DateTime<Utc>,
        memories: Option<Vec<MemoryRecord>>,
    ) -> Self {
        Self {
            archived_at,
            reason,
            message_count: state.messages.len(),
            total_exchanges: state.total_exchanges,
            current_turn: state.current_turn,
            started_at: state.started_at,
            messages: state.messages.clone(),
            memories,
        }
    }
}

/// `YYYY-MM-DD_HH00.json` for hourly snapshots, `YYYY-MM-DD_HH00_<reason>.json` otherwise.
pub fn archive_filename(reason: ArchiveReason, at: DateTime<Utc>) -> String {
    let stamp = at.format("%Y-%m-%d_%H00");
    match reason {
        ArchiveReason::Hourly => format!("{}.json", stamp),
        other => format!("{}_{}.json", stamp, other.as_str()),
    }
}

pub fn daily_filename(date: NaiveDate) -> String {
    format!("{}_daily.json", date.format("%Y-%m-%d"))
}

/// Archive names come from request paths, so they are checked before touching any sink.
pub fn is_valid_archive_name(name: &str) -> bool {
    name.len() > ".json".len()
        && name.ends_with(".json")
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveSource {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveInfo {
    pub filename: String,
    pub source: ArchiveSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

/// A place archive documents can be written to and read back from.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    fn label(&self) -> &'static str;

    fn source(&self) -> ArchiveSource;

    async fn write(&self, filename: &str, document: &ArchiveDocument) -> Result<()>;

    async fn list(&self) -> Result<Vec<ArchiveInfo>>;

    /// Raw JSON of one archive, `None` when the sink does not have it.
    async fn fetch(&self, filename: &str) -> Result<Option<Value>>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveOutcome {
    pub filename: String,
    pub reason: ArchiveReason,
    pub message_count: usize,
    pub sinks_ok: Vec<String>,
    pub sinks_failed: Vec<String>,
}

impl ArchiveOutcome {
    pub fn any_succeeded(&self) -> bool {
        !self.sinks_ok.is_empty()
    }
}

/// One archive normalized for readers, whatever shape it was written in.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveContent {
    pub filename: String,
    pub source: ArchiveSource,
    pub format: &'static str,
    pub message_count: usize,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub include_memories: bool,
    pub memory_limit: usize,
    pub remote_cache_ttl: Duration,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            include_memories: true,
            memory_limit: 500,
            remote_cache_ttl: Duration::from_secs(300),
        }
    }
}

struct CachedListing {
    fetched_at: Instant,
    entries: Vec<ArchiveInfo>,
}

/// Fans snapshots out to every configured sink and serves the merged read path.
pub struct ArchiveManager {
    local: Option<Arc<LocalArchiveSink>>,
    remote: Option<Arc<dyn ArchiveSink>>,
    memory: Option<Arc<PersonaMemory>>,
    options: ArchiveOptions,
    last_archived_date: Mutex<Option<NaiveDate>>,
    remote_cache: tokio::sync::Mutex<Option<CachedListing>>,
}

impl ArchiveManager {
    pub fn new(
        local: Option<Arc<LocalArchiveSink>>,
        remote: Option<Arc<dyn ArchiveSink>>,
        memory: Option<Arc<PersonaMemory>>,
        options: ArchiveOptions,
    ) -> Self {
        Self {
            local,
            remote,
            memory,
            options,
            last_archived_date: Mutex::new(None),
            remote_cache: tokio::sync::Mutex::new(None),
        }
    }

    pub fn has_sinks(&self) -> bool {
        self.local.is_some() || self.remote.is_some()
    }

    fn memories_for_archive(&self) -> Option<Vec<MemoryRecord>> {
        if !self.options.include_memories {
            return None;
        }
        let memory = self.memory.as_ref()?;
        match memory.recent_records(self.options.memory_limit) {
            Ok(records) => Some(records),
            Err(e) => {
                tracing::warn!("Archiving without memories: {:#}", e);
                None
            }
        }
    }

    pub async fn archive(&self, state: &ConversationState, reason: ArchiveReason) -> ArchiveOutcome {
        self.archive_at(state, reason, Utc::now()).await
    }

    pub async fn archive_at(
        &self,
        state: &ConversationState,
        reason: ArchiveReason,
        now: DateTime<Utc>,
    ) -> ArchiveOutcome {
        let filename = archive_filename(reason, now);
        self.write_document(filename, state, reason, now).await
    }

    async fn write_document(
        &self,
        filename: String,
        state: &ConversationState,
        reason: ArchiveReason,
        now: DateTime<Utc>,
    ) -> ArchiveOutcome {
        let document = ArchiveDocument::from_state(state, reason, now, self.memories_for_archive());

        let local_write = async {
            match &self.local {
                Some(sink) => Some((sink.label(), sink.write(&filename, &document).await)),
                None => None,
            }
        };
        let remote_write = async {
            match &self.remote {
                Some(sink) => Some((sink.label(), sink.write(&filename, &document).await)),
                None => None,
            }
        };
        let (local_result, remote_result) = tokio::join!(local_write, remote_write);

        let mut outcome = ArchiveOutcome {
            filename: filename.clone(),
            reason,
            message_count: document.message_count,
            sinks_ok: Vec::new(),
            sinks_failed: Vec::new(),
        };
        for (label, result) in [local_result, remote_result].into_iter().flatten() {
            match result {
                Ok(()) => outcome.sinks_ok.push(label.to_string()),
                Err(e) => {
                    tracing::error!("{} archive {} failed: {:#}", label, filename, e);
                    outcome.sinks_failed.push(label.to_string());
                }
            }
        }

        if outcome.any_succeeded() {
            tracing::info!(
                "Archived {} messages to {} ({} reason, sinks: {})",
                outcome.message_count,
                filename,
                reason.as_str(),
                outcome.sinks_ok.join(", ")
            );
            if outcome.sinks_ok.iter().any(|s| s == "remote") {
                self.invalidate_remote_cache().await;
            }
        }
        if let Ok(mut last) = self.last_archived_date.lock() {
            *last = Some(now.date_naive());
        }
        outcome
    }

    /// Writes one extra `daily` archive the first time a snapshot is taken on a new date.
    pub async fn check_daily_rollover(
        &self,
        state: &ConversationState,
        now: DateTime<Utc>,
    ) -> Option<ArchiveOutcome> {
        let previous = match self.last_archived_date.lock() {
            Ok(last) => *last,
            Err(_) => None,
        }?;
        if previous == now.date_naive() {
            return None;
        }
        tracing::info!("Date rolled over from {}, writing daily archive", previous);
        let filename = daily_filename(previous);
        Some(
            self.write_document(filename, state, ArchiveReason::Daily, now)
                .await,
        )
    }

    /// Timer entry point: daily rollover check, then the hourly snapshot.
    pub async fn run_scheduled(&self, state: &ConversationState) -> ArchiveOutcome {
        let now = Utc::now();
        self.check_daily_rollover(state, now).await;
        self.archive_at(state, ArchiveReason::Hourly, now).await
    }

    /// Local-only and synchronous, for the panic hook where no runtime can be relied on.
    pub fn emergency_archive_blocking(&self, state: &ConversationState) -> Option<PathBuf> {
        let sink = self.local.as_ref()?;
        let now = Utc::now();
        let filename = archive_filename(ArchiveReason::Emergency, now);
        let memories = self
            .memory
            .as_ref()
            .filter(|_| self.options.include_memories)
            .and_then(|memory| memory.try_recent_records(self.options.memory_limit));
        let document = ArchiveDocument::from_state(state, ArchiveReason::Emergency, now, memories);
        match sink.write_blocking(&filename, &document) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!("Emergency archive failed: {:#}", e);
                None
            }
        }
    }

    async fn invalidate_remote_cache(&self) {
        *self.remote_cache.lock().await = None;
    }

    async fn remote_listing(&self) -> Vec<ArchiveInfo> {
        let Some(remote) = &self.remote else {
            return Vec::new();
        };

        let mut cache = self.remote_cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < self.options.remote_cache_ttl {
                return cached.entries.clone();
            }
        }

        match remote.list().await {
            Ok(entries) => {
                *cache = Some(CachedListing {
                    fetched_at: Instant::now(),
                    entries: entries.clone(),
                });
                entries
            }
            Err(e) => {
                tracing::warn!("Remote archive listing failed: {:#}", e);
                cache
                    .as_ref()
                    .map(|cached| cached.entries.clone())
                    .unwrap_or_default()
            }
        }
    }

    /// Local and remote listings merged; local wins on a name collision. Newest first.
    pub async fn list(&self) -> Vec<ArchiveInfo> {
        let mut merged = match &self.local {
            Some(local) => local.list().await.unwrap_or_else(|e| {
                tracing::warn!("Local archive listing failed: {:#}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        let seen: HashSet<String> = merged.iter().map(|info| info.filename.clone()).collect();
        merged.extend(
            self.remote_listing()
                .await
                .into_iter()
                .filter(|info| !seen.contains(&info.filename)),
        );
        merged.sort_by(|a, b| b.filename.cmp(&a.filename));
        merged
    }

    pub async fn fetch(&self, filename: &str) -> Result<Option<ArchiveContent>> {
        if !is_valid_archive_name(filename) {
            return Ok(None);
        }

        let sinks: [Option<Arc<dyn ArchiveSink>>; 2] = [
            self.local.clone().map(|sink| sink as Arc<dyn ArchiveSink>),
            self.remote.clone(),
        ];
        for sink in sinks.into_iter().flatten() {
            let raw = match sink.fetch(filename).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("{} archive fetch of {} failed: {:#}", sink.label(), filename, e);
                    continue;
                }
            };
            let payload = ArchivePayload::from_value(raw).map_err(|e| {
                anyhow::anyhow!("Archive {} has an unrecognized shape: {}", filename, e)
            })?;
            let format = payload.kind();
            let messages = payload.into_messages();
            return Ok(Some(ArchiveContent {
                filename: filename.to_string(),
                source: sink.source(),
                format,
                message_count: messages.len(),
                messages,
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory sink standing in for the remote store.
    #[derive(Default)]
    pub(crate) struct MemorySink {
        pub docs: Mutex<HashMap<String, Value>>,
        pub list_calls: AtomicUsize,
        pub fail_writes: bool,
    }

    impl MemorySink {
        pub(crate) fn failing() -> Self {
            Self {
                fail_writes: true,
                ..Self::default()
            }
        }

        pub(crate) fn names(&self) -> Vec<String> {
            let mut names: Vec<String> = self.docs.lock().unwrap().keys().cloned().collect();
            names.sort();
            names
        }
    }

    #[async_trait]
    impl ArchiveSink for MemorySink {
        fn label(&self) -> &'static str {
            "remote"
        }

        fn source(&self) -> ArchiveSource {
            ArchiveSource::Remote
        }

        async fn write(&self, filename: &str, document: &ArchiveDocument) -> Result<()> {
            if self.fail_writes {
                anyhow::bail!("remote unavailable");
            }
            self.docs
                .lock()
                .unwrap()
                .insert(filename.to_string(), serde_json::to_value(document)?);
            Ok(())
        }

        async fn list(&self) -> Result<Vec<ArchiveInfo>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .names()
                .into_iter()
                .map(|filename| ArchiveInfo {
                    filename,
                    source: ArchiveSource::Remote,
                    size_bytes: None,
                    modified_at: None,
                })
                .collect())
        }

        async fn fetch(&self, filename: &str) -> Result<Option<Value>> {
            Ok(self.docs.lock().unwrap().get(filename).cloned())
        }
    }

    fn state_with(n: usize) -> ConversationState {
        let mut state = ConversationState::default();
        state.push_message(Message::system("Conversation started between Aurora and Basalt."));
        for i in 0..n {
            let who = if i % 2 == 0 { "Aurora" } else { "Basalt" };
            state.commit_turn(Message::new(who, format!("turn {}", i), None));
        }
        state
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 17, 42).unwrap()
    }

    #[test]
    fn filenames_encode_hour_and_reason() {
        let when = at(2024, 3, 9, 7);
        assert_eq!(archive_filename(ArchiveReason::Hourly, when), "2024-03-09_0700.json");
        assert_eq!(
            archive_filename(ArchiveReason::Emergency, when),
            "2024-03-09_0700_emergency.json"
        );
        assert_eq!(
            daily_filename(NaiveDate::from_ymd_opt(2024, 3, 8).unwrap()),
            "2024-03-08_daily.json"
        );
    }

    #[test]
    fn archive_names_are_validated() {
        assert!(is_valid_archive_name("2024-03-09_0700.json"));
        assert!(is_valid_archive_name("2024-03-09_0700_manual.json"));
        assert!(!is_valid_archive_name("../state.json"));
        assert!(!is_valid_archive_name("a/b.json"));
        assert!(!is_valid_archive_name("notes.txt"));
        assert!(!is_valid_archive_name(".json"));
        assert!(!is_valid_archive_name("x..json"));
    }

    #[tokio::test]
    async fn one_failing_sink_does_not_block_the_other() {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(LocalArchiveSink::new(dir.path()));
        let manager = ArchiveManager::new(
            Some(local),
            Some(Arc::new(MemorySink::failing())),
            None,
            ArchiveOptions::default(),
        );

        let outcome = manager
            .archive_at(&state_with(3), ArchiveReason::Manual, at(2024, 3, 9, 7))
            .await;
        assert_eq!(outcome.filename, "2024-03-09_0700_manual.json");
        assert_eq!(outcome.sinks_ok, vec!["local"]);
        assert_eq!(outcome.sinks_failed, vec!["remote"]);
        assert_eq!(outcome.message_count, 4);
        assert!(dir.path().join("2024-03-09_0700_manual.json").exists());
    }

    #[tokio::test]
    async fn document_carries_state_and_memories() {
        let memory = Arc::new(PersonaMemory::in_memory().unwrap());
        memory.record("Aurora", "remembered").unwrap();
        let remote = Arc::new(MemorySink::default());
        let manager = ArchiveManager::new(
            None,
            Some(remote.clone() as Arc<dyn ArchiveSink>),
            Some(memory),
            ArchiveOptions::default(),
        );

        manager
            .archive_at(&state_with(2), ArchiveReason::Hourly, at(2024, 3, 9, 7))
            .await;
        let doc = remote.docs.lock().unwrap()["2024-03-09_0700.json"].clone();
        assert_eq!(doc["reason"], "hourly");
        assert_eq!(doc["messageCount"], 3);
        assert_eq!(doc["totalExchanges"], 2);
        assert_eq!(doc["currentTurn"], "A");
        assert_eq!(doc["memories"][0]["content"], "remembered");
    }

    #[tokio::test]
    async fn daily_rollover_writes_once_per_new_date() {
        let remote = Arc::new(MemorySink::default());
        let manager = ArchiveManager::new(
            None,
            Some(remote.clone() as Arc<dyn ArchiveSink>),
            None,
            ArchiveOptions::default(),
        );
        let state = state_with(1);

        assert!(manager
            .check_daily_rollover(&state, at(2024, 3, 9, 23))
            .await
            .is_none());
        manager
            .archive_at(&state, ArchiveReason::Hourly, at(2024, 3, 9, 23))
            .await;
        assert!(manager
            .check_daily_rollover(&state, at(2024, 3, 9, 23))
            .await
            .is_none());

        let rolled = manager
            .check_daily_rollover(&state, at(2024, 3, 10, 0))
            .await
            .unwrap();
        assert_eq!(rolled.filename, "2024-03-09_daily.json");
        assert!(manager
            .check_daily_rollover(&state, at(2024, 3, 10, 0))
            .await
            .is_none());
        assert_eq!(
            remote.names(),
            vec!["2024-03-09_2300.json", "2024-03-09_daily.json"]
        );
    }

    #[tokio::test]
    async fn listing_merges_local_first_newest_first_and_caches_remote() {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(LocalArchiveSink::new(dir.path()));
        let remote = Arc::new(MemorySink::default());
        let manager = ArchiveManager::new(
            Some(local.clone()),
            Some(remote.clone() as Arc<dyn ArchiveSink>),
            None,
            ArchiveOptions {
                remote_cache_ttl: Duration::from_secs(300),
                ..ArchiveOptions::default()
            },
        );
        let state = state_with(1);

        let doc = ArchiveDocument::from_state(&state, ArchiveReason::Hourly, Utc::now(), None);
        local.write("2024-03-09_0700.json", &doc).await.unwrap();
        remote.write("2024-03-09_0700.json", &doc).await.unwrap();
        remote.write("2024-03-10_0100.json", &doc).await.unwrap();

        let listing = manager.list().await;
        let names: Vec<_> = listing.iter().map(|i| i.filename.as_str()).collect();
        assert_eq!(names, vec!["2024-03-10_0100.json", "2024-03-09_0700.json"]);
        assert_eq!(listing[1].source, ArchiveSource::Local);
        assert_eq!(listing[0].source, ArchiveSource::Remote);

        manager.list().await;
        assert_eq!(remote.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_normalizes_legacy_shapes_and_prefers_local() {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(LocalArchiveSink::new(dir.path()));
        let remote = Arc::new(MemorySink::default());
        remote.docs.lock().unwrap().insert(
            "legacy.json".to_string(),
            serde_json::json!({"conversation": [
                {"id": "x", "timestamp": 1, "entity": "Aurora", "content": "old"}
            ]}),
        );
        let manager = ArchiveManager::new(
            Some(local.clone()),
            Some(remote.clone() as Arc<dyn ArchiveSink>),
            None,
            ArchiveOptions::default(),
        );

        let content = manager.fetch("legacy.json").await.unwrap().unwrap();
        assert_eq!(content.source, ArchiveSource::Remote);
        assert_eq!(content.format, "conversation");
        assert_eq!(content.message_count, 1);

        let state = state_with(2);
        let doc = ArchiveDocument::from_state(&state, ArchiveReason::Manual, Utc::now(), None);
        local.write("legacy.json", &doc).await.unwrap();
        let content = manager.fetch("legacy.json").await.unwrap().unwrap();
        assert_eq!(content.source, ArchiveSource::Local);
        assert_eq!(content.format, "messages");
        assert_eq!(content.messages, state.messages);

        assert!(manager.fetch("missing.json").await.unwrap().is_none());
        assert!(manager.fetch("../etc.json").await.unwrap().is_none());
    }

    #[test]
    fn emergency_archive_is_synchronous_and_local() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ArchiveManager::new(
            Some(Arc::new(LocalArchiveSink::new(dir.path()))),
            None,
            None,
            ArchiveOptions::default(),
        );
        let path = manager.emergency_archive_blocking(&state_with(1)).unwrap();
        assert!(path.exists());
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("_emergency.json"));
        assert_eq!(local::list_filenames_blocking(dir.path()).len(), 1);
    }

    #[test]
    fn emergency_archive_skips_memories_when_database_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(PersonaMemory::in_memory().unwrap());
        memory.record("Aurora", "mid-write").unwrap();
        let manager = ArchiveManager::new(
            Some(Arc::new(LocalArchiveSink::new(dir.path()))),
            None,
            Some(memory.clone()),
            ArchiveOptions::default(),
        );

        // Same thread holds the connection, as when a panic fires inside a memory write.
        let held = memory.lock_conn().unwrap();
        let path = manager.emergency_archive_blocking(&state_with(1)).unwrap();
        drop(held);

        let doc: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(doc["messages"].as_array().map(Vec::len), Some(2));
        assert!(doc.get("memories").is_none());
    }
}
