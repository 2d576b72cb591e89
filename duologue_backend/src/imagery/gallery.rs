use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ImageProvider;
use crate::conversation::{now_ms, write_json_atomic, Message};
use crate::events::{ConversationEvent, EventSender};
use crate::persona::{PersonaId, PersonaPair};

/// Prompts used when the config does not supply its own list.
pub const DEFAULT_GALLERY_PROMPTS: &[&str] = &[
    "Two lanterns drifting over a dark lake, reflecting each other",
    "A library where the shelves grow like trees",
    "A conversation written in constellations across a winter sky",
    "An old observatory at dawn, the dome half open",
    "A staircase of clouds leading to a quiet door",
    "Tide pools holding tiny reflections of cities",
    "A chess board where the pieces are made of weather",
];

const CONTEXT_SNAPSHOT_MESSAGES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageArtifact {
    pub id: String,
    pub timestamp: i64,
    pub agent: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub context_snapshot: String,
}

/// Append-only JSON array of generated images.
pub struct GalleryIndex {
    path: PathBuf,
    entries: Mutex<Vec<ImageArtifact>>,
}

impl GalleryIndex {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match Self::read(&path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Starting with an empty gallery: {:#}", e);
                Vec::new()
            }
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn read(path: &Path) -> Result<Vec<ImageArtifact>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        };
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {:?}", path))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<ImageArtifact>>> {
        self.entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Gallery lock poisoned: {}", e))
    }

    /// Memory only changes once the file write has gone through.
    pub fn append(&self, artifact: ImageArtifact) -> Result<()> {
        let mut entries = self.lock()?;
        let mut updated = entries.clone();
        updated.push(artifact);
        write_json_atomic(&self.path, &updated)?;
        *entries = updated;
        Ok(())
    }

    pub fn list(&self) -> Vec<ImageArtifact> {
        self.lock().map(|entries| entries.clone()).unwrap_or_default()
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<ImageArtifact> {
        self.lock()
            .map(|entries| entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, id: &str) -> Option<ImageArtifact> {
        self.lock()
            .ok()?
            .iter()
            .find(|artifact| artifact.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scheduled image generation, independent of the turn cadence. Credit alternates
/// between the personas and prompts come from a curated list.
pub struct GalleryGenerator {
    provider: Arc<dyn ImageProvider>,
    index: Arc<GalleryIndex>,
    personas: PersonaPair,
    prompts: Vec<String>,
    style_prefix: String,
    local_dir: Option<PathBuf>,
    next_agent: Mutex<PersonaId>,
    event_tx: EventSender,
}

impl GalleryGenerator {
    pub fn new(
        provider: Arc<dyn ImageProvider>,
        index: Arc<GalleryIndex>,
        personas: PersonaPair,
        prompts: Vec<String>,
        style_prefix: impl Into<String>,
        local_dir: Option<PathBuf>,
        event_tx: EventSender,
    ) -> Self {
        let prompts = if prompts.is_empty() {
            DEFAULT_GALLERY_PROMPTS.iter().map(|p| p.to_string()).collect()
        } else {
            prompts
        };
        Self {
            provider,
            index,
            personas,
            prompts,
            style_prefix: style_prefix.into(),
            local_dir,
            next_agent: Mutex::new(PersonaId::A),
            event_tx,
        }
    }

    fn take_next_agent(&self) -> PersonaId {
        match self.next_agent.lock() {
            Ok(mut next) => {
                let current = *next;
                *next = current.other();
                current
            }
            Err(_) => PersonaId::A,
        }
    }

    /// Generate, store and announce one artifact.
    pub async fn run_once(&self, context: &[Message]) -> Result<ImageArtifact> {
        let agent = self.personas.get(self.take_next_agent()).clone();
        let subject = self
            .prompts
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No gallery prompts configured"))?;
        let prompt = super::stylize_prompt(&self.style_prefix, &agent, &subject);

        let url = self
            .provider
            .generate(&prompt)
            .await
            .context("Gallery image generation failed")?;

        let id = format!("img_{}", Uuid::new_v4().simple());
        let local_path = match &self.local_dir {
            Some(dir) => match self.provider.download(&url, dir, &id).await {
                Ok(path) => path.map(|p| p.to_string_lossy().into_owned()),
                Err(e) => {
                    tracing::warn!("Keeping remote-only gallery image {}: {:#}", id, e);
                    None
                }
            },
            None => None,
        };

        let context_snapshot = context
            .iter()
            .rev()
            .take(CONTEXT_SNAPSHOT_MESSAGES)
            .rev()
            .map(|message| format!("{}: {}", message.entity, message.content))
            .collect::<Vec<_>>()
            .join("\n");

        let artifact = ImageArtifact {
            id,
            timestamp: now_ms(),
            agent: agent.name.clone(),
            url,
            local_path,
            rationale: format!(
                "{} picked \"{}\" to capture the current mood ({}).",
                agent.name, subject, agent.style
            ),
            prompt,
            context_snapshot,
        };

        self.index.append(artifact.clone())?;
        tracing::info!(
            "Gallery image {} credited to {} ({} total)",
            artifact.id,
            artifact.agent,
            self.index.len()
        );
        let _ = self.event_tx.send(ConversationEvent::Image {
            data: artifact.clone(),
        });
        Ok(artifact)
    }
}
