use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{is_valid_archive_name, ArchiveDocument, ArchiveInfo, ArchiveSink, ArchiveSource};
use crate::conversation::write_json_atomic;

/// Archive documents as pretty JSON files in one directory.
pub struct LocalArchiveSink {
    dir: PathBuf,
}

impl LocalArchiveSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Synchronous write for contexts that cannot await (panic hook, signal exit path).
    pub fn write_blocking(&self, filename: &str, document: &ArchiveDocument) -> Result<PathBuf> {
        if !is_valid_archive_name(filename) {
            anyhow::bail!("Refusing to write archive with invalid name '{}'", filename);
        }
        let path = self.dir.join(filename);
        write_json_atomic(&path, document)?;
        Ok(path)
    }
}

#[async_trait]
impl ArchiveSink for LocalArchiveSink {
    fn label(&self) -> &'static str {
        "local"
    }

    fn source(&self) -> ArchiveSource {
        ArchiveSource::Local
    }

    async fn write(&self, filename: &str, document: &ArchiveDocument) -> Result<()> {
        if !is_valid_archive_name(filename) {
            anyhow::bail!("Refusing to write archive with invalid name '{}'", filename);
        }
        let json = serde_json::to_vec_pretty(document).context("Failed to serialize archive")?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create archive dir {:?}", self.dir))?;
        let path = self.dir.join(filename);
        let tmp = self.dir.join(format!("{}.tmp", filename));
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move {:?} into place", tmp))?;
        tracing::debug!("Wrote local archive {:?}", path);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ArchiveInfo>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {:?}", self.dir));
            }
        };

        let mut infos = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name().to_string_lossy().into_owned();
            if !is_valid_archive_name(&filename) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            infos.push(ArchiveInfo {
                filename,
                source: ArchiveSource::Local,
                size_bytes: Some(metadata.len()),
                modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        Ok(infos)
    }

    async fn fetch(&self, filename: &str) -> Result<Option<Value>> {
        if !is_valid_archive_name(filename) {
            return Ok(None);
        }
        let path = self.dir.join(filename);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        };
        let value = serde_json::from_slice(&raw)
            .with_context(|| format!("Archive {:?} is not valid JSON", path))?;
        Ok(Some(value))
    }
}

/// Used by tests and tooling that want the raw listing without the async runtime.
pub fn list_filenames_blocking(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .filter(|name| is_valid_archive_name(name))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
