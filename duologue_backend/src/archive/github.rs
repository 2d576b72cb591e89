use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{is_valid_archive_name, ArchiveDocument, ArchiveInfo, ArchiveSink, ArchiveSource};
use crate::config::GithubArchiveConfig;

const GITHUB_API: &str = "https://api.github.com";
const GITHUB_ACCEPT: &str = "application/vnd.github.v3+json";

/// A file or directory entry from the contents API
#[derive(Debug, Deserialize)]
struct ContentEntry {
    name: String,
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    download_url: Option<String>,
}

/// Archives committed into a GitHub repository through the contents API.
pub struct GithubArchiveSink {
    base_url: String,
    repo: String,
    token: String,
    branch: String,
    path_prefix: String,
    client: reqwest::Client,
}

impl GithubArchiveSink {
    /// `None` unless both repo and token are set.
    pub fn from_config(config: &GithubArchiveConfig, client: reqwest::Client) -> Option<Self> {
        if !config.is_configured() {
            return None;
        }
        Some(Self {
            base_url: GITHUB_API.to_string(),
            repo: config.repo.clone().unwrap_or_default(),
            token: config.token.clone().unwrap_or_default(),
            branch: config.branch.clone(),
            path_prefix: config.path_prefix.trim_matches('/').to_string(),
            client,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    fn repo_path(&self, filename: &str) -> String {
        if self.path_prefix.is_empty() {
            filename.to_string()
        } else {
            format!("{}/{}", self.path_prefix, filename)
        }
    }

    fn contents_url(&self, path: &str) -> String {
        format!("{}/repos/{}/contents/{}", self.base_url, self.repo, path)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", GITHUB_ACCEPT)
            .header("User-Agent", "duologue-archiver")
    }

    /// GET a contents path on the configured branch, `None` on 404.
    async fn get_contents(&self, path: &str) -> Result<Option<Value>> {
        let url = self.contents_url(path);
        let response = self
            .request(reqwest::Method::GET, &url)
            .query(&[("ref", self.branch.as_str())])
            .send()
            .await
            .with_context(|| format!("Failed to reach GitHub for {}", path))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("GitHub contents error {} for {}: {}", status, path, body);
        }
        let value = response
            .json()
            .await
            .context("Failed to parse GitHub contents response")?;
        Ok(Some(value))
    }

    async fn existing_sha(&self, path: &str) -> Result<Option<String>> {
        let Some(value) = self.get_contents(path).await? else {
            return Ok(None);
        };
        let entry: ContentEntry =
            serde_json::from_value(value).context("Unexpected GitHub file metadata")?;
        Ok(entry.sha)
    }

    async fn download(&self, url: &str) -> Result<Value> {
        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .context("Failed to download archive from GitHub")?;
        if !response.status().is_success() {
            anyhow::bail!("GitHub download failed: {}", response.status());
        }
        response
            .json()
            .await
            .context("GitHub archive is not valid JSON")
    }
}

#[async_trait]
impl ArchiveSink for GithubArchiveSink {
    fn label(&self) -> &'static str {
        "remote"
    }

    fn source(&self) -> ArchiveSource {
        ArchiveSource::Remote
    }

    async fn write(&self, filename: &str, document: &ArchiveDocument) -> Result<()> {
        if !is_valid_archive_name(filename) {
            anyhow::bail!("Refusing to write archive with invalid name '{}'", filename);
        }
        let path = self.repo_path(filename);
        let json = serde_json::to_vec_pretty(document).context("Failed to serialize archive")?;

        // Overwriting an existing file needs its blob sha.
        let sha = self.existing_sha(&path).await?;

        let mut body = json!({
            "message": format!("Archive conversation ({})", document.reason.as_str()),
            "content": base64::engine::general_purpose::STANDARD.encode(json),
            "branch": self.branch,
        });
        if let Some(sha) = sha {
            body["sha"] = Value::String(sha);
        }

        let url = self.contents_url(&path);
        let response = self
            .request(reqwest::Method::PUT, &url)
            .json(&body)
            .send()
            .await
            .context("Failed to send archive to GitHub")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("GitHub archive upload error {}: {}", status, body);
        }
        tracing::debug!("Committed archive {} to {}", path, self.repo);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ArchiveInfo>> {
        let Some(value) = self.get_contents(&self.path_prefix).await? else {
            return Ok(Vec::new());
        };
        let entries: Vec<ContentEntry> =
            serde_json::from_value(value).context("GitHub archive path is not a directory")?;
        Ok(listing_from_entries(entries))
    }

    async fn fetch(&self, filename: &str) -> Result<Option<Value>> {
        if !is_valid_archive_name(filename) {
            return Ok(None);
        }
        let Some(value) = self.get_contents(&self.repo_path(filename)).await? else {
            return Ok(None);
        };
        let entry: ContentEntry =
            serde_json::from_value(value).context("Unexpected GitHub file metadata")?;

        // Large files come back without inline content.
        if let Some(decoded) = decode_inline_content(&entry)? {
            return Ok(Some(decoded));
        }
        match entry.download_url.as_deref() {
            Some(url) => self.download(url).await.map(Some),
            None => anyhow::bail!("GitHub returned no content for {}", filename),
        }
    }
}

fn listing_from_entries(entries: Vec<ContentEntry>) -> Vec<ArchiveInfo> {
    entries
        .into_iter()
        .filter(|entry| entry.kind.as_deref().unwrap_or("file") == "file")
        .filter(|entry| is_valid_archive_name(&entry.name))
        .map(|entry| ArchiveInfo {
            filename: entry.name,
            source: ArchiveSource::Remote,
            size_bytes: entry.size,
            modified_at: None,
        })
        .collect()
}

fn decode_inline_content(entry: &ContentEntry) -> Result<Option<Value>> {
    let Some(content) = entry.content.as_deref().filter(|c| !c.is_empty()) else {
        return Ok(None);
    };
    if entry.encoding.as_deref().unwrap_or("base64") != "base64" {
        return Ok(None);
    }
    // The API wraps base64 at 60 columns.
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact)
        .context("GitHub content is not valid base64")?;
    let value = serde_json::from_slice(&bytes).context("GitHub archive is not valid JSON")?;
    Ok(Some(value))
}
