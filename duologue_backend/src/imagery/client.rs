use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ImageProvider;
use crate::config::ImageConfig;

#[derive(Debug, Serialize)]
struct ImageGenerationRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'a str,
}

#[derive(Debug, Deserialize)]
struct ImageGenerationResponse {
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    url: Option<String>,
}

/// Client for an OpenAI-compatible `/images/generations` endpoint
pub struct ImageClient {
    api_url: String,
    api_key: String,
    model: String,
    size: String,
    client: reqwest::Client,
}

impl ImageClient {
    pub fn new(config: &ImageConfig, client: reqwest::Client) -> Self {
        Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().unwrap_or_default(),
            model: config.model.clone(),
            size: config.size.clone(),
            client,
        }
    }

    /// Request one image and return its hosted URL
    pub async fn generate_url(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/images/generations", self.api_url);

        let request = ImageGenerationRequest {
            model: &self.model,
            prompt,
            n: 1,
            size: &self.size,
        };

        let mut req = self.client.post(&url).json(&request);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req
            .send()
            .await
            .context("Failed to send image generation request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Image API error {}: {}", status, body);
        }

        let result: ImageGenerationResponse = response
            .json()
            .await
            .context("Failed to parse image API response")?;

        result
            .data
            .into_iter()
            .find_map(|item| item.url)
            .ok_or_else(|| anyhow::anyhow!("Image API returned no URL"))
    }

    /// Download a generated image next to the gallery index
    pub async fn download_to(&self, url: &str, dir: &Path, stem: &str) -> Result<PathBuf> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to download generated image")?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to download image: {}", response.status());
        }

        let bytes = response
            .bytes()
            .await
            .context("Failed to read image bytes")?;

        let extension = image_extension(&bytes);
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {:?}", dir))?;
        let output_path = dir.join(format!("{}.{}", stem, extension));
        tokio::fs::write(&output_path, &bytes)
            .await
            .with_context(|| format!("Failed to write image to {:?}", output_path))?;

        Ok(output_path)
    }
}

#[async_trait]
impl ImageProvider for ImageClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.generate_url(prompt).await
    }

    async fn download(&self, url: &str, dir: &Path, stem: &str) -> Result<Option<PathBuf>> {
        self.download_to(url, dir, stem).await.map(Some)
    }
}

/// File extension from the image magic bytes, `bin` when unrecognised.
pub fn image_extension(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(format) => format.extensions_str().first().copied().unwrap_or("bin"),
        Err(_) => "bin",
    }
}
