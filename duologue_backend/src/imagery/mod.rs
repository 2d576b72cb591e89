pub mod client;
pub mod gallery;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use regex_lite::Regex;

use crate::persona::Persona;

/// Anything that turns a prompt into a hosted image URL.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Keep a local copy of a generated image. Providers without download support
    /// return `None`.
    async fn download(&self, _url: &str, _dir: &Path, _stem: &str) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMarker {
    pub description: String,
    /// Byte range of the whole `[IMAGE: ...]` token in the source text.
    pub start: usize,
    pub end: usize,
}

fn marker_regex() -> Option<&'static Regex> {
    static MARKER: OnceLock<Option<Regex>> = OnceLock::new();
    MARKER
        .get_or_init(|| Regex::new(r"(?i)\[IMAGE:[ \t]*([^\]\n]+)\]").ok())
        .as_ref()
}

/// First `[IMAGE: ...]` marker on a single line, case-insensitive.
pub fn extract_image_marker(text: &str) -> Option<ImageMarker> {
    let captures = marker_regex()?.captures(text)?;
    let whole = captures.get(0)?;
    let description = captures.get(1)?.as_str().trim();
    if description.is_empty() {
        return None;
    }
    Some(ImageMarker {
        description: description.to_string(),
        start: whole.start(),
        end: whole.end(),
    })
}

pub fn stylize_prompt(style_prefix: &str, persona: &Persona, description: &str) -> String {
    let mut prompt = String::new();
    if !style_prefix.trim().is_empty() {
        prompt.push_str(style_prefix.trim());
        prompt.push_str(", ");
    }
    prompt.push_str(description.trim());
    if !persona.style.trim().is_empty() {
        prompt.push_str(&format!(" (mood: {})", persona.style.trim()));
    }
    prompt
}

/// One global last-fire timestamp shared by both personas.
#[derive(Debug)]
pub struct ImageCooldown {
    window: Duration,
    last_fired: Mutex<Option<Instant>>,
}

impl ImageCooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_fired: Mutex::new(None),
        }
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        match self.last_fired.lock() {
            Ok(guard) => match *guard {
                Some(last) => now.saturating_duration_since(last) >= self.window,
                None => true,
            },
            Err(_) => false,
        }
    }

    pub fn mark(&self, now: Instant) {
        if let Ok(mut guard) = self.last_fired.lock() {
            *guard = Some(now);
        }
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last_fired.lock() {
            Ok(guard) => guard
                .map(|last| self.window.saturating_sub(now.saturating_duration_since(last)))
                .unwrap_or_default(),
            Err(_) => self.window,
        }
    }
}

/// In-band image requests from generated text, rate-limited by the cooldown.
pub struct ImageSideChannel {
    provider: Option<Arc<dyn ImageProvider>>,
    style_prefix: String,
    cooldown: ImageCooldown,
}

impl ImageSideChannel {
    pub fn new(
        provider: Option<Arc<dyn ImageProvider>>,
        style_prefix: impl Into<String>,
        cooldown: Duration,
    ) -> Self {
        Self {
            provider,
            style_prefix: style_prefix.into(),
            cooldown: ImageCooldown::new(cooldown),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, String::new(), Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    pub fn cooldown(&self) -> &ImageCooldown {
        &self.cooldown
    }

    /// One attempt per marker. On a cooldown miss or failure the marker simply stays
    /// in the text and no image is attached.
    pub async fn resolve(&self, persona: &Persona, text: &str) -> Option<String> {
        let provider = self.provider.as_ref()?;
        let marker = extract_image_marker(text)?;

        let now = Instant::now();
        if !self.cooldown.is_ready(now) {
            tracing::debug!(
                "{} asked for an image but the cooldown has {}s left",
                persona.name,
                self.cooldown.remaining(now).as_secs()
            );
            return None;
        }

        let prompt = stylize_prompt(&self.style_prefix, persona, &marker.description);
        match provider.generate(&prompt).await {
            Ok(url) => {
                self.cooldown.mark(Instant::now());
                tracing::info!("Generated image for {}: {}", persona.name, url);
                Some(url)
            }
            Err(e) => {
                tracing::warn!("Image generation failed for {}: {:#}", persona.name, e);
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::persona::PersonaId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct FixedImage {
        pub url: Option<&'static str>,
        pub calls: AtomicUsize,
    }

    impl FixedImage {
        pub(crate) fn ok(url: &'static str) -> Arc<Self> {
            Arc::new(Self {
                url: Some(url),
                calls: AtomicUsize::new(0),
            })
        }

        pub(crate) fn failing() -> Arc<Self> {
            Arc::new(Self {
                url: None,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ImageProvider for FixedImage {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.url {
                Some(url) => Ok(url.to_string()),
                None => anyhow::bail!("image backend down"),
            }
        }
    }

    fn persona() -> Persona {
        Persona {
            id: PersonaId::A,
            name: "Aurora".to_string(),
            instructions: String::new(),
            style: "warm".to_string(),
        }
    }

    #[test]
    fn marker_is_case_insensitive_first_match() {
        let marker =
            extract_image_marker("Look! [image: a red door] and [IMAGE: a blue sky]").unwrap();
        assert_eq!(marker.description, "a red door");
        assert_eq!(marker.start, 6);
        assert_eq!(
            &"Look! [image: a red door] and [IMAGE: a blue sky]"[marker.start..marker.end],
            "[image: a red door]"
        );
    }

    #[test]
    fn marker_must_stay_on_one_line() {
        assert!(extract_image_marker("[IMAGE: a red\ndoor]").is_none());
        assert!(extract_image_marker("[IMAGE:   ]").is_none());
        assert!(extract_image_marker("no marker here").is_none());
    }

    #[test]
    fn stylized_prompt_includes_prefix_and_mood() {
        let prompt = stylize_prompt("Oil painting", &persona(), " a red door ");
        assert_eq!(prompt, "Oil painting, a red door (mood: warm)");
    }

    #[test]
    fn cooldown_window() {
        let cooldown = ImageCooldown::new(Duration::from_secs(600));
        let start = Instant::now();
        assert!(cooldown.is_ready(start));
        cooldown.mark(start);
        assert!(!cooldown.is_ready(start + Duration::from_secs(599)));
        assert!(cooldown.is_ready(start + Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn resolve_attaches_url_when_cooldown_expired() {
        let provider = FixedImage::ok("https://images.example/red-door.png");
        let channel = ImageSideChannel::new(
            Some(provider.clone() as Arc<dyn ImageProvider>),
            "Watercolor",
            Duration::from_secs(600),
        );

        let url = channel.resolve(&persona(), "Picture this [IMAGE: a red door]").await;
        assert_eq!(url.as_deref(), Some("https://images.example/red-door.png"));

        // Second marker inside the window is ignored without calling the backend.
        let again = channel.resolve(&persona(), "[IMAGE: a red door]").await;
        assert!(again.is_none());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_generation_leaves_cooldown_open() {
        let provider = FixedImage::failing();
        let channel = ImageSideChannel::new(
            Some(provider.clone() as Arc<dyn ImageProvider>),
            "",
            Duration::from_secs(600),
        );
        assert!(channel.resolve(&persona(), "[IMAGE: fog]").await.is_none());
        assert!(channel.cooldown().is_ready(Instant::now()));
        assert!(channel.resolve(&persona(), "[IMAGE: fog]").await.is_none());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disabled_channel_never_generates() {
        let channel = ImageSideChannel::disabled();
        assert!(!channel.is_enabled());
        assert!(channel.resolve(&persona(), "[IMAGE: fog]").await.is_none());
    }
}
