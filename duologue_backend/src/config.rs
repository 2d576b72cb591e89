use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::persona::{Persona, PersonaId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub name: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub style: String,
}

impl PersonaConfig {
    pub fn to_persona(&self, id: PersonaId) -> Persona {
        Persona {
            id,
            name: self.name.clone(),
            instructions: self.instructions.clone(),
            style: self.style.clone(),
        }
    }
}

fn default_persona_a() -> PersonaConfig {
    PersonaConfig {
        name: "Aurora".to_string(),
        instructions: "You are an optimistic dreamer who sees possibility everywhere. \
                       Ask bold questions and build on what your partner says."
            .to_string(),
        style: "warm, curious, poetic".to_string(),
    }
}

fn default_persona_b() -> PersonaConfig {
    PersonaConfig {
        name: "Basalt".to_string(),
        instructions: "You are a grounded skeptic who tests ideas against reality. \
                       Challenge assumptions politely and offer concrete examples."
            .to_string(),
        style: "dry, precise, quietly funny".to_string(),
    }
}

/// OpenAI-compatible chat completion endpoint (Ollama, LM Studio, vLLM, OpenAI, etc.)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_llm_url")]
    pub api_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_true() -> bool {
    true
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_local_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_local_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_temperature() -> f32 {
    0.9
}

fn default_max_tokens() -> u32 {
    400
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: default_llm_url(),
            model: default_llm_model(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl LlmConfig {
    fn local_default() -> Self {
        Self {
            enabled: false,
            api_url: default_local_llm_url(),
            model: default_local_llm_model(),
            ..Self::default()
        }
    }
}

fn default_local_llm() -> LlmConfig {
    LlmConfig::local_default()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_image_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_image_model")]
    pub model: String,
    #[serde(default = "default_image_size")]
    pub size: String,
    #[serde(default = "default_style_prefix")]
    pub style_prefix: String,
    #[serde(default = "default_image_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_image_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_image_model() -> String {
    "dall-e-3".to_string()
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

fn default_style_prefix() -> String {
    "Dreamlike digital painting, soft light, rich texture".to_string()
}

fn default_image_cooldown_secs() -> u64 {
    600
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: default_image_url(),
            api_key: None,
            model: default_image_model(),
            size: default_image_size(),
            style_prefix: default_style_prefix(),
            cooldown_secs: default_image_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_gallery_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_true")]
    pub keep_local_copy: bool,
    /// Curated prompts the scheduled generator cycles through. Empty uses the built-in list.
    #[serde(default)]
    pub prompts: Vec<String>,
}

fn default_gallery_interval_secs() -> u64 {
    1800
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_gallery_interval_secs(),
            keep_local_copy: true,
            prompts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubArchiveConfig {
    /// `owner/name`
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_github_branch")]
    pub branch: String,
    #[serde(default = "default_github_prefix")]
    pub path_prefix: String,
}

fn default_github_branch() -> String {
    "main".to_string()
}

fn default_github_prefix() -> String {
    "archives".to_string()
}

impl Default for GithubArchiveConfig {
    fn default() -> Self {
        Self {
            repo: None,
            token: None,
            branch: default_github_branch(),
            path_prefix: default_github_prefix(),
        }
    }
}

impl GithubArchiveConfig {
    pub fn is_configured(&self) -> bool {
        let filled = |value: &Option<String>| {
            value
                .as_deref()
                .map(|v| !v.trim().is_empty())
                .unwrap_or(false)
        };
        filled(&self.repo) && filled(&self.token)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_true")]
    pub local_enabled: bool,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub github: GithubArchiveConfig,
    #[serde(default = "default_archive_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_remote_cache_secs")]
    pub remote_cache_secs: u64,
    #[serde(default = "default_true")]
    pub include_memories: bool,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: usize,
}

fn default_archive_interval_secs() -> u64 {
    3600
}

fn default_remote_cache_secs() -> u64 {
    300
}

fn default_memory_limit() -> usize {
    500
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            local_enabled: true,
            dir: None,
            github: GithubArchiveConfig::default(),
            interval_secs: default_archive_interval_secs(),
            remote_cache_secs: default_remote_cache_secs(),
            include_memories: true,
            memory_limit: default_memory_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_turn_min_secs")]
    pub turn_min_secs: u64,
    #[serde(default = "default_turn_max_secs")]
    pub turn_max_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

fn default_initial_delay_secs() -> u64 {
    5
}

fn default_turn_min_secs() -> u64 {
    25
}

fn default_turn_max_secs() -> u64 {
    35
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_keepalive_secs() -> u64 {
    25
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            turn_min_secs: default_turn_min_secs(),
            turn_max_secs: default_turn_max_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // Shared secret for start/stop/reset/archive. Unset means admin actions are always rejected.
    #[serde(default)]
    pub admin_code: Option<String>,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub state_path: Option<String>,

    #[serde(default = "default_persona_a")]
    pub persona_a: PersonaConfig,
    #[serde(default = "default_persona_b")]
    pub persona_b: PersonaConfig,

    // Paid endpoint, tried after the local one
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default = "default_local_llm")]
    pub local_llm: LlmConfig,

    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub gallery: GalleryConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|dir| dir.join("duologue"))
        .unwrap_or_else(|| PathBuf::from("data"))
        .to_string_lossy()
        .into_owned()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            admin_code: None,
            data_dir: default_data_dir(),
            state_path: None,
            persona_a: default_persona_a(),
            persona_b: default_persona_b(),
            llm: LlmConfig::default(),
            local_llm: LlmConfig::local_default(),
            image: ImageConfig::default(),
            gallery: GalleryConfig::default(),
            archive: ArchiveConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// `DUOLOGUE_CONFIG` if set, otherwise duologue_config.toml next to the executable
    pub fn config_path() -> PathBuf {
        env::var("DUOLOGUE_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::get_base_dir().join("duologue_config.toml"))
    }

    /// Load config from file, then apply environment overrides
    pub fn load() -> Self {
        let path = Self::config_path();
        let mut config = match Self::load_from(&path) {
            Ok(Some(config)) => {
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Ok(None) => {
                tracing::warn!("No config file at {:?}, using defaults + env vars", path);
                Self::default()
            }
            Err(e) => {
                tracing::error!("Failed to parse {:?}: {:#}", path, e);
                Self::default()
            }
        };
        config.apply_env();
        config
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        };
        let config = toml::from_str::<ServiceConfig>(&contents)
            .with_context(|| format!("Invalid config in {:?}", path))?;
        Ok(Some(config))
    }

    pub fn apply_env(&mut self) {
        if let Some(bind) = env_string("DUOLOGUE_BIND") {
            self.bind_addr = bind;
        }
        if let Some(code) = env_string("DUOLOGUE_ADMIN_CODE") {
            self.admin_code = Some(code);
        }
        if let Some(dir) = env_string("DUOLOGUE_DATA_DIR") {
            self.data_dir = dir;
        }

        if let Some(url) = env_string("LLM_API_URL") {
            self.llm.api_url = url;
        }
        if let Some(model) = env_string("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(key) = env_string("LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(url) = env_string("LOCAL_LLM_API_URL") {
            self.local_llm.api_url = url;
            self.local_llm.enabled = true;
        }
        if let Some(model) = env_string("LOCAL_LLM_MODEL") {
            self.local_llm.model = model;
        }

        if let Some(url) = env_string("IMAGE_API_URL") {
            self.image.api_url = url;
        }
        if let Some(key) = env_string("IMAGE_API_KEY") {
            self.image.api_key = Some(key);
        }
        if let Some(enabled) = env_flag("DUOLOGUE_ENABLE_IMAGES") {
            self.image.enabled = enabled;
        }
        if let Some(enabled) = env_flag("DUOLOGUE_ENABLE_GALLERY") {
            self.gallery.enabled = enabled;
        }

        if let Some(token) = env_string("GITHUB_TOKEN") {
            self.archive.github.token = Some(token);
        }
        if let Some(repo) = env_string("GITHUB_REPO") {
            self.archive.github.repo = Some(repo);
        }
        if let Some(branch) = env_string("GITHUB_BRANCH") {
            self.archive.github.branch = branch;
        }
    }

    pub fn persona(&self, id: PersonaId) -> Persona {
        match id {
            PersonaId::A => self.persona_a.to_persona(PersonaId::A),
            PersonaId::B => self.persona_b.to_persona(PersonaId::B),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.data_dir().join("conversation_state.json"))
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.archive
            .dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.data_dir().join("archives"))
    }

    pub fn gallery_dir(&self) -> PathBuf {
        self.data_dir().join("gallery")
    }

    pub fn gallery_index_path(&self) -> PathBuf {
        self.gallery_dir().join("index.json")
    }

    pub fn memory_db_path(&self) -> PathBuf {
        self.data_dir().join("persona_memory.db")
    }

    /// Turn window bounds, ordered even if configured backwards
    pub fn turn_window_secs(&self) -> (u64, u64) {
        let min = self.timing.turn_min_secs;
        let max = self.timing.turn_max_secs;
        if min <= max {
            (min, max)
        } else {
            (max, min)
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_flag(key: &str) -> Option<bool> {
    env::var(key).ok().map(|enabled| {
        enabled.eq_ignore_ascii_case("1")
            || enabled.eq_ignore_ascii_case("true")
            || enabled.eq_ignore_ascii_case("yes")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: ServiceConfig = toml::from_str(
            r#"
admin_code = "letmein"
data_dir = "/tmp/duologue-test"

[persona_a]
name = "Ivy"

[timing]
turn_min_secs = 40
"#,
        )
        .unwrap();

        assert_eq!(config.admin_code.as_deref(), Some("letmein"));
        assert_eq!(config.persona_a.name, "Ivy");
        assert!(config.persona_a.instructions.is_empty());
        assert_eq!(config.persona_b.name, "Basalt");
        assert_eq!(config.timing.turn_min_secs, 40);
        assert_eq!(config.timing.turn_max_secs, 35);
        assert_eq!(config.image.cooldown_secs, 600);
        assert!(!config.local_llm.enabled);
        assert!(config.llm.enabled);
        assert_eq!(
            config.state_path(),
            PathBuf::from("/tmp/duologue-test/conversation_state.json")
        );
    }

    #[test]
    fn turn_window_is_ordered() {
        let mut config = ServiceConfig::default();
        config.timing.turn_min_secs = 40;
        // turn_max_secs stays 35
        assert_eq!(config.turn_window_secs(), (35, 40));
    }

    #[test]
    fn github_archive_requires_repo_and_token() {
        let mut github = GithubArchiveConfig::default();
        assert!(!github.is_configured());
        github.repo = Some("owner/archive".to_string());
        assert!(!github.is_configured());
        github.token = Some("  ".to_string());
        assert!(!github.is_configured());
        github.token = Some("ghp_abc".to_string());
        assert!(github.is_configured());
    }

    #[test]
    fn load_from_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = ServiceConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn load_from_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "bind_addr = [").unwrap();
        assert!(ServiceConfig::load_from(&path).is_err());
    }
}
