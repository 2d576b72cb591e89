use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flume::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::archive::{
    ArchiveManager, ArchiveOptions, ArchiveReason, ArchiveSink, GithubArchiveSink,
    LocalArchiveSink,
};
use crate::config::ServiceConfig;
use crate::conversation::ConversationStore;
use crate::events::{ConversationEvent, EventHub};
use crate::http_client::build_http_client_with_timeout;
use crate::imagery::client::ImageClient;
use crate::imagery::gallery::{GalleryGenerator, GalleryIndex};
use crate::imagery::{ImageProvider, ImageSideChannel};
use crate::llm_client::LlmClient;
use crate::memory::PersonaMemory;
use crate::persona::{PersonaId, PersonaPair};
use crate::responder::{LlmResponseSource, ResponseGenerator, ResponseSource};
use crate::scheduler::{SchedulerTiming, TurnScheduler};
use crate::server::{self, ServerState};
use crate::shutdown;

const EVENT_CAPACITY: usize = 256;
const GALLERY_CONTEXT_MESSAGES: usize = 3;

pub struct ServiceRuntime {
    pub config: ServiceConfig,
    pub scheduler: Arc<TurnScheduler>,
    pub archives: Arc<ArchiveManager>,
    pub gallery_index: Arc<GalleryIndex>,
    pub gallery: Option<Arc<GalleryGenerator>>,
    pub hub: EventHub,
    event_rx: Receiver<ConversationEvent>,
    background: CancellationToken,
}

impl ServiceRuntime {
    pub fn bootstrap(config: ServiceConfig) -> Result<Self> {
        let http = build_http_client_with_timeout(Duration::from_secs(
            config.timing.request_timeout_secs.max(1),
        ))?;
        let personas = PersonaPair::new(
            config.persona(PersonaId::A),
            config.persona(PersonaId::B),
        );

        let responder = ResponseGenerator::new(build_sources(&config, &http));
        tracing::info!("Response sources: {:?}", responder.source_names());

        let image_provider: Option<Arc<dyn ImageProvider>> =
            if config.image.enabled && config.image.api_key.is_some() {
                tracing::info!("Image generation enabled ({})", config.image.model);
                Some(Arc::new(ImageClient::new(&config.image, http.clone())))
            } else {
                tracing::info!("Image generation disabled");
                None
            };
        let images = ImageSideChannel::new(
            image_provider.clone(),
            config.image.style_prefix.clone(),
            Duration::from_secs(config.image.cooldown_secs),
        );

        let memory = match PersonaMemory::open(config.memory_db_path()) {
            Ok(memory) => Some(Arc::new(memory)),
            Err(e) => {
                tracing::warn!("Running without persona memory: {:#}", e);
                None
            }
        };

        let (event_tx, event_rx) = flume::unbounded();
        let hub = EventHub::new(EVENT_CAPACITY);

        let scheduler = Arc::new(TurnScheduler::new(
            ConversationStore::new(config.state_path()),
            personas.clone(),
            responder,
            images,
            memory.clone(),
            event_tx.clone(),
            SchedulerTiming::from_config(&config),
        ));

        let archives = Arc::new(build_archives(&config, http, memory));

        let gallery_index = Arc::new(GalleryIndex::open(config.gallery_index_path()));
        let gallery = match (&image_provider, config.gallery.enabled) {
            (Some(provider), true) => Some(Arc::new(GalleryGenerator::new(
                provider.clone(),
                gallery_index.clone(),
                personas,
                config.gallery.prompts.clone(),
                config.image.style_prefix.clone(),
                config
                    .gallery
                    .keep_local_copy
                    .then(|| config.gallery_dir()),
                event_tx,
            ))),
            (None, true) => {
                tracing::warn!("Gallery is enabled but image generation is not configured");
                None
            }
            _ => None,
        };

        Ok(Self {
            config,
            scheduler,
            archives,
            gallery_index,
            gallery,
            hub,
            event_rx,
            background: CancellationToken::new(),
        })
    }

    pub fn server_state(&self) -> Arc<ServerState> {
        Arc::new(ServerState {
            scheduler: self.scheduler.clone(),
            archives: self.archives.clone(),
            gallery: self.gallery_index.clone(),
            hub: self.hub.clone(),
            admin_code: self.config.admin_code.clone(),
            keepalive: Duration::from_secs(self.config.timing.keepalive_secs.max(1)),
        })
    }

    /// Event bridge, hourly archives, gallery timer and crash recovery.
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        self.hub.spawn_bridge(self.event_rx.clone());

        let mut handles = Vec::new();
        if self.archives.has_sinks() {
            handles.push(tokio::spawn(archive_loop(
                self.scheduler.clone(),
                self.archives.clone(),
                Duration::from_secs(self.config.archive.interval_secs.max(60)),
                self.background.clone(),
            )));
        } else {
            tracing::warn!("No archive destination configured; hourly archives are off");
        }

        if let Some(gallery) = &self.gallery {
            handles.push(tokio::spawn(gallery_loop(
                self.scheduler.clone(),
                gallery.clone(),
                Duration::from_secs(self.config.gallery.interval_secs.max(60)),
                self.background.clone(),
            )));
        }

        let scheduler = self.scheduler.clone();
        handles.push(tokio::spawn(async move {
            scheduler.resume_if_flagged().await;
        }));
        handles
    }

    /// Archive to every sink and flush state. Used on signals and fatal errors.
    pub async fn archive_on_exit(&self, reason: ArchiveReason) {
        let snapshot = self.scheduler.snapshot().await;
        if self.archives.has_sinks() {
            let outcome = self.archives.archive(&snapshot, reason).await;
            if !outcome.any_succeeded() {
                tracing::error!("Exit archive {} was not written anywhere", outcome.filename);
            }
        }
        self.scheduler.flush().await;
    }

    /// Bind, run until a shutdown signal, archive on the way out.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind server to {}", self.config.bind_addr))?;

        shutdown::install_panic_hook(self.scheduler.clone(), self.archives.clone());
        self.spawn_background_tasks();

        let runtime = self.clone();
        let on_signal = async move {
            shutdown::shutdown_signal().await;
            tracing::info!("Shutdown requested; archiving before exit");
            runtime.background.cancel();
            runtime.archive_on_exit(ArchiveReason::Shutdown).await;
        };

        let result = server::serve(listener, self.server_state(), on_signal).await;
        if let Err(e) = &result {
            tracing::error!("Server stopped unexpectedly: {:#}", e);
            self.archive_on_exit(ArchiveReason::Emergency).await;
        }
        self.background.cancel();
        result
    }
}

fn build_sources(config: &ServiceConfig, http: &reqwest::Client) -> Vec<Arc<dyn ResponseSource>> {
    let mut sources: Vec<Arc<dyn ResponseSource>> = Vec::new();
    if config.local_llm.enabled {
        sources.push(Arc::new(LlmResponseSource::new(
            "local",
            LlmClient::new(&config.local_llm, http.clone()),
        )));
    }
    if config.llm.enabled {
        if config.llm.api_key.is_some() {
            sources.push(Arc::new(LlmResponseSource::new(
                "remote",
                LlmClient::new(&config.llm, http.clone()),
            )));
        } else {
            tracing::warn!("Remote LLM enabled but no API key set; skipping it");
        }
    }
    if sources.is_empty() {
        tracing::warn!("No LLM configured; personas will use fallback lines");
    }
    sources
}

fn build_archives(
    config: &ServiceConfig,
    http: reqwest::Client,
    memory: Option<Arc<PersonaMemory>>,
) -> ArchiveManager {
    let local = config
        .archive
        .local_enabled
        .then(|| Arc::new(LocalArchiveSink::new(config.archive_dir())));
    let remote = GithubArchiveSink::from_config(&config.archive.github, http).map(|sink| {
        tracing::info!("Remote archives go to GitHub repo {}", sink.repo());
        Arc::new(sink) as Arc<dyn ArchiveSink>
    });
    ArchiveManager::new(
        local,
        remote,
        memory,
        ArchiveOptions {
            include_memories: config.archive.include_memories,
            memory_limit: config.archive.memory_limit,
            remote_cache_ttl: Duration::from_secs(config.archive.remote_cache_secs),
        },
    )
}

async fn archive_loop(
    scheduler: Arc<TurnScheduler>,
    archives: Arc<ArchiveManager>,
    every: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = scheduler.snapshot().await;
                let archives = archives.clone();
                // Fire and forget so a slow sink never delays the next tick.
                tokio::spawn(async move {
                    archives.run_scheduled(&snapshot).await;
                });
            }
        }
    }
}

async fn gallery_loop(
    scheduler: Arc<TurnScheduler>,
    gallery: Arc<GalleryGenerator>,
    every: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let context = scheduler
                    .snapshot()
                    .await
                    .recent(GALLERY_CONTEXT_MESSAGES)
                    .to_vec();
                match gallery.run_once(&context).await {
                    Ok(artifact) => {
                        tracing::info!("Gallery image {} credited to {}", artifact.id, artifact.agent)
                    }
                    Err(e) => tracing::warn!("Gallery generation failed: {:#}", e),
                }
            }
        }
    }
}
