use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::conversation::{ConversationState, ConversationStore, Message};
use crate::events::{ConversationEvent, EventSender};
use crate::imagery::ImageSideChannel;
use crate::memory::PersonaMemory;
use crate::persona::PersonaPair;
use crate::responder::{ResponseGenerator, ResponseRequest, CONTEXT_WINDOW};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerTiming {
    pub initial_delay: Duration,
    pub turn_min: Duration,
    pub turn_max: Duration,
}

impl SchedulerTiming {
    pub fn from_config(config: &ServiceConfig) -> Self {
        let (min, max) = config.turn_window_secs();
        Self {
            initial_delay: Duration::from_secs(config.timing.initial_delay_secs),
            turn_min: Duration::from_secs(min),
            turn_max: Duration::from_secs(max),
        }
    }

    /// Uniform pick inside the turn window.
    pub fn next_delay(&self) -> Duration {
        let min = self.turn_min.as_millis() as u64;
        let max = (self.turn_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

impl Default for SchedulerTiming {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            turn_min: Duration::from_secs(25),
            turn_max: Duration::from_secs(35),
        }
    }
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn sleep_or_cancel(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Owns the conversation and drives the alternating turns.
///
/// Running is tracked by a live cancellation token; the persisted `isRunning` flag
/// only mirrors it for readers and crash recovery.
pub struct TurnScheduler {
    state: tokio::sync::Mutex<ConversationState>,
    store: ConversationStore,
    personas: PersonaPair,
    responder: ResponseGenerator,
    images: ImageSideChannel,
    memory: Option<Arc<PersonaMemory>>,
    event_tx: EventSender,
    timing: SchedulerTiming,
    running: Mutex<Option<CancellationToken>>,
}

impl TurnScheduler {
    pub fn new(
        store: ConversationStore,
        personas: PersonaPair,
        responder: ResponseGenerator,
        images: ImageSideChannel,
        memory: Option<Arc<PersonaMemory>>,
        event_tx: EventSender,
        timing: SchedulerTiming,
    ) -> Self {
        let state = store.load();
        Self {
            state: tokio::sync::Mutex::new(state),
            store,
            personas,
            responder,
            images,
            memory,
            event_tx,
            timing,
            running: Mutex::new(None),
        }
    }

    pub fn personas(&self) -> &PersonaPair {
        &self.personas
    }

    pub fn memory(&self) -> Option<&Arc<PersonaMemory>> {
        self.memory.as_ref()
    }

    pub fn responder(&self) -> &ResponseGenerator {
        &self.responder
    }

    fn emit(&self, event: ConversationEvent) {
        if self.event_tx.send(event).is_err() {
            tracing::debug!("Event channel closed; dropping event");
        }
    }

    /// Whether a turn cycle is currently live.
    pub fn is_active(&self) -> bool {
        match self.running.lock() {
            Ok(running) => running.as_ref().is_some_and(|t| !t.is_cancelled()),
            Err(_) => false,
        }
    }

    pub async fn snapshot(&self) -> ConversationState {
        self.state.lock().await.clone()
    }

    /// Non-blocking read for contexts that cannot await. `None` while a writer holds the lock.
    pub fn try_snapshot(&self) -> Option<ConversationState> {
        self.state.try_lock().ok().map(|state| state.clone())
    }

    pub async fn flush(&self) {
        let state = self.state.lock().await;
        self.store.save(&state);
    }

    /// Synchronous save from the last known state, skipped if the lock is held.
    pub fn flush_blocking(&self) -> bool {
        match self.state.try_lock() {
            Ok(state) => self.store.try_save(&state).is_ok(),
            Err(_) => false,
        }
    }

    /// Returns `false` when already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let token = {
            let Ok(mut running) = self.running.lock() else {
                tracing::error!("Scheduler lock poisoned; refusing to start");
                return false;
            };
            if running.as_ref().is_some_and(|t| !t.is_cancelled()) {
                return false;
            }
            let token = CancellationToken::new();
            *running = Some(token.clone());
            token
        };

        let opening = {
            let mut state = self.state.lock().await;
            state.is_running = true;
            let opening = if state.messages.is_empty() {
                let message = Message::system(format!(
                    "Conversation started between {} and {}.",
                    self.personas.a.name, self.personas.b.name
                ));
                state.push_message(message.clone());
                Some(message)
            } else {
                None
            };
            self.store.save(&state);
            opening
        };

        tracing::info!(
            "Conversation started ({} and {})",
            self.personas.a.name,
            self.personas.b.name
        );
        self.emit(ConversationEvent::Status { is_running: true });
        if let Some(message) = opening {
            self.emit(ConversationEvent::Message { message });
        }

        tokio::spawn(Arc::clone(self).run_cycle(token));
        true
    }

    /// Returns whether a cycle was live. Always leaves the persisted flag false.
    pub async fn stop(&self) -> bool {
        let token = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(_) => None,
        };
        let was_running = token.as_ref().is_some_and(|t| !t.is_cancelled());
        if let Some(token) = token {
            token.cancel();
        }

        {
            let mut state = self.state.lock().await;
            state.is_running = false;
            self.store.save(&state);
        }

        tracing::info!("Conversation stopped");
        self.emit(ConversationEvent::Status { is_running: false });
        was_running
    }

    pub async fn reset(&self) {
        self.stop().await;
        {
            let mut state = self.state.lock().await;
            *state = ConversationState::default();
            self.store.save(&state);
        }
        tracing::info!("Conversation reset");
        self.emit(ConversationEvent::Reset);
    }

    /// A persisted running flag without a live cycle means the process died mid-run.
    pub async fn resume_if_flagged(self: &Arc<Self>) -> bool {
        let flagged = self.state.lock().await.is_running;
        if !flagged || self.is_active() {
            return false;
        }
        tracing::info!("Resuming conversation that was running before restart");
        self.start().await
    }

    async fn run_cycle(self: Arc<Self>, token: CancellationToken) {
        if !sleep_or_cancel(&token, self.timing.initial_delay).await {
            return;
        }
        loop {
            self.run_turn(&token).await;
            if token.is_cancelled() {
                break;
            }
            let delay = self.timing.next_delay();
            tracing::debug!("Next turn in {:.1}s", delay.as_secs_f32());
            if !sleep_or_cancel(&token, delay).await {
                break;
            }
        }
        tracing::debug!("Turn cycle ended");
    }

    /// One turn for whoever holds `currentTurn`. The state lock is never held across
    /// the generation calls; a stop during generation discards the result.
    pub async fn run_turn(&self, token: &CancellationToken) -> Option<Message> {
        let (turn, history) = {
            let state = self.state.lock().await;
            (state.current_turn, state.recent(CONTEXT_WINDOW).to_vec())
        };
        let speaker = self.personas.get(turn);
        let partner = self.personas.get(turn.other());

        let request = ResponseRequest {
            speaker,
            partner,
            history: &history,
            allow_images: self.images.is_enabled(),
        };
        let content = self.responder.generate(&request).await;
        let image = self.images.resolve(speaker, &content).await;

        if token.is_cancelled() {
            tracing::debug!("Discarding {}'s turn; conversation was stopped", speaker.name);
            return None;
        }

        let message = Message::new(speaker.name.clone(), content, image);
        {
            let mut state = self.state.lock().await;
            if token.is_cancelled() {
                tracing::debug!(
                    "Discarding {}'s turn; stopped while waiting to commit",
                    speaker.name
                );
                return None;
            }
            if state.current_turn != turn {
                tracing::warn!("Turn changed underneath {}; discarding reply", speaker.name);
                return None;
            }
            state.commit_turn(message.clone());
            self.store.save(&state);
        }

        if let Some(memory) = &self.memory {
            if let Err(e) = memory.record(&speaker.name, &message.content) {
                tracing::warn!("Failed to record memory for {}: {:#}", speaker.name, e);
            }
        }

        tracing::info!(
            "{}: {}",
            speaker.name,
            message.content.chars().take(80).collect::<String>()
        );
        self.emit(ConversationEvent::Message {
            message: message.clone(),
        });
        Some(message)
    }
}
