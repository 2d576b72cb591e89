use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::conversation::Message;
use crate::imagery::gallery::ImageArtifact;

/// State-change notifications fanned out to every connected viewer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConversationEvent {
    Message {
        message: Message,
    },
    Status {
        #[serde(rename = "isRunning")]
        is_running: bool,
    },
    Viewers {
        count: usize,
    },
    Reset,
    Image {
        data: ImageArtifact,
    },
}

pub type EventSender = flume::Sender<ConversationEvent>;

/// Broadcast side of the hub. Producers push into a flume channel; the bridge
/// forwards into a tokio broadcast channel that each websocket subscribes to.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<ConversationEvent>,
    viewers: Arc<AtomicUsize>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            viewers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.tx.subscribe()
    }

    /// Best effort; no subscribers is not an error.
    pub fn publish(&self, event: ConversationEvent) {
        let _ = self.tx.send(event);
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.load(Ordering::SeqCst)
    }

    /// Registers a viewer and announces the new count. Dropping the guard unregisters.
    pub fn connect_viewer(&self) -> ViewerGuard {
        let count = self.viewers.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("Viewer connected ({} watching)", count);
        self.publish(ConversationEvent::Viewers { count });
        ViewerGuard { hub: self.clone() }
    }

    pub fn spawn_bridge(&self, event_rx: flume::Receiver<ConversationEvent>) {
        let hub = self.clone();
        tokio::spawn(async move {
            while let Ok(event) = event_rx.recv_async().await {
                hub.publish(event);
            }
            tracing::debug!("Event bridge closed");
        });
    }
}

pub struct ViewerGuard {
    hub: EventHub,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let count = self
            .hub
            .viewers
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        tracing::debug!("Viewer disconnected ({} watching)", count);
        self.hub.publish(ConversationEvent::Viewers { count });
    }
}
