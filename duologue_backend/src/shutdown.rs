use std::sync::Arc;

use crate::archive::ArchiveManager;
use crate::scheduler::TurnScheduler;

/// Resolves on ctrl-c, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received ctrl-c"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

/// On panic, write a local emergency archive and flush state synchronously, then
/// hand over to the previously installed hook so the panic still propagates.
pub fn install_panic_hook(scheduler: Arc<TurnScheduler>, archives: Arc<ArchiveManager>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        emergency_snapshot(&scheduler, &archives);
        previous(info);
    }));
}

/// Best effort from any thread. Skips the archive if the state lock is held, since
/// the panicking thread may be the one holding it.
pub fn emergency_snapshot(scheduler: &TurnScheduler, archives: &ArchiveManager) -> bool {
    let Some(state) = scheduler.try_snapshot() else {
        eprintln!("duologue: state locked during panic; skipping emergency archive");
        return false;
    };
    let archived = archives.emergency_archive_blocking(&state);
    match &archived {
        Some(path) => eprintln!("duologue: emergency archive written to {}", path.display()),
        None => eprintln!("duologue: emergency archive unavailable"),
    }
    scheduler.flush_blocking();
    archived.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveOptions, LocalArchiveSink};
    use crate::conversation::ConversationStore;
    use crate::imagery::ImageSideChannel;
    use crate::persona::{Persona, PersonaId, PersonaPair};
    use crate::responder::ResponseGenerator;
    use crate::scheduler::SchedulerTiming;

    #[tokio::test]
    async fn emergency_snapshot_archives_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let persona = |id, name: &str| Persona {
            id,
            name: name.to_string(),
            instructions: String::new(),
            style: String::new(),
        };
        let (tx, _rx) = flume::unbounded();
        let scheduler = Arc::new(TurnScheduler::new(
            ConversationStore::new(dir.path().join("state.json")),
            PersonaPair::new(persona(PersonaId::A, "Aurora"), persona(PersonaId::B, "Basalt")),
            ResponseGenerator::new(Vec::new()),
            ImageSideChannel::disabled(),
            None,
            tx,
            SchedulerTiming {
                initial_delay: std::time::Duration::from_secs(3600),
                ..SchedulerTiming::default()
            },
        ));
        let archives = ArchiveManager::new(
            Some(Arc::new(LocalArchiveSink::new(dir.path().join("archives")))),
            None,
            None,
            ArchiveOptions::default(),
        );
        scheduler.start().await;
        std::fs::remove_file(dir.path().join("state.json")).unwrap();

        assert!(emergency_snapshot(&scheduler, &archives));
        let names = crate::archive::local::list_filenames_blocking(&dir.path().join("archives"));
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with("_emergency.json"));
        assert!(dir.path().join("state.json").exists());
        scheduler.stop().await;
    }
}
