//! Index synchronization service
//!
//! Listens to document events and forwards them to the coordinator as they
//! arrive. Embedding happens in the coordinator's background jobs, so the
//! listener never waits on a provider.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::coordinator::IndexCoordinator;
use super::error::SearchResult;
use crate::events::{DocumentEvent, SharedEventBus};

/// Index synchronization service
#[derive(Clone)]
pub struct IndexSyncService {
    coordinator: IndexCoordinator,
    enabled: Arc<AtomicBool>,
}

impl IndexSyncService {
    pub fn new(coordinator: IndexCoordinator) -> Self {
        Self {
            coordinator,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Enable or disable the service
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Check if the service is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Subscribe to the event bus and process events on a spawned task
    pub fn start(&self, event_bus: SharedEventBus) -> JoinHandle<()> {
        let receiver = event_bus.subscribe();
        let service = self.clone();
        log::info!("[IndexSync] Started");
        tokio::spawn(async move { service.run(receiver).await })
    }

    /// Event listener loop; returns when the bus is closed
    pub async fn run(&self, mut receiver: broadcast::Receiver<DocumentEvent>) {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if !self.is_enabled() {
                        log::debug!("[IndexSync] Disabled, ignoring {} event", event.kind());
                        continue;
                    }
                    if let Err(e) = self.apply(event) {
                        log::error!("[IndexSync] Failed to apply event: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("[IndexSync] Lagged behind by {} events", n);
                    self.coordinator.mark_events_lost(n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    log::info!("[IndexSync] Event bus closed, stopping");
                    break;
                }
            }
        }
    }

    /// Apply one event to the indexes
    pub fn apply(&self, event: DocumentEvent) -> SearchResult<()> {
        match event {
            DocumentEvent::Saved(document) => {
                let outcome = self.coordinator.on_document_saved(&document)?;
                log::debug!(
                    "[IndexSync] Indexed {} {} ({} chunks)",
                    document.kind(),
                    document.id(),
                    outcome.chunk_ids.len()
                );
            }
            DocumentEvent::Deleted { kind, parent_id } => {
                self.coordinator.on_document_deleted(kind, &parent_id)?;
            }
            DocumentEvent::AllDeleted { kind } => {
                self.coordinator.on_all_documents_deleted(kind)?;
            }
        }
        Ok(())
    }
}
