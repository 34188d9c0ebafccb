use crate::{ControllerError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use rampart_core::ResourceEvent;
use rampart_storage::ObjectStore;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A worker fed by the object store's watch bus
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// React to one store event
    async fn handle_event(&self, event: &ResourceEvent) -> Result<()>;

    /// Rebuild from a full listing of the store
    async fn resync(&self) -> Result<()>;

    /// Periodic hook; resyncs by default
    async fn tick(&self) -> Result<()> {
        self.resync().await
    }
}

/// Drive `handler` until `token` is cancelled.
///
/// The subscription is taken before the initial listing so nothing written
/// in between is missed. A lagged receiver lost events and triggers a resync.
pub async fn run_watch(
    handler: &dyn EventHandler,
    store: &ObjectStore,
    tick_every: Duration,
    token: CancellationToken,
) -> Result<()> {
    let mut events = BroadcastStream::new(store.subscribe());
    handler.resync().await?;
    info!(worker = handler.name(), "Watch started");

    let mut ticks = tokio::time::interval(tick_every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticks.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!(worker = handler.name(), "Watch shutting down");
                return Ok(());
            }
            event = events.next() => match event {
                Some(Ok(event)) => {
                    if let Err(e) = handler.handle_event(&event).await {
                        warn!(
                            worker = handler.name(),
                            resource = %event.resource_key,
                            "Failed to handle event: {}", e
                        );
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    warn!(worker = handler.name(), missed, "Watch lagged, resyncing");
                    if let Err(e) = handler.resync().await {
                        error!(worker = handler.name(), "Resync failed: {}", e);
                    }
                }
                None => return Err(ControllerError::WatchClosed),
            },
            _ = ticks.tick() => {
                if let Err(e) = handler.tick().await {
                    error!(worker = handler.name(), "Periodic pass failed: {}", e);
                }
            }
        }
    }
}
