//! Transactional-outbox drainer.
//!
//! The RESERVED status flip writes its event into `outbox_events` inside
//! the same transaction; this task publishes pending rows and marks them,
//! so a reserved order can never lose its event to a broker hiccup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::broker::EventPublisher;
use crate::store::Store;

const DRAIN_INTERVAL: Duration = Duration::from_secs(1);
const DRAIN_BATCH: i64 = 100;

pub struct OutboxProcessor {
    store: Arc<dyn Store>,
    events: Arc<EventPublisher>,
}

impl OutboxProcessor {
    pub fn new(store: Arc<dyn Store>, events: Arc<EventPublisher>) -> Self {
        Self { store, events }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = time::interval(DRAIN_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("outbox processor shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = self.drain().await {
                        error!(%err, "outbox drain failed");
                    }
                }
            }
        }
    }

    /// Publishes pending rows oldest-first. A row is marked published only
    /// after the broker acknowledges; failures leave it for the next tick.
    pub async fn drain(&self) -> Result<usize> {
        let pending = self.store.unpublished_outbox(DRAIN_BATCH).await?;
        let mut published = 0;

        for row in pending {
            let key = shared::order_key(row.order_id);
            match self.events.raw(&key, row.payload.to_string()).await {
                Ok(()) => {
                    self.store.mark_outbox_published(row.id).await?;
                    published += 1;
                }
                Err(err) => {
                    error!(outbox_id = row.id, %err, "failed to publish outbox event");
                    continue;
                }
            }
        }

        Ok(published)
    }
}
