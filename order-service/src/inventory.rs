//! Inventory coordination between the stock cache (fast path) and the
//! durable store (authoritative fallback).

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::cache::StockCache;
use crate::models::Inventory;
use crate::store::{Store, StoreError};

/// Deadline for the detached database mirror of a cache-granted
/// reservation. Deliberately independent of the originating request so a
/// client disconnect cannot leak the drift.
const MIRROR_TIMEOUT: Duration = Duration::from_secs(5);

pub struct InventoryService {
    store: Arc<dyn Store>,
    cache: Arc<dyn StockCache>,
}

impl InventoryService {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn StockCache>) -> Self {
        Self { store, cache }
    }

    /// Attempts to reserve `quantity` units. Returns `Ok(false)` when stock
    /// is insufficient; only infrastructure failures surface as errors.
    pub async fn reserve(&self, product_id: i64, quantity: i32) -> Result<bool, StoreError> {
        match self.cache.reserve(product_id, quantity).await {
            Ok(false) => Ok(false),
            Ok(true) => {
                let store = Arc::clone(&self.store);
                tokio::spawn(async move {
                    match tokio::time::timeout(
                        MIRROR_TIMEOUT,
                        store.reserve_stock_tx(product_id, quantity),
                    )
                    .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => error!(
                            product_id,
                            %err,
                            "failed to mirror reservation to database"
                        ),
                        Err(_) => error!(product_id, "reservation mirror timed out"),
                    }
                });
                Ok(true)
            }
            Err(err) => {
                warn!(
                    product_id,
                    %err,
                    "stock cache unavailable, falling back to database"
                );
                match self.store.reserve_stock_tx(product_id, quantity).await {
                    Ok(()) => Ok(true),
                    Err(StoreError::InsufficientStock { .. }) => Ok(false),
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Compensates an earlier reservation. Cache failures are logged and
    /// left to reconciliation; the durable update is what must land.
    pub async fn release(&self, product_id: i64, quantity: i32) -> Result<(), StoreError> {
        if let Err(err) = self.cache.release(product_id, quantity).await {
            error!(product_id, %err, "failed to release stock in cache");
        }
        if !self.store.release_stock(product_id, quantity).await? {
            warn!(product_id, "no inventory row matched stock release");
        }
        Ok(())
    }

    /// Finalizes a reservation after successful payment.
    pub async fn commit(&self, product_id: i64, quantity: i32) -> Result<(), StoreError> {
        match self.cache.commit(product_id, quantity).await {
            Ok(true) => {}
            Ok(false) => warn!(product_id, "cache had fewer units reserved than committed"),
            Err(err) => error!(product_id, %err, "failed to commit stock in cache"),
        }
        if !self.store.commit_stock(product_id, quantity).await? {
            warn!(product_id, "no inventory row matched stock commit");
        }
        Ok(())
    }

    /// Seeds the cache from the durable record for every product. Returns
    /// the number of products synced; per-product failures are logged and
    /// skipped (the database fallback keeps reservations correct).
    pub async fn sync_to_cache(&self) -> Result<usize, StoreError> {
        let products = self.store.products().await?;
        let mut synced = 0;
        for product in &products {
            let row = match self.store.inventory(product.id).await {
                Ok(Some(row)) => row,
                Ok(None) => {
                    warn!(product_id = product.id, "product has no inventory row");
                    continue;
                }
                Err(err) => {
                    error!(product_id = product.id, %err, "failed to load inventory");
                    continue;
                }
            };
            if let Err(err) = self.cache.init(product.id, row.available, row.reserved).await {
                error!(product_id = product.id, %err, "failed to seed stock cache");
                continue;
            }
            synced += 1;
        }
        Ok(synced)
    }

    pub async fn inventory(&self, product_id: i64) -> Result<Option<Inventory>, StoreError> {
        self.store.inventory(product_id).await
    }
}
