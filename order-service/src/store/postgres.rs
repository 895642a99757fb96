use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use scoped_futures::ScopedFutureExt;
use uuid::Uuid;

use super::{Store, StoreError};
use crate::models::{
    Inventory, NewOrder, NewOrderItem, NewOutboxEvent, NewPayment, Order, OrderItem, OrderStatus,
    OutboxEvent, Payment, PaymentStatus, Product,
};
use crate::schema::{
    inventory, order_items, orders, outbox_events, payments, processed_events, products,
};

type DbPool = Pool<AsyncPgConnection>;

/// PostgreSQL-backed store. Row-level locking in [`Store::reserve_stock_tx`]
/// serializes concurrent reservations on the fallback path.
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(
        &self,
    ) -> Result<diesel_async::pooled_connection::bb8::PooledConnection<'_, AsyncPgConnection>, StoreError>
    {
        self.pool
            .get()
            .await
            .map_err(|err| StoreError::Pool(err.to_string()))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn product_by_id(&self, id: i64) -> Result<Option<Product>, StoreError> {
        let mut conn = self.conn().await?;
        let product = products::table
            .filter(products::id.eq(id))
            .first::<Product>(&mut conn)
            .await
            .optional()?;
        Ok(product)
    }

    async fn products_by_ids(&self, ids: &[i64]) -> Result<Vec<Product>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let found = products::table
            .filter(products::id.eq_any(ids))
            .load::<Product>(&mut conn)
            .await?;
        Ok(found)
    }

    async fn products(&self) -> Result<Vec<Product>, StoreError> {
        let mut conn = self.conn().await?;
        let all = products::table
            .order(products::id.asc())
            .load::<Product>(&mut conn)
            .await?;
        Ok(all)
    }

    async fn inventory(&self, product_id: i64) -> Result<Option<Inventory>, StoreError> {
        let mut conn = self.conn().await?;
        let row = inventory::table
            .filter(inventory::product_id.eq(product_id))
            .first::<Inventory>(&mut conn)
            .await
            .optional()?;
        Ok(row)
    }

    async fn reserve_stock_tx(&self, product_id: i64, quantity: i32) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, StoreError, _>(|conn| {
            async move {
                let available = inventory::table
                    .filter(inventory::product_id.eq(product_id))
                    .select(inventory::available)
                    .for_update()
                    .first::<i32>(conn)
                    .await?;

                if available < quantity {
                    return Err(StoreError::InsufficientStock {
                        product_id,
                        available,
                        requested: quantity,
                    });
                }

                diesel::update(inventory::table.filter(inventory::product_id.eq(product_id)))
                    .set((
                        inventory::available.eq(inventory::available - quantity),
                        inventory::reserved.eq(inventory::reserved + quantity),
                        inventory::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)
                    .await?;

                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn release_stock(&self, product_id: i64, quantity: i32) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(inventory::table.filter(inventory::product_id.eq(product_id)))
            .set((
                inventory::available.eq(inventory::available + quantity),
                inventory::reserved.eq(inventory::reserved - quantity),
                inventory::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(updated > 0)
    }

    async fn commit_stock(&self, product_id: i64, quantity: i32) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(inventory::table.filter(inventory::product_id.eq(product_id)))
            .set((
                inventory::reserved.eq(inventory::reserved - quantity),
                inventory::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(updated > 0)
    }

    async fn create_order(&self, order: NewOrder) -> Result<Order, StoreError> {
        let mut conn = self.conn().await?;
        diesel::insert_into(orders::table)
            .values(&order)
            .get_result::<Order>(&mut conn)
            .await
            .map_err(|err| match err {
                diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                    StoreError::DuplicateKey
                }
                other => StoreError::from(other),
            })
    }

    async fn order_by_id(&self, id: i64) -> Result<Option<Order>, StoreError> {
        let mut conn = self.conn().await?;
        let order = orders::table
            .filter(orders::id.eq(id))
            .first::<Order>(&mut conn)
            .await
            .optional()?;
        Ok(order)
    }

    async fn order_by_idempotency_key(&self, key: &str) -> Result<Option<Order>, StoreError> {
        let mut conn = self.conn().await?;
        let order = orders::table
            .filter(orders::idempotency_key.eq(key))
            .first::<Order>(&mut conn)
            .await
            .optional()?;
        Ok(order)
    }

    async fn orders_for_user(&self, user_id: i64) -> Result<Vec<Order>, StoreError> {
        let mut conn = self.conn().await?;
        let found = orders::table
            .filter(orders::user_id.eq(user_id))
            .order(orders::created_at.desc())
            .load::<Order>(&mut conn)
            .await?;
        Ok(found)
    }

    async fn update_order_status(
        &self,
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            orders::table
                .filter(orders::id.eq(order_id))
                .filter(orders::status.eq(from.as_str())),
        )
        .set((
            orders::status.eq(to.as_str()),
            orders::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;
        Ok(updated == 1)
    }

    async fn transition_with_outbox(
        &self,
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
        event: NewOutboxEvent,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, StoreError, _>(|conn| {
            async move {
                let updated = diesel::update(
                    orders::table
                        .filter(orders::id.eq(order_id))
                        .filter(orders::status.eq(from.as_str())),
                )
                .set((
                    orders::status.eq(to.as_str()),
                    orders::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;

                if updated == 0 {
                    return Ok(false);
                }

                diesel::insert_into(outbox_events::table)
                    .values(&event)
                    .execute(conn)
                    .await?;

                Ok(true)
            }
            .scope_boxed()
        })
        .await
    }

    async fn create_order_item(&self, item: NewOrderItem) -> Result<OrderItem, StoreError> {
        let mut conn = self.conn().await?;
        let created = diesel::insert_into(order_items::table)
            .values(&item)
            .get_result::<OrderItem>(&mut conn)
            .await?;
        Ok(created)
    }

    async fn order_items(&self, order_id: i64) -> Result<Vec<OrderItem>, StoreError> {
        let mut conn = self.conn().await?;
        let items = order_items::table
            .filter(order_items::order_id.eq(order_id))
            .order(order_items::id.asc())
            .load::<OrderItem>(&mut conn)
            .await?;
        Ok(items)
    }

    async fn create_payment(&self, payment: NewPayment) -> Result<Payment, StoreError> {
        let mut conn = self.conn().await?;
        let created = diesel::insert_into(payments::table)
            .values(&payment)
            .get_result::<Payment>(&mut conn)
            .await?;
        Ok(created)
    }

    async fn update_payment_status(
        &self,
        payment_id: i64,
        status: PaymentStatus,
        provider_tx_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel::update(payments::table.filter(payments::id.eq(payment_id)))
            .set((
                payments::status.eq(status.as_str()),
                payments::provider_tx_id.eq(provider_tx_id),
                payments::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn payment_for_order(&self, order_id: i64) -> Result<Option<Payment>, StoreError> {
        let mut conn = self.conn().await?;
        let payment = payments::table
            .filter(payments::order_id.eq(order_id))
            .order(payments::created_at.desc())
            .first::<Payment>(&mut conn)
            .await
            .optional()?;
        Ok(payment)
    }

    async fn is_event_processed(&self, event_id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let exists = diesel::select(diesel::dsl::exists(
            processed_events::table.filter(processed_events::event_id.eq(event_id)),
        ))
        .get_result::<bool>(&mut conn)
        .await?;
        Ok(exists)
    }

    async fn mark_event_processed(
        &self,
        event_id: Uuid,
        event_type: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel::insert_into(processed_events::table)
            .values((
                processed_events::event_id.eq(event_id),
                processed_events::event_type.eq(event_type),
            ))
            .on_conflict(processed_events::event_id)
            .do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn unpublished_outbox(&self, limit: i64) -> Result<Vec<OutboxEvent>, StoreError> {
        let mut conn = self.conn().await?;
        let pending = outbox_events::table
            .filter(outbox_events::published.eq(false))
            .order(outbox_events::id.asc())
            .limit(limit)
            .load::<OutboxEvent>(&mut conn)
            .await?;
        Ok(pending)
    }

    async fn mark_outbox_published(&self, outbox_id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel::update(outbox_events::table.filter(outbox_events::id.eq(outbox_id)))
            .set(outbox_events::published.eq(true))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}
