//! PostgreSQL-backed [`OrderStore`].
//!
//! Expects an `orders` table (created out of band):
//!
//! ```sql
//! CREATE TABLE orders (
//!     id                 BIGSERIAL PRIMARY KEY,
//!     order_uid          TEXT        NOT NULL,
//!     track_number       TEXT        NOT NULL,
//!     entry              TEXT        NOT NULL,
//!     delivery           JSONB       NOT NULL,
//!     payment            JSONB       NOT NULL,
//!     items              JSONB       NOT NULL,
//!     locale             TEXT        NOT NULL,
//!     internal_signature TEXT        NOT NULL,
//!     customer_id        TEXT        NOT NULL,
//!     delivery_service   TEXT        NOT NULL,
//!     shardkey           TEXT        NOT NULL,
//!     sm_id              BIGINT      NOT NULL,
//!     date_created       TIMESTAMPTZ NOT NULL,
//!     oof_shard          TEXT        NOT NULL
//! );
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, info};

use orderflow_core::{Delivery, LineItem, Order, OrderId, Payment};

use crate::bootstrap::{connect_with_retry, RetryPolicy};
use crate::error::StorageError;
use crate::store::OrderStore;

const INSERT_ORDER: &str = "
INSERT INTO orders (order_uid, track_number, entry, delivery, payment, items, locale,
                    internal_signature, customer_id, delivery_service, shardkey, sm_id,
                    date_created, oof_shard)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
RETURNING id";

const SELECT_COLUMNS: &str = "
SELECT id, order_uid, track_number, entry, delivery, payment, items, locale,
       internal_signature, customer_id, delivery_service, shardkey, sm_id,
       date_created, oof_shard
FROM orders";

/// Pool sizing and per-attempt limits for [`PgOrderStore::connect`].
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    /// Bounds one connect + probe attempt inside the retry loop.
    pub attempt_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    /// Connect with bounded retry.
    ///
    /// Each attempt opens a pool and runs `SELECT 1`; the first attempt that
    /// passes the probe wins. Exhausting `policy.budget` fails with
    /// [`StorageError::StartupTimeout`]. A malformed URL fails immediately.
    pub async fn connect(
        url: &str,
        policy: RetryPolicy,
        settings: PoolSettings,
    ) -> Result<Self, StorageError> {
        let options: PgConnectOptions = url.parse()?;
        info!(
            host = options.get_host(),
            database = options.get_database().unwrap_or("(default)"),
            budget = ?policy.budget,
            "connecting to PostgreSQL"
        );

        let pool = connect_with_retry(policy, || {
            let options = options.clone();
            async move {
                let pool = PgPoolOptions::new()
                    .max_connections(settings.max_connections)
                    .acquire_timeout(settings.attempt_timeout)
                    .connect_with(options)
                    .await?;
                sqlx::query("SELECT 1").execute(&pool).await?;
                Ok::<_, sqlx::Error>(pool)
            }
        })
        .await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool (no probe, no retry).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn insert(&self, order: &Order) -> Result<OrderId, StorageError> {
        let id = sqlx::query_scalar::<_, i64>(INSERT_ORDER)
            .bind(&order.order_uid)
            .bind(&order.track_number)
            .bind(&order.entry)
            .bind(Json(&order.delivery))
            .bind(Json(&order.payment))
            .bind(Json(&order.items))
            .bind(&order.locale)
            .bind(&order.internal_signature)
            .bind(&order.customer_id)
            .bind(&order.delivery_service)
            .bind(&order.shardkey)
            .bind(order.sm_id)
            .bind(order.date_created)
            .bind(&order.oof_shard)
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::Persistence)?;

        debug!(order_id = id, order_uid = %order.order_uid, "order inserted");
        Ok(id)
    }

    async fn get(&self, id: OrderId) -> Result<Order, StorageError> {
        let row = sqlx::query_as::<_, OrderRow>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::NotFound(Some(id)))?;

        Ok(row.into_order().1)
    }

    async fn get_all(&self) -> Result<HashMap<OrderId, Order>, StorageError> {
        let rows = sqlx::query_as::<_, OrderRow>(SELECT_COLUMNS)
            .fetch_all(&self.pool)
            .await?;

        if rows.is_empty() {
            return Err(StorageError::NotFound(None));
        }
        Ok(rows.into_iter().map(OrderRow::into_order).collect())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: i64,
    order_uid: String,
    track_number: String,
    entry: String,
    delivery: Json<Delivery>,
    payment: Json<Payment>,
    items: Json<Vec<LineItem>>,
    locale: String,
    internal_signature: String,
    customer_id: String,
    delivery_service: String,
    shardkey: String,
    sm_id: i64,
    date_created: DateTime<Utc>,
    oof_shard: String,
}

impl OrderRow {
    fn into_order(self) -> (OrderId, Order) {
        let order = Order {
            order_uid: self.order_uid,
            track_number: self.track_number,
            entry: self.entry,
            delivery: self.delivery.0,
            payment: self.payment.0,
            items: self.items.0,
            locale: self.locale,
            internal_signature: self.internal_signature,
            customer_id: self.customer_id,
            delivery_service: self.delivery_service,
            shardkey: self.shardkey,
            sm_id: self.sm_id,
            date_created: self.date_created,
            oof_shard: self.oof_shard,
        };
        (self.id, order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row() -> OrderRow {
        OrderRow {
            id: 12,
            order_uid: "b563feb7b2b84b6test".into(),
            track_number: "WBILMTESTTRACK".into(),
            entry: "WBIL".into(),
            delivery: Json(Delivery {
                city: "Kiryat Mozkin".into(),
                ..Default::default()
            }),
            payment: Json(Payment {
                amount: 1817,
                ..Default::default()
            }),
            items: Json(vec![LineItem {
                nm_id: 2389212,
                ..Default::default()
            }]),
            locale: "en".into(),
            internal_signature: String::new(),
            customer_id: "test".into(),
            delivery_service: "meest".into(),
            shardkey: "9".into(),
            sm_id: 99,
            date_created: Utc.with_ymd_and_hms(2021, 11, 26, 6, 22, 19).unwrap(),
            oof_shard: "1".into(),
        }
    }

    #[test]
    fn row_maps_to_order() {
        let (id, order) = row().into_order();
        assert_eq!(id, 12);
        assert_eq!(order.sm_id, 99);
        assert_eq!(order.delivery.city, "Kiryat Mozkin");
        assert_eq!(order.payment.amount, 1817);
        assert_eq!(order.items[0].nm_id, 2389212);
    }

    #[test]
    fn wide_sm_id_survives_row_mapping() {
        let mut row = row();
        row.sm_id = 5_000_000_000;
        assert_eq!(row.into_order().1.sm_id, 5_000_000_000);
    }

    #[tokio::test]
    async fn malformed_url_fails_without_retry() {
        let result = PgOrderStore::connect(
            "definitely not a url",
            RetryPolicy::default(),
            PoolSettings::default(),
        )
        .await;
        assert!(matches!(result, Err(StorageError::Database(_))));
    }
}
