use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DocumentError;

/// Store-assigned order identifier, shared by the store and the cache.
pub type OrderId = i64;

/// Recipient block of an order. Free-form strings, no further validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Delivery {
    pub name: String,
    pub phone: String,
    pub zip: String,
    pub city: String,
    pub address: String,
    pub region: String,
    pub email: String,
}

/// Payment block of an order. Amounts are non-negative by type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Payment {
    pub transaction: String,
    pub request_id: String,
    pub currency: String,
    pub provider: String,
    pub bank: String,
    pub amount: u64,
    /// Unix seconds.
    pub payment_dt: u64,
    pub delivery_cost: u64,
    pub goods_total: u64,
    pub custom_fee: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineItem {
    pub track_number: String,
    pub rid: String,
    pub name: String,
    pub size: String,
    pub brand: String,
    pub chrt_id: u64,
    pub price: u64,
    pub sale: u64,
    pub total_price: u64,
    pub nm_id: u64,
    pub status: u64,
}

/// A validated order event, the unit of ingestion.
///
/// Every field except `internal_signature` is guaranteed non-empty. An `Order`
/// carries no id of its own: the store assigns one on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_uid: String,
    pub track_number: String,
    pub entry: String,
    pub delivery: Delivery,
    pub payment: Payment,
    pub items: Vec<LineItem>,
    pub locale: String,
    pub internal_signature: String,
    pub customer_id: String,
    pub delivery_service: String,
    pub shardkey: String,
    /// Always positive.
    pub sm_id: i64,
    pub date_created: DateTime<Utc>,
    pub oof_shard: String,
}

/// Wire shape as it arrives from the bus. Absent keys decode to empty values
/// so the validator can name the offending field.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireOrder {
    order_uid: String,
    track_number: String,
    entry: String,
    delivery: Option<Delivery>,
    payment: Option<Payment>,
    items: Option<Vec<LineItem>>,
    locale: String,
    internal_signature: String,
    customer_id: String,
    delivery_service: String,
    shardkey: String,
    sm_id: i64,
    date_created: Option<DateTime<Utc>>,
    oof_shard: String,
}

impl Order {
    /// Decode and validate a raw bus payload.
    ///
    /// Runs three fail-fast stages: JSON syntax, typed decode, required
    /// fields. The first failing stage decides the error.
    pub fn from_slice(payload: &[u8]) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_slice(payload).map_err(DocumentError::Malformed)?;
        let wire: WireOrder = serde_json::from_value(value).map_err(DocumentError::TypeMismatch)?;
        wire.validate()
    }
}

impl WireOrder {
    fn validate(self) -> Result<Order, DocumentError> {
        let required = [
            ("order_uid", &self.order_uid),
            ("track_number", &self.track_number),
            ("entry", &self.entry),
            ("locale", &self.locale),
            ("customer_id", &self.customer_id),
            ("delivery_service", &self.delivery_service),
            ("shardkey", &self.shardkey),
            ("oof_shard", &self.oof_shard),
        ];
        if let Some(&(name, _)) = required.iter().find(|(_, value)| value.is_empty()) {
            return Err(DocumentError::MissingField(name));
        }
        if self.sm_id <= 0 {
            return Err(DocumentError::MissingField("sm_id"));
        }

        let date_created = self
            .date_created
            .ok_or(DocumentError::MissingField("date_created"))?;
        let delivery = self.delivery.ok_or(DocumentError::MissingField("delivery"))?;
        let payment = self.payment.ok_or(DocumentError::MissingField("payment"))?;
        let items = self.items.ok_or(DocumentError::MissingField("items"))?;

        Ok(Order {
            order_uid: self.order_uid,
            track_number: self.track_number,
            entry: self.entry,
            delivery,
            payment,
            items,
            locale: self.locale,
            internal_signature: self.internal_signature,
            customer_id: self.customer_id,
            delivery_service: self.delivery_service,
            shardkey: self.shardkey,
            sm_id: self.sm_id,
            date_created,
            oof_shard: self.oof_shard,
        })
    }
}
