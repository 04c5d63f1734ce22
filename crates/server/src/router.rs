//! HTTP router construction.

use std::sync::Arc;

use axum::middleware;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::state::AppState;
use crate::throttle::{self, Limiter};

/// Build the application router. The throttle sits in front of every route.
pub fn build_router(state: Arc<AppState>, limiter: Arc<Limiter>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/orders/{id}", get(api::get_order))
        .layer(middleware::from_fn_with_state(limiter, throttle::throttle))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use orderflow_core::{Delivery, Order, OrderId, Payment};
    use orderflow_queue::{IngestMetrics, PipelineState, PipelineStatus};
    use orderflow_storage::{MemoryCache, OrderCache, StorageError};
    use serde_json::Value;
    use tower::ServiceExt; // for `oneshot`

    fn order(uid: &str) -> Order {
        Order {
            order_uid: uid.to_string(),
            track_number: "WBILMTESTTRACK".into(),
            entry: "WBIL".into(),
            delivery: Delivery {
                city: "Kiryat Mozkin".into(),
                ..Default::default()
            },
            payment: Payment {
                transaction: uid.to_string(),
                amount: 1817,
                ..Default::default()
            },
            items: Vec::new(),
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

    fn app_with(cache: Arc<dyn OrderCache>, limiter: Arc<Limiter>) -> Router {
        let status = Arc::new(PipelineStatus::new());
        status.set(PipelineState::Subscribed);
        let state = Arc::new(AppState {
            cache,
            metrics: Arc::new(IngestMetrics::default()),
            status,
        });
        build_router(state, limiter)
    }

    fn app() -> Router {
        let cache = MemoryCache::new();
        cache.set(1, Arc::new(order("b563feb7b2b84b6test"))).unwrap();
        app_with(Arc::new(cache), throttle::limiter(1000, 1000))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn cached_order_is_returned() {
        let (status, body) = get(app(), "/orders/1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["order_uid"], "b563feb7b2b84b6test");
        assert_eq!(body["sm_id"], 99);
        assert_eq!(body["date_created"], "2021-11-26T06:22:19Z");
    }

    #[tokio::test]
    async fn unknown_id_is_404() {
        let (status, body) = get(app(), "/orders/42").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("42"));
    }

    #[tokio::test]
    async fn non_integer_id_is_404() {
        let (status, _) = get(app(), "/orders/abc").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    struct BrokenCache;

    impl OrderCache for BrokenCache {
        fn get(&self, _id: OrderId) -> Result<Arc<Order>, StorageError> {
            Err(StorageError::CacheWrite("lock unavailable".into()))
        }
        fn set(&self, _id: OrderId, _order: Arc<Order>) -> Result<(), StorageError> {
            Ok(())
        }
        fn len(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn other_cache_errors_are_500_without_detail() {
        let app = app_with(Arc::new(BrokenCache), throttle::limiter(1000, 1000));
        let (status, body) = get(app, "/orders/1").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "internal server error");
    }

    #[tokio::test]
    async fn health_reports_pipeline_and_cache() {
        let (status, body) = get(app(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["pipeline"], "subscribed");
        assert_eq!(body["cached_orders"], 1);
        assert_eq!(body["ingest"]["received"], 0);
    }

    #[tokio::test]
    async fn requests_over_burst_are_throttled() {
        let app = app_with(Arc::new(MemoryCache::new()), throttle::limiter(1, 2));

        let (first, _) = get(app.clone(), "/health").await;
        let (second, _) = get(app.clone(), "/health").await;
        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::OK);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
    }
}
