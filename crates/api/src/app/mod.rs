//! HTTP application wiring (Axum router + shared services).
//!
//! - `services.rs`: task service, rate limiter and tier directory
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
///
/// `/health` is outside both the principal check and the rate limiter.
pub fn build_app(services: Arc<AppServices>) -> Router {
    // The last layer added runs first: principal, then admission.
    let protected = routes::router()
        .layer(Extension(services.clone()))
        .layer(axum::middleware::from_fn_with_state(
            services,
            middleware::rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn(middleware::principal_middleware));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use taskforge_infra::InMemoryTaskStore;
    use taskforge_ratelimit::{Budget, RateLimitConfig, StaticSubscriptions, Tier, TierBudgets};
    use tower::ServiceExt;

    fn app_with(limits: RateLimitConfig, subs: Arc<StaticSubscriptions>) -> Router {
        let services =
            AppServices::new(Arc::new(InMemoryTaskStore::new()), limits, subs).unwrap();
        build_app(Arc::new(services))
    }

    fn get(uri: &str, principal: Option<&str>) -> Request<Body> {
        let mut req = Request::builder().uri(uri);
        if let Some(p) = principal {
            req = req.header(middleware::PRINCIPAL_HEADER, p);
        }
        req.body(Body::empty()).unwrap()
    }

    async fn json_body(res: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(res.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_principal_and_is_never_limited() {
        let one = TierBudgets::new(Budget::per_minute(1), Budget::per_minute(1), Budget::per_minute(1));
        let app = app_with(RateLimitConfig::new(one), Arc::new(StaticSubscriptions::default()));
        for _ in 0..5 {
            let res = app.clone().oneshot(get("/health", None)).await.unwrap();
            assert_eq!(res.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn tier_is_resolved_per_request() {
        let subs = Arc::new(StaticSubscriptions::default());
        let app = app_with(RateLimitConfig::default(), subs.clone());

        let res = app.clone().oneshot(get("/whoami", Some("carol"))).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["x-ratelimit-limit"], "60");
        assert_eq!(json_body(res).await["tier"], "free");

        subs.set("carol".parse().unwrap(), Tier::Pro);
        let res = app.oneshot(get("/whoami", Some("carol"))).await.unwrap();
        assert_eq!(res.headers()["x-ratelimit-limit"], "1200");
        assert_eq!(json_body(res).await["tier"], "pro");
    }

    #[tokio::test]
    async fn denied_request_reports_limit_and_retry_after() {
        let two = TierBudgets::new(Budget::per_minute(2), Budget::per_minute(2), Budget::per_minute(2));
        let app = app_with(RateLimitConfig::new(two), Arc::new(StaticSubscriptions::default()));

        for _ in 0..2 {
            let res = app.clone().oneshot(get("/stats", Some("dave"))).await.unwrap();
            assert_eq!(res.status(), StatusCode::OK);
        }
        let res = app.clone().oneshot(get("/stats", Some("dave"))).await.unwrap();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry: u64 = res.headers()["retry-after"].to_str().unwrap().parse().unwrap();
        assert!((1..=60).contains(&retry));
        let body = json_body(res).await;
        assert_eq!(body["error"], "rate_limited");
        assert_eq!(body["limit"], "2/60s");
        assert_eq!(body["retry_after_secs"], retry);

        // Another principal has its own bucket
        let res = app.oneshot(get("/stats", Some("erin"))).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
}
