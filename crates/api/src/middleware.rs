use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde_json::json;

use taskforge_core::OwnerId;
use taskforge_ratelimit::{Budget, Decision};

use crate::app::errors::json_error;
use crate::app::services::AppServices;
use crate::context::{PrincipalContext, TierContext};

/// Header carrying the caller identity, set by the authentication proxy.
pub const PRINCIPAL_HEADER: &str = "x-principal-id";

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

pub async fn principal_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let owner = extract_principal(req.headers())?;
    req.extensions_mut().insert(PrincipalContext::new(owner));
    Ok(next.run(req).await)
}

fn extract_principal(headers: &HeaderMap) -> Result<OwnerId, Response> {
    let unauthorized = |msg: &str| json_error(StatusCode::UNAUTHORIZED, "unauthorized", msg);

    let header = headers
        .get(PRINCIPAL_HEADER)
        .ok_or_else(|| unauthorized("missing principal"))?;
    let header = header
        .to_str()
        .map_err(|_| unauthorized("principal is not valid ASCII"))?;
    header.parse().map_err(|_| unauthorized("malformed principal"))
}

/// Admission control; runs after [`principal_middleware`].
///
/// The tier is looked up on every request so subscription changes apply
/// immediately.
pub async fn rate_limit_middleware(
    State(services): State<Arc<AppServices>>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(principal) = req.extensions().get::<PrincipalContext>().cloned() else {
        return json_error(StatusCode::UNAUTHORIZED, "unauthorized", "missing principal");
    };
    let tier = services.subscriptions.tier_for(principal.owner_id());

    let decision = services
        .limiter
        .admit(req.uri().path(), principal.owner_id(), tier, Utc::now());
    match decision {
        Decision::Allow {
            limit,
            remaining,
            reset_after,
        } => {
            req.extensions_mut().insert(TierContext(tier));
            let mut res = next.run(req).await;
            let headers = res.headers_mut();
            headers.insert(LIMIT_HEADER, HeaderValue::from(limit.requests));
            headers.insert(REMAINING_HEADER, HeaderValue::from(remaining));
            headers.insert(RESET_HEADER, HeaderValue::from(ceil_secs(reset_after)));
            res
        }
        Decision::Deny { limit, retry_after } => rate_limited(limit, retry_after),
    }
}

fn rate_limited(limit: Budget, retry_after: Duration) -> Response {
    let secs = ceil_secs(retry_after);
    let mut res = (
        StatusCode::TOO_MANY_REQUESTS,
        axum::Json(json!({
            "error": "rate_limited",
            "message": format!("rate limit of {limit} exceeded"),
            "limit": limit.to_string(),
            "retry_after_secs": secs,
        })),
    )
        .into_response();
    res.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
    res.headers_mut()
        .insert(LIMIT_HEADER, HeaderValue::from(limit.requests));
    res.headers_mut().insert(REMAINING_HEADER, HeaderValue::from(0u32));
    res
}

/// Whole seconds, rounded up.
fn ceil_secs(d: Duration) -> u64 {
    d.as_millis().div_ceil(1000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(59_001)), 60);
        assert_eq!(ceil_secs(Duration::from_secs(60)), 60);
    }

    #[test]
    fn principal_header_is_required_and_validated() {
        let mut headers = HeaderMap::new();
        assert!(extract_principal(&headers).is_err());

        headers.insert(PRINCIPAL_HEADER, HeaderValue::from_static("   "));
        assert!(extract_principal(&headers).is_err());

        headers.insert(PRINCIPAL_HEADER, HeaderValue::from_static("alice"));
        assert_eq!(extract_principal(&headers).unwrap().as_str(), "alice");
    }

    #[test]
    fn denial_carries_limit_and_retry_after() {
        let res = rate_limited(Budget::per_minute(30), Duration::from_millis(12_300));
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers()[RETRY_AFTER], "13");
        assert_eq!(res.headers()[LIMIT_HEADER], "30");
    }
}
