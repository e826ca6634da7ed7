use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::routes::common::blocking;
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::{PrincipalContext, TierContext};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn whoami(
    Extension(principal): Extension<PrincipalContext>,
    Extension(TierContext(tier)): Extension<TierContext>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "principal_id": principal.owner_id().as_str(),
        "tier": tier.as_str(),
    }))
}

/// Task counts by status across all owners.
pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match blocking(move || services.tasks.stats()).await {
        Ok(Ok(stats)) => (StatusCode::OK, Json(dto::stats_to_json(stats))).into_response(),
        Ok(Err(e)) => errors::store_error_to_response(e),
        Err(resp) => resp,
    }
}
