use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use taskforge_core::TaskId;

use crate::app::routes::common::blocking;
use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_task).get(list_tasks))
        .route("/:id", get(get_task).delete(cancel_task))
}

pub async fn submit_task(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<dto::SubmitTaskRequest>,
) -> axum::response::Response {
    let owner = principal.owner_id().clone();
    let input = body.input.unwrap_or_else(|| json!({}));
    let submitted = blocking(move || services.tasks.submit(&body.task_type, owner, input)).await;

    match submitted {
        Ok(Ok(id)) => (
            StatusCode::CREATED,
            Json(json!({ "id": id.to_string(), "status": "pending" })),
        )
            .into_response(),
        Ok(Err(e)) => errors::submit_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn get_task(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: TaskId = match id.parse() {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };
    let owner = principal.owner_id().clone();

    match blocking(move || services.tasks.get_owned(id, &owner)).await {
        Ok(Ok(Some(task))) => (StatusCode::OK, Json(dto::task_to_json(&task))).into_response(),
        Ok(Ok(None)) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "task not found"),
        Ok(Err(e)) => errors::store_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn list_tasks(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<dto::ListTasksQuery>,
) -> axum::response::Response {
    let owner = principal.owner_id().clone();
    let limit = query.limit();

    match blocking(move || services.tasks.list_for_owner(&owner, limit)).await {
        Ok(Ok(tasks)) => {
            let items = tasks.iter().map(dto::task_to_json).collect::<Vec<_>>();
            (StatusCode::OK, Json(json!({ "items": items }))).into_response()
        }
        Ok(Err(e)) => errors::store_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn cancel_task(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: TaskId = match id.parse() {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };
    let owner = principal.owner_id().clone();

    match blocking(move || services.tasks.cancel_owned(id, &owner)).await {
        Ok(Ok(task)) => (StatusCode::OK, Json(dto::task_to_json(&task))).into_response(),
        Ok(Err(e)) => errors::cancel_error_to_response(e),
        Err(resp) => resp,
    }
}
