use axum::{routing::get, Router};

pub mod common;
pub mod system;
pub mod tasks;

/// Router for all endpoints that need a principal.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/stats", get(system::stats))
        .nest("/tasks", tasks::router())
}
