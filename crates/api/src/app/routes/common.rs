use axum::http::StatusCode;

use crate::app::errors::json_error;

/// Run a store call on the blocking pool; the task store API is synchronous.
pub async fn blocking<T, F>(f: F) -> Result<T, axum::response::Response>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        tracing::error!(error = %e, "blocking task failed");
        json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
    })
}
