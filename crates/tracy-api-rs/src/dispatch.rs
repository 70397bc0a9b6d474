use std::sync::Arc;
use tracing::error;
use tracy_tracer::{ErrorEnvelope, TracerError, TracerService};

/// Runs one service operation off the async workers, since every store call
/// blocks on the single connection. Failures are logged here so adapters only
/// have to encode them.
pub async fn call<F>(service: &Arc<TracerService>, op: F) -> Result<Vec<u8>, ErrorEnvelope>
where
    F: FnOnce(&TracerService) -> Result<Vec<u8>, TracerError> + Send + 'static,
{
    let service = Arc::clone(service);
    match tokio::task::spawn_blocking(move || op(&service)).await {
        Ok(Ok(body)) => Ok(body),
        Ok(Err(err)) => Err(reject(&err)),
        Err(err) => {
            error!(event = "service_task_failed", error = %err);
            Err(ErrorEnvelope {
                code: "internal_error".to_string(),
                message: "service task failed".to_string(),
            })
        }
    }
}

pub fn reject(err: &TracerError) -> ErrorEnvelope {
    error!(event = "request_failed", code = err.code(), error = %err);
    ErrorEnvelope::from(err)
}
