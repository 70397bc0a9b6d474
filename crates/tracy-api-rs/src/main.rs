mod config;
mod dispatch;
mod logging;
mod rest;
mod ws;

use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info};
use tracy_core::TagExtractor;
use tracy_storage::{TracerDb, TracerStore};
use tracy_tracer::TracerService;

#[tokio::main]
async fn main() {
    let config = config::load_config();
    let log_file = logging::init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr);
        return;
    }

    let db = match TracerDb::open(&config.db_path) {
        Ok(value) => Arc::new(value),
        Err(err) => {
            error!(event = "store_open_failed", path = %config.db_path, error = %err);
            return;
        }
    };
    let store: Arc<dyn TracerStore> = db.clone();
    let service = Arc::new(TracerService::new(store, Arc::new(TagExtractor::new())));
    let app = rest::router(service);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "api_error", error = %err);
            close_store(&db);
            return;
        }
    };

    info!(event = "api_start", addr = %config.addr, db_path = %config.db_path);
    if let Some(path) = &log_file {
        info!(event = "log_file", path = %path.display());
    }

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "api_error", error = %err);
    }

    close_store(&db);
    info!(event = "api_stop");
}

fn close_store(db: &TracerDb) {
    if let Err(err) = db.close() {
        error!(event = "store_close_failed", error = %err);
    }
}
