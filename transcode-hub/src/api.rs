use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::bus::MediaBus;
use crate::handler::transcode::TranscodeApi;

pub(crate) fn start_api_server(cancel: CancellationToken, api: TranscodeApi, bus: Arc<MediaBus>) {
    tokio::spawn(async move {
        let app = Router::new()
            .nest("/transcode", crate::handler::transcode::transcode_router(api))
            .nest("/source", crate::handler::source::source_router(bus));

        let listener = match TcpListener::bind("0.0.0.0:8090").await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("failed to bind API server: {}", e);
                return;
            }
        };
        log::info!("API server started on port 8090");
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("error serving API: {}", e);
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("shutting down API server...");
}
