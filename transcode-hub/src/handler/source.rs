use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::post};
use serde::Deserialize;

use crate::bus::{MediaBus, SourceEvent};

/// Webhook surface the streaming server calls to feed the media-source bus.
pub fn source_router(bus: Arc<MediaBus>) -> Router {
    Router::new()
        .route("/changed", post(media_changed))
        .route("/no_readers", post(no_readers))
        .with_state(bus)
}

#[derive(Deserialize)]
struct MediaChangedRequest {
    app: String,
    stream: String,
    registered: bool,
}

#[derive(Deserialize)]
struct NoReadersRequest {
    app: String,
    stream: String,
}

async fn media_changed(State(bus): State<Arc<MediaBus>>, Json(req): Json<MediaChangedRequest>) -> Json<&'static str> {
    bus.publish(SourceEvent::Changed { app: req.app, stream: req.stream, registered: req.registered });
    Json("ok")
}

async fn no_readers(State(bus): State<Arc<MediaBus>>, Json(req): Json<NoReadersRequest>) -> Json<&'static str> {
    bus.publish(SourceEvent::NoReaders { app: req.app, stream: req.stream });
    Json("ok")
}
