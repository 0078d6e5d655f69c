use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bus::MediaBus;
use crate::config::ConfigStore;
use crate::supervisor::Supervisor;

mod api;
mod bus;
mod config;
mod handler;
mod rule;
mod session;
mod supervisor;
mod template;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("transcode_hub", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "transcode.conf".to_string());
    let store = match ConfigStore::from_file(&config_path) {
        Ok(store) => store,
        Err(e) => {
            log::warn!("cannot read config {}: {}, starting with empty config", config_path, e);
            ConfigStore::new()
        }
    };

    let cancel = CancellationToken::new();
    let bus = Arc::new(MediaBus::new());
    let supervisor = Supervisor::new();

    if !supervisor.start(&store, &bus) {
        log::info!("transcode supervisor not started");
    }

    let api = handler::transcode::TranscodeApi {
        supervisor: Arc::clone(&supervisor),
        config_path: Arc::new(config_path),
    };
    api::start_api_server(cancel.clone(), api, Arc::clone(&bus));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    supervisor.stop().await;
    std::process::exit(0);
}
