use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use backend::config::ServerConfig;
use backend::store::{MemoryStore, RendezvousStore, UpstashStore};
use backend::{app, AppState};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let mut memory = None;
    let store: Arc<dyn RendezvousStore> = match &config.upstash {
        Some(upstash) => match UpstashStore::new(&upstash.url, &upstash.token) {
            Ok(store) => {
                info!(url = %upstash.url, "using upstash store");
                Arc::new(store)
            }
            Err(err) => {
                error!(%err, "cannot build upstash client");
                return ExitCode::FAILURE;
            }
        },
        None => {
            info!("no upstash configured, using in-memory store");
            let store = MemoryStore::new();
            memory = Some(store.clone());
            Arc::new(store)
        }
    };

    let state = AppState::new(store, &config);

    let sweeper = state.clone();
    let interval = config.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let forgotten = sweeper.sweep_limiters();
            let purged = match &memory {
                Some(store) => store.purge_expired().await,
                None => 0,
            };
            if forgotten + purged > 0 {
                tracing::debug!(purged, forgotten, "sweep");
            }
        }
    });

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, addr = %config.bind_addr, "bind failed");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %config.bind_addr, "signaling listening");

    let service = app(state).into_make_service_with_connect_info::<SocketAddr>();
    if let Err(err) = axum::serve(listener, service).await {
        error!(%err, "server error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
