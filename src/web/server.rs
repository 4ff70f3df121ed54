use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::routes::{self, ApiState};
use crate::config::WebConfig;
use crate::orchestrator::Orchestrator;

pub struct WebServer {
    state: ApiState,
    host: String,
    port: u16,
    running: Arc<AtomicBool>,
}

impl WebServer {
    pub fn new(orchestrator: Orchestrator, config: &WebConfig) -> Self {
        Self {
            state: ApiState::new(orchestrator),
            host: config.host.clone(),
            port: config.port,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let app = routes::routes(self.state.clone()).layer(TraceLayer::new_for_http());

        self.running.store(true, Ordering::SeqCst);

        let listener = tokio::net::TcpListener::bind(format!("{}:{}", self.host, self.port))
            .await
            .context(format!("Failed to bind to port {}", self.port))?;
        info!("Web server listening on http://{}:{}", self.host, self.port);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(self.running.clone()))
            .await
            .context("Failed to serve")?;

        Ok(())
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn shutdown_signal(running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
