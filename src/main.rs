use std::sync::Arc;

use anyhow::Result;

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use wayfinder::config::{OrchestratorConfig, CONFIG};
use wayfinder::domain::PosemeshClient;
use wayfinder::identity::{DeviceIdentity, IdentityStore};
use wayfinder::orchestrator::Orchestrator;
use wayfinder::robot::SlamtecBase;
use wayfinder::robot_call::load_products;
use wayfinder::startup::{self, StartupOptions, StartupOutcome};
use wayfinder::web::WebServer;

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    info!("Application starting...");

    let identity = Arc::new(IdentityStore::new(DeviceIdentity::from_config(
        &CONFIG.general,
    )));
    let robot = Arc::new(SlamtecBase::new(&CONFIG.robot)?);
    let domain = Arc::new(PosemeshClient::new(
        &CONFIG.domain,
        identity.identity.device_id.clone(),
    )?);

    let orchestrator = Orchestrator::new(
        OrchestratorConfig::from_config(&CONFIG),
        robot.clone(),
        domain,
        identity,
        Vec::new(),
    );

    let report = startup::initialize(
        robot.as_ref(),
        &orchestrator.auth(),
        &StartupOptions::from_config(&CONFIG),
    )
    .await;
    orchestrator.set_waypoints(report.waypoints);
    match load_products(&CONFIG.robot_call.products_path).await {
        Ok(products) => orchestrator.set_products(products),
        Err(e) => warn!("[CALL] No products for robot calls: {:#}", e),
    }
    if let Some(e) = report.outcome.error() {
        warn!("Starting with limited functionality: {}", e);
        orchestrator.report_error(e);
    }

    // Create a shutdown signal channel
    let (shutdown_tx, _) = broadcast::channel(1);

    let orchestrator_handle =
        spawn_orchestrator(orchestrator.clone(), shutdown_tx.subscribe()).await;
    let web_server = WebServer::new(orchestrator.clone(), &CONFIG.web);
    let web_handle = spawn_web_server(web_server, shutdown_tx.subscribe()).await;

    if CONFIG.patrol.auto_start && report.outcome == StartupOutcome::Ready {
        info!("[PATROL] Auto-starting promotion");
        if let Err(e) = orchestrator.handle().start_promotion().await {
            error!("Failed to auto-start promotion: {}", e);
        }
    }

    let shutdown_signal = async {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received, stopping services...");
                if shutdown_tx.send(()).is_err() {
                    warn!("No services left to stop");
                }
            }
            Err(err) => {
                error!("Failed to listen for shutdown signal: {}", err);
            }
        }
    };

    let results = tokio::join!(orchestrator_handle, web_handle, shutdown_signal);

    for (result, name) in [results.0, results.1]
        .into_iter()
        .zip(["Orchestrator", "Web server"])
    {
        if let Err(e) = result {
            error!("{} join error: {}", name, e);
        }
    }

    info!("All services stopped, shutting down");

    Ok(())
}

async fn spawn_orchestrator(
    orchestrator: Orchestrator,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let runner = orchestrator.clone();
        let mut run = tokio::spawn(async move { runner.run().await });
        let result = tokio::select! {
            result = &mut run => result,
            _ = shutdown.recv() => {
                info!("Shutting down orchestrator...");
                orchestrator.stop();
                run.await
            }
        };
        match result {
            Ok(Err(e)) => error!("Orchestrator error: {}", e),
            Err(e) => error!("Orchestrator task failed: {}", e),
            Ok(Ok(())) => {}
        }
    })
}

async fn spawn_web_server(
    server: WebServer,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = server.start() => {
                if let Err(e) = result {
                    error!("Web server error: {}", e);
                }
            }
            _ = shutdown.recv() => {
                info!("Shutting down web server...");
                server.stop().await;
            }
        }
    })
}

fn setup_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .pretty(),
        )
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&CONFIG.general.log_level))
                .add_directive("hyper=info".parse().expect("valid directive"))
                .add_directive("reqwest=info".parse().expect("valid directive")),
        )
        .try_init()
        .expect("Failed to initialize logging");
}
