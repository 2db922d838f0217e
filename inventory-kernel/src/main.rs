/**
 * INVENTORY KERNEL - service entry point
 *
 * ROLE: wires configuration, logging, store, remote client, reconciliation
 * tasks and the REST API together.
 *
 * STARTUP:
 * 1. `.env` then configuration (fatal when missing or invalid)
 * 2. tracing subscriber (stdout or `logfile`)
 * 3. store (fatal when it cannot be opened)
 * 4. one bootstrap pass per deployment in the background
 * 5. periodic tasks, then the HTTP server until Ctrl-C
 */

use anyhow::Context;
use std::fs::OpenOptions;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use inventory_kernel::config::{load_config, InventoryConfig};
use inventory_kernel::health::HealthTracker;
use inventory_kernel::http::{self, AppState, Updater};
use inventory_kernel::openstack::OpenStackClient;
use inventory_kernel::reconcile::Reconciler;
use inventory_kernel::scheduler::Scheduler;
use inventory_kernel::store::Store;
use inventory_kernel::tasks::TaskContext;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cfg = match load_config().await {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("[inventory] configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_tracing(&cfg) {
        eprintln!("[inventory] unable to initialise logging: {e:#}");
        std::process::exit(1);
    }

    if let Err(e) = run(cfg).await {
        error!(error = %format!("{e:#}"), "fatal error");
        std::process::exit(1);
    }
}

fn init_tracing(cfg: &InventoryConfig) -> anyhow::Result<()> {
    let level = if cfg.debug { Level::DEBUG } else { Level::INFO };
    let builder = tracing_subscriber::fmt().with_max_level(level).with_target(false);

    match &cfg.logfile {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            builder
                .with_ansi(false)
                .with_writer(BoxMakeWriter::new(std::sync::Mutex::new(file)))
                .init();
        }
        None => builder.init(),
    }
    Ok(())
}

async fn run(cfg: InventoryConfig) -> anyhow::Result<()> {
    let store = Store::open(&cfg.database)
        .with_context(|| format!("opening store {}", cfg.database))?;

    let client = OpenStackClient::new(cfg.deployments.clone()).context("building http client")?;
    let reconciler = Reconciler::new(store.clone(), Arc::new(client));
    let health = HealthTracker::new();
    let ctx = TaskContext::new(reconciler, health.clone(), cfg.deployment_names());

    info!(deployments = ?ctx.deployments(), "starting inventory");
    for deployment in ctx.deployments() {
        let ctx = ctx.clone();
        let deployment = deployment.clone();
        tokio::spawn(async move { ctx.bootstrap(&deployment).await });
    }

    let mut scheduler = Scheduler::new();
    ctx.register(&mut scheduler, &cfg)?;
    scheduler.start()?;

    let updater: Updater = {
        let ctx = ctx.clone();
        Arc::new(move |deployment: String| {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.update_deployment(&deployment).await });
        })
    };

    let listen_on = cfg.listen_on.clone();
    let app = http::build_router(AppState {
        cfg: Arc::new(cfg),
        store,
        health,
        updater,
    });

    let listener = TcpListener::bind(&listen_on)
        .await
        .with_context(|| format!("binding {listen_on}"))?;
    info!(addr = %listen_on, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("http server")?;

    scheduler.stop().await;
    Ok(())
}
