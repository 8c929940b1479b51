use anyhow::{bail, Context, Result};
use clap::Parser;
use corral::catalog::provider::CatalogProvider;
use corral::control::ControlPlane;
use corral::discovery::DiscoveryService;
use corral::logs::{CaptureLayer, LogBroadcaster};
use corral::plugins::NoopPluginHost;
use corral::registry::ClientRegistry;
use corral::reload::ReloadManager;
use corral::runtime::RuntimeState;
use corral::scheduler::Scheduler;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod pool;
mod provider;

use pool::LocalScheduler;
use provider::FileCatalogProvider;

#[derive(Parser, Debug)]
#[command(name = "corrald", version, about = "corral control-plane daemon")]
struct Args {
    /// Address to bind the Control RPC to.
    #[arg(long, default_value = "127.0.0.1:8642")]
    addr: String,

    /// Path to the catalog TOML file.
    #[arg(long)]
    config: PathBuf,

    /// Optional bearer token required on the RPC boundary.
    #[arg(long, env = "CORRAL_TOKEN")]
    auth_key: Option<String>,

    /// Catalog file poll cadence, seconds.
    #[arg(long, default_value_t = 2)]
    poll_interval_seconds: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let logs = LogBroadcaster::new();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .with(CaptureLayer::new(Arc::clone(&logs)))
        .init();

    match run(args, logs).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "corrald exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, logs: Arc<LogBroadcaster>) -> Result<()> {
    let provider = FileCatalogProvider::load(&args.config)
        .await
        .with_context(|| format!("loading catalog {}", args.config.display()))?;
    let initial = provider.current();
    let runtime_config = initial.summary.runtime.clone();
    info!(
        revision = initial.revision,
        servers = initial.summary.server_spec_keys.len(),
        "catalog loaded"
    );

    let scheduler: Arc<dyn Scheduler> = LocalScheduler::new(
        initial.summary.spec_registry.clone(),
        runtime_config.handshake_timeout(),
    );
    let registry = ClientRegistry::new(Arc::clone(&initial), Arc::clone(&scheduler), None);
    let runtime = RuntimeState::new(Arc::clone(&initial), Arc::clone(&scheduler));
    let discovery = DiscoveryService::new(Arc::clone(&registry), Arc::clone(&runtime));
    let reload = ReloadManager::new(
        Arc::clone(&provider) as Arc<dyn CatalogProvider>,
        Arc::clone(&scheduler),
        Arc::clone(&registry),
        Arc::clone(&runtime),
        Arc::new(NoopPluginHost),
        None,
    );
    let mut fatal = reload.fatal_signal();

    let cancel = CancellationToken::new();
    provider.spawn_poll(
        Duration::from_secs(args.poll_interval_seconds.max(1)),
        cancel.clone(),
    );
    reload.spawn(cancel.clone());
    registry.start_monitor();
    runtime.start(cancel.clone());
    if runtime_config.idle_check_interval_seconds > 0 {
        scheduler.start_idle_manager(Duration::from_secs(
            runtime_config.idle_check_interval_seconds,
        ));
    }
    if runtime_config.ping_interval_seconds > 0 {
        scheduler.start_ping_manager(Duration::from_secs(runtime_config.ping_interval_seconds));
    }

    // Always-on specs stay warm with or without clients.
    for (key, spec) in &initial.summary.spec_registry {
        if spec.always_on() {
            if let Err(err) = scheduler
                .set_desired_min_ready(*key, spec.effective_min_ready())
                .await
            {
                warn!(server = %spec.name, error = %err, "warm-up failed");
            }
        }
    }

    let control = Arc::new(ControlPlane {
        registry: Arc::clone(&registry),
        discovery,
        runtime: Arc::clone(&runtime),
        reload: Arc::clone(&reload),
        logs,
        scheduler: Arc::clone(&scheduler),
        auth_token: args.auth_key.clone(),
    });
    let router = corral::rpc::server::router(control);
    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("binding {}", args.addr))?;
    info!(addr = %args.addr, "control RPC listening");

    let serve_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
            .await
    });

    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
        reason = fatal.recv() => {
            let reason = reason.unwrap_or_else(|| "unknown".into());
            Err(reason)
        }
    };

    cancel.cancel();
    registry.stop_monitor();
    scheduler.stop_all().await;
    server.await.ok();

    match outcome {
        Ok(()) => {
            info!("corrald shut down");
            Ok(())
        }
        // Strict reload mode: a failed apply is fatal so a supervisor can
        // remediate with a clean restart.
        Err(reason) => bail!("strict reload failure: {reason}"),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
