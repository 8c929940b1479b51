use anyhow::{bail, Context, Result};
use clap::Parser;
use corral::logs::LogLevel;
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::streamable_http_server::StreamableHttpService;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod args;
mod client;
mod server;
mod sync;
mod view;

use args::{CliArgs, TransportKind};
use client::{CallerIdentity, ClientManager, ConnectOptions};
use server::GatewayServer;
use sync::{Backoff, SyncEngine};
use view::MirrorView;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    // MCP owns stdout in stdio mode; all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "gateway failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CliArgs) -> Result<()> {
    let ca_pem = match &args.tls_ca {
        Some(path) => Some(
            std::fs::read(path)
                .with_context(|| format!("reading CA certificate {}", path.display()))?,
        ),
        None => None,
    };

    let manager = ClientManager::new(
        ConnectOptions {
            rpc: args.rpc.clone(),
            token: args.token.clone(),
            ca_pem,
        },
        CallerIdentity {
            caller: args.caller.clone(),
            pid: std::process::id(),
            tags: args.tags.clone(),
            server: args.server.clone(),
        },
    );

    register_with_backoff(&manager, args.max_retries).await?;
    info!(caller = %args.caller, rpc = %args.rpc, "registered with the control plane");

    let view = MirrorView::new();
    let min_level: LogLevel = args.log_level.parse().unwrap_or(LogLevel::Info);
    let engine = SyncEngine::new(Arc::clone(&manager), Arc::clone(&view), min_level);
    let cancel = CancellationToken::new();
    engine.spawn(cancel.clone());

    let handler = GatewayServer::new(Arc::clone(&view), Arc::clone(&manager), args.caller.clone());

    match args.transport {
        TransportKind::Stdio => serve_stdio(handler, &view).await?,
        TransportKind::StreamableHttp => {
            serve_streamable_http(handler, &args.http_addr, &args.http_endpoint).await?
        }
    }

    cancel.cancel();
    manager.unregister().await;
    info!("gateway shut down");
    Ok(())
}

async fn register_with_backoff(manager: &Arc<ClientManager>, max_retries: u32) -> Result<()> {
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
    let mut attempts = 0u32;
    loop {
        match manager.register().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                attempts += 1;
                if max_retries > 0 && attempts >= max_retries {
                    bail!("registration failed after {attempts} attempts: {err}");
                }
                let delay = backoff.next();
                warn!(error = %err, attempt = attempts, ?delay, "registration failed, retrying");
                manager.reset().await;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn serve_stdio(handler: GatewayServer, view: &Arc<MirrorView>) -> Result<()> {
    let running = rmcp::service::serve_server(handler, rmcp::transport::stdio())
        .await
        .context("starting stdio MCP server")?;
    view.set_peer(running.peer().clone());

    tokio::select! {
        quit = running.waiting() => {
            info!(reason = ?quit, "stdio session ended");
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }
    Ok(())
}

async fn serve_streamable_http(
    handler: GatewayServer,
    addr: &str,
    endpoint: &str,
) -> Result<()> {
    let service = StreamableHttpService::new(
        move || Ok(handler.clone()),
        Arc::new(LocalSessionManager::default()),
        Default::default(),
    );
    let router = axum::Router::new().nest_service(endpoint, service);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr, endpoint, "serving MCP over streamable HTTP");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving streamable HTTP")?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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
