use std::sync::Arc;

use clap::Parser;
use mcpl_webhook::LoggingSink;
use mcpl_webhook::WebhookConfig;
use mcpl_webhook::args::Args;
use mcpl_webhook::args::resolve_home;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mcpl_common::logging::init();
    let args = Args::parse();

    let home = resolve_home(&args.home)?;
    tokio::fs::create_dir_all(&home).await?;
    let config = WebhookConfig::load(&home)?;
    tracing::info!(endpoints = config.endpoints.len(), path = %home.display(), "loaded webhook.toml");

    // The standalone binary has no connection of its own to an MCPL host;
    // it only proves out endpoint configuration. An embedding delegate
    // process supplies a real `PushEventSink` that frames events onto its
    // own Reliable Channel.
    let router = mcpl_webhook::build_router(config, Arc::new(LoggingSink));

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(addr = %args.bind, "mcpl-webhook listening");
    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
