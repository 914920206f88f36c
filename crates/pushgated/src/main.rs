use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use db::DBService;
use services::services::{
    config::Settings, engine::Engine, notify::OutboundNotifier, poller::BranchPoller,
};
use tracing_subscriber::{EnvFilter, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,pushgated={level},services={level},db={level},utils={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string).context("failed to create tracing filter")?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let config_path = std::env::var_os("PUSHGATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/pushgate/settings.json"));
    let settings = Arc::new(Settings::load_or_default(&config_path));

    let db = DBService::new(&settings.database.path)
        .await
        .context("failed to open request store")?;

    let (notifier, mut mail_rx, mut chat_rx) = OutboundNotifier::new();
    // Delivery transports attach to these queues out of process; when
    // running standalone the messages are at least visible in the log.
    tokio::spawn(async move {
        while let Some(mail) = mail_rx.recv().await {
            tracing::info!(to = ?mail.recipients, subject = %mail.subject, "outbound mail enqueued");
        }
    });
    tokio::spawn(async move {
        while let Some(chat) = chat_rx.recv().await {
            tracing::info!(to = ?chat.recipients, "outbound chat enqueued");
        }
    });

    let engine = Engine::new(settings, db, Arc::new(notifier));
    let workers = engine.start();
    tracing::info!(workers = workers.len(), "git work queues started");

    tokio::spawn(BranchPoller::new(engine.clone()).run());

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    tracing::info!("shutting down");
    Ok(())
}
