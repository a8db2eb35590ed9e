/// roster-warden - roster-driven join access control
///
/// Polls an external group roster, resolves members to stable account
/// ids through a persistent cache, reconciles them into a durable access
/// list, and serves synchronous join-access checks from it.
mod acl;
mod cache;
mod config;
mod db;
mod directory;
mod error;
mod pipeline;
mod server;

use acl::AccessList;
use config::Config;
use directory::{Directory, HttpDirectory};
use error::WardenResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> WardenResult<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roster_warden=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("reading configuration...");
    let config = Config::load()?;

    // one cancellation token for every worker and the lookup service;
    // Ctrl-C fires it once
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; shutting down...");
                cancel.cancel();
            }
        });
    }

    info!(
        "starting pipeline for roster '{}' (poll interval {}s)",
        config.roster_id(),
        config.group_poll_interval_secs
    );
    let directory: Arc<dyn Directory> = Arc::new(HttpDirectory::new(config.directory_base())?);
    let pipeline = pipeline::start(&config, directory, &cancel).await?;

    // the reconciler creates the access list during bootstrap; don't
    // serve lookups against a file that doesn't exist yet
    info!("waiting for access list creation...");
    while !config.acl_file.exists() && !cancel.is_cancelled() {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = sleep(Duration::from_secs(1)) => {}
        }
    }

    if !cancel.is_cancelled() {
        let acl = AccessList::open(&config.acl_file).await?;
        server::serve(
            server::LookupState { acl: acl.clone() },
            config.service_port,
            cancel.clone(),
        )
        .await?;
        acl.close().await;
    }

    // serve() only returns once shutdown began; make sure the workers
    // see it even if it began with a server error path
    cancel.cancel();

    info!("awaiting worker shutdown...");
    pipeline.join().await;

    info!("shutdown complete");
    Ok(())
}
