/// Pipeline orchestration
///
/// Three long-running workers — poller, resolver, reconciler — connected
/// by two single-slot handoff channels. Each worker owns its own store
/// handle; the channels and the durable stores are the only shared
/// state. One cancellation token stops all three at their next safe
/// point.
pub mod poller;
pub mod reconciler;
pub mod resolver;

pub use poller::RosterPoller;
pub use reconciler::{AccessReconciler, StaticOverrides};
pub use resolver::IdentityResolver;

use crate::{
    acl::AccessList,
    cache::IdentityCache,
    config::Config,
    directory::{Directory, Identity},
    error::WardenResult,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A fully resolved snapshot: member handle -> identity
pub type ResolvedBatch = HashMap<String, Identity>;

/// Outcome of offering a value to a single-slot handoff
#[derive(Debug)]
pub enum Handoff {
    Sent,
    /// Slot stayed occupied past the bounded wait
    Dropped,
    /// Receiver is gone
    Closed,
}

/// Handles to the three running workers
pub struct Pipeline {
    poller: JoinHandle<()>,
    resolver: JoinHandle<()>,
    reconciler: JoinHandle<()>,
}

impl Pipeline {
    /// Wait for every worker to finish. Workers only finish once the
    /// shared cancellation token fires (or on a fatal pipeline error).
    pub async fn join(self) {
        for (name, handle) in [
            ("poller", self.poller),
            ("resolver", self.resolver),
            ("reconciler", self.reconciler),
        ] {
            match handle.await {
                Ok(()) => info!(" > {} stopped", name),
                Err(e) => error!(" > {} aborted: {}", name, e),
            }
        }
    }
}

/// Open the stores, wire the handoff channels, and spawn the workers.
pub async fn start(
    config: &Config,
    directory: Arc<dyn Directory>,
    cancel: &CancellationToken,
) -> WardenResult<Pipeline> {
    let (snapshot_tx, snapshot_rx) = mpsc::channel(1);
    let (batch_tx, batch_rx) = mpsc::channel(1);

    let cache = IdentityCache::open(&config.cache_file).await?;
    let acl = AccessList::open(&config.acl_file).await?;

    let poller = RosterPoller::new(
        Arc::clone(&directory),
        config.roster_id().to_string(),
        Duration::from_secs(config.group_poll_interval_secs),
        snapshot_tx,
        cancel.clone(),
    );

    let resolver = IdentityResolver::new(directory, cache, snapshot_rx, batch_tx, cancel.clone());

    let reconciler = AccessReconciler::new(
        acl,
        StaticOverrides::new(&config.allowed, &config.denied),
        batch_rx,
        cancel.clone(),
    );

    Ok(Pipeline {
        poller: tokio::spawn(poller.run()),
        resolver: tokio::spawn(resolver.run()),
        reconciler: tokio::spawn(reconciler.run()),
    })
}


#[cfg(test)]
mod tests {
    use super::testing::FakeDirectory;
    use super::*;
    use crate::directory::RosterSnapshot;
    use std::time::Instant;

    fn snapshot(members: &[&str]) -> RosterSnapshot {
        RosterSnapshot {
            group_name: "Test Group".to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    async fn wait_for<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !check().await {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Full resolver -> reconciler path over real store files, driven by
    /// hand-fed snapshots instead of the interval poller.
    #[tokio::test]
    async fn snapshots_flow_through_to_the_access_list() {
        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("cache.sqlite");
        let acl_file = dir.path().join("acl.sqlite");

        let directory = Arc::new(FakeDirectory::new(snapshot(&[])));
        directory.insert_identity("h1", "Alice", "1001");
        directory.insert_identity("h2", "Bob", "1002");

        let (snapshot_tx, snapshot_rx) = mpsc::channel(1);
        let (batch_tx, batch_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let cache = IdentityCache::open(&cache_file).await.unwrap();
        let acl = AccessList::open(&acl_file).await.unwrap();

        let resolver = IdentityResolver::new(
            directory.clone() as Arc<dyn Directory>,
            cache,
            snapshot_rx,
            batch_tx,
            cancel.clone(),
        );
        let reconciler = AccessReconciler::new(
            acl,
            StaticOverrides::new(&HashMap::new(), &HashMap::new()),
            batch_rx,
            cancel.clone(),
        );

        let resolver_task = tokio::spawn(resolver.run());
        let reconciler_task = tokio::spawn(reconciler.run());

        snapshot_tx.send(snapshot(&["h1", "h2"])).await.unwrap();

        // observe through an independent handle, like the lookup service
        let observer = AccessList::open(&acl_file).await.unwrap();
        wait_for("both members to be authorized", || {
            let observer = observer.clone();
            async move {
                observer.find("1001").await.unwrap().is_some()
                    && observer.find("1002").await.unwrap().is_some()
            }
        })
        .await;

        // a shrunk roster expires the departed member on the next cycle
        snapshot_tx.send(snapshot(&["h1"])).await.unwrap();
        wait_for("the departed member to expire", || {
            let observer = observer.clone();
            async move { observer.find("1002").await.unwrap().is_none() }
        })
        .await;
        assert!(observer.find("1001").await.unwrap().is_some());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), resolver_task)
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), reconciler_task)
            .await
            .unwrap()
            .unwrap();
        observer.close().await;
    }
}
