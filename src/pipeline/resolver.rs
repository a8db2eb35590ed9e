/// Identity Resolver - turns roster snapshots into resolved batches
///
/// Each handle resolves through the identity cache first, then through
/// the directory service with bounded parallelism and a per-handle retry
/// budget. A snapshot with any member still unresolved after retries is
/// discarded whole: acting on a membership list known to be incomplete
/// risks wrongly de-authorizing members that merely failed to resolve
/// this cycle.
use crate::{
    cache::IdentityCache,
    directory::{Directory, Identity, RosterSnapshot},
    error::WardenResult,
    pipeline::ResolvedBatch,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How many identity requests to keep in flight at once
const RESOLVER_WORKERS: usize = 4;

/// How many times to attempt resolving a single handle before declaring
/// it unresolved for this cycle
const MAX_RESOLVE_ATTEMPTS: u32 = 3;

/// How long a resolved identity stays cached without being seen
const CACHE_TTL_DAYS: i64 = 7;

/// How long to wait on the resolved-batch handoff before declaring the
/// reconciler stuck. Unlike a roster snapshot, a resolved batch is
/// expensive to recreate, so exceeding this is fatal, not a drop.
const BATCH_HANDOFF_WAIT: Duration = Duration::from_secs(300);

pub struct IdentityResolver {
    directory: Arc<dyn Directory>,
    cache: IdentityCache,
    cache_ttl: chrono::Duration,
    max_attempts: u32,
    worker_count: usize,
    batch_handoff_wait: Duration,
    snapshots: mpsc::Receiver<RosterSnapshot>,
    resolved: mpsc::Sender<ResolvedBatch>,
    cancel: tokio_util::sync::CancellationToken,
    upstream_requests: u64,
    cache_hits: u64,
}

impl IdentityResolver {
    pub fn new(
        directory: Arc<dyn Directory>,
        cache: IdentityCache,
        snapshots: mpsc::Receiver<RosterSnapshot>,
        resolved: mpsc::Sender<ResolvedBatch>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            directory,
            cache,
            cache_ttl: chrono::Duration::days(CACHE_TTL_DAYS),
            max_attempts: MAX_RESOLVE_ATTEMPTS,
            worker_count: RESOLVER_WORKERS,
            batch_handoff_wait: BATCH_HANDOFF_WAIT,
            snapshots,
            resolved,
            cancel,
            upstream_requests: 0,
            cache_hits: 0,
        }
    }

    pub async fn run(mut self) {
        info!("resolver starting...");

        loop {
            let snapshot = tokio::select! {
                _ = self.cancel.cancelled() => break,
                maybe = self.snapshots.recv() => match maybe {
                    Some(snapshot) => snapshot,
                    None => break,
                },
            };

            let batch = match self.resolve_snapshot(&snapshot, Utc::now()).await {
                Ok(Some(batch)) => Some(batch),
                Ok(None) => None, // incomplete; already logged
                Err(e) => {
                    error!("resolution cycle failed: {}", e);
                    None
                }
            };

            if let Some(batch) = batch {
                match timeout(self.batch_handoff_wait, self.resolved.send(batch)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        if !self.cancel.is_cancelled() {
                            error!("reconciler hung up; stopping resolver");
                        }
                        break;
                    }
                    Err(_) => {
                        // losing a fully resolved batch means redoing all
                        // of its upstream work; a stall here is an outage,
                        // not backpressure
                        error!(
                            "resolved batch handoff stalled for {}s; reconciler appears stuck, stopping resolver",
                            self.batch_handoff_wait.as_secs()
                        );
                        break;
                    }
                }
            }

            // cycle complete, hit or miss: evict lapsed cache entries
            match self.cache.sweep(Utc::now()).await {
                Ok(0) => {}
                Ok(evicted) => info!("expired {} cache entries", evicted),
                Err(e) => error!("cache sweep failed: {}", e),
            }
        }

        self.cache.close().await;
        info!(
            "resolver shutdown complete: {} upstream requests ({} cache hits)",
            self.upstream_requests, self.cache_hits
        );
    }

    /// Resolve every member of a snapshot, returning the full batch, or
    /// `None` if any member stayed unresolved after its retry budget.
    async fn resolve_snapshot(
        &mut self,
        snapshot: &RosterSnapshot,
        now: DateTime<Utc>,
    ) -> WardenResult<Option<ResolvedBatch>> {
        let mut batch = ResolvedBatch::new();
        let mut missing: Vec<String> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();

        for handle in &snapshot.members {
            if !seen.insert(handle.as_str()) {
                continue;
            }
            match self.cache.get(handle, now).await? {
                Some(entry) => {
                    self.cache_hits += 1;
                    batch.insert(handle.clone(), entry.identity());
                }
                None => missing.push(handle.clone()),
            }
        }

        // resolve the remainder upstream, a bounded number in flight
        let max_attempts = self.max_attempts;
        let outcomes: Vec<(String, Option<Identity>, u32)> = stream::iter(
            missing.into_iter().map(|handle| {
                let directory = Arc::clone(&self.directory);
                async move {
                    let (identity, attempts) =
                        resolve_one(directory.as_ref(), &handle, max_attempts).await;
                    (handle, identity, attempts)
                }
            }),
        )
        .buffer_unordered(self.worker_count)
        .collect()
        .await;

        let mut unresolved: Vec<String> = Vec::new();
        for (handle, identity, attempts) in outcomes {
            self.upstream_requests += u64::from(attempts);
            match identity {
                Some(identity) => {
                    self.cache.put(&handle, &identity, self.cache_ttl, now).await?;
                    batch.insert(handle, identity);
                }
                None => unresolved.push(handle),
            }
        }

        if !unresolved.is_empty() {
            warn!(
                "{} of {} members failed to resolve; discarding batch",
                unresolved.len(),
                snapshot.members.len()
            );
            for handle in &unresolved {
                warn!("unresolved member: {}", handle);
            }
            return Ok(None);
        }

        Ok(Some(batch))
    }
}

/// Resolve a single handle, retrying transient failures. Attempts are
/// independent calls, never partial-state retries.
async fn resolve_one(
    directory: &dyn Directory,
    handle: &str,
    max_attempts: u32,
) -> (Option<Identity>, u32) {
    for attempt in 1..=max_attempts {
        match directory.fetch_identity(handle).await {
            Ok(identity) => {
                debug!(
                    "[{}/{}] resolved {} -> {}",
                    attempt, max_attempts, handle, identity.account_id
                );
                return (Some(identity), attempt);
            }
            Err(e) => {
                warn!("[{}/{}] failed to resolve {}: {}", attempt, max_attempts, handle, e);
            }
        }
    }

    warn!("max resolve attempts reached for {}", handle);
    (None, max_attempts)
}
