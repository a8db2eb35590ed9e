/// Access Reconciler - applies resolved batches to the access list
///
/// Converges the access list, cycle over cycle, to exactly
/// {auto-allow ∪ (current roster − auto-deny)}. A skipped cycle leaves
/// state where it was; it never corrupts it.
use crate::{
    acl::AccessList,
    error::WardenResult,
    pipeline::ResolvedBatch,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Operator-supplied allow/deny overrides, normalized so that auto-allow
/// always wins: an account id present in both sets is dropped from deny.
#[derive(Debug, Clone)]
pub struct StaticOverrides {
    /// account id -> display name
    allow: HashMap<String, String>,
    /// account ids, disjoint from `allow`
    deny: HashSet<String>,
}

impl StaticOverrides {
    pub fn new(allowed: &HashMap<String, String>, denied: &HashMap<String, String>) -> Self {
        let allow: HashMap<String, String> = allowed
            .iter()
            .map(|(name, account_id)| (account_id.clone(), name.clone()))
            .collect();

        let deny = denied
            .values()
            .filter(|account_id| !allow.contains_key(*account_id))
            .cloned()
            .collect();

        Self { allow, deny }
    }

    pub fn allow_count(&self) -> usize {
        self.allow.len()
    }

    pub fn deny_count(&self) -> usize {
        self.deny.len()
    }

    /// Is this account id settled statically (either direction)?
    fn covers(&self, account_id: &str) -> bool {
        self.allow.contains_key(account_id) || self.deny.contains(account_id)
    }
}

/// Counts reported by one reconciliation cycle
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    /// dynamic entries added or refreshed
    pub updated: u64,
    /// stale entries removed
    pub expired: u64,
}

pub struct AccessReconciler {
    acl: AccessList,
    overrides: StaticOverrides,
    batches: mpsc::Receiver<ResolvedBatch>,
    cancel: tokio_util::sync::CancellationToken,
}

impl AccessReconciler {
    pub fn new(
        acl: AccessList,
        overrides: StaticOverrides,
        batches: mpsc::Receiver<ResolvedBatch>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            acl,
            overrides,
            batches,
            cancel,
        }
    }

    pub async fn run(mut self) {
        info!(
            "reconciler starting ({} auto-allow and {} auto-deny entries)...",
            self.overrides.allow_count(),
            self.overrides.deny_count()
        );

        if let Err(e) = self.bootstrap(Utc::now()).await {
            error!("access list bootstrap failed: {}", e);
            self.acl.close().await;
            return;
        }

        let mut updates: u64 = 0;

        loop {
            let batch = tokio::select! {
                _ = self.cancel.cancelled() => break,
                maybe = self.batches.recv() => match maybe {
                    Some(batch) => batch,
                    None => break,
                },
            };

            match self.apply(&batch, Utc::now()).await {
                Ok(stats) => {
                    updates += stats.updated;
                    info!("{} dynamic members updated", stats.updated);
                    if stats.expired > 0 {
                        info!("expired {} from access list", stats.expired);
                    }
                }
                // the cycle simply didn't advance; the next batch applies
                // from scratch
                Err(e) => error!("reconcile cycle failed: {}", e),
            }
        }

        self.acl.close().await;
        info!("reconciler shutdown complete: {} access list updates performed", updates);
    }

    /// One-time startup pass: auto-allow identities are inserted (a
    /// no-op if present), auto-deny identities removed.
    pub async fn bootstrap(&self, now: DateTime<Utc>) -> WardenResult<()> {
        for (account_id, display_name) in &self.overrides.allow {
            self.acl.add(account_id, display_name, now).await?;
        }

        for account_id in &self.overrides.deny {
            self.acl.remove(account_id).await?;
        }

        Ok(())
    }

    /// Apply one resolved batch at time `now`.
    pub async fn apply(&self, batch: &ResolvedBatch, now: DateTime<Utc>) -> WardenResult<CycleStats> {
        // auto-allow entries are refreshed unconditionally, keeping them
        // immune to the expiry pass below
        for account_id in self.overrides.allow.keys() {
            self.acl.touch(account_id, now).await?;
        }

        // statically-settled ids are excluded from dynamic processing:
        // auto-allow was refreshed just now, auto-deny was removed at
        // bootstrap and must not be re-added from roster data
        let mut stats = CycleStats::default();
        let mut processed: Vec<&crate::directory::Identity> = Vec::new();
        for identity in batch.values() {
            if self.overrides.covers(&identity.account_id) {
                continue;
            }

            // several handles can resolve to one account
            if processed.iter().any(|seen| seen.same_subject(identity)) {
                continue;
            }

            if !self.acl.touch(&identity.account_id, now).await? {
                self.acl.add(&identity.account_id, &identity.display_name, now).await?;
            }
            processed.push(identity);
            stats.updated += 1;
        }

        // everything not touched this cycle is absent from the current
        // roster and not statically protected
        stats.expired = self.acl.expire(now).await?;

        Ok(stats)
    }
}
