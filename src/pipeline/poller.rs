/// Roster Poller - periodically fetches the full group roster
///
/// Every snapshot handed downstream is the complete current membership;
/// anyone missing from it can be assumed to no longer be in the group.
use crate::{
    directory::{Directory, RosterSnapshot},
    pipeline::Handoff,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

/// Wait after an unsuccessful roster request before trying again
const RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// How long to wait on the snapshot handoff slot before dropping the
/// snapshot. This should never trip unless the resolver is stuck.
const SNAPSHOT_HANDOFF_WAIT: Duration = Duration::from_secs(5);

pub struct RosterPoller {
    directory: Arc<dyn Directory>,
    roster_id: String,
    interval: Duration,
    handoff_wait: Duration,
    retry_backoff: Duration,
    updates: mpsc::Sender<RosterSnapshot>,
    cancel: tokio_util::sync::CancellationToken,
}

impl RosterPoller {
    pub fn new(
        directory: Arc<dyn Directory>,
        roster_id: String,
        interval: Duration,
        updates: mpsc::Sender<RosterSnapshot>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            directory,
            roster_id,
            interval,
            handoff_wait: SNAPSHOT_HANDOFF_WAIT,
            retry_backoff: RETRY_BACKOFF,
            updates,
            cancel,
        }
    }

    pub async fn run(self) {
        info!("poller starting (roster '{}')...", self.roster_id);
        let mut polls: u64 = 0;

        loop {
            polls += 1;

            let snapshot = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.directory.fetch_roster(&self.roster_id) => match result {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!("roster fetch failed: {}", e);
                        info!("retrying in {}s...", self.retry_backoff.as_secs());
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = sleep(self.retry_backoff) => {}
                        }
                        // a retry does not consume a poll interval slot
                        continue;
                    }
                },
            };

            let members = snapshot.members.len();
            match self.deliver(snapshot).await {
                Handoff::Sent => {
                    info!("{} members found and sent for update", members);
                }
                Handoff::Dropped => {
                    // a stale snapshot is worthless once a newer poll can
                    // supersede it; never stall the poller on a stuck
                    // downstream stage
                    warn!(
                        "snapshot handoff still occupied after {}s; {} member snapshot DROPPED",
                        self.handoff_wait.as_secs(),
                        members
                    );
                }
                Handoff::Closed => {
                    if !self.cancel.is_cancelled() {
                        error!("resolver hung up; stopping poller");
                    }
                    break;
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.interval) => {}
            }
        }

        info!("poller shutdown complete: {} polls made", polls);
    }

    /// Offer a snapshot to the single-slot handoff, waiting at most
    /// `handoff_wait` for the slot to free up.
    async fn deliver(&self, snapshot: RosterSnapshot) -> Handoff {
        match timeout(self.handoff_wait, self.updates.send(snapshot)).await {
            Ok(Ok(())) => Handoff::Sent,
            Ok(Err(_)) => Handoff::Closed,
            Err(_) => Handoff::Dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::FakeDirectory;
    use std::time::Instant;
    use tokio_util::sync::CancellationToken;

    fn snapshot(members: &[&str]) -> RosterSnapshot {
        RosterSnapshot {
            group_name: "Test Group".to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn poller(
        directory: Arc<FakeDirectory>,
        updates: mpsc::Sender<RosterSnapshot>,
        cancel: CancellationToken,
    ) -> RosterPoller {
        let mut poller = RosterPoller::new(
            directory,
            "my-clan".to_string(),
            Duration::from_secs(60),
            updates,
            cancel,
        );
        poller.handoff_wait = Duration::from_millis(50);
        poller.retry_backoff = Duration::from_millis(10);
        poller
    }

    #[tokio::test]
    async fn occupied_slot_drops_within_the_bounded_wait() {
        let directory = Arc::new(FakeDirectory::new(snapshot(&["h1"])));
        let (tx, _rx) = mpsc::channel(1);

        // occupy the single slot; the receiver never drains it
        tx.send(snapshot(&["old"])).await.unwrap();

        let poller = poller(directory, tx, CancellationToken::new());
        let started = Instant::now();
        let outcome = poller.deliver(snapshot(&["h1"])).await;

        assert!(matches!(outcome, Handoff::Dropped));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn free_slot_delivers() {
        let directory = Arc::new(FakeDirectory::new(snapshot(&["h1"])));
        let (tx, mut rx) = mpsc::channel(1);

        let poller = poller(directory, tx, CancellationToken::new());
        let outcome = poller.deliver(snapshot(&["h1", "h2"])).await;

        assert!(matches!(outcome, Handoff::Sent));
        assert_eq!(rx.recv().await.unwrap().members.len(), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let directory = Arc::new(FakeDirectory::new(snapshot(&["h1"])));
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(poller(directory, tx, cancel.clone()).run());

        // one snapshot arrives, then the poller sleeps on its interval
        assert_eq!(rx.recv().await.unwrap().members, vec!["h1".to_string()]);
        cancel.cancel();

        timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller did not observe cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn transient_failure_backs_off_and_retries() {
        let directory = Arc::new(FakeDirectory::new(snapshot(&["h1"])));
        directory.fail_roster_times(2);
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(poller(directory.clone(), tx, cancel.clone()).run());

        // delivered despite the two injected failures
        let delivered = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("poller never recovered")
            .unwrap();
        assert_eq!(delivered.members, vec!["h1".to_string()]);
        assert_eq!(directory.roster_calls(), 3);

        cancel.cancel();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
