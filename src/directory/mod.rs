/// Directory Service
///
/// The external source of truth: a roster lookup returning the complete
/// current membership, and a member lookup resolving an opaque handle into
/// a stable account identity. Both calls may fail transiently; callers are
/// expected to retry.
pub mod http;

pub use http::HttpDirectory;

use crate::error::WardenResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A resolved member identity.
///
/// `account_id` is the canonical, stable identifier used for
/// authorization; `display_name` is informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// The handle this identity was resolved from
    pub handle: String,
    pub display_name: String,
    pub account_id: String,
}

impl Identity {
    /// Two identities are the same authorization subject iff their
    /// account ids match. Display names and handles both change over
    /// time; the account id does not.
    pub fn same_subject(&self, other: &Identity) -> bool {
        self.account_id == other.account_id
    }
}

/// One complete membership snapshot for a poll cycle.
///
/// Absence from `members` means "no longer a member" — snapshots are
/// never incremental.
#[derive(Debug, Clone)]
pub struct RosterSnapshot {
    /// Group display name, informational only
    pub group_name: String,
    /// Member handles in roster order
    pub members: Vec<String>,
}

/// Directory service operations.
///
/// One concrete implementation talks HTTP; tests substitute fakes.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Fetch the complete current roster for a group.
    async fn fetch_roster(&self, roster_id: &str) -> WardenResult<RosterSnapshot>;

    /// Resolve a member handle into an identity.
    async fn fetch_identity(&self, handle: &str) -> WardenResult<Identity>;
}
