/// HTTP Directory Service client
///
/// Fetches roster and identity documents as JSON. Any of a failed
/// request, a non-2xx status, a non-JSON content type, or an explicit
/// upstream error body is reported as a transient `Upstream` error.
use crate::{
    directory::{Directory, Identity, RosterSnapshot},
    error::{WardenError, WardenResult},
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

const USER_AGENT: &str = concat!("roster-warden/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Members document served at `{base}/groups/{roster_id}/members`
#[derive(Debug, Deserialize)]
struct MembersPage {
    group_name: String,
    members: Vec<MemberRecord>,
}

#[derive(Debug, Deserialize)]
struct MemberRecord {
    handle: String,
    #[allow(dead_code)]
    #[serde(default)]
    display_name: String,
}

/// Explicit upstream error body, served with a 200 status for dead or
/// private profiles.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ErrorPage {
    error: String,
}

/// Directory service client over HTTP
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(base_url: impl Into<String>) -> WardenResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| WardenError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> WardenResult<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| WardenError::Upstream(format!("({}) request failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WardenError::Upstream(format!(
                "({}) bad HTTP result: {}",
                url, status
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.starts_with("application/json") {
            return Err(WardenError::Upstream(format!(
                "({}) unsupported content type: {}",
                url, content_type
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| WardenError::Upstream(format!("({}) body read failed: {}", url, e)))?;

        decode_body(url, &body)
    }
}

/// Decode a response body, surfacing an explicit error page as an
/// upstream failure.
fn decode_body<T: DeserializeOwned>(url: &str, body: &str) -> WardenResult<T> {
    if let Ok(page) = serde_json::from_str::<ErrorPage>(body) {
        return Err(WardenError::Upstream(format!("({}) {}", url, page.error)));
    }

    serde_json::from_str(body)
        .map_err(|e| WardenError::Upstream(format!("({}) unparseable response: {}", url, e)))
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn fetch_roster(&self, roster_id: &str) -> WardenResult<RosterSnapshot> {
        let url = format!("{}/groups/{}/members", self.base_url, roster_id);
        let page: MembersPage = self.get_json(&url).await?;

        Ok(RosterSnapshot {
            group_name: page.group_name,
            members: page.members.into_iter().map(|m| m.handle).collect(),
        })
    }

    async fn fetch_identity(&self, handle: &str) -> WardenResult<Identity> {
        // the handle IS the member's profile URL
        let mut identity: Identity = self.get_json(handle).await?;
        identity.handle = handle.to_string();
        Ok(identity)
    }
}
