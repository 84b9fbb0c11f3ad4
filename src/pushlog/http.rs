//! Push-log sources: Mercurial HTTP endpoint and an offline stand-in

use super::json::{parse_pushes, Push};
use super::{PushLogError, PushLogSource};
use std::collections::HashMap;
use std::time::Duration;

/// Blocking client for `<base_url>/<repo_path>/json-pushes`
#[derive(Debug, Clone)]
pub struct HgPushLog {
    base_url: String,
    repo_paths: HashMap<String, String>,
    client: reqwest::blocking::Client,
}

impl HgPushLog {
    /// `repo_paths` maps branch names to repository paths; unknown branches
    /// use their own name
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        repo_paths: HashMap<String, String>,
    ) -> Result<Self, PushLogError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("perfalert/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            repo_paths,
            client,
        })
    }

    fn repo_path<'a>(&'a self, branch: &'a str) -> &'a str {
        self.repo_paths
            .get(branch)
            .map(String::as_str)
            .unwrap_or(branch)
    }

    pub fn changesets_url(&self, branch: &str, revisions: &[String]) -> String {
        let query: Vec<String> = revisions
            .iter()
            .map(|r| format!("changeset={}", r))
            .collect();
        format!(
            "{}/{}/json-pushes?full=1&{}",
            self.base_url,
            self.repo_path(branch),
            query.join("&")
        )
    }

    pub fn range_url(&self, branch: &str, from: &str, to: &str) -> String {
        format!(
            "{}/{}/json-pushes?full=1&fromchange={}&tochange={}",
            self.base_url,
            self.repo_path(branch),
            from,
            to
        )
    }

    fn get(&self, url: &str) -> Result<Vec<Push>, PushLogError> {
        tracing::debug!("GET {}", url);
        let response = self.client.get(url).send()?;
        if !response.status().is_success() {
            return Err(PushLogError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        let bytes = response.bytes()?;
        parse_pushes(&bytes)
    }
}

impl PushLogSource for HgPushLog {
    fn fetch_changesets(&self, branch: &str, revisions: &[String]) -> Result<Vec<Push>, PushLogError> {
        self.get(&self.changesets_url(branch, revisions))
    }

    fn fetch_range(&self, branch: &str, from: &str, to: &str) -> Result<Vec<Push>, PushLogError> {
        self.get(&self.range_url(branch, from, to))
    }
}

/// Source used when no push-log server is configured
///
/// Every lookup fails softly, so points keep their arrival order.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflinePushLog;

impl PushLogSource for OfflinePushLog {
    fn fetch_changesets(&self, _branch: &str, _revisions: &[String]) -> Result<Vec<Push>, PushLogError> {
        Err(PushLogError::Unavailable)
    }

    fn fetch_range(&self, _branch: &str, _from: &str, _to: &str) -> Result<Vec<Push>, PushLogError> {
        Err(PushLogError::Unavailable)
    }
}
