//! Candidate account sources
//!
//! Which accounts to test is up to the operator. A source only has to hand
//! back an ordered list; [`collect_candidates`] validates and de-duplicates it.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;

/// Supplies candidate account IDs in the order they should be probed
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn candidates(&self) -> Result<Vec<String>>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Candidates given directly, e.g. `--candidates 111111111111,222222222222`
#[derive(Debug, Clone, Default)]
pub struct StaticCandidates {
    ids: Vec<String>,
}

impl StaticCandidates {
    pub fn new(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a comma separated list, ignoring blanks
    pub fn from_list(list: &str) -> Self {
        Self::new(
            list.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty()),
        )
    }
}

#[async_trait]
impl CandidateSource for StaticCandidates {
    async fn candidates(&self) -> Result<Vec<String>> {
        Ok(self.ids.clone())
    }

    fn describe(&self) -> String {
        format!("{} listed on the command line", self.ids.len())
    }
}

/// One account ID per line; blank lines and `#` comments are skipped
#[derive(Debug, Clone)]
pub struct FileCandidates {
    path: PathBuf,
}

impl FileCandidates {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CandidateSource for FileCandidates {
    async fn candidates(&self) -> Result<Vec<String>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read candidates file: {:?}", self.path))?;

        Ok(content
            .lines()
            .map(|line| line.split('#').next().unwrap_or_default().trim())
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// AWS account IDs are exactly 12 ASCII digits
pub fn is_account_id(id: &str) -> bool {
    id.len() == 12 && id.bytes().all(|b| b.is_ascii_digit())
}

/// Gather all sources in order, reject malformed IDs, keep first occurrences
pub async fn collect_candidates(sources: &[Box<dyn CandidateSource>]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();

    for source in sources {
        let ids = source.candidates().await?;
        debug!(source = %source.describe(), count = ids.len(), "Loaded candidates");

        for id in ids {
            if !is_account_id(&id) {
                bail!("Invalid account ID '{}' from {}: expected 12 digits", id, source.describe());
            }
            if seen.insert(id.clone()) {
                ordered.push(id);
            }
        }
    }

    Ok(ordered)
}
