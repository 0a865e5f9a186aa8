//! Core domain model for careerscan: listing candidates, job records and scrape runs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod canonical;

pub use canonical::{canonicalize, url_hash, CanonicalUrl, InvalidUrl, UrlHash};

pub const CRATE_NAME: &str = "careerscan-core";

/// A link harvested from a listing page, before canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateLink {
    pub raw_url: String,
    pub title: String,
    pub team: Option<String>,
    pub location: Option<String>,
}

impl CandidateLink {
    pub fn new(raw_url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            raw_url: raw_url.into(),
            title: title.into(),
            team: None,
            location: None,
        }
    }

    /// Canonicalize and hash this link, producing the dedup key.
    pub fn keyed(self) -> Result<KeyedCandidate, InvalidUrl> {
        let canonical = canonicalize(&self.raw_url)?;
        let hash = url_hash(&canonical);
        Ok(KeyedCandidate {
            link: self,
            canonical,
            hash,
        })
    }
}

/// Candidate link paired with its canonical form and dedup hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedCandidate {
    pub link: CandidateLink,
    pub canonical: CanonicalUrl,
    pub hash: UrlHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Where a job row stands in the detail-extraction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractStatus {
    Pending,
    Extracted,
    Failed,
}

impl ExtractStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractStatus::Pending => "pending",
            ExtractStatus::Extracted => "extracted",
            ExtractStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ExtractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ExtractStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExtractStatus::Pending),
            "extracted" => Ok(ExtractStatus::Extracted),
            "failed" => Ok(ExtractStatus::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Why a render-wait attempt (or a whole job) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NavigationTimeout,
    RenderTimeout,
    ContentNotVisible,
    FatalNavigation,
    ExtractionExhausted,
}

impl FailureReason {
    /// Transient render races get another attempt; everything else is terminal.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureReason::NavigationTimeout
                | FailureReason::RenderTimeout
                | FailureReason::ContentNotVisible
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::NavigationTimeout => "navigation_timeout",
            FailureReason::RenderTimeout => "render_timeout",
            FailureReason::ContentNotVisible => "content_not_visible",
            FailureReason::FatalNavigation => "fatal_navigation",
            FailureReason::ExtractionExhausted => "extraction_exhausted",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "navigation_timeout" => Ok(FailureReason::NavigationTimeout),
            "render_timeout" => Ok(FailureReason::RenderTimeout),
            "content_not_visible" => Ok(FailureReason::ContentNotVisible),
            "fatal_navigation" => Ok(FailureReason::FatalNavigation),
            "extraction_exhausted" => Ok(FailureReason::ExtractionExhausted),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant: {0}")]
pub struct UnknownVariant(pub String);

/// Fields read off a fully rendered detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub title: String,
    pub raw_description: String,
    pub team: Option<String>,
    pub location: Option<String>,
    pub employment_type: Option<String>,
}

/// Persisted job posting. Exactly one row exists per `url_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    pub url_hash: UrlHash,
    pub canonical_url: String,
    pub source_id: String,
    pub title: String,
    pub team: Option<String>,
    pub location: Option<String>,
    pub employment_type: Option<String>,
    /// Empty until the detail page has been extracted.
    pub raw_description: String,
    pub discovered_at: DateTime<Utc>,
    pub scraped_at: Option<DateTime<Utc>>,
    pub processed: bool,
    pub extract_status: ExtractStatus,
    pub failure_reason: Option<FailureReason>,
    pub failure_detail: Option<String>,
    pub attempts: u32,
    pub analyzed_at: Option<DateTime<Utc>>,
}

/// One invocation of the run controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub id: i64,
    pub source_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub jobs_discovered: u32,
    pub jobs_scraped: u32,
    pub jobs_analyzed: u32,
    pub status: RunStatus,
    pub error_message: Option<String>,
}

/// Aggregate counts written when a run is finalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub jobs_discovered: u32,
    pub jobs_scraped: u32,
    pub jobs_analyzed: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reasons_round_trip_through_storage_strings() {
        for reason in [
            FailureReason::NavigationTimeout,
            FailureReason::RenderTimeout,
            FailureReason::ContentNotVisible,
            FailureReason::FatalNavigation,
            FailureReason::ExtractionExhausted,
        ] {
            assert_eq!(reason.as_str().parse::<FailureReason>().unwrap(), reason);
        }
    }

    #[test]
    fn only_render_races_are_retryable() {
        assert!(FailureReason::NavigationTimeout.is_retryable());
        assert!(FailureReason::RenderTimeout.is_retryable());
        assert!(FailureReason::ContentNotVisible.is_retryable());
        assert!(!FailureReason::FatalNavigation.is_retryable());
        assert!(!FailureReason::ExtractionExhausted.is_retryable());
    }

    #[test]
    fn running_is_the_only_open_status() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn keyed_candidate_hashes_the_canonical_form() {
        let a = CandidateLink::new("https://careers.example.com/jobs/42?utm_source=x#apply", "Backend")
            .keyed()
            .unwrap();
        let b = CandidateLink::new("https://CAREERS.example.com/jobs/42", "Backend")
            .keyed()
            .unwrap();
        assert_eq!(a.canonical, b.canonical);
        assert_eq!(a.hash, b.hash);
    }
}
