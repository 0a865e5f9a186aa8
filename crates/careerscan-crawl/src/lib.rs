//! Crawl orchestration: configuration, source registry, discovery, render-wait
//! extraction and the run controller.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use careerscan_adapters::SourceProfile;
use serde::Deserialize;

pub mod controller;
pub mod discovery;
pub mod extract;

pub use controller::{JobFailure, RunController, RunError, RunMode, RunOptions, RunReport};
pub use discovery::{DiscoveryConfig, DiscoveryEngine, DiscoveryError, DiscoveryOutcome, StopReason};
pub use extract::{
    AttemptFailure, BackoffPolicy, DetailTarget, ExtractionOutcome, Phase, RenderWaitConfig,
    RenderWaitExtractor,
};

pub const CRATE_NAME: &str = "careerscan-crawl";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceProfile>,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text).context("decoding source registry")?;
        let mut seen = std::collections::HashSet::new();
        for source in &registry.sources {
            if !seen.insert(source.source_id.as_str()) {
                anyhow::bail!("duplicate source_id {}", source.source_id);
            }
            source
                .validate()
                .with_context(|| format!("validating source {}", source.source_id))?;
        }
        Ok(registry)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceProfile> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceProfile> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub database_url: String,
    pub sources_path: PathBuf,
    pub headless: bool,
    pub workers: usize,
    pub scroll_pause: Duration,
    pub max_scrolls: u32,
    pub stale_threshold: u32,
    pub discovery_timeout: Duration,
    pub nav_timeout: Duration,
    pub quiet_window: Duration,
    pub quiesce_timeout: Duration,
    pub visible_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    /// A worker replaces its page session after this many jobs.
    pub session_recycle_jobs: u32,
    pub run_timeout: Option<Duration>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl CrawlConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        // Unparsable or out-of-range values fall back to the default.
        fn parsed<T: FromStr>(value: Option<String>, default: T) -> T {
            value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        }
        let secs = |key: &str, default: u64| Duration::from_secs(parsed(lookup(key), default));
        let millis = |key: &str, default: u64| Duration::from_millis(parsed(lookup(key), default));

        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://data/jobs.db".to_string()),
            sources_path: lookup("CAREERSCAN_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            headless: lookup("CAREERSCAN_HEADLESS")
                .map(|v| !matches!(v.trim(), "0" | "false" | "FALSE" | "False" | "no"))
                .unwrap_or(true),
            workers: parsed::<usize>(lookup("CAREERSCAN_WORKERS"), 3).max(1),
            scroll_pause: millis("CAREERSCAN_SCROLL_PAUSE_MS", 2000),
            max_scrolls: parsed::<u32>(lookup("CAREERSCAN_MAX_SCROLLS"), 20).max(1),
            stale_threshold: parsed::<u32>(lookup("CAREERSCAN_STALE_THRESHOLD"), 2).max(1),
            discovery_timeout: secs("CAREERSCAN_DISCOVERY_TIMEOUT_SECS", 300),
            nav_timeout: secs("CAREERSCAN_NAV_TIMEOUT_SECS", 60),
            quiet_window: millis("CAREERSCAN_QUIET_WINDOW_MS", 500),
            quiesce_timeout: secs("CAREERSCAN_QUIESCE_TIMEOUT_SECS", 20),
            visible_timeout: secs("CAREERSCAN_VISIBLE_TIMEOUT_SECS", 15),
            max_attempts: parsed::<u32>(lookup("CAREERSCAN_MAX_ATTEMPTS"), 3).max(1),
            backoff_base: millis("CAREERSCAN_BACKOFF_BASE_MS", 2000),
            session_recycle_jobs: parsed::<u32>(lookup("CAREERSCAN_SESSION_RECYCLE_JOBS"), 20)
                .max(1),
            run_timeout: Some(parsed::<u64>(lookup("CAREERSCAN_RUN_TIMEOUT_SECS"), 0))
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }

    pub fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            settle_delay: self.scroll_pause,
            stale_threshold: self.stale_threshold,
            max_scrolls: self.max_scrolls,
            max_duration: self.discovery_timeout,
            nav_timeout: self.nav_timeout,
            ..DiscoveryConfig::default()
        }
    }

    pub fn render_wait(&self) -> RenderWaitConfig {
        RenderWaitConfig {
            nav_timeout: self.nav_timeout,
            quiet_window: self.quiet_window,
            quiesce_timeout: self.quiesce_timeout,
            visible_timeout: self.visible_timeout,
            max_attempts: self.max_attempts,
            politeness: self.scroll_pause,
            backoff: BackoffPolicy {
                base_delay: self.backoff_base,
                max_delay: self.backoff_base.saturating_mul(8),
            },
            ..RenderWaitConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn config_defaults_match_documented_values() {
        let config = CrawlConfig::default();
        assert_eq!(config.database_url, "sqlite://data/jobs.db");
        assert!(config.headless);
        assert_eq!(config.workers, 3);
        assert_eq!(config.stale_threshold, 2);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.scroll_pause, Duration::from_secs(2));
        assert_eq!(config.run_timeout, None);
        assert_eq!(config.session_recycle_jobs, 20);
        assert_eq!(config.render_wait().politeness, Duration::from_secs(2));
        assert_eq!(config.render_wait().backoff.delay_for_attempt(1), Duration::from_secs(4));
    }

    #[test]
    fn config_reads_overrides_and_ignores_garbage() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CAREERSCAN_WORKERS", "8"),
            ("CAREERSCAN_HEADLESS", "false"),
            ("CAREERSCAN_MAX_ATTEMPTS", "not-a-number"),
            ("CAREERSCAN_RUN_TIMEOUT_SECS", "90"),
            ("CAREERSCAN_QUIET_WINDOW_MS", "750"),
        ]);
        let config = CrawlConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.workers, 8);
        assert!(!config.headless);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.run_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.render_wait().quiet_window, Duration::from_millis(750));
    }

    #[test]
    fn config_rejects_zero_and_overflowing_counts() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CAREERSCAN_MAX_SCROLLS", "0"),
            ("CAREERSCAN_STALE_THRESHOLD", "4294967298"),
            ("CAREERSCAN_MAX_ATTEMPTS", "-1"),
            ("CAREERSCAN_SESSION_RECYCLE_JOBS", "0"),
        ]);
        let config = CrawlConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.max_scrolls, 1);
        assert_eq!(config.stale_threshold, 2);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.session_recycle_jobs, 1);

        let env: HashMap<&str, &str> = HashMap::from([("CAREERSCAN_MAX_SCROLLS", "5000000000")]);
        let config = CrawlConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.max_scrolls, 20);
        assert_eq!(config.discovery().max_scrolls, 20);
    }

    const REGISTRY: &str = r##"
sources:
  - source_id: acme
    display_name: Acme Corp
    listing_urls:
      - https://careers.acme.example/jobs
    search_url: "https://careers.acme.example/search?q="
    search_terms: ["Backend Engineer"]
    selectors:
      job_card: "li.job"
      job_link: "a"
      job_title: ".title"
      job_location: ".location"
      detail_description: "#job-description"
      detail_type: ".employment-type"
  - source_id: globex
    display_name: Globex
    enabled: false
    listing_urls: ["https://globex.example/careers"]
    selectors:
      job_card: ".card"
      job_link: "a.apply"
      job_title: "h3"
      detail_title: "h2.role"
      detail_description: ".desc"
"##;

    #[test]
    fn registry_parses_and_filters_enabled_sources() {
        let registry = SourceRegistry::from_yaml(REGISTRY).unwrap();
        let enabled: Vec<_> = registry.enabled().map(|s| s.source_id.as_str()).collect();
        assert_eq!(enabled, vec!["acme"]);

        let acme = registry.get("acme").unwrap();
        assert_eq!(acme.listing_targets().len(), 2);
        assert_eq!(acme.selectors.detail.detail_title, "h1");
        assert_eq!(
            acme.selectors.listing.job_location.as_deref(),
            Some(".location")
        );
        assert_eq!(registry.get("globex").unwrap().selectors.detail.detail_title, "h2.role");
    }

    #[test]
    fn registry_rejects_duplicate_ids_and_bad_selectors() {
        let duplicated = REGISTRY.replace("source_id: globex", "source_id: acme");
        assert!(SourceRegistry::from_yaml(&duplicated).is_err());

        let broken = REGISTRY.replace("\"li.job\"", "\"li[\"");
        let err = SourceRegistry::from_yaml(&broken).unwrap_err();
        assert!(format!("{err:#}").contains("acme"));
    }

    #[test]
    fn bundled_sources_file_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml");
        let registry = SourceRegistry::load(&path).unwrap();
        let enabled: Vec<_> = registry.enabled().map(|s| s.source_id.as_str()).collect();
        assert_eq!(enabled, vec!["acme"]);
        assert_eq!(registry.get("acme").unwrap().listing_targets().len(), 3);
    }
}
