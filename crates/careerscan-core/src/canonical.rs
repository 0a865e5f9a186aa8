//! URL canonicalization and the content-addressed dedup key.
//!
//! The rule: absolute `http`/`https` URLs only; scheme and host lowercased and
//! default ports dropped (via `url`); fragment removed; tracking parameters
//! removed; remaining query pairs stably sorted by key; a trailing `/` on a
//! non-root path removed. The rule is idempotent.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "gh_src", "lever-source", "mc_cid", "mc_eid", "ref", "referrer", "src",
    "source", "trk",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidUrl {
    #[error("unparseable url {input:?}: {message}")]
    Parse { input: String, message: String },
    #[error("unsupported scheme {scheme:?} in {input:?}")]
    Scheme { input: String, scheme: String },
    #[error("url has no host: {0:?}")]
    MissingHost(String),
}

/// A URL in canonical form. Two postings with equal canonical URLs are the same job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalUrl(Url);

impl CanonicalUrl {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// Lowercase hex SHA-256 of a canonical URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UrlHash(String);

impl UrlHash {
    pub const HEX_LEN: usize = 64;

    /// Accepts a stored digest; rejects anything that is not 64 lowercase hex chars.
    pub fn from_hex(hex: impl Into<String>) -> Option<Self> {
        let hex = hex.into();
        let valid = hex.len() == Self::HEX_LEN
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then_some(Self(hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UrlHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

pub fn canonicalize(raw_url: &str) -> Result<CanonicalUrl, InvalidUrl> {
    let mut url = Url::parse(raw_url.trim()).map_err(|e| InvalidUrl::Parse {
        input: raw_url.to_string(),
        message: e.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(InvalidUrl::Scheme {
            input: raw_url.to_string(),
            scheme: url.scheme().to_string(),
        });
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(InvalidUrl::MissingHost(raw_url.to_string()));
    }

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.is_empty() && !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    Ok(CanonicalUrl(url))
}

pub fn url_hash(canonical: &CanonicalUrl) -> UrlHash {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_str().as_bytes());
    UrlHash(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fragment_tracking_and_trailing_slash() {
        let c = canonicalize("HTTPS://Jobs.Example.com:443/openings/123/?utm_source=li&b=2&a=1#apply")
            .unwrap();
        assert_eq!(c.as_str(), "https://jobs.example.com/openings/123?a=1&b=2");
    }

    #[test]
    fn keeps_identifying_query_params() {
        let a = canonicalize("https://boards.example.com/acme?gh_jid=1001").unwrap();
        let b = canonicalize("https://boards.example.com/acme?gh_jid=1002").unwrap();
        assert_ne!(a, b);
        assert_ne!(url_hash(&a), url_hash(&b));
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let inputs = [
            "https://example.com/",
            "https://example.com/a/b/?z=1&y=two%20words&utm_medium=x",
            "http://example.com:8080/path?q=a+b#frag",
            "https://example.com/search?category=Backend+Engineer&ref=home",
            "https://example.com/x?k=2&k=1",
        ];
        for input in inputs {
            let once = canonicalize(input).unwrap();
            let twice = canonicalize(once.as_str()).unwrap();
            assert_eq!(once, twice, "not idempotent for {input}");
        }
    }

    #[test]
    fn hash_is_deterministic_sha256_hex() {
        let c = canonicalize("https://example.com/jobs/1").unwrap();
        let h1 = url_hash(&c);
        let h2 = url_hash(&canonicalize("https://example.com/jobs/1#top").unwrap());
        assert_eq!(h1, h2);
        assert_eq!(h1.as_str().len(), UrlHash::HEX_LEN);
        assert_eq!(UrlHash::from_hex(h1.as_str()), Some(h1));
    }

    #[test]
    fn rejects_malformed_and_non_web_urls() {
        assert!(matches!(canonicalize("/jobs/1"), Err(InvalidUrl::Parse { .. })));
        assert!(matches!(
            canonicalize("mailto:jobs@example.com"),
            Err(InvalidUrl::Scheme { .. })
        ));
        assert!(matches!(
            canonicalize("javascript:void(0)"),
            Err(InvalidUrl::Scheme { .. })
        ));
        assert!(UrlHash::from_hex("not-a-hash").is_none());
    }
}
