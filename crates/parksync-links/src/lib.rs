//! Link validation over canonical park records.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parksync_core::{CanonicalPark, LinkType};
use parksync_storage::{
    read_json, write_json, HttpFetcher, ObjectStore, ProbeMethod, ProbeResponse, StoreError,
    TokenBucketConfig,
};
use reqwest::Url;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "parksync-links";

/// Hosts that answer automated clients with 403 while serving browsers normally.
pub const DEFAULT_BROWSER_ONLY_DOMAINS: &[&str] =
    &["recreation.gov", "reserveamerica.com", "fs.usda.gov"];

const SOFT_404_MARKERS: &[&str] = &["page not found", "404"];
const WORST_ENTITY_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Ok,
    Redirect,
    Broken,
    Timeout,
    Error,
    BrowserOnly,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Redirect => "redirect",
            Self::Broken => "broken",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::BrowserOnly => "browser_only",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkCheckConfig {
    /// Upper bound on waiting for one request.
    pub timeout: Duration,
    /// Minimum spacing between requests to the same host.
    pub pace: Duration,
    pub concurrency: usize,
    pub browser_only_domains: Vec<String>,
}

impl Default for LinkCheckConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            pace: Duration::from_millis(500),
            concurrency: 4,
            browser_only_domains: DEFAULT_BROWSER_ONLY_DOMAINS
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl LinkCheckConfig {
    fn is_browser_only(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.browser_only_domains.iter().any(|domain| {
            let domain = domain.to_ascii_lowercase();
            host == domain || host.ends_with(&format!(".{domain}"))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkReferrer {
    pub entity_id: String,
    pub entity_name: String,
    pub region: String,
}

/// One distinct URL and every entity that points at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    pub url: String,
    pub link_type: LinkType,
    pub referrers: Vec<LinkReferrer>,
}

/// Gathers park links, contact websites and campground reservation URLs.
///
/// A URL shared by several parks becomes one target; the first link type seen wins.
pub fn collect_targets<'a>(parks: impl IntoIterator<Item = &'a CanonicalPark>) -> Vec<LinkTarget> {
    let mut by_url: BTreeMap<String, LinkTarget> = BTreeMap::new();
    for park in parks {
        let referrer = LinkReferrer {
            entity_id: park.id.clone(),
            entity_name: park.name.clone(),
            region: park.region.clone(),
        };
        let candidates = park
            .links
            .iter()
            .map(|l| (l.link_type, l.url.as_str()))
            .chain(park.contact.website.as_deref().map(|u| (LinkType::Official, u)))
            .chain(
                park.campgrounds
                    .iter()
                    .filter_map(|c| c.reservation_url.as_deref())
                    .map(|u| (LinkType::Reservation, u)),
            );
        for (link_type, url) in candidates {
            let url = url.trim();
            if url.is_empty() {
                continue;
            }
            let target = by_url.entry(url.to_string()).or_insert_with(|| LinkTarget {
                url: url.to_string(),
                link_type,
                referrers: Vec::new(),
            });
            if !target.referrers.contains(&referrer) {
                target.referrers.push(referrer.clone());
            }
        }
    }
    by_url.into_values().collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub status: LinkStatus,
    pub http_status: Option<u16>,
    pub redirect_to: Option<String>,
    pub message: Option<String>,
}

impl CheckOutcome {
    fn new(status: LinkStatus, http_status: Option<u16>) -> Self {
        Self {
            status,
            http_status,
            redirect_to: None,
            message: None,
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkCheckResult {
    pub url: String,
    pub link_type: LinkType,
    pub status: LinkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub elapsed_ms: u64,
    pub referrers: Vec<LinkReferrer>,
}

/// HEAD first, GET when HEAD is inconclusive. Redirects are reported, not followed.
pub struct LinkChecker {
    http: Arc<HttpFetcher>,
    config: LinkCheckConfig,
}

impl LinkChecker {
    pub fn new(http: Arc<HttpFetcher>, config: LinkCheckConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &LinkCheckConfig {
        &self.config
    }

    async fn limiter_key(&self, host: &str) -> String {
        let key = format!("link:{}", host.to_ascii_lowercase());
        self.http
            .limiters()
            .configure(
                &key,
                TokenBucketConfig {
                    capacity: 1,
                    refill_every: self.config.pace,
                },
            )
            .await;
        key
    }

    pub async fn check(&self, url: &str) -> CheckOutcome {
        let parsed = match Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => parsed,
            Ok(parsed) => {
                return CheckOutcome::new(LinkStatus::Error, None)
                    .with_message(format!("unsupported scheme {}", parsed.scheme()))
            }
            Err(err) => {
                return CheckOutcome::new(LinkStatus::Error, None)
                    .with_message(format!("invalid url: {err}"))
            }
        };
        let Some(host) = parsed.host_str().map(str::to_string) else {
            return CheckOutcome::new(LinkStatus::Error, None).with_message("url has no host");
        };
        let key = self.limiter_key(&host).await;

        // HEAD and the GET fallback share one timeout budget.
        let remaining = match self
            .http
            .probe(&key, ProbeMethod::Head, url, self.config.timeout)
            .await
        {
            Ok(resp) if (200..300).contains(&resp.status) => {
                return CheckOutcome::new(LinkStatus::Ok, Some(resp.status))
            }
            Ok(resp) if is_redirect(&resp) => return redirect_outcome(&parsed, &resp),
            Ok(resp) => {
                debug!(url, status = resp.status, "HEAD inconclusive, retrying with GET");
                self.config.timeout.saturating_sub(resp.elapsed)
            }
            Err(err) => return error_outcome(&err),
        };
        if remaining.is_zero() {
            return CheckOutcome::new(LinkStatus::Timeout, None)
                .with_message("no response before timeout");
        }

        match self
            .http
            .probe(&key, ProbeMethod::Get, url, remaining)
            .await
        {
            Ok(resp) => self.classify_get(&parsed, &host, &resp),
            Err(err) => error_outcome(&err),
        }
    }

    fn classify_get(&self, url: &Url, host: &str, resp: &ProbeResponse) -> CheckOutcome {
        let status = resp.status;
        match status {
            200..=299 => match soft_404_title(resp) {
                Some(title) => CheckOutcome::new(LinkStatus::Broken, Some(status))
                    .with_message(format!("soft 404: {title}")),
                None => CheckOutcome::new(LinkStatus::Ok, Some(status)),
            },
            _ if is_redirect(resp) => redirect_outcome(url, resp),
            403 if self.config.is_browser_only(host) => {
                CheckOutcome::new(LinkStatus::BrowserOnly, Some(status))
            }
            400..=599 => CheckOutcome::new(LinkStatus::Broken, Some(status)),
            _ => CheckOutcome::new(LinkStatus::Error, Some(status))
                .with_message(format!("unexpected status {status}")),
        }
    }

    /// Checks every target, at most `concurrency` at once, paced per host.
    pub async fn check_all(&self, targets: Vec<LinkTarget>) -> Vec<LinkCheckResult> {
        let mut results = stream::iter(targets)
            .map(|target| async move {
                let started = Instant::now();
                let outcome = self.check(&target.url).await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                match outcome.status {
                    LinkStatus::Ok | LinkStatus::Redirect => {
                        debug!(url = %target.url, status = outcome.status.as_str(), elapsed_ms, "link checked")
                    }
                    _ => warn!(
                        url = %target.url,
                        status = outcome.status.as_str(),
                        http_status = ?outcome.http_status,
                        "link check failed"
                    ),
                }
                LinkCheckResult {
                    url: target.url,
                    link_type: target.link_type,
                    status: outcome.status,
                    http_status: outcome.http_status,
                    redirect_to: outcome.redirect_to,
                    message: outcome.message,
                    elapsed_ms,
                    referrers: target.referrers,
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        results.sort_by(|a, b| a.url.cmp(&b.url));
        results
    }
}

fn is_redirect(resp: &ProbeResponse) -> bool {
    (300..400).contains(&resp.status) && resp.location.is_some()
}

fn redirect_outcome(base: &Url, resp: &ProbeResponse) -> CheckOutcome {
    let mut outcome = CheckOutcome::new(LinkStatus::Redirect, Some(resp.status));
    outcome.redirect_to = resp.location.as_deref().map(|location| {
        base.join(location)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| location.to_string())
    });
    outcome
}

fn error_outcome(err: &reqwest::Error) -> CheckOutcome {
    if err.is_timeout() {
        CheckOutcome::new(LinkStatus::Timeout, None).with_message("no response before timeout")
    } else {
        CheckOutcome::new(LinkStatus::Error, None).with_message(err.to_string())
    }
}

/// Title of an HTML page that claims to be missing despite a 2xx status.
fn soft_404_title(resp: &ProbeResponse) -> Option<String> {
    let is_html = resp
        .content_type
        .as_deref()
        .map_or(true, |ct| ct.to_ascii_lowercase().contains("html"));
    if !is_html || resp.body.is_empty() {
        return None;
    }
    let document = Html::parse_document(&String::from_utf8_lossy(&resp.body));
    let selector = Selector::parse("title").ok()?;
    let title = document
        .select(&selector)
        .next()?
        .text()
        .collect::<String>()
        .trim()
        .to_string();
    let lower = title.to_ascii_lowercase();
    SOFT_404_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
        .then_some(title)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityLinkHealth {
    pub entity_id: String,
    pub entity_name: String,
    pub broken: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkReport {
    pub generated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub total_links: usize,
    pub valid_links: usize,
    pub broken_links: usize,
    pub timeouts: usize,
    pub errors: usize,
    pub redirects: usize,
    pub browser_only: usize,
    pub by_status: BTreeMap<LinkStatus, usize>,
    pub by_link_type: BTreeMap<LinkType, BTreeMap<LinkStatus, usize>>,
    /// Entities with at least one broken link, most broken first.
    pub worst_entities: Vec<EntityLinkHealth>,
    /// Stored park keys that could not be decoded and were not checked.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_records: Vec<String>,
    pub results: Vec<LinkCheckResult>,
}

impl LinkReport {
    pub fn from_results(
        results: Vec<LinkCheckResult>,
        region: Option<&str>,
        generated_at: DateTime<Utc>,
    ) -> Self {
        let mut by_status: BTreeMap<LinkStatus, usize> = BTreeMap::new();
        let mut by_link_type: BTreeMap<LinkType, BTreeMap<LinkStatus, usize>> = BTreeMap::new();
        let mut entities: BTreeMap<&str, EntityLinkHealth> = BTreeMap::new();

        for result in &results {
            *by_status.entry(result.status).or_default() += 1;
            *by_link_type
                .entry(result.link_type)
                .or_default()
                .entry(result.status)
                .or_default() += 1;
            for referrer in &result.referrers {
                let health = entities
                    .entry(referrer.entity_id.as_str())
                    .or_insert_with(|| EntityLinkHealth {
                        entity_id: referrer.entity_id.clone(),
                        entity_name: referrer.entity_name.clone(),
                        broken: 0,
                        total: 0,
                    });
                health.total += 1;
                if result.status == LinkStatus::Broken {
                    health.broken += 1;
                }
            }
        }

        let mut worst_entities = entities
            .into_values()
            .filter(|h| h.broken > 0)
            .collect::<Vec<_>>();
        worst_entities.sort_by(|a, b| {
            b.broken
                .cmp(&a.broken)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        worst_entities.truncate(WORST_ENTITY_LIMIT);

        let count = |status: LinkStatus| by_status.get(&status).copied().unwrap_or(0);
        Self {
            generated_at,
            region: region.map(str::to_ascii_uppercase),
            total_links: results.len(),
            valid_links: count(LinkStatus::Ok),
            broken_links: count(LinkStatus::Broken),
            timeouts: count(LinkStatus::Timeout),
            errors: count(LinkStatus::Error),
            redirects: count(LinkStatus::Redirect),
            browser_only: count(LinkStatus::BrowserOnly),
            by_status,
            by_link_type,
            worst_entities,
            skipped_records: Vec::new(),
            results,
        }
    }

    /// Gate signal: no link classified as broken.
    pub fn passed(&self) -> bool {
        self.broken_links == 0
    }

    pub fn store_key(&self) -> String {
        format!("reports/links/{}.json", self.generated_at.format("%Y%m%dT%H%M%SZ"))
    }
}

#[derive(Debug, Error)]
pub enum LinkReportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("encoding link report: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub async fn persist_report(
    store: &dyn ObjectStore,
    report: &LinkReport,
) -> Result<String, LinkReportError> {
    let key = report.store_key();
    write_json(store, &key, report).await?;
    info!(key = %key, broken = report.broken_links, "link report stored");
    Ok(key)
}

pub async fn write_report_file(path: &Path, report: &LinkReport) -> Result<(), LinkReportError> {
    let bytes = serde_json::to_vec_pretty(report)?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| LinkReportError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Stored parks for one region, or for every region when `region` is `None`.
/// Keys that fail to decode are skipped and returned next to the parks.
pub async fn load_parks(
    store: &dyn ObjectStore,
    region: Option<&str>,
) -> Result<(Vec<CanonicalPark>, Vec<String>), StoreError> {
    let prefix = match region {
        Some(region) => format!("regions/{}/parks/", region.to_ascii_lowercase()),
        None => "regions/".to_string(),
    };
    let mut parks = Vec::new();
    let mut skipped = Vec::new();
    for key in store.list(&prefix).await? {
        if !key.contains("/parks/") || !key.ends_with(".json") {
            continue;
        }
        match read_json::<CanonicalPark>(store, &key).await {
            Ok(Some(park)) => parks.push(park),
            Ok(None) => {}
            Err(err @ StoreError::Decode { .. }) => {
                warn!(key = %key, error = %err, "skipping undecodable park");
                skipped.push(key);
            }
            Err(err) => return Err(err),
        }
    }
    Ok((parks, skipped))
}

/// Loads parks, checks every distinct link, and stores the report.
pub async fn validate_store_links(
    store: &dyn ObjectStore,
    checker: &LinkChecker,
    region: Option<&str>,
) -> Result<LinkReport, LinkReportError> {
    let (parks, skipped) = load_parks(store, region).await?;
    let targets = collect_targets(&parks);
    let entities = targets
        .iter()
        .flat_map(|t| t.referrers.iter().map(|r| r.entity_id.as_str()))
        .collect::<BTreeSet<_>>()
        .len();
    info!(parks = parks.len(), links = targets.len(), entities, "validating links");

    let results = checker.check_all(targets).await;
    let mut report = LinkReport::from_results(results, region, Utc::now());
    report.skipped_records = skipped;
    persist_report(store, &report).await?;
    info!(
        valid = report.valid_links,
        broken = report.broken_links,
        timeouts = report.timeouts,
        browser_only = report.browser_only,
        "link validation finished"
    );
    Ok(report)
}
