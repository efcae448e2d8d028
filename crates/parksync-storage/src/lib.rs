//! Object store backends + rate-limited HTTP transport for parksync.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "parksync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid object key {0:?}")]
    InvalidKey(String),
    #[error("object store io for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("decoding {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub key: String,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Durable key/value object store. Each `put` is atomic per object; there is
/// no cross-object transaction.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<PutOutcome, StoreError>;
    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

pub async fn read_json<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let Some(bytes) = store.get(key).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Decode {
            key: key.to_string(),
            source,
        })
}

pub async fn write_json<T: Serialize + ?Sized>(
    store: &dyn ObjectStore,
    key: &str,
    value: &T,
) -> Result<PutOutcome, StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
        key: key.to_string(),
        source,
    })?;
    store.put(key, &bytes).await
}

/// Filesystem-backed store: one file per key under `root`, written via temp file + rename.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |p, seg| p.join(seg)))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<PutOutcome, StoreError> {
        let path = self.path_for(key)?;
        let io_err = |source| StoreError::Io {
            key: key.to_string(),
            source,
        };
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent).await.map_err(io_err)?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(source) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(source));
        }

        if let Err(source) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(source));
        }

        Ok(PutOutcome {
            key: key.to_string(),
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let trimmed = prefix.trim_end_matches('/');
        let start = if trimmed.is_empty() {
            self.root.clone()
        } else {
            self.path_for(trimmed)?
        };
        let io_err = |source| StoreError::Io {
            key: prefix.to_string(),
            source,
        };

        let mut keys = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(io_err(source)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(io_err)?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if !entry.file_name().to_string_lossy().starts_with('.') {
                    if let Ok(rel) = path.strip_prefix(&self.root) {
                        let key = rel
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy())
                            .collect::<Vec<_>>()
                            .join("/");
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-process store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_key(key)?;
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<PutOutcome, StoreError> {
        validate_key(key)?;
        self.objects
            .write()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(PutOutcome {
            key: key.to_string(),
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .objects
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    #[serde(rename = "refill_ms", with = "duration_ms")]
    pub refill_every: Duration,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            refill_every: Duration::from_millis(250),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            capacity,
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            if self.refill_every.is_zero() {
                return;
            }
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every {
                let refills = (elapsed.as_nanos() / self.refill_every.as_nanos())
                    .min(u128::from(self.capacity)) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = if state.tokens == self.capacity {
                    Instant::now()
                } else {
                    state.last_refill + self.refill_every.saturating_mul(refills)
                };
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(state.last_refill.elapsed());
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// One token bucket per provider (or per host for link checks), created lazily.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    default: TokenBucketConfig,
    configs: Mutex<HashMap<String, TokenBucketConfig>>,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl RateLimiterRegistry {
    pub fn new(default: TokenBucketConfig) -> Self {
        Self {
            default,
            ..Default::default()
        }
    }

    /// Sets the pacing for `key`. Takes effect for buckets not yet created.
    pub async fn configure(&self, key: &str, config: TokenBucketConfig) {
        self.configs.lock().await.insert(key.to_string(), config);
    }

    pub async fn bucket(&self, key: &str) -> Arc<TokenBucket> {
        let config = self
            .configs
            .lock()
            .await
            .get(key)
            .copied()
            .unwrap_or(self.default);
        let mut buckets = self.buckets.lock().await;
        buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(config)))
            .clone()
    }

    pub async fn acquire(&self, key: &str) {
        self.bucket(key).await.take().await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: TokenBucketConfig,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            rate_limit: TokenBucketConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    Head,
    Get,
}

/// Raw single-attempt response used by link checks. Redirects are not followed.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: u16,
    pub location: Option<String>,
    pub content_type: Option<String>,
    /// At most `PROBE_BODY_LIMIT` bytes; the rest of the body is never read.
    pub body: Vec<u8>,
    /// Time spent on the request itself, excluding the limiter wait.
    pub elapsed: Duration,
}

pub const PROBE_BODY_LIMIT: usize = 256 * 1024;

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    probe_client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    limiters: RateLimiterRegistry,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        let mut probe_builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
            probe_builder = probe_builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let probe_client = probe_builder.build().context("building probe client")?;

        Ok(Self {
            client,
            probe_client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            limiters: RateLimiterRegistry::new(config.rate_limit),
            backoff: config.backoff,
        })
    }

    pub fn limiters(&self) -> &RateLimiterRegistry {
        &self.limiters
    }

    async fn per_source_semaphore(&self, source_key: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GET with retries on 5xx/429 and transient transport failures, paced by
    /// the `source_key` rate limiter on every attempt.
    pub async fn fetch(
        &self,
        source_key: &str,
        request: &HttpRequest,
    ) -> Result<FetchedResponse, TransportError> {
        let span = info_span!("http_fetch", source_key, url = %request.url);
        self.fetch_inner(source_key, request).instrument(span).await
    }

    async fn fetch_inner(
        &self,
        source_key: &str,
        request: &HttpRequest,
    ) -> Result<FetchedResponse, TransportError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_key).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let mut attempt = 0;
        loop {
            self.limiters.acquire(source_key).await;
            let mut builder = self.client.get(&request.url).query(&request.query);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let retries_left = attempt < self.backoff.max_retries;

            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|source| TransportError::Request {
                                url: final_url.clone(),
                                source,
                            })?
                            .to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && retries_left {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(TransportError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && retries_left {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(TransportError::Request {
                        url: request.url.clone(),
                        source: err,
                    });
                }
            }
        }
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        source_key: &str,
        request: &HttpRequest,
    ) -> Result<T, TransportError> {
        let response = self.fetch(source_key, request).await?;
        serde_json::from_slice(&response.body).map_err(|e| TransportError::Decode {
            url: response.final_url,
            message: e.to_string(),
        })
    }

    /// Single attempt with its own timeout, paced by `limiter_key`.
    pub async fn probe(
        &self,
        limiter_key: &str,
        method: ProbeMethod,
        url: &str,
        timeout: Duration,
    ) -> Result<ProbeResponse, reqwest::Error> {
        self.limiters.acquire(limiter_key).await;
        let started = Instant::now();
        let builder = match method {
            ProbeMethod::Head => self.probe_client.head(url),
            ProbeMethod::Get => self.probe_client.get(url),
        };
        let mut resp = builder.timeout(timeout).send().await?;
        let status = resp.status().as_u16();
        let header = |name: reqwest::header::HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string)
        };
        let location = header(reqwest::header::LOCATION);
        let content_type = header(reqwest::header::CONTENT_TYPE);

        let mut body = Vec::new();
        if method == ProbeMethod::Get {
            while body.len() < PROBE_BODY_LIMIT {
                let Some(chunk) = resp.chunk().await? else {
                    break;
                };
                let take = chunk.len().min(PROBE_BODY_LIMIT - body.len());
                body.extend_from_slice(&chunk[..take]);
            }
        }
        Ok(ProbeResponse {
            status,
            location,
            content_type,
            body,
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            rate_limit: TokenBucketConfig {
                capacity: 10,
                refill_every: Duration::from_millis(1),
            },
            ..Default::default()
        })
        .expect("fetcher")
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn fs_store_overwrites_atomically_and_lists_keys() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());

        store.put("regions/wi/parks/wi-a.json", b"{\"v\":1}").await.unwrap();
        store.put("regions/wi/parks/wi-a.json", b"{\"v\":2}").await.unwrap();
        store.put("regions/wi/index.json", b"[]").await.unwrap();
        store.put("regions/mn/index.json", b"[]").await.unwrap();

        let got = store.get("regions/wi/parks/wi-a.json").await.unwrap();
        assert_eq!(got.as_deref(), Some(&b"{\"v\":2}"[..]));
        assert!(store.get("regions/wi/parks/missing.json").await.unwrap().is_none());

        let keys = store.list("regions/wi/").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "regions/wi/index.json".to_string(),
                "regions/wi/parks/wi-a.json".to_string()
            ]
        );
        assert!(store.list("regions/tx/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keys_with_traversal_are_rejected() {
        let store = MemoryObjectStore::new();
        assert!(matches!(
            store.put("../etc/passwd", b"x").await,
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.get("a//b").await,
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn memory_store_lists_by_prefix() {
        let store = MemoryObjectStore::new();
        write_json(&store, "regions/wi/parks/wi-a.json", &serde_json::json!({"a": 1}))
            .await
            .unwrap();
        write_json(&store, "regions/wib/parks/x.json", &serde_json::json!({}))
            .await
            .unwrap();
        let keys = store.list("regions/wi/").await.unwrap();
        assert_eq!(keys, vec!["regions/wi/parks/wi-a.json".to_string()]);
        let value: Option<serde_json::Value> =
            read_json(&store, "regions/wi/parks/wi-a.json").await.unwrap();
        assert_eq!(value.unwrap()["a"], 1);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn token_bucket_paces_after_capacity_is_spent() {
        let bucket = TokenBucket::new(TokenBucketConfig {
            capacity: 1,
            refill_every: Duration::from_millis(40),
        });
        let started = Instant::now();
        bucket.take().await;
        bucket.take().await;
        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_millis(75));
    }

    #[tokio::test]
    async fn registry_hands_out_one_bucket_per_key() {
        let registry = RateLimiterRegistry::new(TokenBucketConfig::default());
        registry
            .configure("ridb", TokenBucketConfig { capacity: 5, refill_every: Duration::from_millis(10) })
            .await;
        let a = registry.bucket("ridb").await;
        let b = registry.bucket("ridb").await;
        let c = registry.bucket("arcgis").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.capacity, 5);
        assert_eq!(c.capacity, 1);
    }

    #[tokio::test]
    async fn fetch_retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let fetcher = fast_fetcher(2);
        let value: serde_json::Value = fetcher
            .fetch_json("test", &HttpRequest::get(format!("{}/data", server.uri())).query("page", 1))
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn fetch_does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = fast_fetcher(3);
        let err = fetcher
            .fetch("test", &HttpRequest::get(format!("{}/missing", server.uri())))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn probe_reports_redirect_without_following() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new"))
            .mount(&server)
            .await;

        let fetcher = fast_fetcher(0);
        let resp = fetcher
            .probe("host", ProbeMethod::Head, &format!("{}/old", server.uri()), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(resp.status, 301);
        assert_eq!(resp.location.as_deref(), Some("/new"));
    }

    #[tokio::test]
    async fn probe_body_stops_at_the_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; PROBE_BODY_LIMIT * 3]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/small"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<title>ok</title>"))
            .mount(&server)
            .await;

        let fetcher = fast_fetcher(0);
        let big = fetcher
            .probe("host", ProbeMethod::Get, &format!("{}/big", server.uri()), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(big.body.len(), PROBE_BODY_LIMIT);
        let small = fetcher
            .probe("host", ProbeMethod::Get, &format!("{}/small", server.uri()), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(small.body, b"<title>ok</title>");
    }
}
