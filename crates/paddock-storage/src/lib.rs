//! Raw day cache and the paced HTTP fetcher used against the racing source.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use paddock_core::{RaceDate, DATE_FORMAT};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, REFERER};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "paddock-storage";

/// Result of writing a day to the cache.
#[derive(Debug, Clone)]
pub struct CachedDay {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: usize,
    /// The day was already cached; the new bytes were not written.
    pub existing: bool,
}

/// On-disk cache of raw day payloads at `<root>/<source>/<YYYY>/<YYYY-MM-DD>.json`.
///
/// Files are written once via temp-file rename and never rewritten in place.
#[derive(Debug, Clone)]
pub struct DayCache {
    root: PathBuf,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl DayCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, source_id: &str, date: RaceDate) -> PathBuf {
        self.root
            .join(source_id)
            .join(date.format("%Y").to_string())
            .join(format!("{}.json", date.format(DATE_FORMAT)))
    }

    pub async fn load_day(
        &self,
        source_id: &str,
        date: RaceDate,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.path_for(source_id, date);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Missing files are not an error.
    pub async fn remove_day(&self, source_id: &str, date: RaceDate) -> anyhow::Result<()> {
        let path = self.path_for(source_id, date);
        match fs::remove_file(&path).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                Err(err).with_context(|| format!("removing {}", path.display()))
            }
            _ => Ok(()),
        }
    }

    pub async fn store_day(
        &self,
        source_id: &str,
        date: RaceDate,
        bytes: &[u8],
    ) -> anyhow::Result<CachedDay> {
        let path = self.path_for(source_id, date);
        let cached = |existing| CachedDay {
            path: path.clone(),
            sha256: sha256_hex(bytes),
            bytes: bytes.len(),
            existing,
        };

        if fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(cached(true));
        }
        let dir = path.parent().unwrap_or(self.root.as_path()).to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let tmp = dir.join(format!(".{}.partial", Uuid::new_v4()));
        let written: std::io::Result<()> = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(err).with_context(|| format!("writing {}", path.display()));
        }
        Ok(cached(false))
    }
}

/// Exponential backoff between attempts of one request. `max_attempts` includes the first.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay after the `retry`-th failure (0-based).
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        let exp = u32::try_from(retry).unwrap_or(u32::MAX).min(16);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Token bucket over tokio's clock, so paused-time tests see the pacing.
#[derive(Debug)]
pub struct TokenBucket {
    config: TokenBucketConfig,
    // (available tokens, instant the next token accrues)
    state: Mutex<(u32, Instant)>,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            config: TokenBucketConfig { capacity, ..config },
            state: Mutex::new((capacity, Instant::now() + config.refill_every)),
        }
    }

    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        loop {
            let now = Instant::now();
            while state.1 <= now && state.0 < self.config.capacity {
                state.0 += 1;
                state.1 += self.config.refill_every;
            }
            if state.0 == self.config.capacity && state.1 <= now {
                state.1 = now + self.config.refill_every;
            }
            if state.0 > 0 {
                state.0 -= 1;
                return;
            }
            // Holding the lock keeps waiters in FIFO order.
            tokio::time::sleep_until(state.1).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub max_in_flight: usize,
    pub rate_limit: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            referer: None,
            max_in_flight: 4,
            rate_limit: Some(TokenBucketConfig {
                capacity: 1,
                refill_every: Duration::from_millis(400),
            }),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("transient failure fetching {url}: {reason}")]
    Transient { url: String, reason: String },
    #[error("permanent failure fetching {url}: {reason}")]
    Permanent { url: String, reason: String },
}

impl FetchError {
    pub fn transient(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn permanent(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permanent {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    pub fn url(&self) -> &str {
        match self {
            FetchError::Transient { url, .. } | FetchError::Permanent { url, .. } => url,
        }
    }

    /// 5xx and 429 are worth retrying; any other non-success status is not.
    pub fn from_status(url: impl Into<String>, status: StatusCode) -> Self {
        let reason = format!("http status {}", status.as_u16());
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Self::transient(url, reason)
        } else {
            Self::permanent(url, reason)
        }
    }

    fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            Self::transient(url, err.to_string())
        } else {
            Self::permanent(url, err.to_string())
        }
    }
}

/// HTTP GET with a cap on requests in flight and optional rate limiting.
/// One attempt per call; [`FetchError`] tells the caller whether to retry.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    bucket: Option<TokenBucket>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(referer) = config.referer.as_deref() {
            headers.insert(REFERER, HeaderValue::from_str(referer).context("invalid referer")?);
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build().context("building http client")?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            bucket: config.rate_limit.map(TokenBucket::new),
        })
    }

    pub fn shared(config: HttpClientConfig) -> anyhow::Result<Arc<Self>> {
        Self::new(config).map(Arc::new)
    }

    /// Fetch `url` as text. Blank bodies count as permanent failures.
    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::permanent(url, "fetcher closed"))?;
        if let Some(bucket) = &self.bucket {
            bucket.acquire().await;
        }

        async {
            let started = Instant::now();
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| FetchError::from_reqwest(url, &err))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::from_status(resp.url().as_str(), status));
            }

            let body = resp
                .text()
                .await
                .map_err(|err| FetchError::from_reqwest(url, &err))?;
            if body.trim().is_empty() {
                return Err(FetchError::permanent(url, "empty response body"));
            }
            debug!(
                status = status.as_u16(),
                bytes = body.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "fetched"
            );
            Ok(body)
        }
        .instrument(info_span!("http_fetch", url))
        .await
    }
}
