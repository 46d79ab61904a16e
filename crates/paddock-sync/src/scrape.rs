//! Scraper: cache, fetcher with bounded retry, and the parser composed per date.

use std::sync::Arc;

use async_trait::async_trait;
use paddock_adapters::{parse_day, DayFetcher, DayPayload, ParseError, SectionFailure};
use paddock_core::{Clock, Race, RaceDate, DATE_FORMAT};
use paddock_storage::{BackoffPolicy, DayCache, FetchError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error)]
pub enum ScrapeError {
    #[error("transport failure after {attempts} attempt(s): {source}")]
    Transport {
        attempts: usize,
        #[source]
        source: FetchError,
    },
    #[error("source page could not be parsed: {0}")]
    Parse(#[from] ParseError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScrapedDay {
    pub race_date: RaceDate,
    pub races: Vec<Race>,
    pub failures: Vec<SectionFailure>,
    pub from_cache: bool,
}

#[async_trait]
pub trait DayScraper: Send + Sync {
    async fn scrape_date(&self, date: RaceDate) -> Result<ScrapedDay, ScrapeError>;
}

pub struct Scraper<F> {
    fetcher: F,
    cache: Option<DayCache>,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl<F: DayFetcher> Scraper<F> {
    pub fn new(fetcher: F, clock: Arc<dyn Clock>) -> Self {
        Self {
            fetcher,
            cache: None,
            backoff: BackoffPolicy::default(),
            clock,
        }
    }

    pub fn with_cache(mut self, cache: DayCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    async fn fetch_with_retry(&self, date: RaceDate) -> Result<DayPayload, ScrapeError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.fetcher.fetch_day(date).await {
                Ok(payload) => return Ok(payload),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.backoff.delay_for_attempt(attempt - 1);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient fetch failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(ScrapeError::Transport {
                        attempts: attempt,
                        source: err,
                    })
                }
            }
        }
    }

    async fn cached_payload(&self, cache: &DayCache, date: RaceDate) -> Option<DayPayload> {
        let bytes = match cache.load_day(self.fetcher.source_id(), date).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, "cache read failed, fetching instead");
                return None;
            }
        };
        match serde_json::from_slice::<DayPayload>(&bytes) {
            // An empty cached card is refetched rather than trusted forever.
            Ok(payload) if payload.race_date == date && !payload.races.is_empty() => Some(payload),
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "corrupt cache file discarded");
                if let Err(err) = cache.remove_day(self.fetcher.source_id(), date).await {
                    warn!(error = %err, "could not remove corrupt cache file");
                }
                None
            }
        }
    }

    async fn write_cache(&self, cache: &DayCache, payload: &DayPayload) {
        let bytes = match serde_json::to_vec(payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "could not serialize payload for cache");
                return;
            }
        };
        match cache
            .store_day(self.fetcher.source_id(), payload.race_date, &bytes)
            .await
        {
            Ok(stored) => debug!(
                path = %stored.path.display(),
                sha256 = %stored.sha256,
                already_cached = stored.existing,
                "cached payload"
            ),
            Err(err) => warn!(error = %err, "cache write failed"),
        }
    }
}

#[async_trait]
impl<F: DayFetcher> DayScraper for Scraper<F> {
    async fn scrape_date(&self, date: RaceDate) -> Result<ScrapedDay, ScrapeError> {
        // Today's card is still forming and is never cached.
        let cache = self.cache.as_ref().filter(|_| date < self.clock.today());

        let mut from_cache = false;
        let cached = match cache {
            Some(cache) => self.cached_payload(cache, date).await,
            None => None,
        };
        let payload = match cached {
            Some(payload) => {
                from_cache = true;
                payload
            }
            None => {
                let payload = self.fetch_with_retry(date).await?;
                if let Some(cache) = cache {
                    self.write_cache(cache, &payload).await;
                }
                payload
            }
        };

        let parsed = parse_day(&payload)?;
        for failure in &parsed.failures {
            warn!(
                race_id = ?failure.race_id,
                section = %failure.section,
                reason = %failure.reason,
                "skipped part of source page"
            );
        }
        info!(
            date = %date.format(DATE_FORMAT),
            races = parsed.races.len(),
            from_cache,
            "scraped date"
        );
        Ok(ScrapedDay {
            race_date: date,
            races: parsed.races,
            failures: parsed.failures,
            from_cache,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{day_payload, ScriptedFetcher};
    use paddock_core::{parse_race_date, FixedClock};
    use tempfile::tempdir;

    fn d(s: &str) -> RaceDate {
        parse_race_date(s).unwrap()
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(d("2024-05-05")))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_up_to_the_limit() {
        let fetcher = ScriptedFetcher::new();
        fetcher.fail_transient(d("2024-05-03"), 5);
        let scraper = Scraper::new(fetcher.clone(), clock());

        let err = scraper.scrape_date(d("2024-05-03")).await.unwrap_err();
        assert!(matches!(err, ScrapeError::Transport { attempts: 3, .. }));
        assert_eq!(fetcher.calls_for(d("2024-05-03")), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn recovered_transient_failure_succeeds() {
        let fetcher = ScriptedFetcher::new();
        fetcher.fail_transient(d("2024-05-03"), 2);
        let scraper = Scraper::new(fetcher.clone(), clock());

        let day = scraper.scrape_date(d("2024-05-03")).await.unwrap();
        assert_eq!(day.races.len(), 1);
        assert_eq!(fetcher.calls_for(d("2024-05-03")), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let fetcher = ScriptedFetcher::new();
        fetcher.fail_permanent(d("2024-05-03"));
        let scraper = Scraper::new(fetcher.clone(), clock());

        let err = scraper.scrape_date(d("2024-05-03")).await.unwrap_err();
        assert!(matches!(err, ScrapeError::Transport { attempts: 1, .. }));
        assert_eq!(fetcher.calls_for(d("2024-05-03")), 1);
    }

    #[tokio::test]
    async fn unusable_page_is_a_parse_error() {
        let fetcher = ScriptedFetcher::new();
        fetcher.serve_unparseable(d("2024-05-03"));
        let scraper = Scraper::new(fetcher, clock());
        let err = scraper.scrape_date(d("2024-05-03")).await.unwrap_err();
        assert!(matches!(err, ScrapeError::Parse(_)));
    }

    #[tokio::test]
    async fn past_dates_are_served_from_cache_after_first_fetch() {
        let dir = tempdir().unwrap();
        let fetcher = ScriptedFetcher::new();
        let scraper = Scraper::new(fetcher.clone(), clock()).with_cache(DayCache::new(dir.path()));

        let first = scraper.scrape_date(d("2024-05-02")).await.unwrap();
        let second = scraper.scrape_date(d("2024-05-02")).await.unwrap();
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.races, second.races);
        assert_eq!(fetcher.calls_for(d("2024-05-02")), 1);
        assert!(dir.path().join("sportinglife/2024/2024-05-02.json").exists());
    }

    #[tokio::test]
    async fn today_is_never_cached() {
        let dir = tempdir().unwrap();
        let fetcher = ScriptedFetcher::new();
        let scraper = Scraper::new(fetcher.clone(), clock()).with_cache(DayCache::new(dir.path()));

        scraper.scrape_date(d("2024-05-05")).await.unwrap();
        scraper.scrape_date(d("2024-05-05")).await.unwrap();
        assert_eq!(fetcher.calls_for(d("2024-05-05")), 2);
        assert!(!dir.path().join("sportinglife/2024/2024-05-05.json").exists());
    }

    #[tokio::test]
    async fn corrupt_cache_file_is_ignored() {
        let dir = tempdir().unwrap();
        let cache = DayCache::new(dir.path());
        cache
            .store_day("sportinglife", d("2024-05-02"), b"{ truncated")
            .await
            .unwrap();
        let fetcher = ScriptedFetcher::new();
        let scraper = Scraper::new(fetcher.clone(), clock()).with_cache(cache);

        let day = scraper.scrape_date(d("2024-05-02")).await.unwrap();
        assert!(!day.from_cache);
        assert_eq!(fetcher.calls_for(d("2024-05-02")), 1);
        assert_eq!(day_payload(d("2024-05-02")).race_date, day.race_date);

        let again = scraper.scrape_date(d("2024-05-02")).await.unwrap();
        assert!(again.from_cache, "fresh payload replaced the corrupt file");
    }
}
