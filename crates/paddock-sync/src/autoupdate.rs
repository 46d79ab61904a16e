//! Auto-update orchestrator: gap-driven backfill, on-demand scrapes and status.
//!
//! At most one ingestion run (backfill, window backfill or manual scrape) is active at a time.
//! The flag lives in the single mutex-guarded [`UpdateState`] and is held by a [`RunGuard`]
//! for the lifetime of the run.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use paddock_adapters::SectionFailure;
use paddock_core::{dates_inclusive, next_day, previous_day, Clock, RaceDate, DATE_FORMAT};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::gaps::find_gaps;
use crate::scrape::{DayScraper, ScrapeError};
use crate::store::{RaceStore, StoreError, WriteSummary};

const STORE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("an ingestion run is already active")]
    ConcurrencyRejected,
    #[error("invalid date: {0}")]
    InvalidDate(String),
    #[error(transparent)]
    Scrape(#[from] ScrapeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    fn failure_cause(&self) -> FailureCause {
        match self {
            IngestError::Scrape(ScrapeError::Transport { .. }) => FailureCause::Transport,
            IngestError::Scrape(ScrapeError::Parse(_)) => FailureCause::Parse,
            _ => FailureCause::Store,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Determining,
    Backfilling,
    Verifying,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Transport,
    Parse,
    Store,
}

/// A date that was scraped and written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateCommit {
    pub date: RaceDate,
    pub races_parsed: usize,
    pub from_cache: bool,
    pub write: WriteSummary,
    pub section_failures: Vec<SectionFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DateOutcome {
    Committed(DateCommit),
    Failed {
        date: RaceDate,
        cause: FailureCause,
        message: String,
    },
}

impl DateOutcome {
    pub fn date(&self) -> RaceDate {
        match self {
            DateOutcome::Committed(commit) => commit.date,
            DateOutcome::Failed { date, .. } => *date,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, DateOutcome::Committed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackfillReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Attempted window; `None` when the store was already up to date.
    pub window: Option<(RaceDate, RaceDate)>,
    pub outcomes: Vec<DateOutcome>,
    /// Dates in the window still without races after the run.
    pub incomplete_dates: Vec<RaceDate>,
    pub cancelled: bool,
}

impl BackfillReport {
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_committed()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateStatus {
    pub last_complete_date: Option<RaceDate>,
    pub run_active: bool,
    pub phase: Phase,
    pub current_date: Option<RaceDate>,
    pub stopping: bool,
    pub last_error: Option<String>,
    /// Dates skipped by earlier runs that still hold no races.
    pub unresolved_dates: Vec<RaceDate>,
    pub last_run: Option<BackfillReport>,
}

#[derive(Debug)]
struct UpdateState {
    active: bool,
    phase: Phase,
    current_date: Option<RaceDate>,
    last_complete_date: Option<RaceDate>,
    last_error: Option<String>,
    // Failed or unattempted dates, carried across runs until filled.
    unresolved: BTreeSet<RaceDate>,
    last_run: Option<BackfillReport>,
}

impl Default for UpdateState {
    fn default() -> Self {
        Self {
            active: false,
            phase: Phase::Idle,
            current_date: None,
            last_complete_date: None,
            last_error: None,
            unresolved: BTreeSet::new(),
            last_run: None,
        }
    }
}

fn lock_state(state: &Mutex<UpdateState>) -> MutexGuard<'_, UpdateState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds the single-active-run flag; releasing it on drop covers early returns and panics.
struct RunGuard {
    state: Arc<Mutex<UpdateState>>,
}

impl RunGuard {
    fn acquire(state: &Arc<Mutex<UpdateState>>) -> Result<Self, IngestError> {
        let mut guard = lock_state(state);
        if guard.active {
            return Err(IngestError::ConcurrencyRejected);
        }
        guard.active = true;
        guard.phase = Phase::Idle;
        guard.current_date = None;
        Ok(Self {
            state: Arc::clone(state),
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut guard = lock_state(&self.state);
        guard.active = false;
        guard.current_date = None;
        // Failed stays visible until the next run starts.
        if guard.phase != Phase::Failed {
            guard.phase = Phase::Idle;
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoUpdateConfig {
    /// First date ingested into an empty store.
    pub earliest_date: RaceDate,
    /// Pause between consecutive dates.
    pub pacing: Duration,
    pub startup_delay: Duration,
}

pub struct AutoUpdater {
    scraper: Arc<dyn DayScraper>,
    store: Arc<dyn RaceStore>,
    clock: Arc<dyn Clock>,
    config: AutoUpdateConfig,
    state: Arc<Mutex<UpdateState>>,
    shutdown: CancellationToken,
}

impl AutoUpdater {
    pub fn new(
        scraper: Arc<dyn DayScraper>,
        store: Arc<dyn RaceStore>,
        clock: Arc<dyn Clock>,
        config: AutoUpdateConfig,
    ) -> Self {
        Self {
            scraper,
            store,
            clock,
            config,
            state: Arc::new(Mutex::new(UpdateState::default())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &AutoUpdateConfig {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Stop after the in-flight date; no new date starts once this is called.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Fill every date after the last complete one up to yesterday.
    pub async fn run_backfill(&self) -> Result<BackfillReport, IngestError> {
        let guard = RunGuard::acquire(&self.state)?;
        self.backfill_with_guard(guard).await
    }

    /// Start a backfill on its own task. Rejected before spawning if a run is active.
    pub fn start_backfill(self: &Arc<Self>) -> Result<JoinHandle<()>, IngestError> {
        let guard = RunGuard::acquire(&self.state)?;
        let updater = Arc::clone(self);
        Ok(tokio::spawn(async move {
            if let Err(err) = updater.backfill_with_guard(guard).await {
                error!(error = %err, "background backfill failed");
            }
        }))
    }

    /// Backfill after the configured startup delay. The delay is cut short by shutdown.
    pub fn spawn_on_startup(self: &Arc<Self>) -> JoinHandle<()> {
        let updater = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = updater.shutdown.cancelled() => return,
                _ = tokio::time::sleep(updater.config.startup_delay) => {}
            }
            match updater.run_backfill().await {
                Ok(_) => {}
                Err(IngestError::ConcurrencyRejected) => {
                    info!("startup backfill skipped, another run is active")
                }
                Err(err) => error!(error = %err, "startup backfill failed"),
            }
        })
    }

    /// Ingest only the dates in `[from, to]` (clamped to yesterday) that hold no races.
    pub async fn backfill_window(
        &self,
        from: RaceDate,
        to: RaceDate,
    ) -> Result<BackfillReport, IngestError> {
        let yesterday = self.clock.yesterday();
        let to = to.min(yesterday);
        if from > to {
            return Err(IngestError::InvalidDate(format!(
                "window {} to {} holds no past dates",
                from.format(DATE_FORMAT),
                to.format(DATE_FORMAT)
            )));
        }

        let guard = RunGuard::acquire(&self.state)?;
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "backfill_window",
            %run_id,
            from = %from.format(DATE_FORMAT),
            to = %to.format(DATE_FORMAT)
        );
        async move {
            self.set_phase(Phase::Determining);
            let gaps = match find_gaps(self.store.as_ref(), from, to, self.clock.today()).await {
                Ok(gaps) => gaps,
                Err(err) => return Err(self.fail_run(err)),
            };
            info!(missing = gaps.len(), "window gaps determined");
            let report = self.ingest_dates(run_id, from, to, gaps).await;
            self.finish_run(report, guard).await
        }
        .instrument(span)
        .await
    }

    /// Scrape and store one date. Dates after today are refused.
    pub async fn scrape_date(&self, date: RaceDate) -> Result<DateCommit, IngestError> {
        let today = self.clock.today();
        if date > today {
            return Err(IngestError::InvalidDate(format!(
                "{} is after today ({})",
                date.format(DATE_FORMAT),
                today.format(DATE_FORMAT)
            )));
        }
        let _guard = RunGuard::acquire(&self.state)?;
        self.update(|s| {
            s.phase = Phase::Backfilling;
            s.current_date = Some(date);
        });

        let result = self.ingest_date(date).await;
        match &result {
            Ok(_) => self.update(|s| {
                s.unresolved.remove(&date);
                if s.unresolved.is_empty() {
                    s.last_error = None;
                }
            }),
            Err(err) => self.update(|s| {
                s.last_error = Some(format!("{}: {err}", date.format(DATE_FORMAT)));
                if date < today {
                    s.unresolved.insert(date);
                }
            }),
        }
        self.refresh_last_complete().await;
        result
    }

    pub async fn scrape_yesterday(&self) -> Result<DateCommit, IngestError> {
        self.scrape_date(self.clock.yesterday()).await
    }

    pub async fn find_gaps(
        &self,
        from: RaceDate,
        to: RaceDate,
    ) -> Result<Vec<RaceDate>, IngestError> {
        if from > to {
            return Err(IngestError::InvalidDate(format!(
                "from {} is after to {}",
                from.format(DATE_FORMAT),
                to.format(DATE_FORMAT)
            )));
        }
        Ok(find_gaps(self.store.as_ref(), from, to, self.clock.today()).await?)
    }

    /// Status with the last complete date and the unresolved dates re-read from the store.
    pub async fn status(&self) -> UpdateStatus {
        self.refresh_last_complete().await;
        if let Err(err) = self.recheck_unresolved().await {
            warn!(error = %err, "could not re-check unresolved dates");
        }
        self.current_status()
    }

    /// Status from in-memory state only.
    pub fn current_status(&self) -> UpdateStatus {
        let state = lock_state(&self.state);
        UpdateStatus {
            last_complete_date: state.last_complete_date,
            run_active: state.active,
            phase: state.phase,
            current_date: state.current_date,
            stopping: self.shutdown.is_cancelled(),
            last_error: state.last_error.clone(),
            unresolved_dates: state.unresolved.iter().copied().collect(),
            last_run: state.last_run.clone(),
        }
    }

    async fn backfill_with_guard(&self, guard: RunGuard) -> Result<BackfillReport, IngestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("backfill", %run_id);
        async move {
            self.set_phase(Phase::Determining);
            let today = self.clock.today();
            let yesterday = previous_day(today);
            let last_complete = match self.store.latest_race_date_before(today).await {
                Ok(last) => last,
                Err(err) => return Err(self.fail_run(err)),
            };
            self.update(|s| s.last_complete_date = last_complete);
            let carried = match self.recheck_unresolved().await {
                Ok(carried) => carried,
                Err(err) => return Err(self.fail_run(err)),
            };

            let last_complete =
                last_complete.unwrap_or_else(|| previous_day(self.config.earliest_date));
            let from = next_day(last_complete);
            let mut dates = carried
                .into_iter()
                .filter(|date| *date < from)
                .collect::<Vec<_>>();
            let retried = dates.len();
            if from <= yesterday {
                dates.extend(dates_inclusive(from, yesterday));
            }
            let Some(&first) = dates.first() else {
                info!(
                    last_complete = %last_complete.format(DATE_FORMAT),
                    "store is up to date"
                );
                let now = Utc::now();
                let report = BackfillReport {
                    run_id,
                    started_at: now,
                    finished_at: now,
                    window: None,
                    outcomes: Vec::new(),
                    incomplete_dates: Vec::new(),
                    cancelled: false,
                };
                return self.finish_run(report, guard).await;
            };

            info!(
                from = %first.format(DATE_FORMAT),
                to = %yesterday.format(DATE_FORMAT),
                retried,
                "backfilling"
            );
            let report = self.ingest_dates(run_id, first, yesterday, dates).await;
            self.finish_run(report, guard).await
        }
        .instrument(span)
        .await
    }

    /// Sequential scrape+write of `dates`, paced, then a verifying gap scan of `[from, to]`
    /// restricted to the planned dates.
    async fn ingest_dates(
        &self,
        run_id: Uuid,
        from: RaceDate,
        to: RaceDate,
        dates: Vec<RaceDate>,
    ) -> BackfillReport {
        let started_at = Utc::now();
        self.set_phase(Phase::Backfilling);
        let planned = dates.iter().copied().collect::<BTreeSet<_>>();

        let mut outcomes = Vec::with_capacity(dates.len());
        let mut cancelled = false;
        for (idx, date) in dates.into_iter().enumerate() {
            if idx > 0 {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(self.config.pacing) => {}
                }
            }
            if self.shutdown.is_cancelled() {
                cancelled = true;
                info!(next = %date.format(DATE_FORMAT), "shutdown requested, stopping backfill");
                break;
            }

            self.update(|s| s.current_date = Some(date));
            let outcome = match self.ingest_date(date).await {
                Ok(commit) => DateOutcome::Committed(commit),
                Err(err) => {
                    let cause = err.failure_cause();
                    warn!(date = %date.format(DATE_FORMAT), ?cause, error = %err, "date failed");
                    let message = err.to_string();
                    self.update(|s| {
                        s.last_error = Some(format!("{}: {message}", date.format(DATE_FORMAT)))
                    });
                    DateOutcome::Failed {
                        date,
                        cause,
                        message,
                    }
                }
            };
            outcomes.push(outcome);
        }

        self.update(|s| {
            s.phase = Phase::Verifying;
            s.current_date = None;
        });
        let verified = find_gaps(self.store.as_ref(), from, to, self.clock.today()).await;
        let incomplete_dates = match verified {
            Ok(gaps) => gaps.into_iter().filter(|d| planned.contains(d)).collect(),
            Err(err) => {
                warn!(error = %err, "verification failed, reporting uncommitted dates instead");
                let committed = committed_dates(&outcomes);
                planned.difference(&committed).copied().collect()
            }
        };

        BackfillReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            window: Some((from, to)),
            outcomes,
            incomplete_dates,
            cancelled,
        }
    }

    async fn ingest_date(&self, date: RaceDate) -> Result<DateCommit, IngestError> {
        let span = info_span!("ingest_date", race_date = %date.format(DATE_FORMAT));
        self.ingest_date_inner(date).instrument(span).await
    }

    async fn ingest_date_inner(&self, date: RaceDate) -> Result<DateCommit, IngestError> {
        let scraped = self.scraper.scrape_date(date).await?;
        let today = self.clock.today();

        let write = match self
            .store
            .upsert_race_date(date, &scraped.races, today)
            .await
        {
            Ok(write) => write,
            Err(err) => {
                warn!(error = %err, "store write failed, retrying once");
                tokio::time::sleep(STORE_RETRY_DELAY).await;
                self.store
                    .upsert_race_date(date, &scraped.races, today)
                    .await?
            }
        };

        info!(
            races = scraped.races.len(),
            races_written = write.races_written,
            runners_written = write.runners_written,
            rejected = write.rejected_runners.len(),
            "date committed"
        );
        Ok(DateCommit {
            date,
            races_parsed: scraped.races.len(),
            from_cache: scraped.from_cache,
            write,
            section_failures: scraped.failures,
        })
    }

    async fn finish_run(
        &self,
        report: BackfillReport,
        guard: RunGuard,
    ) -> Result<BackfillReport, IngestError> {
        self.refresh_last_complete().await;
        info!(
            attempted = report.attempted(),
            failed = report.failed(),
            incomplete = report.incomplete_dates.len(),
            cancelled = report.cancelled,
            "backfill finished"
        );
        // A date committed with zero races had no racing; it is resolved, not carried.
        let committed = committed_dates(&report.outcomes);
        self.update(|s| {
            s.unresolved.retain(|d| !committed.contains(d));
            s.unresolved.extend(
                report
                    .incomplete_dates
                    .iter()
                    .filter(|d| !committed.contains(*d)),
            );
            if report.failed() > 0 {
                s.phase = Phase::Failed;
            } else if s.unresolved.is_empty() {
                s.last_error = None;
            }
            s.last_run = Some(report.clone());
        });
        drop(guard);
        Ok(report)
    }

    /// Drop carried dates that now hold races; returns the ones still missing.
    async fn recheck_unresolved(&self) -> Result<Vec<RaceDate>, StoreError> {
        let carried = lock_state(&self.state)
            .unresolved
            .iter()
            .copied()
            .collect::<Vec<_>>();
        let (Some(&first), Some(&last)) = (carried.first(), carried.last()) else {
            return Ok(Vec::new());
        };
        let missing = find_gaps(self.store.as_ref(), first, last, self.clock.today())
            .await?
            .into_iter()
            .filter(|d| carried.binary_search(d).is_ok())
            .collect::<Vec<_>>();
        self.update(|s| {
            s.unresolved
                .retain(|d| carried.binary_search(d).is_err() || missing.binary_search(d).is_ok());
            if s.unresolved.is_empty() && !s.active {
                s.last_error = None;
            }
        });
        Ok(missing)
    }

    fn fail_run(&self, err: StoreError) -> IngestError {
        error!(error = %err, "cannot determine ingestion state");
        self.update(|s| {
            s.phase = Phase::Failed;
            s.last_error = Some(err.to_string());
        });
        IngestError::Store(err)
    }

    async fn refresh_last_complete(&self) {
        match self.store.latest_race_date_before(self.clock.today()).await {
            Ok(last) => self.update(|s| s.last_complete_date = last),
            Err(err) => warn!(error = %err, "could not refresh last complete date"),
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.update(|s| s.phase = phase);
    }

    fn update(&self, f: impl FnOnce(&mut UpdateState)) {
        let mut state = lock_state(&self.state);
        f(&mut state);
    }
}

fn committed_dates(outcomes: &[DateOutcome]) -> BTreeSet<RaceDate> {
    outcomes
        .iter()
        .filter(|o| o.is_committed())
        .map(DateOutcome::date)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrape::Scraper;
    use crate::store::MemoryRaceStore;
    use crate::testing::{day_payload, ScriptedFetcher};
    use async_trait::async_trait;
    use paddock_adapters::parse_day;
    use paddock_core::{parse_race_date, FixedClock};

    const PACING: Duration = Duration::from_secs(15);

    fn d(s: &str) -> RaceDate {
        parse_race_date(s).unwrap()
    }

    struct Harness {
        updater: Arc<AutoUpdater>,
        fetcher: ScriptedFetcher,
        store: Arc<MemoryRaceStore>,
    }

    fn harness(today: &str, earliest: &str) -> Harness {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(d(today)));
        let fetcher = ScriptedFetcher::new();
        let store = Arc::new(MemoryRaceStore::new());
        let scraper = Scraper::new(fetcher.clone(), Arc::clone(&clock));
        let updater = AutoUpdater::new(
            Arc::new(scraper),
            store.clone(),
            clock,
            AutoUpdateConfig {
                earliest_date: d(earliest),
                pacing: PACING,
                startup_delay: Duration::from_secs(5),
            },
        );
        Harness {
            updater: Arc::new(updater),
            fetcher,
            store,
        }
    }

    async fn seed(store: &MemoryRaceStore, date: &str, today: &str) {
        let races = parse_day(&day_payload(d(date))).unwrap().races;
        store.upsert_race_date(d(date), &races, d(today)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn backfills_from_last_complete_date_to_yesterday_with_pacing() {
        let h = harness("2024-05-05", "2024-01-01");
        seed(&h.store, "2024-05-01", "2024-05-05").await;
        h.fetcher.fail_transient(d("2024-05-03"), 3);

        let report = h.updater.run_backfill().await.unwrap();

        assert_eq!(
            h.fetcher.called_dates(),
            vec![
                d("2024-05-02"),
                d("2024-05-03"),
                d("2024-05-03"),
                d("2024-05-03"),
                d("2024-05-04"),
            ]
        );
        let calls = h.fetcher.calls();
        assert!(calls[1].1 - calls[0].1 >= PACING, "pacing after 05-02");
        assert!(calls[4].1 - calls[3].1 >= PACING, "pacing after failed 05-03");

        assert_eq!(report.window, Some((d("2024-05-02"), d("2024-05-04"))));
        assert_eq!(report.attempted(), 3);
        assert!(report.outcomes[0].is_committed());
        assert!(matches!(
            report.outcomes[1],
            DateOutcome::Failed { cause: FailureCause::Transport, .. }
        ));
        assert!(report.outcomes[2].is_committed());
        assert_eq!(report.incomplete_dates, vec![d("2024-05-03")]);
        assert!(!report.cancelled);

        let status = h.updater.status().await;
        assert_eq!(status.last_complete_date, Some(d("2024-05-04")));
        assert!(!status.run_active);
        assert_eq!(status.phase, Phase::Failed);
        assert!(status.last_error.unwrap_or_default().contains("2024-05-03"));
        assert_eq!(status.unresolved_dates, vec![d("2024-05-03")]);
        assert_eq!(status.last_run.map(|r| r.run_id), Some(report.run_id));
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_date_stays_unresolved_across_runs_until_filled() {
        let h = harness("2024-05-05", "2024-01-01");
        seed(&h.store, "2024-05-01", "2024-05-05").await;
        // Two runs' worth of exhausted retries.
        h.fetcher.fail_transient(d("2024-05-03"), 6);

        h.updater.run_backfill().await.unwrap();
        let second = h.updater.run_backfill().await.unwrap();

        // The second run retries only the carried date.
        assert_eq!(second.window, Some((d("2024-05-03"), d("2024-05-04"))));
        assert_eq!(second.attempted(), 1);
        assert_eq!(second.incomplete_dates, vec![d("2024-05-03")]);

        let status = h.updater.status().await;
        assert_eq!(status.last_complete_date, Some(d("2024-05-04")));
        assert_eq!(status.phase, Phase::Failed);
        assert_eq!(status.unresolved_dates, vec![d("2024-05-03")]);
        assert!(status.last_error.unwrap_or_default().contains("2024-05-03"));

        let third = h.updater.run_backfill().await.unwrap();
        assert_eq!(third.failed(), 0);
        assert!(third.incomplete_dates.is_empty());

        let status = h.updater.status().await;
        assert_eq!(status.phase, Phase::Idle);
        assert!(status.unresolved_dates.is_empty());
        assert_eq!(status.last_error, None);
        assert_eq!(h.store.races_on(d("2024-05-03")).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_scrape_resolves_a_carried_date() {
        let h = harness("2024-05-05", "2024-05-02");
        h.fetcher.fail_transient(d("2024-05-02"), 3);

        let report = h.updater.run_backfill().await.unwrap();
        assert_eq!(report.failed(), 1);
        assert_eq!(h.updater.status().await.unresolved_dates, vec![d("2024-05-02")]);

        h.updater.scrape_date(d("2024-05-02")).await.unwrap();
        let status = h.updater.status().await;
        assert!(status.unresolved_dates.is_empty());
        assert_eq!(status.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn structural_failure_on_one_date_does_not_block_the_rest() {
        let h = harness("2024-05-06", "2024-05-01");
        h.fetcher.serve_unparseable(d("2024-05-02"));

        let report = h.updater.run_backfill().await.unwrap();

        assert_eq!(report.attempted(), 5);
        let failed = report
            .outcomes
            .iter()
            .filter(|o| !o.is_committed())
            .collect::<Vec<_>>();
        assert_eq!(failed.len(), 1);
        assert!(matches!(
            failed[0],
            DateOutcome::Failed { cause: FailureCause::Parse, .. }
        ));
        assert_eq!(failed[0].date(), d("2024-05-02"));
        for date in ["2024-05-01", "2024-05-03", "2024-05-04", "2024-05-05"] {
            assert_eq!(h.store.races_on(d(date)).len(), 1, "{date} committed");
        }
        assert_eq!(report.incomplete_dates, vec![d("2024-05-02")]);
    }

    #[tokio::test]
    async fn second_start_while_active_is_rejected_not_queued() {
        let h = harness("2024-05-05", "2024-05-01");
        let guard = RunGuard::acquire(&h.updater.state).unwrap();

        assert!(h.updater.current_status().run_active);
        assert!(matches!(
            h.updater.run_backfill().await,
            Err(IngestError::ConcurrencyRejected)
        ));
        assert!(matches!(
            h.updater.scrape_date(d("2024-05-02")).await,
            Err(IngestError::ConcurrencyRejected)
        ));
        assert!(matches!(
            h.updater.start_backfill(),
            Err(IngestError::ConcurrencyRejected)
        ));
        assert!(h.fetcher.calls().is_empty());

        drop(guard);
        assert!(!h.updater.current_status().run_active);
        assert!(h.updater.scrape_date(d("2024-05-02")).await.is_ok());
    }

    #[tokio::test]
    async fn scrape_date_refuses_future_and_is_idempotent() {
        let h = harness("2024-05-05", "2024-05-01");

        assert!(matches!(
            h.updater.scrape_date(d("2024-05-06")).await,
            Err(IngestError::InvalidDate(_))
        ));

        let first = h.updater.scrape_yesterday().await.unwrap();
        assert_eq!(first.date, d("2024-05-04"));
        assert_eq!(first.write.races_written, 1);
        assert_eq!(first.write.runners_written, 2);

        let second = h.updater.scrape_date(d("2024-05-04")).await.unwrap();
        assert_eq!(second.write, WriteSummary::default());
        assert_eq!(h.store.race_count(), 1);
        assert_eq!(h.store.runner_count(), 2);

        // Today's card is allowed.
        assert!(h.updater.scrape_date(d("2024-05-05")).await.is_ok());
        assert_eq!(h.updater.status().await.last_complete_date, Some(d("2024-05-04")));
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_is_retried_once() {
        let h = harness("2024-05-05", "2024-05-01");
        h.store.fail_next_writes(1);
        assert!(h.updater.scrape_date(d("2024-05-02")).await.is_ok());

        h.store.fail_next_writes(2);
        let err = h.updater.scrape_date(d("2024-05-03")).await.unwrap_err();
        assert!(matches!(err, IngestError::Store(_)));
        assert!(h.updater.current_status().last_error.is_some());
    }

    #[tokio::test]
    async fn up_to_date_store_attempts_nothing() {
        let h = harness("2024-05-05", "2024-05-01");
        seed(&h.store, "2024-05-04", "2024-05-05").await;

        let report = h.updater.run_backfill().await.unwrap();
        assert_eq!(report.window, None);
        assert!(h.fetcher.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_finishes_in_flight_date_and_starts_no_other() {
        let h = harness("2024-05-05", "2024-05-01");
        h.fetcher.cancel_on_first_call(h.updater.shutdown_token());

        let report = h.updater.run_backfill().await.unwrap();

        assert!(report.cancelled);
        assert_eq!(h.fetcher.called_dates(), vec![d("2024-05-01")]);
        assert!(report.outcomes[0].is_committed());
        assert_eq!(
            report.incomplete_dates,
            vec![d("2024-05-02"), d("2024-05-03"), d("2024-05-04")]
        );
        assert!(h.updater.current_status().stopping);
    }

    #[tokio::test(start_paused = true)]
    async fn window_backfill_only_fetches_missing_dates() {
        let h = harness("2024-05-10", "2024-05-01");
        seed(&h.store, "2024-05-02", "2024-05-10").await;
        seed(&h.store, "2024-05-04", "2024-05-10").await;

        let report = h
            .updater
            .backfill_window(d("2024-05-01"), d("2024-05-30"))
            .await
            .unwrap();

        assert_eq!(report.window, Some((d("2024-05-01"), d("2024-05-09"))));
        assert_eq!(
            h.fetcher.called_dates(),
            vec![
                d("2024-05-01"),
                d("2024-05-03"),
                d("2024-05-05"),
                d("2024-05-06"),
                d("2024-05-07"),
                d("2024-05-08"),
                d("2024-05-09"),
            ]
        );
        assert!(report.incomplete_dates.is_empty());

        assert!(matches!(
            h.updater.backfill_window(d("2024-05-10"), d("2024-05-12")).await,
            Err(IngestError::InvalidDate(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn background_start_runs_and_releases_the_guard() {
        let h = harness("2024-05-03", "2024-05-01");
        let handle = h.updater.start_backfill().unwrap();
        handle.await.unwrap();

        let status = h.updater.current_status();
        assert!(!status.run_active);
        assert_eq!(status.last_run.map(|r| r.attempted()), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn startup_task_exits_on_shutdown_during_delay() {
        let h = harness("2024-05-03", "2024-05-01");
        let handle = h.updater.spawn_on_startup();
        h.updater.shutdown();
        handle.await.unwrap();
        assert!(h.fetcher.calls().is_empty());
    }

    struct UnreachableStore;

    #[async_trait]
    impl RaceStore for UnreachableStore {
        async fn upsert_race_date(
            &self,
            _date: RaceDate,
            _races: &[paddock_core::Race],
            _today: RaceDate,
        ) -> Result<WriteSummary, StoreError> {
            Err(StoreError::Message("connection refused".into()))
        }

        async fn latest_race_date_before(
            &self,
            _before: RaceDate,
        ) -> Result<Option<RaceDate>, StoreError> {
            Err(StoreError::Message("connection refused".into()))
        }

        async fn race_counts(
            &self,
            _from: RaceDate,
            _to: RaceDate,
        ) -> Result<std::collections::BTreeMap<RaceDate, i64>, StoreError> {
            Err(StoreError::Message("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn unreachable_store_fails_the_run_and_releases_the_guard() {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(d("2024-05-05")));
        let fetcher = ScriptedFetcher::new();
        let updater = AutoUpdater::new(
            Arc::new(Scraper::new(fetcher.clone(), Arc::clone(&clock))),
            Arc::new(UnreachableStore),
            clock,
            AutoUpdateConfig {
                earliest_date: d("2024-05-01"),
                pacing: PACING,
                startup_delay: Duration::ZERO,
            },
        );

        assert!(matches!(updater.run_backfill().await, Err(IngestError::Store(_))));
        let status = updater.current_status();
        assert_eq!(status.phase, Phase::Failed);
        assert!(!status.run_active);
        assert!(fetcher.calls().is_empty());
    }
}
