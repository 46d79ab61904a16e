//! Race store: transactional per-date upserts into Postgres, plus an in-memory twin.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::NaiveTime;
use paddock_core::{normalize_name, Race, RaceDate, Runner, DATE_FORMAT};
use serde::Serialize;
use sqlx::{PgConnection, PgPool, Row};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRunner {
    pub race: String,
    pub saddle_number: i32,
    pub reason: String,
}

/// Rows inserted or changed by one date's write. Unchanged rows are not counted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub races_written: usize,
    pub runners_written: usize,
    pub rejected_runners: Vec<RejectedRunner>,
}

#[async_trait]
pub trait RaceStore: Send + Sync {
    /// Upsert every race of `date` in a single transaction.
    async fn upsert_race_date(
        &self,
        date: RaceDate,
        races: &[Race],
        today: RaceDate,
    ) -> Result<WriteSummary, StoreError>;

    /// Latest date strictly before `before` holding at least one race.
    async fn latest_race_date_before(
        &self,
        before: RaceDate,
    ) -> Result<Option<RaceDate>, StoreError>;

    /// Race counts per date within `[from, to]`; dates without races are absent.
    async fn race_counts(
        &self,
        from: RaceDate,
        to: RaceDate,
    ) -> Result<BTreeMap<RaceDate, i64>, StoreError>;
}

/// Split a race's runners into writable ones and rejections.
///
/// For dates before `today` a runner must resolve to a horse identity; an empty normalised
/// name would leave `horse_id` null, so it is rejected instead of written.
pub fn screen_runners<'a>(
    race: &'a Race,
    today: RaceDate,
) -> (Vec<&'a Runner>, Vec<RejectedRunner>) {
    let historical = race.race_date < today;
    let mut accepted = Vec::with_capacity(race.runners.len());
    let mut rejected = Vec::new();
    for runner in &race.runners {
        if historical && normalize_name(&runner.horse_name).is_empty() {
            rejected.push(RejectedRunner {
                race: race.slot_label(),
                saddle_number: runner.saddle_number,
                reason: "horse identity could not be resolved".to_string(),
            });
            continue;
        }
        accepted.push(runner);
    }
    (accepted, rejected)
}

fn ensure_single_date(date: RaceDate, races: &[Race]) -> Result<(), StoreError> {
    match races.iter().find(|r| r.race_date != date) {
        Some(stray) => Err(StoreError::Message(format!(
            "race {} does not belong to {}",
            stray.slot_label(),
            date.format(DATE_FORMAT)
        ))),
        None => Ok(()),
    }
}

#[derive(Debug, Clone)]
pub struct PgRaceStore {
    pool: PgPool,
}

impl PgRaceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runners before `before` with no horse identity. Zero on a healthy store.
    pub async fn count_unresolved_runners_before(
        &self,
        before: RaceDate,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*)::BIGINT AS unresolved FROM racing.runners WHERE horse_id IS NULL AND race_date < $1",
        )
        .bind(before)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("unresolved")?)
    }
}

#[derive(Debug, Clone, Copy)]
enum Dimension {
    Horse,
    Jockey,
    Trainer,
    Owner,
}

impl Dimension {
    fn columns(self) -> (&'static str, &'static str, &'static str) {
        match self {
            Dimension::Horse => ("racing.horses", "horse_id", "horse_name"),
            Dimension::Jockey => ("racing.jockeys", "jockey_id", "jockey_name"),
            Dimension::Trainer => ("racing.trainers", "trainer_id", "trainer_name"),
            Dimension::Owner => ("racing.owners", "owner_id", "owner_name"),
        }
    }
}

async fn resolve_dimension(
    conn: &mut PgConnection,
    dimension: Dimension,
    name: Option<&str>,
) -> Result<Option<i64>, StoreError> {
    let Some(name) = name else {
        return Ok(None);
    };
    let norm = normalize_name(name);
    if norm.is_empty() {
        return Ok(None);
    }
    let (table, id_col, name_col) = dimension.columns();
    let sql = format!(
        "WITH ins AS (
            INSERT INTO {table} ({name_col}, norm_name) VALUES ($1, $2)
            ON CONFLICT (norm_name) DO NOTHING
            RETURNING {id_col}
        )
        SELECT {id_col} FROM ins
        UNION ALL
        SELECT {id_col} FROM {table} WHERE norm_name = $2
        LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(name)
        .bind(&norm)
        .fetch_one(&mut *conn)
        .await?;
    Ok(Some(row.try_get::<i64, _>(0)?))
}

async fn resolve_course(conn: &mut PgConnection, race: &Race) -> Result<i64, StoreError> {
    let norm = normalize_name(&race.course);
    if norm.is_empty() {
        return Err(StoreError::Message(format!(
            "race {} has no usable course name",
            race.slot_label()
        )));
    }
    let row = sqlx::query(
        "WITH ins AS (
            INSERT INTO racing.courses (course_name, region, norm_name) VALUES ($1, $2, $3)
            ON CONFLICT (norm_name) DO NOTHING
            RETURNING course_id
        )
        SELECT course_id FROM ins
        UNION ALL
        SELECT course_id FROM racing.courses WHERE norm_name = $3
        LIMIT 1",
    )
    .bind(&race.course)
    .bind(race.region.as_str())
    .bind(&norm)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.try_get("course_id")?)
}

const UPSERT_RACE_SQL: &str = "
INSERT INTO racing.races (
    race_date, region, course_id, off_time, race_name, race_type, race_class,
    distance, going, surface, age_band, ran, source_race_id
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
ON CONFLICT (course_id, off_time, race_date) DO UPDATE SET
    region = EXCLUDED.region,
    race_name = EXCLUDED.race_name,
    race_type = EXCLUDED.race_type,
    race_class = EXCLUDED.race_class,
    distance = EXCLUDED.distance,
    going = EXCLUDED.going,
    surface = EXCLUDED.surface,
    age_band = EXCLUDED.age_band,
    ran = EXCLUDED.ran,
    source_race_id = EXCLUDED.source_race_id,
    updated_at = now()
WHERE (
    racing.races.region, racing.races.race_name, racing.races.race_type, racing.races.race_class,
    racing.races.distance, racing.races.going, racing.races.surface, racing.races.age_band,
    racing.races.ran, racing.races.source_race_id
) IS DISTINCT FROM (
    EXCLUDED.region, EXCLUDED.race_name, EXCLUDED.race_type, EXCLUDED.race_class,
    EXCLUDED.distance, EXCLUDED.going, EXCLUDED.surface, EXCLUDED.age_band,
    EXCLUDED.ran, EXCLUDED.source_race_id
)
RETURNING race_id";

// Odds are sticky: a later card without betting data keeps what an earlier scrape captured.
const UPSERT_RUNNER_SQL: &str = "
INSERT INTO racing.runners (
    race_id, race_date, saddle_number, horse_id, horse_name, jockey_id, trainer_id, owner_id,
    draw, age, weight_lbs, headgear, form, betfair_selection_id, best_odds, best_bookmaker
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
ON CONFLICT (race_id, saddle_number) DO UPDATE SET
    horse_id = EXCLUDED.horse_id,
    horse_name = EXCLUDED.horse_name,
    jockey_id = EXCLUDED.jockey_id,
    trainer_id = EXCLUDED.trainer_id,
    owner_id = EXCLUDED.owner_id,
    draw = EXCLUDED.draw,
    age = EXCLUDED.age,
    weight_lbs = EXCLUDED.weight_lbs,
    headgear = EXCLUDED.headgear,
    form = EXCLUDED.form,
    betfair_selection_id = COALESCE(EXCLUDED.betfair_selection_id, racing.runners.betfair_selection_id),
    best_odds = COALESCE(EXCLUDED.best_odds, racing.runners.best_odds),
    best_bookmaker = COALESCE(EXCLUDED.best_bookmaker, racing.runners.best_bookmaker),
    updated_at = now()
WHERE (
    racing.runners.horse_id, racing.runners.horse_name, racing.runners.jockey_id,
    racing.runners.trainer_id, racing.runners.owner_id, racing.runners.draw, racing.runners.age,
    racing.runners.weight_lbs, racing.runners.headgear, racing.runners.form,
    racing.runners.betfair_selection_id, racing.runners.best_odds, racing.runners.best_bookmaker
) IS DISTINCT FROM (
    EXCLUDED.horse_id, EXCLUDED.horse_name, EXCLUDED.jockey_id,
    EXCLUDED.trainer_id, EXCLUDED.owner_id, EXCLUDED.draw, EXCLUDED.age,
    EXCLUDED.weight_lbs, EXCLUDED.headgear, EXCLUDED.form,
    COALESCE(EXCLUDED.betfair_selection_id, racing.runners.betfair_selection_id),
    COALESCE(EXCLUDED.best_odds, racing.runners.best_odds),
    COALESCE(EXCLUDED.best_bookmaker, racing.runners.best_bookmaker)
)
RETURNING runner_id";

/// Returns the race id and whether the row was inserted or changed.
async fn upsert_race(
    conn: &mut PgConnection,
    course_id: i64,
    race: &Race,
    ran: usize,
) -> Result<(i64, bool), StoreError> {
    let ran = i32::try_from(ran).map_err(|_| StoreError::Message("runner count overflow".into()))?;
    let written = sqlx::query(UPSERT_RACE_SQL)
        .bind(race.race_date)
        .bind(race.region.as_str())
        .bind(course_id)
        .bind(race.off_time)
        .bind(&race.race_name)
        .bind(&race.race_type)
        .bind(&race.race_class)
        .bind(&race.distance)
        .bind(&race.going)
        .bind(&race.surface)
        .bind(&race.age_band)
        .bind(ran)
        .bind(race.source_race_id)
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(row) = written {
        return Ok((row.try_get("race_id")?, true));
    }

    let row = sqlx::query(
        "SELECT race_id FROM racing.races WHERE course_id = $1 AND off_time = $2 AND race_date = $3",
    )
    .bind(course_id)
    .bind(race.off_time)
    .bind(race.race_date)
    .fetch_one(&mut *conn)
    .await?;
    Ok((row.try_get("race_id")?, false))
}

async fn upsert_runner(
    conn: &mut PgConnection,
    race_id: i64,
    race_date: RaceDate,
    runner: &Runner,
) -> Result<bool, StoreError> {
    let horse_id = resolve_dimension(conn, Dimension::Horse, Some(&runner.horse_name)).await?;
    let jockey_id = resolve_dimension(conn, Dimension::Jockey, runner.jockey.as_deref()).await?;
    let trainer_id = resolve_dimension(conn, Dimension::Trainer, runner.trainer.as_deref()).await?;
    let owner_id = resolve_dimension(conn, Dimension::Owner, runner.owner.as_deref()).await?;

    let written = sqlx::query(UPSERT_RUNNER_SQL)
        .bind(race_id)
        .bind(race_date)
        .bind(runner.saddle_number)
        .bind(horse_id)
        .bind(&runner.horse_name)
        .bind(jockey_id)
        .bind(trainer_id)
        .bind(owner_id)
        .bind(runner.draw)
        .bind(runner.horse_age)
        .bind(runner.weight_lbs)
        .bind(&runner.headgear)
        .bind(&runner.form)
        .bind(runner.betfair_selection_id)
        .bind(runner.best_odds)
        .bind(&runner.best_bookmaker)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(written.is_some())
}

#[async_trait]
impl RaceStore for PgRaceStore {
    async fn upsert_race_date(
        &self,
        date: RaceDate,
        races: &[Race],
        today: RaceDate,
    ) -> Result<WriteSummary, StoreError> {
        ensure_single_date(date, races)?;
        let mut tx = self.pool.begin().await?;
        let mut summary = WriteSummary::default();

        for race in races {
            let (accepted, rejected) = screen_runners(race, today);
            for rejection in &rejected {
                warn!(
                    race = %rejection.race,
                    saddle = rejection.saddle_number,
                    "rejecting runner without identity"
                );
            }
            summary.rejected_runners.extend(rejected);

            let course_id = resolve_course(&mut tx, race).await?;
            let (race_id, changed) = upsert_race(&mut tx, course_id, race, accepted.len()).await?;
            if changed {
                summary.races_written += 1;
            }
            for runner in accepted {
                if upsert_runner(&mut tx, race_id, race.race_date, runner).await? {
                    summary.runners_written += 1;
                }
            }
        }

        tx.commit().await?;
        debug!(
            date = %date.format(DATE_FORMAT),
            races = summary.races_written,
            runners = summary.runners_written,
            "committed race date"
        );
        Ok(summary)
    }

    async fn latest_race_date_before(
        &self,
        before: RaceDate,
    ) -> Result<Option<RaceDate>, StoreError> {
        let row =
            sqlx::query("SELECT MAX(race_date) AS latest FROM racing.races WHERE race_date < $1")
            .bind(before)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("latest")?)
    }

    async fn race_counts(
        &self,
        from: RaceDate,
        to: RaceDate,
    ) -> Result<BTreeMap<RaceDate, i64>, StoreError> {
        let rows = sqlx::query(
            "SELECT race_date, COUNT(*)::BIGINT AS races
             FROM racing.races
             WHERE race_date BETWEEN $1 AND $2
             GROUP BY race_date",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            counts.insert(row.try_get("race_date")?, row.try_get("races")?);
        }
        Ok(counts)
    }
}

type RaceKey = (RaceDate, NaiveTime, String);

#[derive(Debug, Clone)]
struct StoredRace {
    header: Race,
    runners: BTreeMap<i32, Runner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    races: BTreeMap<RaceKey, StoredRace>,
    failing_writes: usize,
}

/// In-memory [`RaceStore`] with the same keying and change detection as the Postgres store.
#[derive(Debug, Default)]
pub struct MemoryRaceStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryRaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with a store error.
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().failing_writes = count;
    }

    pub fn race_count(&self) -> usize {
        self.lock().races.len()
    }

    pub fn runner_count(&self) -> usize {
        self.lock().races.values().map(|r| r.runners.len()).sum()
    }

    pub fn races_on(&self, date: RaceDate) -> Vec<Race> {
        self.lock()
            .races
            .values()
            .filter(|r| r.header.race_date == date)
            .map(|r| Race {
                runners: r.runners.values().cloned().collect(),
                ..r.header.clone()
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RaceStore for MemoryRaceStore {
    async fn upsert_race_date(
        &self,
        date: RaceDate,
        races: &[Race],
        today: RaceDate,
    ) -> Result<WriteSummary, StoreError> {
        ensure_single_date(date, races)?;
        let mut inner = self.lock();
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(StoreError::Message("simulated store outage".to_string()));
        }

        let mut summary = WriteSummary::default();
        for race in races {
            let (accepted, rejected) = screen_runners(race, today);
            summary.rejected_runners.extend(rejected);

            let key = (race.race_date, race.off_time, normalize_name(&race.course));
            let header = Race {
                runners: Vec::new(),
                ..race.clone()
            };
            let stored = match inner.races.entry(key) {
                Entry::Occupied(entry) => {
                    let stored = entry.into_mut();
                    if stored.header != header {
                        stored.header = header;
                        summary.races_written += 1;
                    }
                    stored
                }
                Entry::Vacant(entry) => {
                    summary.races_written += 1;
                    entry.insert(StoredRace {
                        header,
                        runners: BTreeMap::new(),
                    })
                }
            };
            for runner in accepted {
                let previous = stored.runners.get(&runner.saddle_number);
                let mut merged = runner.clone();
                if let Some(previous) = previous {
                    merged.betfair_selection_id =
                        merged.betfair_selection_id.or(previous.betfair_selection_id);
                    merged.best_odds = merged.best_odds.or(previous.best_odds);
                    merged.best_bookmaker =
                        merged.best_bookmaker.or_else(|| previous.best_bookmaker.clone());
                }
                if previous != Some(&merged) {
                    stored.runners.insert(merged.saddle_number, merged);
                    summary.runners_written += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn latest_race_date_before(
        &self,
        before: RaceDate,
    ) -> Result<Option<RaceDate>, StoreError> {
        Ok(self
            .lock()
            .races
            .keys()
            .map(|(date, _, _)| *date)
            .filter(|d| *d < before)
            .max())
    }

    async fn race_counts(
        &self,
        from: RaceDate,
        to: RaceDate,
    ) -> Result<BTreeMap<RaceDate, i64>, StoreError> {
        let mut counts = BTreeMap::new();
        for (date, _, _) in self.lock().races.keys() {
            if *date >= from && *date <= to {
                *counts.entry(*date).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}
