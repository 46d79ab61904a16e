//! Source adapter contracts + the Sporting Life race-card adapter.
//!
//! Fetching and parsing are split: [`DayFetcher`] gathers the raw bodies for one date into a
//! [`DayPayload`], and [`parse_day`] turns a payload into domain [`Race`] values without any I/O.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Timelike, Utc};
use paddock_core::{
    collapse_whitespace, normalize_name, Race, RaceDate, Region, Runner, DATE_FORMAT,
};
use paddock_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "paddock-adapters";

pub const SPORTING_LIFE_SOURCE_ID: &str = "sportinglife";
pub const DEFAULT_SPORTING_LIFE_BASE_URL: &str = "https://www.sportinglife.com/api/horse-racing";
pub const SPORTING_LIFE_REFERER: &str = "https://www.sportinglife.com/racing/racecards";

const BETFAIR_BOOKMAKER: &str = "Betfair Sportsbook";

/// Consecutive races without a detail body before the whole date is abandoned.
pub const MAX_CONSECUTIVE_RACE_FAILURES: usize = 3;

/// Tracks per-race detail failures while a day is fetched. A lone missing race is left out of
/// the payload (the parser records it); a run of them fails the date.
#[derive(Debug, Default)]
struct DetailFailures {
    consecutive: usize,
}

impl DetailFailures {
    fn succeeded(&mut self) {
        self.consecutive = 0;
    }

    fn skip(&mut self, race_id: i64, err: FetchError) -> Result<(), FetchError> {
        self.consecutive += 1;
        if self.consecutive >= MAX_CONSECUTIVE_RACE_FAILURES {
            return Err(err);
        }
        warn!(race_id, error = %err, "race detail unavailable, skipping race");
        Ok(())
    }
}

/// Raw content for one date: the racecards index plus per-race detail and betting bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayPayload {
    pub source_id: String,
    pub race_date: RaceDate,
    pub fetched_at: DateTime<Utc>,
    pub index: String,
    pub races: Vec<RacePayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RacePayload {
    pub race_id: i64,
    pub detail: String,
    pub betting: Option<String>,
}

#[async_trait]
pub trait DayFetcher: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_day(&self, date: RaceDate) -> Result<DayPayload, FetchError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("racecards index is not valid JSON: {0}")]
    IndexJson(String),
    #[error("racecards index has an unexpected shape: {0}")]
    IndexShape(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Index,
    Detail,
    Betting,
    Runner,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Section::Index => "index",
            Section::Detail => "detail",
            Section::Betting => "betting",
            Section::Runner => "runner",
        };
        f.write_str(label)
    }
}

/// A non-fatal defect in part of a page. The rest of the date still parses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionFailure {
    pub race_id: Option<i64>,
    pub section: Section,
    pub reason: String,
}

impl SectionFailure {
    fn new(race_id: Option<i64>, section: Section, reason: impl Into<String>) -> Self {
        Self {
            race_id,
            section,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDay {
    pub race_date: RaceDate,
    /// Ordered by off time, then course.
    pub races: Vec<Race>,
    pub failures: Vec<SectionFailure>,
}

/// One UK/IRE race as listed in the racecards index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedRace {
    pub race_id: i64,
    pub region: Region,
    pub course: String,
    pub race_name: String,
    pub off_time: NaiveTime,
    pub has_handicap: bool,
    pub race_class: Option<String>,
    pub distance: Option<String>,
    pub going: Option<String>,
    pub surface: Option<String>,
    pub age_band: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RaceIndex {
    pub races: Vec<IndexedRace>,
    pub failures: Vec<SectionFailure>,
}

pub fn region_for_country(short_name: &str) -> Option<Region> {
    match short_name.trim() {
        "ENG" | "SCO" | "Wale" => Some(Region::Gb),
        "Eire" => Some(Region::Ire),
        _ => None,
    }
}

/// Parse the racecards index, keeping UK/IRE meetings only.
pub fn parse_race_index(body: &str) -> Result<RaceIndex, ParseError> {
    let value: JsonValue =
        serde_json::from_str(body).map_err(|e| ParseError::IndexJson(e.to_string()))?;
    let meetings = value
        .as_array()
        .ok_or_else(|| ParseError::IndexShape("expected an array of meetings".to_string()))?;

    let mut index = RaceIndex::default();
    for meeting in meetings {
        let country = json_str(meeting, &["meeting_summary", "course", "country", "short_name"]);
        let Some(region) = country.and_then(region_for_country) else {
            continue;
        };
        let meeting_course = json_text(meeting, &["meeting_summary", "course", "name"]);

        let Some(races) = meeting.get("races").and_then(JsonValue::as_array) else {
            index.failures.push(SectionFailure::new(
                None,
                Section::Index,
                format!(
                    "meeting {} has no races list",
                    meeting_course.as_deref().unwrap_or("<unnamed>")
                ),
            ));
            continue;
        };

        for race in races {
            match indexed_race(race, region, meeting_course.as_deref()) {
                Ok(entry) => index.races.push(entry),
                Err(failure) => index.failures.push(failure),
            }
        }
    }
    Ok(index)
}

fn indexed_race(
    race: &JsonValue,
    region: Region,
    meeting_course: Option<&str>,
) -> Result<IndexedRace, SectionFailure> {
    let race_id = race
        .get("race_summary_reference")
        .and_then(|r| r.get("id"))
        .and_then(json_int)
        .ok_or_else(|| {
            SectionFailure::new(None, Section::Index, "race entry without a race reference id")
        })?;

    let course = json_text(race, &["course_name"])
        .or_else(|| meeting_course.map(collapse_whitespace))
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            SectionFailure::new(Some(race_id), Section::Index, "race without a course")
        })?;

    let raw_time = json_str(race, &["time"]).unwrap_or_default();
    let off_time = parse_off_time(raw_time).ok_or_else(|| {
        SectionFailure::new(
            Some(race_id),
            Section::Index,
            format!("unparseable off time {raw_time:?}"),
        )
    })?;

    Ok(IndexedRace {
        race_id,
        region,
        course,
        race_name: json_text(race, &["name"]).unwrap_or_default(),
        off_time,
        has_handicap: race
            .get("has_handicap")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false),
        race_class: json_text(race, &["race_class"]),
        distance: json_text(race, &["distance"]),
        going: json_text(race, &["going"]),
        surface: json_text(race, &["course_surface", "surface"]).map(|s| title_case(&s)),
        age_band: json_text(race, &["age"]),
    })
}

/// Turn a fetched day into races. Pure; defects below the index become [`SectionFailure`]s.
pub fn parse_day(payload: &DayPayload) -> Result<ParsedDay, ParseError> {
    let index = parse_race_index(&payload.index)?;
    let mut failures = index.failures;
    let bodies: HashMap<i64, &RacePayload> =
        payload.races.iter().map(|r| (r.race_id, r)).collect();

    let mut races = Vec::with_capacity(index.races.len());
    for entry in &index.races {
        let Some(body) = bodies.get(&entry.race_id) else {
            failures.push(SectionFailure::new(
                Some(entry.race_id),
                Section::Detail,
                "race listed in index but no detail body was captured",
            ));
            continue;
        };
        match parse_race(payload.race_date, entry, body, &mut failures) {
            Ok(race) => races.push(race),
            Err(failure) => failures.push(failure),
        }
    }

    races.sort_by(|a, b| a.off_time.cmp(&b.off_time).then_with(|| a.course.cmp(&b.course)));

    debug!(
        date = %payload.race_date.format(DATE_FORMAT),
        races = races.len(),
        failures = failures.len(),
        "parsed day"
    );
    Ok(ParsedDay {
        race_date: payload.race_date,
        races,
        failures,
    })
}

fn parse_race(
    race_date: RaceDate,
    entry: &IndexedRace,
    body: &RacePayload,
    failures: &mut Vec<SectionFailure>,
) -> Result<Race, SectionFailure> {
    let race_id = Some(entry.race_id);
    let detail: JsonValue = serde_json::from_str(&body.detail).map_err(|e| {
        SectionFailure::new(race_id, Section::Detail, format!("invalid JSON: {e}"))
    })?;
    let rides = detail
        .get("rides")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| SectionFailure::new(race_id, Section::Detail, "missing rides list"))?;

    let mut runners = Vec::with_capacity(rides.len());
    for ride in rides {
        match runner_from_ride(ride) {
            Some(runner) => runners.push(runner),
            None => failures.push(SectionFailure::new(
                race_id,
                Section::Runner,
                format!(
                    "ride without a saddle number ({})",
                    json_text(ride, &["horse", "name"]).unwrap_or_default()
                ),
            )),
        }
    }

    // Stable, so source order decides which of two equal saddle numbers survives.
    runners.sort_by_key(|r| r.saddle_number);
    let mut ordered: Vec<Runner> = Vec::with_capacity(runners.len());
    for runner in runners {
        if ordered
            .last()
            .is_some_and(|prev| prev.saddle_number == runner.saddle_number)
        {
            failures.push(SectionFailure::new(
                race_id,
                Section::Runner,
                format!(
                    "duplicate saddle number {} ({})",
                    runner.saddle_number, runner.horse_name
                ),
            ));
            continue;
        }
        ordered.push(runner);
    }

    if let Some(betting) = &body.betting {
        match parse_betting(betting) {
            Ok(lines) => merge_betting(&mut ordered, &lines),
            Err(reason) => failures.push(SectionFailure::new(race_id, Section::Betting, reason)),
        }
    }

    Ok(Race {
        race_date,
        region: entry.region,
        course: entry.course.clone(),
        off_time: entry.off_time,
        race_name: entry.race_name.clone(),
        race_type: race_type(&entry.race_name, entry.has_handicap).to_string(),
        race_class: entry.race_class.clone(),
        distance: entry.distance.clone(),
        going: entry.going.clone(),
        surface: entry.surface.clone(),
        age_band: entry.age_band.clone(),
        source_race_id: race_id,
        runners: ordered,
    })
}

fn runner_from_ride(ride: &JsonValue) -> Option<Runner> {
    let saddle_number = ride.get("cloth_number").and_then(json_int)?;
    let saddle_number = i32::try_from(saddle_number).ok().filter(|n| *n > 0)?;

    let mut runner = Runner::new(
        saddle_number,
        json_text(ride, &["horse", "name"]).unwrap_or_default(),
    );
    runner.horse_age = json_positive_i32(ride, &["horse", "age"]);
    runner.draw = json_positive_i32(ride, &["stall"]);
    runner.jockey = json_text(ride, &["jockey", "name"]);
    runner.trainer = json_text(ride, &["trainer", "name"]);
    runner.owner = json_text(ride, &["owner", "name"]);
    runner.weight_lbs = json_str(ride, &["weight"]).and_then(weight_to_lbs);
    runner.form = json_text(ride, &["form_summary"]);
    runner.headgear = ride.get("headgear").and_then(headgear_text);
    Some(runner)
}

#[derive(Debug, Clone, PartialEq)]
struct BettingLine {
    saddle_number: Option<i32>,
    name_key: String,
    betfair_selection_id: Option<i64>,
    best_odds: Option<f64>,
    best_bookmaker: Option<String>,
}

fn parse_betting(body: &str) -> Result<Vec<BettingLine>, String> {
    let value: JsonValue = serde_json::from_str(body).map_err(|e| format!("invalid JSON: {e}"))?;
    let rides = value
        .get("rides")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| "missing rides list".to_string())?;

    Ok(rides
        .iter()
        .map(|ride| {
            let mut line = BettingLine {
                saddle_number: ride
                    .get("cloth_number")
                    .and_then(json_int)
                    .and_then(|n| i32::try_from(n).ok()),
                name_key: json_str(ride, &["horse_name"])
                    .map(normalize_name)
                    .unwrap_or_default(),
                betfair_selection_id: None,
                best_odds: None,
                best_bookmaker: None,
            };
            let offers = ride
                .get("bookmakerOdds")
                .and_then(JsonValue::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for offer in offers {
                let bookmaker = json_text(offer, &["bookmakerName"]);
                if bookmaker.as_deref() == Some(BETFAIR_BOOKMAKER) {
                    if let Some(id) = offer.get("selectionId").and_then(json_int) {
                        line.betfair_selection_id = Some(id);
                    }
                }
                let is_best = offer.get("bestOdds").and_then(JsonValue::as_bool) == Some(true);
                let odds = offer.get("decimalOdds").and_then(JsonValue::as_f64);
                if let (true, Some(odds)) = (is_best, odds) {
                    if line.best_odds.map_or(true, |current| odds > current) {
                        line.best_odds = Some(odds);
                        line.best_bookmaker = bookmaker;
                    }
                }
            }
            line
        })
        .collect())
}

/// Attach odds by saddle number, falling back to the normalised horse name.
fn merge_betting(runners: &mut [Runner], lines: &[BettingLine]) {
    let by_saddle: HashMap<i32, &BettingLine> = lines
        .iter()
        .filter_map(|l| l.saddle_number.map(|n| (n, l)))
        .collect();
    let by_name: HashMap<&str, &BettingLine> = lines
        .iter()
        .filter(|l| !l.name_key.is_empty())
        .map(|l| (l.name_key.as_str(), l))
        .collect();

    for runner in runners {
        let key = normalize_name(&runner.horse_name);
        let line = by_saddle
            .get(&runner.saddle_number)
            .or_else(|| by_name.get(key.as_str()));
        if let Some(line) = line {
            runner.betfair_selection_id = line.betfair_selection_id;
            runner.best_odds = line.best_odds;
            runner.best_bookmaker = line.best_bookmaker.clone();
        }
    }
}

/// Race type from the race name and handicap flag.
pub fn race_type(race_name: &str, has_handicap: bool) -> &'static str {
    let name = race_name.to_lowercase();
    if name.contains("chase") && !name.contains("hurdle") {
        return if has_handicap { "Handicap Chase" } else { "Chase" };
    }
    if name.contains("hurdle") {
        return if has_handicap {
            "Handicap Hurdle"
        } else {
            "Hurdle"
        };
    }
    if name.contains("nh flat") || name.contains("bumper") {
        return "NH Flat";
    }
    if has_handicap {
        "Handicap"
    } else {
        "Flat"
    }
}

/// `"11-7"` → 161. Pounds outside 0..=13 or an overflowing stone count give `None`.
pub fn weight_to_lbs(weight: &str) -> Option<i32> {
    let (stones, pounds) = weight.trim().split_once('-')?;
    let stones: i32 = stones.trim().parse().ok()?;
    let pounds: i32 = pounds.trim().parse().ok()?;
    if stones < 0 || !(0..14).contains(&pounds) {
        return None;
    }
    stones
        .checked_mul(14)?
        .checked_add(pounds)
        .filter(|lbs| *lbs > 0)
}

/// Accepts `HH:MM` or `HH:MM:SS`; seconds are dropped.
pub fn parse_off_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
        .and_then(|t| t.with_second(0))
}

fn headgear_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Array(items) => {
            let parts = items
                .iter()
                .filter_map(JsonValue::as_str)
                .filter_map(|s| text_or_none(s.to_string()))
                .collect::<Vec<_>>();
            text_or_none(parts.join(", "))
        }
        JsonValue::Object(_) => json_text(value, &["name"]),
        JsonValue::String(s) => text_or_none(s.clone()),
        _ => None,
    }
}

fn title_case(input: &str) -> String {
    input
        .split_whitespace()
        .map(|word| {
            let lower = word.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = collapse_whitespace(&value);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_str(value, path).and_then(|s| text_or_none(s.to_string()))
}

/// Integers arrive as numbers or as numeric strings depending on the endpoint.
fn json_int(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_positive_i32(value: &JsonValue, path: &[&str]) -> Option<i32> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    json_int(cur)
        .and_then(|n| i32::try_from(n).ok())
        .filter(|n| *n > 0)
}

/// Live adapter over the three Sporting Life JSON endpoints.
#[derive(Debug, Clone)]
pub struct SportingLifeAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl SportingLifeAdapter {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn racecards_url(&self, date: RaceDate) -> String {
        format!("{}/racing/racecards/{}", self.base_url, date.format(DATE_FORMAT))
    }

    pub fn race_url(&self, race_id: i64) -> String {
        format!("{}/race/{race_id}", self.base_url)
    }

    pub fn betting_url(&self, race_id: i64) -> String {
        format!("{}/v2/racing/betting/{race_id}", self.base_url)
    }
}

#[async_trait]
impl DayFetcher for SportingLifeAdapter {
    fn source_id(&self) -> &'static str {
        SPORTING_LIFE_SOURCE_ID
    }

    async fn fetch_day(&self, date: RaceDate) -> Result<DayPayload, FetchError> {
        let index_url = self.racecards_url(date);
        let index = self.http.get_text(&index_url).await?;
        let listed = parse_race_index(&index)
            .map_err(|err| FetchError::permanent(index_url.as_str(), err.to_string()))?;

        let mut races = Vec::with_capacity(listed.races.len());
        let mut skipped = DetailFailures::default();
        for entry in &listed.races {
            let detail = match self.http.get_text(&self.race_url(entry.race_id)).await {
                Ok(body) => body,
                Err(err) if !err.is_transient() => {
                    skipped.skip(entry.race_id, err)?;
                    continue;
                }
                Err(err) => return Err(err),
            };
            skipped.succeeded();
            let betting = match self.http.get_text(&self.betting_url(entry.race_id)).await {
                Ok(body) => Some(body),
                Err(err) if !err.is_transient() => {
                    warn!(
                        race_id = entry.race_id,
                        error = %err,
                        "betting unavailable, continuing without odds"
                    );
                    None
                }
                Err(err) => return Err(err),
            };
            races.push(RacePayload {
                race_id: entry.race_id,
                detail,
                betting,
            });
        }

        info!(
            date = %date.format(DATE_FORMAT),
            races = races.len(),
            "fetched racecards"
        );
        Ok(DayPayload {
            source_id: SPORTING_LIFE_SOURCE_ID.to_string(),
            race_date: date,
            fetched_at: Utc::now(),
            index,
            races,
        })
    }
}

/// Fixture-backed fetcher: `<root>/<date>/index.json`, `race-<id>.json`, `betting-<id>.json`.
#[derive(Debug, Clone)]
pub struct FixtureDayFetcher {
    root: PathBuf,
}

impl FixtureDayFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DayFetcher for FixtureDayFetcher {
    fn source_id(&self) -> &'static str {
        SPORTING_LIFE_SOURCE_ID
    }

    async fn fetch_day(&self, date: RaceDate) -> Result<DayPayload, FetchError> {
        load_fixture_payload(&self.root, date)
    }
}

pub fn load_fixture_payload(
    root: impl AsRef<Path>,
    date: RaceDate,
) -> Result<DayPayload, FetchError> {
    let day_dir = root.as_ref().join(date.format(DATE_FORMAT).to_string());
    let index_path = day_dir.join("index.json");
    let index = read_fixture(&index_path)?.ok_or_else(|| {
        FetchError::permanent(index_path.display().to_string(), "no fixture for date")
    })?;
    let listed = parse_race_index(&index)
        .map_err(|err| FetchError::permanent(index_path.display().to_string(), err.to_string()))?;

    let mut races = Vec::with_capacity(listed.races.len());
    let mut skipped = DetailFailures::default();
    for entry in &listed.races {
        let detail_path = day_dir.join(format!("race-{}.json", entry.race_id));
        let Some(detail) = read_fixture(&detail_path)? else {
            let err =
                FetchError::permanent(detail_path.display().to_string(), "missing race fixture");
            skipped.skip(entry.race_id, err)?;
            continue;
        };
        skipped.succeeded();
        let betting = read_fixture(&day_dir.join(format!("betting-{}.json", entry.race_id)))?;
        races.push(RacePayload {
            race_id: entry.race_id,
            detail,
            betting,
        });
    }

    Ok(DayPayload {
        source_id: SPORTING_LIFE_SOURCE_ID.to_string(),
        race_date: date,
        fetched_at: Utc::now(),
        index,
        races,
    })
}

fn read_fixture(path: &Path) -> Result<Option<String>, FetchError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(FetchError::permanent(path.display().to_string(), err.to_string())),
    }
}
