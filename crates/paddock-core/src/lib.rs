//! Core domain model for Paddock: race dates, races, runners and the clock seam.

use chrono::{Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "paddock-core";

/// Calendar date used as the unit of ingestion.
pub type RaceDate = NaiveDate;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn parse_race_date(input: &str) -> Result<RaceDate, chrono::ParseError> {
    NaiveDate::parse_from_str(input.trim(), DATE_FORMAT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    #[serde(rename = "GB")]
    Gb,
    #[serde(rename = "IRE")]
    Ire,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Gb => "GB",
            Region::Ire => "IRE",
        }
    }
}

/// A race as parsed from the source, keyed by (course, off time, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Race {
    pub race_date: RaceDate,
    pub region: Region,
    pub course: String,
    pub off_time: NaiveTime,
    pub race_name: String,
    pub race_type: String,
    pub race_class: Option<String>,
    pub distance: Option<String>,
    pub going: Option<String>,
    pub surface: Option<String>,
    pub age_band: Option<String>,
    pub source_race_id: Option<i64>,
    /// Ordered by ascending saddle number.
    pub runners: Vec<Runner>,
}

impl Race {
    pub fn ran(&self) -> usize {
        self.runners.len()
    }

    /// Human-readable slot label used in logs and rejection reports.
    pub fn slot_label(&self) -> String {
        format!(
            "{} {} {}",
            self.race_date.format(DATE_FORMAT),
            self.off_time.format("%H:%M"),
            self.course
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runner {
    pub saddle_number: i32,
    pub horse_name: String,
    pub horse_age: Option<i32>,
    pub draw: Option<i32>,
    pub jockey: Option<String>,
    pub trainer: Option<String>,
    pub owner: Option<String>,
    pub weight_lbs: Option<i32>,
    pub headgear: Option<String>,
    pub form: Option<String>,
    pub betfair_selection_id: Option<i64>,
    pub best_odds: Option<f64>,
    pub best_bookmaker: Option<String>,
}

impl Runner {
    pub fn new(saddle_number: i32, horse_name: impl Into<String>) -> Self {
        Self {
            saddle_number,
            horse_name: horse_name.into(),
            horse_age: None,
            draw: None,
            jockey: None,
            trainer: None,
            owner: None,
            weight_lbs: None,
            headgear: None,
            form: None,
            betfair_selection_id: None,
            best_odds: None,
            best_bookmaker: None,
        }
    }
}

/// Source of "today". Backfill windows and the historical-identity rule hang off it.
pub trait Clock: Send + Sync {
    fn today(&self) -> RaceDate;

    fn yesterday(&self) -> RaceDate {
        previous_day(self.today())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> RaceDate {
        Utc::now().date_naive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub RaceDate);

impl Clock for FixedClock {
    fn today(&self) -> RaceDate {
        self.0
    }
}

pub fn previous_day(date: RaceDate) -> RaceDate {
    date.checked_sub_days(Days::new(1)).unwrap_or(date)
}

pub fn next_day(date: RaceDate) -> RaceDate {
    date.checked_add_days(Days::new(1)).unwrap_or(date)
}

/// Every calendar date in `[from, to]`, ascending. Empty when `from > to`.
pub fn dates_inclusive(from: RaceDate, to: RaceDate) -> impl Iterator<Item = RaceDate> {
    from.iter_days().take_while(move |d| *d <= to)
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Name key used for horse/jockey/trainer/owner/course identity.
///
/// Drops a trailing country suffix such as `(IRE)`, lowercases, removes apostrophes and
/// turns the remaining punctuation into spaces before collapsing whitespace.
pub fn normalize_name(input: &str) -> String {
    let trimmed = input.trim_end();
    let base = match trimmed.strip_suffix(')').and_then(|rest| rest.rfind('(')) {
        Some(idx) if idx > 0 => &trimmed[..idx],
        _ => trimmed,
    };
    let cleaned = base
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '\'' | '\u{2019}'))
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>();
    collapse_whitespace(&cleaned)
}
