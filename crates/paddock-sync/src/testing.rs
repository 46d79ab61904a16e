//! Scripted fetcher shared by the scraper and orchestrator tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use paddock_adapters::{DayFetcher, DayPayload, RacePayload, SPORTING_LIFE_SOURCE_ID};
use paddock_core::{RaceDate, DATE_FORMAT};
use paddock_storage::FetchError;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One Chester race with two runners, keyed off the date so ids differ per day.
pub fn day_payload(date: RaceDate) -> DayPayload {
    let race_id = i64::from(date.num_days_from_ce());
    let index = json!([{
        "meeting_summary": {
            "course": { "name": "Chester", "country": { "short_name": "ENG" } }
        },
        "races": [{
            "race_summary_reference": { "id": race_id },
            "name": "Chester Handicap",
            "course_name": "Chester",
            "date": date.format(DATE_FORMAT).to_string(),
            "time": "14:15",
            "has_handicap": true
        }]
    }]);
    let detail = json!({
        "rides": [
            { "cloth_number": "1", "horse": { "name": "Zoffee", "age": 5 }, "weight": "10-0" },
            { "cloth_number": "2", "horse": { "name": "Island Brave", "age": 9 }, "weight": "9-4" }
        ]
    });
    DayPayload {
        source_id: SPORTING_LIFE_SOURCE_ID.to_string(),
        race_date: date,
        fetched_at: Utc::now(),
        index: index.to_string(),
        races: vec![RacePayload {
            race_id,
            detail: detail.to_string(),
            betting: None,
        }],
    }
}

#[derive(Debug, Default)]
struct Script {
    transient_remaining: HashMap<RaceDate, usize>,
    permanent: HashSet<RaceDate>,
    unparseable: HashSet<RaceDate>,
    calls: Vec<(RaceDate, Instant)>,
    cancel_on_first_call: Option<CancellationToken>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedFetcher {
    script: Arc<Mutex<Script>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_transient(&self, date: RaceDate, times: usize) {
        self.script.lock().unwrap().transient_remaining.insert(date, times);
    }

    pub fn fail_permanent(&self, date: RaceDate) {
        self.script.lock().unwrap().permanent.insert(date);
    }

    pub fn serve_unparseable(&self, date: RaceDate) {
        self.script.lock().unwrap().unparseable.insert(date);
    }

    pub fn cancel_on_first_call(&self, token: CancellationToken) {
        self.script.lock().unwrap().cancel_on_first_call = Some(token);
    }

    pub fn calls(&self) -> Vec<(RaceDate, Instant)> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn called_dates(&self) -> Vec<RaceDate> {
        self.calls().into_iter().map(|(date, _)| date).collect()
    }

    pub fn calls_for(&self, date: RaceDate) -> usize {
        self.calls().iter().filter(|(d, _)| *d == date).count()
    }
}

#[async_trait]
impl DayFetcher for ScriptedFetcher {
    fn source_id(&self) -> &'static str {
        SPORTING_LIFE_SOURCE_ID
    }

    async fn fetch_day(&self, date: RaceDate) -> Result<DayPayload, FetchError> {
        let mut script = self.script.lock().unwrap();
        script.calls.push((date, Instant::now()));
        if let Some(token) = script.cancel_on_first_call.take() {
            token.cancel();
        }
        let url = format!("https://example.test/racecards/{}", date.format(DATE_FORMAT));

        if let Some(remaining) = script.transient_remaining.get_mut(&date) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FetchError::transient(url, "connection reset"));
            }
        }
        if script.permanent.contains(&date) {
            return Err(FetchError::permanent(url, "http status 404"));
        }
        if script.unparseable.contains(&date) {
            return Ok(DayPayload {
                index: "<html>down for maintenance</html>".to_string(),
                ..day_payload(date)
            });
        }
        Ok(day_payload(date))
    }
}
