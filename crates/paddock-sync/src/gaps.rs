//! Missing-date detection over a bounded window.

use std::collections::BTreeMap;

use paddock_core::{dates_inclusive, RaceDate};

use crate::store::{RaceStore, StoreError};

/// Dates in `[from, to]` with no races, ascending.
pub fn gaps_from_counts(
    from: RaceDate,
    to: RaceDate,
    counts: &BTreeMap<RaceDate, i64>,
) -> Vec<RaceDate> {
    dates_inclusive(from, to)
        .filter(|date| counts.get(date).copied().unwrap_or(0) == 0)
        .collect()
}

/// Dates in `[from, min(to, today)]` holding no races. One aggregate query per call.
pub async fn find_gaps(
    store: &dyn RaceStore,
    from: RaceDate,
    to: RaceDate,
    today: RaceDate,
) -> Result<Vec<RaceDate>, StoreError> {
    let to = to.min(today);
    if from > to {
        return Ok(Vec::new());
    }
    let counts = store.race_counts(from, to).await?;
    Ok(gaps_from_counts(from, to, &counts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRaceStore;
    use paddock_core::{parse_race_date, Race, Region, Runner};

    fn d(s: &str) -> RaceDate {
        parse_race_date(s).unwrap()
    }

    #[test]
    fn zero_counts_are_gaps_and_positive_counts_are_not() {
        let mut counts = BTreeMap::new();
        counts.insert(d("2024-05-01"), 6);
        counts.insert(d("2024-05-02"), 0);
        counts.insert(d("2024-05-04"), 1);
        assert_eq!(
            gaps_from_counts(d("2024-05-01"), d("2024-05-05"), &counts),
            vec![d("2024-05-02"), d("2024-05-03"), d("2024-05-05")]
        );
    }

    #[tokio::test]
    async fn window_is_clamped_to_today() {
        let store = MemoryRaceStore::new();
        let race = Race {
            race_date: d("2024-05-02"),
            region: Region::Ire,
            course: "Punchestown".to_string(),
            off_time: chrono::NaiveTime::from_hms_opt(16, 10, 0).unwrap(),
            race_name: "Champion Novice Hurdle".to_string(),
            race_type: "Hurdle".to_string(),
            race_class: None,
            distance: None,
            going: None,
            surface: None,
            age_band: None,
            source_race_id: Some(800201),
            runners: vec![Runner::new(1, "Slade Steel")],
        };
        store
            .upsert_race_date(d("2024-05-02"), &[race], d("2024-05-04"))
            .await
            .unwrap();

        let gaps = find_gaps(&store, d("2024-05-01"), d("2024-05-30"), d("2024-05-04"))
            .await
            .unwrap();
        assert_eq!(gaps, vec![d("2024-05-01"), d("2024-05-03"), d("2024-05-04")]);

        let empty = find_gaps(&store, d("2024-05-10"), d("2024-05-30"), d("2024-05-04"))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }
}
