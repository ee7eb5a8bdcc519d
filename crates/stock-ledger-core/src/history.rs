use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::record::StockRecord;
use crate::KernelError;

const MILLIS_PER_DAY: u128 = 86_400_000;

/// A recorded change of status, carrying the days spent in the prior status.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatusTransition {
    #[serde(rename = "status")]
    pub prior_status: String,
    #[serde(rename = "duration")]
    pub duration_days: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatusHistoryEntry {
    #[serde(rename = "status")]
    pub current_status: String,
    #[serde(rename = "start_date", alias = "startDate", with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(rename = "history", default)]
    pub transitions: Vec<StatusTransition>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MergeSummary {
    pub created: usize,
    pub transitioned: usize,
    pub unchanged: usize,
}

impl MergeSummary {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.created > 0 || self.transitioned > 0
    }
}

/// Persistent stock id → status history map. Entries are only ever created or
/// appended to; absence from a snapshot never prunes an entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct HistoryLog {
    entries: BTreeMap<String, StatusHistoryEntry>,
}

impl HistoryLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, stock_id: &str) -> Option<&StatusHistoryEntry> {
        self.entries.get(stock_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StatusHistoryEntry)> {
        self.entries.iter()
    }

    /// Merge one snapshot, returning the next log and leaving `self` untouched.
    ///
    /// Unseen ids start a fresh entry at `now`; a changed status appends a transition
    /// for the prior status and restarts the clock; an unchanged status is a no-op.
    #[must_use]
    pub fn merge_snapshot(
        &self,
        records: &[StockRecord],
        now: OffsetDateTime,
    ) -> (Self, MergeSummary) {
        let mut next = self.clone();
        let mut summary = MergeSummary::default();

        for record in records {
            let status = record.status.as_str();
            let Some(entry) = next.entries.get_mut(&record.stock_id) else {
                next.entries.insert(
                    record.stock_id.clone(),
                    StatusHistoryEntry {
                        current_status: status.to_string(),
                        started_at: now,
                        transitions: Vec::new(),
                    },
                );
                summary.created += 1;
                continue;
            };

            if entry.current_status == status {
                summary.unchanged += 1;
                continue;
            }

            entry.transitions.push(StatusTransition {
                prior_status: std::mem::replace(&mut entry.current_status, status.to_string()),
                duration_days: ceiling_days(entry.started_at, now),
            });
            // Never move the clock backwards on a skewed `now`.
            entry.started_at = entry.started_at.max(now);
            summary.transitioned += 1;
        }

        (next, summary)
    }

    /// Days spent in the current status as of `now`. Computed on every call.
    #[must_use]
    pub fn current_duration_days(&self, stock_id: &str, now: OffsetDateTime) -> Option<u64> {
        self.entries.get(stock_id).map(|entry| ceiling_days(entry.started_at, now))
    }

    /// Decode the persisted blob form.
    ///
    /// # Errors
    /// Returns [`KernelError::Codec`] when the blob does not match the history shape.
    pub fn from_blob(blob: Value) -> Result<Self, KernelError> {
        serde_json::from_value(blob)
            .map_err(|err| KernelError::Codec(format!("invalid status history blob: {err}")))
    }

    /// Encode the whole log for persistence.
    ///
    /// # Errors
    /// Returns [`KernelError::Codec`] when serialization fails.
    pub fn to_blob(&self) -> Result<Value, KernelError> {
        serde_json::to_value(self)
            .map_err(|err| KernelError::Codec(format!("failed to encode status history: {err}")))
    }
}

/// Ceiling of the absolute elapsed time between two instants, in whole days.
#[must_use]
pub fn ceiling_days(from: OffsetDateTime, to: OffsetDateTime) -> u64 {
    let millis = (to - from).whole_milliseconds().unsigned_abs();
    u64::try_from(millis.div_ceil(MILLIS_PER_DAY)).unwrap_or(u64::MAX)
}

/// Render a day count as `"5d"`, `"2w"` or `"1w 3d"`.
#[must_use]
pub fn format_duration(days: u64) -> String {
    if days < 7 {
        return format!("{days}d");
    }
    let weeks = days / 7;
    match days % 7 {
        0 => format!("{weeks}w"),
        remaining => format!("{weeks}w {remaining}d"),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;
    use time::format_description::well_known::Rfc3339;
    use time::Duration;

    use super::*;
    use crate::record::StockStatus;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn mk_record(stock_id: &str, status: &str) -> StockRecord {
        StockRecord {
            stock_id: stock_id.to_string(),
            product: String::new(),
            description: String::new(),
            age: String::new(),
            qty: String::new(),
            stock_cost: 0.0,
            status: StockStatus::parse(status),
            buyer: String::new(),
            comments: String::new(),
            supplier: String::new(),
        }
    }

    fn entry<'a>(log: &'a HistoryLog, stock_id: &str) -> &'a StatusHistoryEntry {
        match log.get(stock_id) {
            Some(entry) => entry,
            None => panic!("history entry for {stock_id} should exist"),
        }
    }

    #[test]
    fn format_duration_uses_weeks_and_days() {
        assert_eq!(format_duration(0), "0d");
        assert_eq!(format_duration(6), "6d");
        assert_eq!(format_duration(7), "1w");
        assert_eq!(format_duration(9), "1w 2d");
        assert_eq!(format_duration(14), "2w");
    }

    #[test]
    fn ceiling_days_rounds_up_partial_days_in_either_direction() {
        let start = fixture_time();
        assert_eq!(ceiling_days(start, start), 0);
        assert_eq!(ceiling_days(start, start + Duration::seconds(1)), 1);
        assert_eq!(ceiling_days(start, start + Duration::days(1)), 1);
        assert_eq!(ceiling_days(start, start + Duration::hours(25)), 2);
        assert_eq!(ceiling_days(start + Duration::hours(25), start), 2);
    }

    #[test]
    fn first_sighting_creates_entry_without_transitions() {
        let (log, summary) =
            HistoryLog::new().merge_snapshot(&[mk_record("A", "Missing")], fixture_time());

        assert_eq!(summary, MergeSummary { created: 1, transitioned: 0, unchanged: 0 });
        let created = entry(&log, "A");
        assert_eq!(created.current_status, "Missing");
        assert_eq!(created.started_at, fixture_time());
        assert!(created.transitions.is_empty());
    }

    #[test]
    fn status_change_appends_transition_with_ceiling_duration() {
        let t0 = fixture_time();
        let t1 = t0 + Duration::days(9) + Duration::hours(3);
        let (log, _) = HistoryLog::new().merge_snapshot(&[mk_record("A", "Missing")], t0);
        let (log, summary) = log.merge_snapshot(&[mk_record("A", "Faulty")], t1);

        assert_eq!(summary.transitioned, 1);
        let updated = entry(&log, "A");
        assert_eq!(updated.current_status, "Faulty");
        assert_eq!(updated.started_at, t1);
        assert_eq!(
            updated.transitions,
            vec![StatusTransition { prior_status: "Missing".to_string(), duration_days: 10 }]
        );
        assert_eq!(log.current_duration_days("A", t1 + Duration::days(3)), Some(3));
    }

    #[test]
    fn remerging_unchanged_snapshot_is_idempotent() {
        let records = vec![mk_record("A", "Missing"), mk_record("B", "Faulty")];
        let t0 = fixture_time();
        let (first, _) = HistoryLog::new().merge_snapshot(&records, t0);
        let (second, summary) = first.merge_snapshot(&records, t0 + Duration::days(4));

        assert_eq!(summary, MergeSummary { created: 0, transitioned: 0, unchanged: 2 });
        assert!(!summary.changed());
        assert_eq!(first, second);
    }

    #[test]
    fn absent_ids_are_left_untouched() {
        let t0 = fixture_time();
        let (log, _) = HistoryLog::new()
            .merge_snapshot(&[mk_record("A", "Missing"), mk_record("B", "Faulty")], t0);
        let (log, _) = log.merge_snapshot(&[mk_record("B", "Missing")], t0 + Duration::days(2));

        let untouched = entry(&log, "A");
        assert_eq!(untouched.current_status, "Missing");
        assert_eq!(untouched.started_at, t0);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn merge_leaves_the_source_log_unchanged() {
        let t0 = fixture_time();
        let (base, _) = HistoryLog::new().merge_snapshot(&[mk_record("A", "Missing")], t0);
        let before = base.clone();
        let _ = base.merge_snapshot(&[mk_record("A", "Faulty")], t0 + Duration::days(1));
        assert_eq!(base, before);
    }

    #[test]
    fn skewed_clock_does_not_move_start_backwards() {
        let t0 = fixture_time();
        let (log, _) = HistoryLog::new().merge_snapshot(&[mk_record("A", "Missing")], t0);
        let (log, _) = log.merge_snapshot(&[mk_record("A", "Faulty")], t0 - Duration::hours(30));

        let updated = entry(&log, "A");
        assert_eq!(updated.started_at, t0);
        assert_eq!(updated.transitions[0].duration_days, 2);
    }

    #[test]
    fn persisted_blob_round_trips_history_shape() {
        let blob = json!({
            "A-1": {
                "status": "Faulty",
                "start_date": "2024-03-01T09:30:00.000Z",
                "history": [ { "status": "Missing", "duration": 3 } ]
            },
            "B": { "status": "Missing", "start_date": "2024-03-04T10:00:00Z" }
        });

        let log = match HistoryLog::from_blob(blob) {
            Ok(log) => log,
            Err(err) => panic!("blob should decode: {err}"),
        };
        assert_eq!(entry(&log, "A-1").transitions[0].prior_status, "Missing");
        assert!(entry(&log, "B").transitions.is_empty());

        let encoded = match log.to_blob() {
            Ok(value) => value,
            Err(err) => panic!("log should encode: {err}"),
        };
        assert_eq!(encoded["A-1"]["history"][0]["duration"], json!(3));
        assert_eq!(encoded["B"]["status"], json!("Missing"));
    }

    #[test]
    fn camel_case_start_date_blobs_decode() {
        let blob = json!({
            "A-1": { "status": "Faulty", "startDate": "2024-03-01T09:30:00Z", "history": [] }
        });

        let log = match HistoryLog::from_blob(blob) {
            Ok(log) => log,
            Err(err) => panic!("blob should decode: {err}"),
        };
        let expected = match OffsetDateTime::parse("2024-03-01T09:30:00Z", &Rfc3339) {
            Ok(at) => at,
            Err(err) => panic!("fixture time should parse: {err}"),
        };
        assert_eq!(entry(&log, "A-1").started_at, expected);

        let encoded = match log.to_blob() {
            Ok(value) => value,
            Err(err) => panic!("log should encode: {err}"),
        };
        assert!(encoded["A-1"]["start_date"].is_string());
        assert!(encoded["A-1"].get("startDate").is_none());
    }

    #[test]
    fn malformed_blob_is_a_codec_error() {
        let result = HistoryLog::from_blob(json!({ "A": { "status": 4 } }));
        assert!(matches!(result, Err(KernelError::Codec(_))));
    }

    proptest! {
        #[test]
        fn property_second_merge_of_same_statuses_adds_no_transitions(
            statuses in proptest::collection::vec(0_u8..5, 1..40),
            gap_hours in 0_i64..2_000,
        ) {
            let labels = ["Incorrect", "Missing", "Faulty", "Not Inspected", "Scrapped"];
            let records = statuses
                .iter()
                .enumerate()
                .map(|(index, status)| mk_record(&format!("S{index}"), labels[usize::from(*status)]))
                .collect::<Vec<_>>();
            let t0 = fixture_time();

            let (first, _) = HistoryLog::new().merge_snapshot(&records, t0);
            let (second, summary) = first.merge_snapshot(&records, t0 + Duration::hours(gap_hours));

            prop_assert_eq!(summary.transitioned, 0);
            prop_assert_eq!(summary.created, 0);
            prop_assert_eq!(first, second);
        }
    }
}
