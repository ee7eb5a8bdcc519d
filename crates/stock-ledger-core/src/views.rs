use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::actions::{ActionAssignment, ActionBook};
use crate::history::{format_duration, HistoryLog, StatusTransition};
use crate::record::StockRecord;
use crate::KernelError;

pub const ALL_BUYERS_KEY: &str = "all";
pub const OTHER_BUYERS_KEY: &str = "Other";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CanonicalBuyer {
    pub key: String,
    pub full_name: String,
}

impl CanonicalBuyer {
    fn new(key: &str, full_name: &str) -> Self {
        Self { key: key.to_string(), full_name: full_name.to_string() }
    }
}

/// The fixed set of recognised buyers, in display order.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(try_from = "Vec<CanonicalBuyer>", into = "Vec<CanonicalBuyer>")]
pub struct BuyerDirectory {
    buyers: Vec<CanonicalBuyer>,
}

impl Default for BuyerDirectory {
    fn default() -> Self {
        Self {
            buyers: vec![
                CanonicalBuyer::new("Steve", "Steve Vallance"),
                CanonicalBuyer::new("Chris", "Chris Hall"),
                CanonicalBuyer::new("Pat", "Patrick Boydell"),
                CanonicalBuyer::new("Felix", "Felix Barber"),
            ],
        }
    }
}

impl TryFrom<Vec<CanonicalBuyer>> for BuyerDirectory {
    type Error = KernelError;

    fn try_from(value: Vec<CanonicalBuyer>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BuyerDirectory> for Vec<CanonicalBuyer> {
    fn from(value: BuyerDirectory) -> Self {
        value.buyers
    }
}

impl BuyerDirectory {
    /// Build a directory from configured buyers.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for empty or duplicate keys/names, or keys
    /// that collide with the reserved `all` and `Other` filters.
    pub fn new(buyers: Vec<CanonicalBuyer>) -> Result<Self, KernelError> {
        let mut keys = BTreeSet::new();
        let mut names = BTreeSet::new();
        for buyer in &buyers {
            let key = buyer.key.trim();
            let full_name = buyer.full_name.trim();
            if key.is_empty() || full_name.is_empty() {
                return Err(KernelError::Validation(
                    "buyer key and full_name MUST be non-empty".to_string(),
                ));
            }
            if key == ALL_BUYERS_KEY || key == OTHER_BUYERS_KEY {
                return Err(KernelError::Validation(format!("buyer key `{key}` is reserved")));
            }
            if !keys.insert(key.to_string()) || !names.insert(full_name.to_string()) {
                return Err(KernelError::Validation(format!(
                    "buyer `{key}` / `{full_name}` is configured more than once"
                )));
            }
        }

        let buyers = buyers
            .into_iter()
            .map(|buyer| CanonicalBuyer::new(buyer.key.trim(), buyer.full_name.trim()))
            .collect();
        Ok(Self { buyers })
    }

    #[must_use]
    pub fn buyers(&self) -> &[CanonicalBuyer] {
        &self.buyers
    }

    #[must_use]
    pub fn is_canonical_name(&self, name: &str) -> bool {
        self.buyers.iter().any(|buyer| buyer.full_name == name)
    }

    /// Resolve a filter key: `all`, a canonical buyer key, or `Other`.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for any other key.
    pub fn parse_filter(&self, value: &str) -> Result<BuyerFilter, KernelError> {
        match value {
            ALL_BUYERS_KEY => Ok(BuyerFilter::All),
            OTHER_BUYERS_KEY => Ok(BuyerFilter::Other),
            key => self
                .buyers
                .iter()
                .find(|buyer| buyer.key == key)
                .map(|buyer| BuyerFilter::Canonical(buyer.clone()))
                .ok_or_else(|| KernelError::Validation(format!("unknown buyer filter `{key}`"))),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BuyerFilter {
    All,
    Canonical(CanonicalBuyer),
    Other,
}

impl BuyerFilter {
    fn matches(&self, record: &StockRecord, directory: &BuyerDirectory) -> bool {
        let buyer = record.buyer.trim();
        match self {
            Self::All => true,
            Self::Canonical(canonical) => buyer == canonical.full_name,
            Self::Other => !buyer.is_empty() && !directory.is_canonical_name(buyer),
        }
    }
}

/// Filter one category by buyer and order by descending stock cost.
///
/// The sort is stable: equal costs keep their snapshot order.
#[must_use]
pub fn filter_and_sort<'a>(
    records: &'a [StockRecord],
    filter: &BuyerFilter,
    directory: &BuyerDirectory,
) -> Vec<&'a StockRecord> {
    let mut filtered =
        records.iter().filter(|record| filter.matches(record, directory)).collect::<Vec<_>>();
    filtered.sort_by(|lhs, rhs| {
        rhs.stock_cost.partial_cmp(&lhs.stock_cost).unwrap_or(Ordering::Equal)
    });
    filtered
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuyerTotal {
    pub key: String,
    pub full_name: String,
    pub total: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BuyerTotals {
    pub buyers: Vec<BuyerTotal>,
    pub other: f64,
    pub all: f64,
}

impl BuyerTotals {
    /// Look up a total by filter key (`all`, `Other`, or a canonical key).
    #[must_use]
    pub fn get(&self, key: &str) -> Option<f64> {
        match key {
            ALL_BUYERS_KEY => Some(self.all),
            OTHER_BUYERS_KEY => Some(self.other),
            key => self.buyers.iter().find(|total| total.key == key).map(|total| total.total),
        }
    }
}

/// Sum stock cost per canonical buyer, for unmatched (`Other`) buyers, and overall.
///
/// Records with an empty buyer count toward `all` only.
#[must_use]
pub fn buyer_totals(records: &[StockRecord], directory: &BuyerDirectory) -> BuyerTotals {
    let mut totals = BuyerTotals {
        buyers: directory
            .buyers()
            .iter()
            .map(|buyer| BuyerTotal {
                key: buyer.key.clone(),
                full_name: buyer.full_name.clone(),
                total: 0.0,
            })
            .collect(),
        other: 0.0,
        all: 0.0,
    };

    for record in records {
        totals.all += record.stock_cost;
        let buyer = record.buyer.trim();
        if buyer.is_empty() {
            continue;
        }
        match totals.buyers.iter_mut().find(|total| total.full_name == buyer) {
            Some(total) => total.total += record.stock_cost,
            None => totals.other += record.stock_cost,
        }
    }

    totals
}

/// One rendered row of a category table.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ViewRow {
    #[serde(flatten)]
    pub record: StockRecord,
    pub action: ActionAssignment,
    pub status_days: Option<u64>,
    pub status_duration: Option<String>,
    pub transitions: Vec<StatusTransition>,
}

/// Compose filtered, sorted rows with their action and status durations as of `now`.
#[must_use]
pub fn view_rows(
    records: &[StockRecord],
    filter: &BuyerFilter,
    directory: &BuyerDirectory,
    actions: &ActionBook,
    history: &HistoryLog,
    now: OffsetDateTime,
) -> Vec<ViewRow> {
    filter_and_sort(records, filter, directory)
        .into_iter()
        .map(|record| {
            let status_days = history.current_duration_days(&record.stock_id, now);
            ViewRow {
                record: record.clone(),
                action: actions.get(&record.stock_id),
                status_days,
                status_duration: status_days.map(format_duration),
                transitions: history
                    .get(&record.stock_id)
                    .map(|entry| entry.transitions.clone())
                    .unwrap_or_default(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::Duration;

    use super::*;
    use crate::actions::ActionKind;
    use crate::record::StockStatus;

    fn mk_record(stock_id: &str, buyer: &str, cost: f64) -> StockRecord {
        StockRecord {
            stock_id: stock_id.to_string(),
            product: String::new(),
            description: String::new(),
            age: String::new(),
            qty: String::new(),
            stock_cost: cost,
            status: StockStatus::Missing,
            buyer: buyer.to_string(),
            comments: String::new(),
            supplier: String::new(),
        }
    }

    fn ids(records: &[&StockRecord]) -> Vec<String> {
        records.iter().map(|record| record.stock_id.clone()).collect()
    }

    fn filter(directory: &BuyerDirectory, key: &str) -> BuyerFilter {
        match directory.parse_filter(key) {
            Ok(filter) => filter,
            Err(err) => panic!("filter {key} should parse: {err}"),
        }
    }

    #[test]
    fn equal_costs_keep_snapshot_order() {
        let directory = BuyerDirectory::default();
        let records = vec![
            mk_record("A", "Chris Hall", 10.0),
            mk_record("B", "Chris Hall", 50.0),
            mk_record("C", "Chris Hall", 10.0),
            mk_record("D", "Chris Hall", 10.0),
        ];

        let sorted = filter_and_sort(&records, &BuyerFilter::All, &directory);
        assert_eq!(ids(&sorted), vec!["B", "A", "C", "D"]);
    }

    #[test]
    fn canonical_filter_matches_full_name_after_trim() {
        let directory = BuyerDirectory::default();
        let records = vec![
            mk_record("A", " Steve Vallance ", 1.0),
            mk_record("B", "Steve", 2.0),
            mk_record("C", "Chris Hall", 3.0),
        ];

        let filtered = filter_and_sort(&records, &filter(&directory, "Steve"), &directory);
        assert_eq!(ids(&filtered), vec!["A"]);
    }

    #[test]
    fn other_filter_excludes_empty_and_canonical_buyers() {
        let directory = BuyerDirectory::default();
        let records = vec![
            mk_record("A", "", 1.0),
            mk_record("B", "Jo Bloggs", 2.0),
            mk_record("C", "Felix Barber", 3.0),
            mk_record("D", "   ", 4.0),
        ];

        let filtered = filter_and_sort(&records, &filter(&directory, "Other"), &directory);
        assert_eq!(ids(&filtered), vec!["B"]);
    }

    #[test]
    fn unknown_filter_key_is_rejected() {
        let result = BuyerDirectory::default().parse_filter("Bob");
        assert!(matches!(result, Err(KernelError::Validation(_))));
    }

    #[test]
    fn totals_exclude_empty_buyers_from_partition() {
        let directory = BuyerDirectory::default();
        let records = vec![
            mk_record("A", "Chris Hall", 10.0),
            mk_record("B", "Jo Bloggs", 5.0),
            mk_record("C", "", 2.5),
            mk_record("D", "Patrick Boydell", 1.0),
        ];

        let totals = buyer_totals(&records, &directory);
        assert_eq!(totals.get("Chris"), Some(10.0));
        assert_eq!(totals.get("Pat"), Some(1.0));
        assert_eq!(totals.get("Steve"), Some(0.0));
        assert_eq!(totals.get("Other"), Some(5.0));
        assert_eq!(totals.get("all"), Some(18.5));
        assert_eq!(totals.get("Bob"), None);
    }

    #[test]
    fn directory_rejects_reserved_and_duplicate_keys() {
        let reserved = BuyerDirectory::new(vec![CanonicalBuyer::new("all", "Everyone")]);
        assert!(matches!(reserved, Err(KernelError::Validation(_))));

        let duplicate = BuyerDirectory::new(vec![
            CanonicalBuyer::new("Jo", "Jo Bloggs"),
            CanonicalBuyer::new("Jo", "Joanne Bloggs"),
        ]);
        assert!(matches!(duplicate, Err(KernelError::Validation(_))));
    }

    #[test]
    fn view_rows_carry_actions_and_durations() {
        let directory = BuyerDirectory::default();
        let records = vec![mk_record("A", "Chris Hall", 1.0), mk_record("B", "Chris Hall", 9.0)];
        let t0 = OffsetDateTime::UNIX_EPOCH + Duration::days(20_000);
        let (history, _) = HistoryLog::new().merge_snapshot(&records, t0);
        let mut actions = ActionBook::new();
        actions.set_action("A", ActionKind::Other);
        actions.set_action_text("A", "relabel");

        let rows = view_rows(
            &records,
            &BuyerFilter::All,
            &directory,
            &actions,
            &history,
            t0 + Duration::days(9),
        );

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].record.stock_id, "B");
        assert_eq!(rows[0].action.kind, ActionKind::Unset);
        assert_eq!(rows[1].action.text.as_deref(), Some("relabel"));
        assert_eq!(rows[1].status_days, Some(9));
        assert_eq!(rows[1].status_duration.as_deref(), Some("1w 2d"));
    }

    proptest! {
        #[test]
        fn property_buyer_totals_partition_all(
            rows in proptest::collection::vec((0_usize..6, 0_u32..100_000), 0..60),
        ) {
            let names = ["Steve Vallance", "Chris Hall", "Patrick Boydell", "Felix Barber", "Jo Bloggs", "Sam Stone"];
            let directory = BuyerDirectory::default();
            let records = rows
                .iter()
                .enumerate()
                .map(|(index, (buyer, pence))| {
                    mk_record(&format!("S{index}"), names[*buyer], f64::from(*pence) / 100.0)
                })
                .collect::<Vec<_>>();

            let totals = buyer_totals(&records, &directory);
            let canonical = totals.buyers.iter().map(|total| total.total).sum::<f64>();
            prop_assert!((canonical + totals.other - totals.all).abs() < 1e-6);
        }

        #[test]
        fn property_sort_is_stable_and_descending(
            costs in proptest::collection::vec(0_u8..5, 0..40),
        ) {
            let directory = BuyerDirectory::default();
            let records = costs
                .iter()
                .enumerate()
                .map(|(index, cost)| mk_record(&format!("{index:03}"), "Chris Hall", f64::from(*cost)))
                .collect::<Vec<_>>();

            let sorted = filter_and_sort(&records, &BuyerFilter::All, &directory);
            for pair in sorted.windows(2) {
                prop_assert!(pair[0].stock_cost >= pair[1].stock_cost);
                if (pair[0].stock_cost - pair[1].stock_cost).abs() < f64::EPSILON {
                    prop_assert!(pair[0].stock_id < pair[1].stock_id);
                }
            }
        }
    }
}
