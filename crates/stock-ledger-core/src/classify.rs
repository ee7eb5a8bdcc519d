use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::record::{StockRecord, StockStatus};

/// Comment markers meaning an `Incorrect` item was visually checked and cleared.
pub const VISUAL_CHECK_MARKERS: [&str; 4] = ["VOK", "V.OK", "VIS", "VISUAL"];

/// Stock ids carrying this suffix are returned stock.
pub const RETURNED_SUFFIX: &str = "-1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Category {
    Incorrect,
    Missing,
    Faulty,
    #[serde(rename = "Not Inspected")]
    NotInspected,
    Returned,
}

impl Category {
    pub const ALL: [Self; 5] =
        [Self::Incorrect, Self::Missing, Self::Faulty, Self::NotInspected, Self::Returned];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incorrect => "Incorrect",
            Self::Missing => "Missing",
            Self::Faulty => "Faulty",
            Self::NotInspected => "Not Inspected",
            Self::Returned => "Returned",
        }
    }

    /// Accepts display labels (`Not Inspected`) and their snake/kebab forms.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "incorrect" => Some(Self::Incorrect),
            "missing" => Some(Self::Missing),
            "faulty" => Some(Self::Faulty),
            "not inspected" => Some(Self::NotInspected),
            "returned" => Some(Self::Returned),
            _ => None,
        }
    }

    /// Membership test for one record. Categories overlap: `Returned` is keyed on
    /// the stock id, the others on status.
    #[must_use]
    pub fn contains(self, record: &StockRecord) -> bool {
        match self {
            Self::Incorrect => {
                record.status == StockStatus::Incorrect && !is_visually_cleared(record)
            }
            Self::Missing => record.status == StockStatus::Missing,
            Self::Faulty => record.status == StockStatus::Faulty,
            Self::NotInspected => record.status == StockStatus::NotInspected,
            Self::Returned => is_returned(record),
        }
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[must_use]
pub fn is_visually_cleared(record: &StockRecord) -> bool {
    let comments = record.comments.to_uppercase();
    VISUAL_CHECK_MARKERS.iter().any(|marker| comments.contains(marker))
}

#[must_use]
pub fn is_returned(record: &StockRecord) -> bool {
    record.stock_id.ends_with(RETURNED_SUFFIX)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CategorySummary {
    pub category: Category,
    pub count: usize,
    pub total_cost: f64,
    pub items: Vec<StockRecord>,
}

/// One snapshot partitioned into (possibly overlapping) categories.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    buckets: BTreeMap<Category, Vec<StockRecord>>,
}

impl Classification {
    /// Partition `records` into categories, preserving snapshot order inside each.
    #[must_use]
    pub fn classify(records: &[StockRecord]) -> Self {
        let mut buckets: BTreeMap<Category, Vec<StockRecord>> =
            Category::ALL.iter().map(|category| (*category, Vec::new())).collect();

        for record in records {
            for category in Category::ALL {
                if category.contains(record) {
                    buckets.entry(category).or_default().push(record.clone());
                }
            }
        }

        Self { buckets }
    }

    #[must_use]
    pub fn records(&self, category: Category) -> &[StockRecord] {
        self.buckets.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    #[must_use]
    pub fn count(&self, category: Category) -> usize {
        self.records(category).len()
    }

    #[must_use]
    pub fn total_cost(&self, category: Category) -> f64 {
        self.records(category).iter().map(|record| record.stock_cost).sum()
    }

    /// Summaries for every category in display order.
    #[must_use]
    pub fn summaries(&self) -> Vec<CategorySummary> {
        Category::ALL
            .iter()
            .map(|category| CategorySummary {
                category: *category,
                count: self.count(*category),
                total_cost: self.total_cost(*category),
                items: self.records(*category).to_vec(),
            })
            .collect()
    }
}
