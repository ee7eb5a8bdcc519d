use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::KernelError;

/// One flat snapshot row as yielded by a snapshot source: column name → cell.
pub type RawRow = BTreeMap<String, Value>;

/// Column names recognised in a raw snapshot row.
pub mod columns {
    pub const STOCK_ID: &str = "Stock Id";
    pub const PRODUCT: &str = "Product";
    pub const DESCRIPTION: &str = "Description";
    pub const AGE: &str = "Age";
    pub const QTY: &str = "Qty";
    pub const STOCK_COST: &str = "Stock Cost";
    pub const STATUS: &str = "Status";
    pub const BUYER: &str = "Buyer";
    pub const COMMENTS: &str = "Comments";
    pub const SUPPLIER: &str = "Supplier";
}

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StockStatus {
    Incorrect,
    Missing,
    Faulty,
    NotInspected,
    Other(String),
}

impl StockStatus {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Incorrect => "Incorrect",
            Self::Missing => "Missing",
            Self::Faulty => "Faulty",
            Self::NotInspected => "Not Inspected",
            Self::Other(label) => label.as_str(),
        }
    }

    /// Status labels are matched exactly; anything unrecognised is kept verbatim.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "Incorrect" => Self::Incorrect,
            "Missing" => Self::Missing,
            "Faulty" => Self::Faulty,
            "Not Inspected" => Self::NotInspected,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for StockStatus {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<StockStatus> for String {
    fn from(value: StockStatus) -> Self {
        value.as_str().to_string()
    }
}

impl Display for StockStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StockRecord {
    pub stock_id: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub age: String,
    #[serde(default)]
    pub qty: String,
    #[serde(default)]
    pub stock_cost: f64,
    pub status: StockStatus,
    #[serde(default)]
    pub buyer: String,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub supplier: String,
}

impl StockRecord {
    /// Normalize one raw snapshot row.
    ///
    /// The buyer is trimmed and the stock cost is coerced to a number, defaulting to `0`.
    ///
    /// # Errors
    /// Returns [`KernelError::MalformedRecord`] when the row carries no usable `Stock Id`.
    pub fn from_row(row: &RawRow) -> Result<Self, KernelError> {
        let stock_id = row
            .get(columns::STOCK_ID)
            .map(|cell| cell_text(cell).trim().to_string())
            .unwrap_or_default();
        if stock_id.is_empty() {
            return Err(KernelError::MalformedRecord(format!(
                "row has no `{}` value",
                columns::STOCK_ID
            )));
        }

        Ok(Self {
            stock_id,
            product: text_field(row, columns::PRODUCT),
            description: text_field(row, columns::DESCRIPTION),
            age: text_field(row, columns::AGE),
            qty: text_field(row, columns::QTY),
            stock_cost: coerce_cost(row.get(columns::STOCK_COST)),
            status: StockStatus::parse(&text_field(row, columns::STATUS)),
            buyer: text_field(row, columns::BUYER).trim().to_string(),
            comments: text_field(row, columns::COMMENTS),
            supplier: text_field(row, columns::SUPPLIER),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedSnapshot {
    pub records: Vec<StockRecord>,
    pub skipped_rows: usize,
}

/// Normalize every row of a snapshot, dropping rows without a stock id.
#[must_use]
pub fn normalize_rows(rows: &[RawRow]) -> NormalizedSnapshot {
    let mut snapshot = NormalizedSnapshot::default();
    for row in rows {
        match StockRecord::from_row(row) {
            Ok(record) => snapshot.records.push(record),
            Err(_) => snapshot.skipped_rows += 1,
        }
    }
    snapshot
}

fn text_field(row: &RawRow, column: &str) -> String {
    row.get(column).map(cell_text).unwrap_or_default()
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                return int.to_string();
            }
            match number.as_f64() {
                // Spreadsheet ids arrive as floats; drop the `.0`.
                Some(float) if float.is_finite() && float.fract() == 0.0 => format!("{float:.0}"),
                Some(float) => float.to_string(),
                None => number.to_string(),
            }
        }
        other => other.to_string(),
    }
}

fn coerce_cost(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                Some(0.0)
            } else {
                trimmed.parse::<f64>().ok()
            }
        }
        Some(Value::Bool(flag)) => Some(if *flag { 1.0 } else { 0.0 }),
        _ => None,
    };
    parsed.filter(|cost| cost.is_finite()).unwrap_or(0.0)
}
