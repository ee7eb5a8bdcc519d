use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::KernelError;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum ActionKind {
    #[default]
    Unset,
    WaitingOnCredit,
    ReceivedCredit,
    RequestedCredit,
    Writedown,
    MoveCost,
    Scrap,
    Other,
}

impl ActionKind {
    pub const CONCRETE: [Self; 7] = [
        Self::WaitingOnCredit,
        Self::ReceivedCredit,
        Self::RequestedCredit,
        Self::Writedown,
        Self::MoveCost,
        Self::Scrap,
        Self::Other,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "Select action...",
            Self::WaitingOnCredit => "Waiting on Credit",
            Self::ReceivedCredit => "Received Credit",
            Self::RequestedCredit => "Requested Credit",
            Self::Writedown => "Writedown",
            Self::MoveCost => "Move Cost",
            Self::Scrap => "Scrap",
            Self::Other => "Other",
        }
    }

    /// Accepts the stored labels as well as snake/kebab case (`move_cost`, `move-cost`).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        if value == Self::Unset.as_str() {
            return Some(Self::Unset);
        }
        let normalized = value.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "unset" | "none" => Some(Self::Unset),
            "waiting on credit" => Some(Self::WaitingOnCredit),
            "received credit" => Some(Self::ReceivedCredit),
            "requested credit" => Some(Self::RequestedCredit),
            "writedown" => Some(Self::Writedown),
            "move cost" => Some(Self::MoveCost),
            "scrap" => Some(Self::Scrap),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

impl TryFrom<String> for ActionKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown action label `{value}`"))
    }
}

impl From<ActionKind> for String {
    fn from(value: ActionKind) -> Self {
        value.as_str().to_string()
    }
}

impl Display for ActionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The observable assignment for one stock id. `text` is only ever present for `Other`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ActionAssignment {
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Per-item remediation actions plus the free-form text kept for `Other`.
///
/// Kinds and texts are persisted under separate keys, so they are held as two maps.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ActionBook {
    kinds: BTreeMap<String, ActionKind>,
    texts: BTreeMap<String, String>,
}

impl ActionBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a book from its two persisted maps. `Unset` kinds are dropped, as is
    /// any text whose id is not currently `Other`.
    #[must_use]
    pub fn from_parts(kinds: BTreeMap<String, ActionKind>, texts: BTreeMap<String, String>) -> Self {
        let kinds: BTreeMap<String, ActionKind> =
            kinds.into_iter().filter(|(_, kind)| *kind != ActionKind::Unset).collect();
        let texts = texts
            .into_iter()
            .filter(|(stock_id, _)| kinds.get(stock_id) == Some(&ActionKind::Other))
            .collect();
        Self { kinds, texts }
    }

    #[must_use]
    pub fn kinds(&self) -> &BTreeMap<String, ActionKind> {
        &self.kinds
    }

    #[must_use]
    pub fn texts(&self) -> &BTreeMap<String, String> {
        &self.texts
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty() && self.texts.is_empty()
    }

    #[must_use]
    pub fn get(&self, stock_id: &str) -> ActionAssignment {
        let kind = self.kinds.get(stock_id).copied().unwrap_or_default();
        let text = if kind == ActionKind::Other { self.texts.get(stock_id).cloned() } else { None };
        ActionAssignment { kind, text }
    }

    /// Assign `kind`. Any kind other than `Other` clears stored text; `Unset` removes
    /// the assignment.
    pub fn set_action(&mut self, stock_id: &str, kind: ActionKind) {
        if kind == ActionKind::Unset {
            self.kinds.remove(stock_id);
        } else {
            self.kinds.insert(stock_id.to_string(), kind);
        }
        if kind != ActionKind::Other {
            self.texts.remove(stock_id);
        }
    }

    /// Store free-form text. Ignored unless the current kind is `Other`, so text is
    /// never held for any other kind.
    pub fn set_action_text(&mut self, stock_id: &str, text: &str) {
        if self.kinds.get(stock_id) == Some(&ActionKind::Other) {
            self.texts.insert(stock_id.to_string(), text.to_string());
        }
    }

    /// Apply one action to many ids; identical to calling [`Self::set_action`] (and
    /// [`Self::set_action_text`] for `Other` with text) on each id.
    ///
    /// Returns the number of distinct ids touched.
    pub fn bulk_apply<'a, I>(&mut self, stock_ids: I, kind: ActionKind, text: Option<&str>) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let distinct = stock_ids.into_iter().collect::<BTreeSet<_>>();
        for stock_id in &distinct {
            self.set_action(stock_id, kind);
            if kind == ActionKind::Other {
                if let Some(text) = text {
                    self.set_action_text(stock_id, text);
                }
            }
        }
        distinct.len()
    }

    /// Encode the kind map (`stock id → label`).
    ///
    /// # Errors
    /// Returns [`KernelError::Codec`] when serialization fails.
    pub fn kinds_blob(&self) -> Result<Value, KernelError> {
        serde_json::to_value(&self.kinds)
            .map_err(|err| KernelError::Codec(format!("failed to encode action kinds: {err}")))
    }

    /// Encode the free-form text map.
    ///
    /// # Errors
    /// Returns [`KernelError::Codec`] when serialization fails.
    pub fn texts_blob(&self) -> Result<Value, KernelError> {
        serde_json::to_value(&self.texts)
            .map_err(|err| KernelError::Codec(format!("failed to encode action text: {err}")))
    }

    /// Decode the persisted kind map; an absent blob is an empty map.
    ///
    /// # Errors
    /// Returns [`KernelError::Codec`] for unknown labels or a non-object blob.
    pub fn decode_kinds(blob: Option<Value>) -> Result<BTreeMap<String, ActionKind>, KernelError> {
        match blob {
            None => Ok(BTreeMap::new()),
            Some(value) => serde_json::from_value(value)
                .map_err(|err| KernelError::Codec(format!("invalid action assignments: {err}"))),
        }
    }

    /// Decode the persisted free-form text map; an absent blob is an empty map.
    ///
    /// # Errors
    /// Returns [`KernelError::Codec`] when the blob is not a string map.
    pub fn decode_texts(blob: Option<Value>) -> Result<BTreeMap<String, String>, KernelError> {
        match blob {
            None => Ok(BTreeMap::new()),
            Some(value) => serde_json::from_value(value)
                .map_err(|err| KernelError::Codec(format!("invalid action text: {err}"))),
        }
    }
}
