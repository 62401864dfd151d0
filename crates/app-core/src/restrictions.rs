//! Participant restrictions
//!
//! A restriction is directional: if Alice lists Bob, Alice must not give to
//! Bob, but Bob may still give to Alice unless he lists her too.
//!
//! Restriction data comes from storage as raw JSON written by other
//! clients, so normalization never fails. Anything that is not an array of
//! strings counts as "no restrictions".

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// A confirmed participant as handed to the draw
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    /// Participant's user ID
    pub participant_id: String,

    /// Raw restriction data, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrictions: Option<Value>,
}

impl ParticipantRecord {
    /// Create a participant without restrictions
    pub fn new(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            restrictions: None,
        }
    }

    /// Attach raw restriction data
    pub fn with_restrictions(mut self, restrictions: Value) -> Self {
        self.restrictions = Some(restrictions);
        self
    }
}

/// Lookup from giver to the receivers they must not draw
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestrictionMap {
    forbidden: HashMap<String, HashSet<String>>,
}

impl RestrictionMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the map from participant records
    ///
    /// Every participant gets an entry, empty when its data is missing or
    /// malformed.
    pub fn from_participants<'a, I>(participants: I) -> Self
    where
        I: IntoIterator<Item = &'a ParticipantRecord>,
    {
        let forbidden = participants
            .into_iter()
            .map(|p| (p.participant_id.clone(), normalize(p.restrictions.as_ref())))
            .collect();

        Self { forbidden }
    }

    /// Forbid `giver` from drawing each of `receivers`
    pub fn forbid<I, S>(&mut self, giver: impl Into<String>, receivers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forbidden
            .entry(giver.into())
            .or_default()
            .extend(receivers.into_iter().map(Into::into));
    }

    /// Whether `giver` is forbidden from drawing `receiver`
    pub fn forbids(&self, giver: &str, receiver: &str) -> bool {
        self.forbidden
            .get(giver)
            .is_some_and(|set| set.contains(receiver))
    }

    /// Receivers forbidden for `giver`, if the giver is known
    pub fn restrictions_for(&self, giver: &str) -> Option<&HashSet<String>> {
        self.forbidden.get(giver)
    }

    /// Number of participants with an entry
    pub fn len(&self) -> usize {
        self.forbidden.len()
    }

    /// Whether the map has no entries
    pub fn is_empty(&self) -> bool {
        self.forbidden.is_empty()
    }
}

/// Normalize raw restriction data into a set of participant IDs
///
/// Non-array values yield an empty set. Non-string array elements are
/// skipped.
pub fn normalize(raw: Option<&Value>) -> HashSet<String> {
    match raw {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => HashSet::new(),
    }
}
