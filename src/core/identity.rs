//! Identity atoms.
//!
//! ItineraryId / NodeId: caller-supplied identifiers, validated on parse.
//! DayNumber: 1-based position of a day within an itinerary.
//! SubjectId: authenticated principal extracted from a credential.
//! BatchId: daemon-generated handle for one applied changeset.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{CoreError, InvalidId};

const ID_MAX_LEN: usize = 128;

fn check_id_chars(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return Some("empty".into());
    }
    if raw.len() > ID_MAX_LEN {
        return Some(format!("longer than {ID_MAX_LEN} bytes"));
    }
    if !raw
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Some("must be ascii alphanumeric, '-' or '_'".into());
    }
    None
}

/// Itinerary identifier - non-empty ascii slug.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItineraryId(String);

impl ItineraryId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        match check_id_chars(&raw) {
            Some(reason) => Err(InvalidId::Itinerary { raw, reason }.into()),
            None => Ok(Self(raw)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ItineraryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItineraryId({:?})", self.0)
    }
}

impl fmt::Display for ItineraryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node identifier - unique within one itinerary.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        match check_id_chars(&raw) {
            Some(reason) => Err(InvalidId::Node { raw, reason }.into()),
            None => Ok(Self(raw)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:?})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 1-based day number. Immutable once a day is created.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DayNumber(u32);

impl DayNumber {
    pub fn new(raw: u32) -> Result<Self, CoreError> {
        if raw == 0 {
            return Err(InvalidId::Day {
                raw,
                reason: "day numbers are 1-based".into(),
            }
            .into());
        }
        Ok(Self(raw))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for DayNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DayNumber({})", self.0)
    }
}

impl fmt::Display for DayNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authenticated principal. Issued externally; we only carry it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(InvalidId::Subject {
                raw,
                reason: "empty".into(),
            }
            .into());
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubjectId({:?})", self.0)
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle for one applied changeset, used to address undo.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        Uuid::parse_str(raw).map(Self).map_err(|e| {
            InvalidId::Batch {
                raw: raw.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

impl fmt::Debug for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BatchId({})", self.0)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn itinerary_id_rejects_empty_and_bad_chars() {
        assert!(ItineraryId::parse("").is_err());
        assert!(ItineraryId::parse("has space").is_err());
        assert!(ItineraryId::parse("trip-2026_08").is_ok());
    }

    #[test]
    fn day_number_is_one_based() {
        assert!(DayNumber::new(0).is_err());
        assert_eq!(DayNumber::new(3).unwrap().get(), 3);
    }

    #[test]
    fn batch_id_round_trips() {
        let id = BatchId::generate();
        assert_eq!(BatchId::parse(&id.to_string()).unwrap(), id);
    }
}
