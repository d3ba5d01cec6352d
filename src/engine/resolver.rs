//! Day resolution for cross-node edges.
//!
//! Resolution order: explicit day on the operation if it names an existing
//! day, else the source node's day, else the target node's day. When both
//! endpoints resolve to different days and no explicit day was given, the
//! outcome is policy, not guesswork - see `EndpointPreference`.

use serde::{Deserialize, Serialize};

use crate::core::{DayNumber, Itinerary, NodeId};

/// Which endpoint wins when source and target sit on different days and the
/// operation carries no explicit day. `Reject` surfaces the ambiguity to the
/// caller instead of picking silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EndpointPreference {
    Source,
    Target,
    #[default]
    Reject,
}

/// Resolution failure: neither an explicit day nor the endpoints produced
/// an unambiguous answer. Both endpoint ids travel with the diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unresolved {
    pub source: NodeId,
    pub target: NodeId,
}

#[derive(Debug, Clone, Copy)]
pub struct EdgeResolver {
    preference: EndpointPreference,
}

impl EdgeResolver {
    pub fn new(preference: EndpointPreference) -> Self {
        Self { preference }
    }

    /// Resolve the day an edge between `source` and `target` belongs to.
    ///
    /// An explicit day that does not exist in the itinerary is treated as
    /// absent and falls through to endpoint resolution - never defaulted.
    pub fn resolve_day(
        &self,
        explicit: Option<DayNumber>,
        source: &NodeId,
        target: &NodeId,
        itinerary: &Itinerary,
    ) -> Result<DayNumber, Unresolved> {
        if let Some(day) = explicit {
            if itinerary.day(day).is_some() {
                return Ok(day);
            }
        }

        let source_day = itinerary.day_of_node(source);
        let target_day = itinerary.day_of_node(target);
        let unresolved = || Unresolved {
            source: source.clone(),
            target: target.clone(),
        };

        match (source_day, target_day) {
            (Some(s), Some(t)) if s == t => Ok(s),
            (Some(s), Some(t)) => match self.preference {
                EndpointPreference::Source => Ok(s),
                EndpointPreference::Target => Ok(t),
                EndpointPreference::Reject => Err(unresolved()),
            },
            (Some(s), None) => Ok(s),
            (None, Some(t)) => Ok(t),
            (None, None) => Err(unresolved()),
        }
    }
}
