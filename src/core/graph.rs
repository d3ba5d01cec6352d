//! Itinerary graph aggregates: days, nodes, edges.
//!
//! The itinerary is the canonical unit of versioning. Days partition nodes
//! and edges; every edge is scoped to exactly one day. All mutation flows
//! through the engine - nothing here mutates in place past construction
//! helpers.

use serde::{Deserialize, Serialize};

use super::error::CoreError;
use super::identity::{DayNumber, ItineraryId, NodeId, SubjectId};

/// What a node represents on the ground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Place,
    Meal,
    Lodging,
    Transit,
}

/// Typed payload carried by every node.
///
/// Costs are minor units (cents) to avoid float drift; timing is minutes
/// from day start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_minute: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_minor: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub title: String,
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_ref: Option<String>,
    #[serde(default)]
    pub payload: NodePayload,
}

impl Node {
    pub fn new(id: NodeId, kind: NodeKind, title: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            title: title.into(),
            locked: false,
            booking_ref: None,
            payload: NodePayload::default(),
        }
    }
}

/// Relation kind between two nodes on a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Travel,
    Sequence,
    Alternative,
}

/// Directed relation between two nodes, scoped to one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub day: DayNumber,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Day {
    pub number: DayNumber,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Day {
    pub fn new(number: DayNumber) -> Self {
        Self {
            number,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }
}

/// Top-level aggregate. Version moves by exactly 1 per applied batch;
/// owner never changes after first persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Itinerary {
    pub id: ItineraryId,
    pub version: u64,
    pub owner: SubjectId,
    pub days: Vec<Day>,
}

impl Itinerary {
    pub fn new(id: ItineraryId, owner: SubjectId) -> Self {
        Self {
            id,
            version: 0,
            owner,
            days: Vec::new(),
        }
    }

    /// Append a day during initial generation. Day numbers must be unique.
    pub fn add_day(&mut self, day: Day) -> Result<(), CoreError> {
        if self.days.iter().any(|d| d.number == day.number) {
            return Err(CoreError::DuplicateDay {
                day: day.number.get(),
            });
        }
        self.days.push(day);
        self.days.sort_by_key(|d| d.number);
        Ok(())
    }

    /// Append a node during initial generation. Node ids are unique across
    /// the whole itinerary, not just within one day.
    pub fn add_node(&mut self, day: DayNumber, node: Node) -> Result<(), CoreError> {
        if self.find_node(&node.id).is_some() {
            return Err(CoreError::DuplicateNode {
                node: node.id.to_string(),
            });
        }
        let slot = self
            .days
            .iter_mut()
            .find(|d| d.number == day)
            .ok_or(CoreError::NoSuchDay { day: day.get() })?;
        slot.nodes.push(node);
        Ok(())
    }

    pub fn day(&self, number: DayNumber) -> Option<&Day> {
        self.days.iter().find(|d| d.number == number)
    }

    pub fn day_mut(&mut self, number: DayNumber) -> Option<&mut Day> {
        self.days.iter_mut().find(|d| d.number == number)
    }

    pub fn find_node(&self, id: &NodeId) -> Option<&Node> {
        self.days.iter().flat_map(|d| d.nodes.iter()).find(|n| &n.id == id)
    }

    pub fn find_node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.days
            .iter_mut()
            .flat_map(|d| d.nodes.iter_mut())
            .find(|n| &n.id == id)
    }

    /// Which day a node currently sits on.
    pub fn day_of_node(&self, id: &NodeId) -> Option<DayNumber> {
        self.days
            .iter()
            .find(|d| d.nodes.iter().any(|n| &n.id == id))
            .map(|d| d.number)
    }

    /// Position of a node within its day's ordered sequence.
    pub fn position_of_node(&self, id: &NodeId) -> Option<(DayNumber, usize)> {
        for day in &self.days {
            if let Some(idx) = day.nodes.iter().position(|n| &n.id == id) {
                return Some((day.number, idx));
            }
        }
        None
    }

    /// Content equality ignoring the version counter. Used by undo tests
    /// and by callers comparing snapshots across an apply/undo pair.
    pub fn same_content(&self, other: &Itinerary) -> bool {
        self.id == other.id && self.owner == other.owner && self.days == other.days
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day_no(n: u32) -> DayNumber {
        DayNumber::new(n).unwrap()
    }

    fn sample() -> Itinerary {
        let mut it = Itinerary::new(
            ItineraryId::parse("trip-1").unwrap(),
            SubjectId::parse("alice").unwrap(),
        );
        it.add_day(Day::new(day_no(1))).unwrap();
        it.add_day(Day::new(day_no(2))).unwrap();
        it.add_node(
            day_no(1),
            Node::new(NodeId::parse("louvre").unwrap(), NodeKind::Place, "Louvre"),
        )
        .unwrap();
        it
    }

    #[test]
    fn duplicate_day_rejected() {
        let mut it = sample();
        assert_eq!(
            it.add_day(Day::new(day_no(2))),
            Err(CoreError::DuplicateDay { day: 2 })
        );
    }

    #[test]
    fn duplicate_node_rejected_across_days() {
        let mut it = sample();
        let dup = Node::new(NodeId::parse("louvre").unwrap(), NodeKind::Meal, "again");
        assert!(matches!(
            it.add_node(day_no(2), dup),
            Err(CoreError::DuplicateNode { .. })
        ));
    }

    #[test]
    fn day_of_node_resolves() {
        let it = sample();
        let id = NodeId::parse("louvre").unwrap();
        assert_eq!(it.day_of_node(&id), Some(day_no(1)));
        assert_eq!(it.position_of_node(&id), Some((day_no(1), 0)));
        assert_eq!(it.day_of_node(&NodeId::parse("nope").unwrap()), None);
    }

    #[test]
    fn same_content_ignores_version() {
        let a = sample();
        let mut b = a.clone();
        b.version = 17;
        assert!(a.same_content(&b));
        assert_ne!(a, b);
    }
}
