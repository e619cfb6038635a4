//! Slot-to-node topology, built from CLUSTER SLOTS replies.

use super::slots::SLOT_COUNT;
use crate::error::{ClientError, Result};
use crate::protocol::RespValue;
use std::collections::BTreeMap;
use std::fmt;

/// Inclusive range of hash slots, the unit CLUSTER SLOTS reports in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, slot: u16) -> bool {
        self.start <= slot && slot <= self.end
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// One master and the slot ranges it serves. Replica information is
/// dropped at parse time; requests only ever route to masters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeEntry {
    pub id: Option<String>,
    pub ranges: Vec<SlotRange>,
}

/// The slot map of one observed cluster epoch.
///
/// Keyed by `host:port`; iteration order is the sorted address order,
/// which keeps seed selection and reconnect sweeps deterministic.
#[derive(Debug, Clone, Default)]
pub struct ClusterTopology {
    nodes: BTreeMap<String, NodeEntry>,
}

impl ClusterTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a CLUSTER SLOTS reply: an array of
    /// `[start, end, [host, port, id?], ...replicas]` entries.
    pub fn from_cluster_slots(reply: &RespValue) -> Result<Self> {
        let entries = reply
            .as_array()
            .ok_or_else(|| ClientError::Cluster("CLUSTER SLOTS reply is not an array".to_string()))?;

        let mut nodes: BTreeMap<String, NodeEntry> = BTreeMap::new();
        for entry in entries {
            let parts = entry.as_array().ok_or_else(|| {
                ClientError::Cluster("CLUSTER SLOTS entry is not an array".to_string())
            })?;
            if parts.len() < 3 {
                return Err(ClientError::Cluster(format!(
                    "CLUSTER SLOTS entry has {} elements, expected at least 3",
                    parts.len()
                )));
            }

            let start = slot_number(&parts[0])?;
            let end = slot_number(&parts[1])?;
            if start > end {
                return Err(ClientError::Cluster(format!(
                    "inverted slot range {}-{}",
                    start, end
                )));
            }

            // parts[2] is the master; any further elements are replicas.
            let master = parts[2].as_array().ok_or_else(|| {
                ClientError::Cluster("CLUSTER SLOTS node entry is not an array".to_string())
            })?;
            if master.len() < 2 {
                return Err(ClientError::Cluster(
                    "CLUSTER SLOTS node entry missing host or port".to_string(),
                ));
            }
            let host = master[0]
                .as_str()
                .ok_or_else(|| ClientError::Cluster("node host is not a string".to_string()))?;
            let port = master[1]
                .as_integer()
                .filter(|p| (0..=u16::MAX as i64).contains(p))
                .ok_or_else(|| ClientError::Cluster("node port out of range".to_string()))?;
            let id = master.get(2).and_then(|v| v.as_str()).map(String::from);

            let node = nodes.entry(format!("{}:{}", host, port)).or_default();
            if node.id.is_none() {
                node.id = id;
            }
            node.ranges.push(SlotRange::new(start, end));
        }

        Ok(Self { nodes })
    }

    /// Address of the master serving `slot`.
    pub fn resolve(&self, slot: u16) -> Option<&str> {
        self.nodes.iter().find_map(|(addr, node)| {
            node.ranges
                .iter()
                .any(|r| r.contains(slot))
                .then_some(addr.as_str())
        })
    }

    /// Node id reported for `addr`, when CLUSTER SLOTS carried one.
    pub fn node_id(&self, addr: &str) -> Option<&str> {
        self.nodes.get(addr)?.id.as_deref()
    }

    pub fn contains_addr(&self, addr: &str) -> bool {
        self.nodes.contains_key(addr)
    }

    /// Known master addresses in sorted order.
    pub fn addrs(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &NodeEntry)> {
        self.nodes.iter().map(|(addr, node)| (addr.as_str(), node))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True when the union of every node's ranges is exactly
    /// `[0, 16383]` with no gaps.
    pub fn full_coverage(&self) -> bool {
        let mut ranges: Vec<SlotRange> = self
            .nodes
            .values()
            .flat_map(|node| node.ranges.iter().copied())
            .collect();
        ranges.sort_by_key(|r| r.start);

        let mut next: u32 = 0;
        for range in ranges {
            if u32::from(range.start) > next {
                return false;
            }
            next = next.max(u32::from(range.end) + 1);
        }
        next == u32::from(SLOT_COUNT)
    }
}

fn slot_number(value: &RespValue) -> Result<u16> {
    value
        .as_integer()
        .filter(|s| (0..i64::from(SLOT_COUNT)).contains(s))
        .map(|s| s as u16)
        .ok_or_else(|| ClientError::Cluster("slot number out of range".to_string()))
}
