//! NIC priority matrix.
//!
//! Serialized form, keyed by memory location:
//!
//! ```json
//! {"cpu:0": [["mlx5_0"], ["mlx5_1"]], "cuda:0": [["mlx5_1"], []]}
//! ```
//!
//! The first list holds preferred NICs for that location, the second holds
//! NICs that work but cross a slower path.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Location consulted when a region's own location has no entry.
pub const WILDCARD_LOCATION: &str = "*";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("invalid NIC priority matrix: {0}")]
    Parse(String),
    #[error("NIC priority matrix lists no devices")]
    Empty,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(Vec<String>, Vec<String>)", into = "(Vec<String>, Vec<String>)")]
pub struct TopologyEntry {
    pub preferred: Vec<String>,
    pub available: Vec<String>,
}

impl From<(Vec<String>, Vec<String>)> for TopologyEntry {
    fn from((preferred, available): (Vec<String>, Vec<String>)) -> Self {
        Self {
            preferred,
            available,
        }
    }
}

impl From<TopologyEntry> for (Vec<String>, Vec<String>) {
    fn from(entry: TopologyEntry) -> Self {
        (entry.preferred, entry.available)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topology {
    matrix: BTreeMap<String, TopologyEntry>,
}

impl Topology {
    pub fn parse(json: &str) -> Result<Self, TopologyError> {
        let topology: Topology =
            serde_json::from_str(json).map_err(|error| TopologyError::Parse(error.to_string()))?;
        if topology.devices().is_empty() {
            return Err(TopologyError::Empty);
        }
        Ok(topology)
    }

    pub fn insert(&mut self, location: impl Into<String>, entry: TopologyEntry) {
        self.matrix.insert(location.into(), entry);
    }

    pub fn entry(&self, location: &str) -> Option<&TopologyEntry> {
        self.matrix.get(location)
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.is_empty()
    }

    /// Every NIC named anywhere in the matrix, sorted and deduplicated.
    /// Device indices used across the transport refer to this list.
    pub fn devices(&self) -> Vec<String> {
        self.matrix
            .values()
            .flat_map(|entry| entry.preferred.iter().chain(entry.available.iter()))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Picks a NIC for memory at `location`. Preferred NICs come first; each
    /// retry walks one step further through preferred then available.
    pub fn select_device(&self, location: &str, retry_count: usize) -> Option<&str> {
        let entry = self
            .matrix
            .get(location)
            .or_else(|| self.matrix.get(WILDCARD_LOCATION))
            .or_else(|| self.matrix.values().next())?;
        let candidates = entry.preferred.len() + entry.available.len();
        if candidates == 0 {
            return None;
        }
        let idx = retry_count % candidates;
        entry
            .preferred
            .get(idx)
            .or_else(|| entry.available.get(idx - entry.preferred.len()))
            .map(String::as_str)
    }

    /// Drops a NIC everywhere, e.g. after it failed to open.
    pub fn disable_device(&mut self, name: &str) {
        for entry in self.matrix.values_mut() {
            entry.preferred.retain(|device| device != name);
            entry.available.retain(|device| device != name);
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
