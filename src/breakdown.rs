//! Hierarchical call-graph statistics.
//!
//! A [`Breakdown`] is a named node carrying a measurement and a sample count,
//! with uniquely named children kept in insertion order. Samples are attributed
//! directly to the node they hit while a recording window is open; at report
//! time the tree is finalized by a fixed pipeline of transforms (`propagate`,
//! then `normalize` / `evaluate_percent` / `evaluate_p95`, then `filter`, then
//! `floor` / `round`) and serialized.

use std::collections::HashMap;
use std::fmt::Write;

use rand::Rng;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// Maximum number of raw values retained for percentile estimation.
pub const RESERVOIR_SIZE: usize = 1000;

/// Kind of a breakdown node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakdownType {
    Callgraph,
    Device,
    Callsite,
    Operation,
    Error,
}

/// One named point in a call graph or categorical tree.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Breakdown {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub breakdown_type: Option<BreakdownType>,
    #[serde(serialize_with = "serialize_metadata")]
    metadata: Vec<(String, String)>,
    pub measurement: f64,
    pub num_samples: u64,
    children: Vec<Breakdown>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    #[serde(skip)]
    reservoir: Option<Vec<f64>>,
}

impl Breakdown {
    /// Creates an empty node without a type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Creates an empty node of the given type.
    pub fn with_type(name: impl Into<String>, breakdown_type: BreakdownType) -> Self {
        Self {
            name: name.into(),
            breakdown_type: Some(breakdown_type),
            ..Default::default()
        }
    }

    pub fn set_type(&mut self, breakdown_type: BreakdownType) {
        self.breakdown_type = Some(breakdown_type);
    }

    /// Sets a metadata value, overwriting an existing key in place.
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.metadata.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.metadata.push((key, value)),
        }
    }

    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Children in insertion order.
    pub fn children(&self) -> &[Breakdown] {
        &self.children
    }

    pub fn find_child(&self, name: &str) -> Option<&Breakdown> {
        self.index.get(name).and_then(|&i| self.children.get(i))
    }

    pub fn find_child_mut(&mut self, name: &str) -> Option<&mut Breakdown> {
        match self.index.get(name) {
            Some(&i) => self.children.get_mut(i),
            None => None,
        }
    }

    /// Attaches a child, replacing any existing child with the same name.
    pub fn add_child(&mut self, child: Breakdown) {
        match self.index.get(&child.name) {
            Some(&i) => self.children[i] = child,
            None => {
                self.index.insert(child.name.clone(), self.children.len());
                self.children.push(child);
            }
        }
    }

    /// Removes and returns the named child with its subtree.
    pub fn remove_child(&mut self, name: &str) -> Option<Breakdown> {
        let i = self.index.remove(name)?;
        let child = self.children.remove(i);
        self.reindex();
        Some(child)
    }

    /// Returns the named child, creating and attaching an empty one if absent.
    pub fn find_or_add_child(&mut self, name: &str) -> &mut Breakdown {
        let i = match self.index.get(name) {
            Some(&i) => i,
            None => {
                let i = self.children.len();
                self.children.push(Breakdown::new(name));
                self.index.insert(name.to_string(), i);
                i
            }
        };
        &mut self.children[i]
    }

    /// Adds directly attributed value and sample count to this node.
    pub fn increment(&mut self, value: f64, count: u64) {
        self.measurement += value;
        self.num_samples += count;
    }

    /// Folds every subtree total into its parent, bottom-up.
    ///
    /// Must run once per finalization; a second call double counts.
    pub fn propagate(&mut self) {
        for child in &mut self.children {
            child.propagate();
            self.measurement += child.measurement;
            self.num_samples += child.num_samples;
        }
    }

    /// Converts windowed totals into per-unit rates.
    pub fn normalize(&mut self, factor: f64) {
        self.measurement /= factor;
        self.num_samples = (self.num_samples as f64 / factor).ceil() as u64;

        for child in &mut self.children {
            child.normalize(factor);
        }
    }

    /// Removes nodes whose own measurement falls outside `[min, max]`.
    ///
    /// The receiver is level 1. Children are only tested once the current
    /// level reaches `from_level`; a removed child takes its subtree with it,
    /// a kept child is visited at the next level. The test looks at each node's
    /// own value, never at what remains below it.
    pub fn filter(&mut self, from_level: usize, min: f64, max: f64) {
        self.filter_level(1, from_level, min, max);
    }

    fn filter_level(&mut self, level: usize, from_level: usize, min: f64, max: f64) {
        let before = self.children.len();
        let prune = level >= from_level;

        self.children.retain_mut(|child| {
            if prune && (child.measurement < min || child.measurement > max) {
                return false;
            }
            child.filter_level(level + 1, from_level, min, max);
            true
        });

        if self.children.len() != before {
            self.reindex();
        }
    }

    /// Replaces measurements with the share of `total_samples` seen at each node.
    pub fn evaluate_percent(&mut self, total_samples: u64) {
        self.measurement = if total_samples == 0 {
            0.0
        } else {
            self.num_samples as f64 / total_samples as f64 * 100.0
        };

        for child in &mut self.children {
            child.evaluate_percent(total_samples);
        }
    }

    /// Replaces measurements with their percentage of `total`.
    pub fn convert_to_percent(&mut self, total: f64) {
        self.measurement = self.measurement / total * 100.0;

        for child in &mut self.children {
            child.convert_to_percent(total);
        }
    }

    pub fn floor(&mut self) {
        self.measurement = self.measurement.floor();

        for child in &mut self.children {
            child.floor();
        }
    }

    pub fn round(&mut self) {
        self.measurement = self.measurement.round();

        for child in &mut self.children {
            child.round();
        }
    }

    /// Height of the subtree rooted here; 1 for a leaf.
    pub fn depth(&self) -> usize {
        self.children.iter().map(Breakdown::depth).max().unwrap_or(0) + 1
    }

    /// Feeds a raw value into this node's percentile reservoir.
    ///
    /// Once the reservoir is full a uniformly chosen slot over the fixed
    /// capacity is overwritten.
    pub fn update_p95<R: Rng + ?Sized>(&mut self, value: f64, rng: &mut R) {
        let reservoir = self
            .reservoir
            .get_or_insert_with(|| Vec::with_capacity(16));

        if reservoir.len() < RESERVOIR_SIZE {
            reservoir.push(value);
        } else {
            let slot = rng.gen_range(0..RESERVOIR_SIZE);
            reservoir[slot] = value;
        }

        self.num_samples += 1;
    }

    /// Sets measurement to the 95th percentile of the reservoir, then drops it.
    pub fn evaluate_p95(&mut self) {
        if let Some(mut reservoir) = self.reservoir.take() {
            if !reservoir.is_empty() {
                reservoir.sort_by(f64::total_cmp);
                let index = (reservoir.len() as f64 * 0.95).floor() as usize;
                self.measurement = reservoir[index.min(reservoir.len() - 1)];
            }
        }

        for child in &mut self.children {
            child.evaluate_p95();
        }
    }

    /// Number of values currently held in the reservoir.
    pub fn reservoir_len(&self) -> usize {
        self.reservoir.as_ref().map_or(0, Vec::len)
    }

    /// Structural JSON form of the tree.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Human-readable tree, one line per node, indented by depth.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_level(0, &mut out);
        out
    }

    fn dump_level(&self, level: usize, out: &mut String) {
        for _ in 0..level {
            out.push(' ');
        }
        let _ = writeln!(
            out,
            "{} - {} ({})",
            self.name, self.measurement, self.num_samples
        );
        for child in &self.children {
            child.dump_level(level + 1, out);
        }
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (i, child) in self.children.iter().enumerate() {
            self.index.insert(child.name.clone(), i);
        }
    }
}

fn serialize_metadata<S: Serializer>(
    metadata: &[(String, String)],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(metadata.len()))?;
    for (k, v) in metadata {
        map.serialize_entry(k, v)?;
    }
    map.end()
}
