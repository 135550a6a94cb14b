//! Hierarchical, time-versioned attribute store.
//!
//! Attributes are addressed by paths of names (`["syscalls", "scenarios", "open#1", "state"]`)
//! and identified by a [`Quark`]. Every attribute keeps an append-only list of
//! [`Interval`]s; the last interval is the ongoing value.

use crate::error::StateError;
use crate::value::Value;
use crate::WILDCARD;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Handle to an attribute in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quark(usize);

impl Quark {
    /// The unnamed root of every store.
    pub const ROOT: Quark = Quark(0);

    pub fn index(self) -> usize {
        self.0
    }
}

/// A value that became current at `start` and stays current until the next interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub start: i64,
    pub value: Value,
}

/// Read/write contract the pattern engine needs from a state store.
///
/// Timestamps are nanoseconds. Writes are append-only per attribute: a write may
/// not be earlier than the last write to the same attribute.
pub trait StateStore {
    /// Resolves `segments` below `base` without creating anything.
    fn quark_relative(&self, base: Quark, segments: &[&str]) -> Result<Quark, StateError>;

    /// Resolves `segments` below `base`, creating missing attributes.
    fn quark_relative_or_create(
        &mut self,
        base: Quark,
        segments: &[&str],
    ) -> Result<Quark, StateError>;

    /// Resolves an absolute path, creating missing attributes.
    fn get_or_create_path(&mut self, segments: &[&str]) -> Result<Quark, StateError> {
        self.quark_relative_or_create(Quark::ROOT, segments)
    }

    /// Direct children of an attribute, in name order.
    fn sub_attributes(&self, quark: Quark) -> Result<Vec<Quark>, StateError>;

    fn attribute_name(&self, quark: Quark) -> Result<String, StateError>;

    /// Slash-separated path from the root, for logs and errors.
    fn full_path(&self, quark: Quark) -> Result<String, StateError>;

    /// Sets the value of an attribute from `timestamp` onwards.
    fn write(&mut self, quark: Quark, timestamp: i64, value: Value) -> Result<(), StateError>;

    /// Latest written value (`Null` if never written).
    fn query_ongoing(&self, quark: Quark) -> Result<Value, StateError>;

    /// Value at `timestamp` and the start of the interval holding it.
    fn query_at(&self, quark: Quark, timestamp: i64) -> Result<(Value, i64), StateError>;

    /// Every interval written to an attribute, oldest first.
    fn query_history(&self, quark: Quark) -> Result<Vec<Interval>, StateError>;

    fn start_time(&self) -> i64;

    fn current_end_time(&self) -> i64;

    /// Moves the end of observed data forward. Never moves it backwards.
    fn update_end_time(&mut self, timestamp: i64);

    /// Resolves a path in which [`WILDCARD`] segments match every child.
    fn query_pattern(&self, base: Quark, pattern: &[&str]) -> Result<Vec<Quark>, StateError> {
        let mut current = vec![base];
        for segment in pattern {
            let mut next = Vec::new();
            for quark in current {
                if *segment == WILDCARD {
                    next.extend(self.sub_attributes(quark)?);
                } else if let Ok(child) = self.quark_relative(quark, &[*segment]) {
                    next.push(child);
                }
            }
            current = next;
        }
        Ok(current)
    }
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    parent: Option<Quark>,
    children: BTreeMap<String, Quark>,
    intervals: Vec<Interval>,
}

impl Node {
    fn new(name: impl Into<String>, parent: Option<Quark>) -> Self {
        Self {
            name: name.into(),
            parent,
            children: BTreeMap::new(),
            intervals: Vec::new(),
        }
    }
}

/// In-memory store: an arena of attribute nodes indexed by quark.
#[derive(Debug, Clone)]
pub struct MemoryStateStore {
    nodes: Vec<Node>,
    start_time: i64,
    end_time: i64,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MemoryStateStore {
    /// Creates an empty store whose observed data starts at `start_time`.
    pub fn new(start_time: i64) -> Self {
        Self {
            nodes: vec![Node::new("", None)],
            start_time,
            end_time: start_time,
        }
    }

    /// Number of attributes, root included.
    pub fn attribute_count(&self) -> usize {
        self.nodes.len()
    }

    fn node(&self, quark: Quark) -> Result<&Node, StateError> {
        self.nodes
            .get(quark.0)
            .ok_or(StateError::InvalidQuark(quark.0))
    }

    fn node_mut(&mut self, quark: Quark) -> Result<&mut Node, StateError> {
        self.nodes
            .get_mut(quark.0)
            .ok_or(StateError::InvalidQuark(quark.0))
    }

    fn child_or_create(&mut self, parent: Quark, name: &str) -> Result<Quark, StateError> {
        if let Some(child) = self.node(parent)?.children.get(name) {
            return Ok(*child);
        }
        let quark = Quark(self.nodes.len());
        self.nodes.push(Node::new(name, Some(parent)));
        self.node_mut(parent)?.children.insert(name.to_string(), quark);
        Ok(quark)
    }

    /// Rebuilds a store from absolute paths and their histories.
    pub(crate) fn from_parts(
        start_time: i64,
        end_time: i64,
        attributes: impl IntoIterator<Item = (Vec<String>, Vec<Interval>)>,
    ) -> Result<Self, StateError> {
        let mut store = Self::new(start_time);
        for (path, intervals) in attributes {
            let segments: Vec<&str> = path.iter().map(String::as_str).collect();
            let quark = store.get_or_create_path(&segments)?;
            store.node_mut(quark)?.intervals = intervals;
        }
        store.end_time = end_time.max(start_time);
        Ok(store)
    }

    /// Absolute name path of an attribute, root excluded.
    fn path_segments(&self, quark: Quark) -> Result<Vec<String>, StateError> {
        let mut segments = Vec::new();
        let mut current = Some(quark);
        while let Some(q) = current {
            let node = self.node(q)?;
            if node.parent.is_some() {
                segments.push(node.name.clone());
            }
            current = node.parent;
        }
        segments.reverse();
        Ok(segments)
    }
}

impl StateStore for MemoryStateStore {
    fn quark_relative(&self, base: Quark, segments: &[&str]) -> Result<Quark, StateError> {
        let mut current = base;
        for segment in segments {
            current = match self.node(current)?.children.get(*segment) {
                Some(child) => *child,
                None => {
                    let mut path = self.full_path(current)?;
                    path.push('/');
                    path.push_str(segment);
                    return Err(StateError::AttributeNotFound { path });
                }
            };
        }
        Ok(current)
    }

    fn quark_relative_or_create(
        &mut self,
        base: Quark,
        segments: &[&str],
    ) -> Result<Quark, StateError> {
        let mut current = base;
        for segment in segments {
            current = self.child_or_create(current, segment)?;
        }
        Ok(current)
    }

    fn sub_attributes(&self, quark: Quark) -> Result<Vec<Quark>, StateError> {
        Ok(self.node(quark)?.children.values().copied().collect())
    }

    fn attribute_name(&self, quark: Quark) -> Result<String, StateError> {
        Ok(self.node(quark)?.name.clone())
    }

    fn full_path(&self, quark: Quark) -> Result<String, StateError> {
        Ok(self.path_segments(quark)?.join("/"))
    }

    fn write(&mut self, quark: Quark, timestamp: i64, value: Value) -> Result<(), StateError> {
        let last = self
            .node(quark)?
            .intervals
            .last()
            .map(|i| (i.start, i.value.clone()));

        match last {
            Some((start, _)) if timestamp < start => {
                return Err(StateError::TimeOrdering {
                    path: self.full_path(quark)?,
                    last: start,
                    attempted: timestamp,
                });
            }
            Some((_, current)) if current == value => {}
            None if value.is_null() => {}
            _ => {
                self.node_mut(quark)?.intervals.push(Interval {
                    start: timestamp,
                    value,
                });
            }
        }

        self.update_end_time(timestamp);
        Ok(())
    }

    fn query_ongoing(&self, quark: Quark) -> Result<Value, StateError> {
        Ok(self
            .node(quark)?
            .intervals
            .last()
            .map(|i| i.value.clone())
            .unwrap_or_default())
    }

    fn query_at(&self, quark: Quark, timestamp: i64) -> Result<(Value, i64), StateError> {
        let intervals = &self.node(quark)?.intervals;
        let idx = intervals.partition_point(|i| i.start <= timestamp);
        if idx == 0 {
            return Ok((Value::Null, self.start_time));
        }
        let interval = &intervals[idx - 1];
        Ok((interval.value.clone(), interval.start))
    }

    fn query_history(&self, quark: Quark) -> Result<Vec<Interval>, StateError> {
        Ok(self.node(quark)?.intervals.clone())
    }

    fn start_time(&self) -> i64 {
        self.start_time
    }

    fn current_end_time(&self) -> i64 {
        self.end_time
    }

    fn update_end_time(&mut self, timestamp: i64) {
        if timestamp > self.end_time {
            self.end_time = timestamp;
        }
    }
}

/// A store shared between the engine and history readers.
pub struct SharedStateStore<S> {
    inner: Arc<RwLock<S>>,
}

impl<S> Clone for SharedStateStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: StateStore> SharedStateStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            inner: Arc::new(RwLock::new(store)),
        }
    }

    /// Read access for history tooling.
    pub fn read(&self) -> RwLockReadGuard<'_, S> {
        self.inner.read()
    }

    pub fn lock(&self) -> RwLockWriteGuard<'_, S> {
        self.inner.write()
    }
}

impl<S: StateStore> StateStore for SharedStateStore<S> {
    fn quark_relative(&self, base: Quark, segments: &[&str]) -> Result<Quark, StateError> {
        self.inner.read().quark_relative(base, segments)
    }

    fn quark_relative_or_create(
        &mut self,
        base: Quark,
        segments: &[&str],
    ) -> Result<Quark, StateError> {
        self.inner.write().quark_relative_or_create(base, segments)
    }

    fn sub_attributes(&self, quark: Quark) -> Result<Vec<Quark>, StateError> {
        self.inner.read().sub_attributes(quark)
    }

    fn attribute_name(&self, quark: Quark) -> Result<String, StateError> {
        self.inner.read().attribute_name(quark)
    }

    fn full_path(&self, quark: Quark) -> Result<String, StateError> {
        self.inner.read().full_path(quark)
    }

    fn write(&mut self, quark: Quark, timestamp: i64, value: Value) -> Result<(), StateError> {
        self.inner.write().write(quark, timestamp, value)
    }

    fn query_ongoing(&self, quark: Quark) -> Result<Value, StateError> {
        self.inner.read().query_ongoing(quark)
    }

    fn query_at(&self, quark: Quark, timestamp: i64) -> Result<(Value, i64), StateError> {
        self.inner.read().query_at(quark, timestamp)
    }

    fn query_history(&self, quark: Quark) -> Result<Vec<Interval>, StateError> {
        self.inner.read().query_history(quark)
    }

    fn start_time(&self) -> i64 {
        self.inner.read().start_time()
    }

    fn current_end_time(&self) -> i64 {
        self.inner.read().current_end_time()
    }

    fn update_end_time(&mut self, timestamp: i64) {
        self.inner.write().update_end_time(timestamp)
    }
}
