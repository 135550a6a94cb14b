//! Scenario records in the state store.
//!
//! Every scenario owns the attribute subtree `<root>/scenarios/<scenario>`:
//!
//! ```text
//! <root>/scenarios/<scenario>/
//!     fsm                     FSM id
//!     parent                  parent FSM id, when spawned
//!     state                   current state
//!     status                  waiting_start | in_progress | matched | abandoned
//!     start_time              time the scenario left its initial state
//!     end_time                time the scenario terminated
//!     states/<state>/start_time
//!     scratch/<slot>
//! ```

use crate::error::CoreError;
use crate::scenario::ScenarioStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracepat_state::{Quark, StateStore, Value, WILDCARD};

pub const SCENARIOS: &str = "scenarios";
pub const FSM: &str = "fsm";
pub const PARENT: &str = "parent";
pub const STATE: &str = "state";
pub const STATUS: &str = "status";
pub const START_TIME: &str = "start_time";
pub const END_TIME: &str = "end_time";
pub const STATES: &str = "states";
pub const SCRATCH: &str = "scratch";

/// Attribute holding a scratch slot of a scenario.
pub fn scratch_quark<S: StateStore + ?Sized>(
    store: &S,
    root: Quark,
    scenario: &str,
    slot: &str,
) -> Result<Quark, CoreError> {
    Ok(store.quark_relative(root, &[SCENARIOS, scenario, SCRATCH, slot])?)
}

/// Attribute holding the time a scenario last entered `state`.
pub fn state_start_quark<S: StateStore + ?Sized>(
    store: &S,
    root: Quark,
    scenario: &str,
    state: &str,
) -> Result<Quark, CoreError> {
    Ok(store.quark_relative(root, &[SCENARIOS, scenario, STATES, state, START_TIME])?)
}

/// Writer for one scenario's subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioHistory {
    quark: Quark,
}

impl ScenarioHistory {
    /// Creates (or reopens) the subtree of `scenario` below `root`.
    pub fn open<S: StateStore + ?Sized>(
        store: &mut S,
        root: Quark,
        scenario: &str,
    ) -> Result<Self, CoreError> {
        let quark = store.quark_relative_or_create(root, &[SCENARIOS, scenario])?;
        Ok(Self { quark })
    }

    /// The scenario attribute root.
    pub fn quark(&self) -> Quark {
        self.quark
    }

    /// Writes `value` at `path` relative to the scenario root.
    pub fn write<S: StateStore + ?Sized>(
        &self,
        store: &mut S,
        timestamp: i64,
        path: &[&str],
        value: Value,
    ) -> Result<(), CoreError> {
        let quark = store.quark_relative_or_create(self.quark, path)?;
        store.write(quark, timestamp, value)?;
        Ok(())
    }

    /// Records the owning FSM and, for spawned scenarios, the parent FSM.
    pub fn set_identity<S: StateStore + ?Sized>(
        &self,
        store: &mut S,
        timestamp: i64,
        fsm: &str,
        parent: Option<&str>,
    ) -> Result<(), CoreError> {
        self.write(store, timestamp, &[FSM], Value::from(fsm))?;
        if let Some(parent) = parent {
            self.write(store, timestamp, &[PARENT], Value::from(parent))?;
        }
        Ok(())
    }

    pub fn set_state<S: StateStore + ?Sized>(
        &self,
        store: &mut S,
        timestamp: i64,
        state: &str,
        status: ScenarioStatus,
    ) -> Result<(), CoreError> {
        self.write(store, timestamp, &[STATE], Value::from(state))?;
        self.write(store, timestamp, &[STATUS], Value::from(status.as_str()))
    }

    pub fn set_start_time<S: StateStore + ?Sized>(
        &self,
        store: &mut S,
        timestamp: i64,
    ) -> Result<(), CoreError> {
        self.write(store, timestamp, &[START_TIME], Value::Long(timestamp))
    }

    pub fn set_end_time<S: StateStore + ?Sized>(
        &self,
        store: &mut S,
        timestamp: i64,
    ) -> Result<(), CoreError> {
        self.write(store, timestamp, &[END_TIME], Value::Long(timestamp))
    }

    /// Records that the scenario entered `state` at `timestamp`.
    pub fn enter_state<S: StateStore + ?Sized>(
        &self,
        store: &mut S,
        timestamp: i64,
        state: &str,
    ) -> Result<(), CoreError> {
        self.write(
            store,
            timestamp,
            &[STATES, state, START_TIME],
            Value::Long(timestamp),
        )
    }

    pub fn save_scratch<S: StateStore + ?Sized>(
        &self,
        store: &mut S,
        timestamp: i64,
        slot: &str,
        value: Value,
    ) -> Result<(), CoreError> {
        self.write(store, timestamp, &[SCRATCH, slot], value)
    }

    pub fn clear_scratch<S: StateStore + ?Sized>(
        &self,
        store: &mut S,
        timestamp: i64,
        slot: &str,
    ) -> Result<(), CoreError> {
        self.write(store, timestamp, &[SCRATCH, slot], Value::Null)
    }

    /// Every scratch slot currently holding a value.
    pub fn scratch_values<S: StateStore + ?Sized>(
        &self,
        store: &S,
    ) -> Result<BTreeMap<String, Value>, CoreError> {
        read_scratch(store, self.quark)
    }

    /// Reads back every scenario recorded below `root`.
    pub fn list<S: StateStore + ?Sized>(
        store: &S,
        root: Quark,
    ) -> Result<Vec<ScenarioRecord>, CoreError> {
        let mut records = Vec::new();
        for quark in store.query_pattern(root, &[SCENARIOS, WILDCARD])? {
            records.push(ScenarioRecord::read(store, quark)?);
        }
        records.sort_by(|a, b| (&a.fsm, a.sequence()).cmp(&(&b.fsm, b.sequence())));
        Ok(records)
    }
}

fn read_scratch<S: StateStore + ?Sized>(
    store: &S,
    scenario: Quark,
) -> Result<BTreeMap<String, Value>, CoreError> {
    let mut values = BTreeMap::new();
    if let Ok(scratch) = store.quark_relative(scenario, &[SCRATCH]) {
        for slot in store.sub_attributes(scratch)? {
            let value = store.query_ongoing(slot)?;
            if !value.is_null() {
                values.insert(store.attribute_name(slot)?, value);
            }
        }
    }
    Ok(values)
}

/// A scenario as recorded in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRecord {
    pub name: String,
    pub fsm: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub state: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scratch: BTreeMap<String, Value>,
}

impl ScenarioRecord {
    fn read<S: StateStore + ?Sized>(store: &S, quark: Quark) -> Result<Self, CoreError> {
        let child = |name: &str| -> Value {
            store
                .quark_relative(quark, &[name])
                .and_then(|q| store.query_ongoing(q))
                .unwrap_or_default()
        };
        let text = |name: &str| child(name).as_str().map(str::to_string);

        Ok(Self {
            name: store.attribute_name(quark)?,
            fsm: text(FSM).unwrap_or_default(),
            parent: text(PARENT),
            state: text(STATE).unwrap_or_default(),
            status: text(STATUS).unwrap_or_default(),
            start_time: child(START_TIME).as_i64(),
            end_time: child(END_TIME).as_i64(),
            scratch: read_scratch(store, quark)?,
        })
    }

    /// Sequence number from the `fsm#sequence` name.
    pub fn sequence(&self) -> u64 {
        self.name
            .rsplit_once('#')
            .and_then(|(_, seq)| seq.parse().ok())
            .unwrap_or(0)
    }

    pub fn is_terminal(&self) -> bool {
        self.status == ScenarioStatus::Matched.as_str()
            || self.status == ScenarioStatus::Abandoned.as_str()
    }
}
