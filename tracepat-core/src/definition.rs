//! Pattern definition types.
//!
//! A definition set is read from YAML (or JSON):
//!
//! ```yaml
//! id: syscalls                   # pattern root attribute
//! initial: "open_close"          # ',' or '|' separated, or a list
//! preconditions: [any_syscall]   # OR-combined, checked before dispatch
//! scratch_fields: { fd: fd }     # event field -> scratch slot
//! tests:
//!   open:  { event: { names: [sys_open, sys_openat], when: "$fd >= 0" } }
//!   close: { event: { names: sys_close, when: "$fd == @fd" } }
//! actions:
//!   segment:
//!     - synthetic_event: { name: { literal: open_close } }
//! fsms:
//!   - id: open_close
//!     initial: S0
//!     final: S_end
//!     concurrent: true
//!     states:
//!       - name: S0
//!         transitions:
//!           - { inputs: [open], target: S1, save_scratch: true }
//!       - name: S1
//!         transitions:
//!           - { inputs: [close], target: S_end, actions: [segment], clear_scratch: true }
//! ```

use crate::action::ActionOp;
use crate::error::CoreError;
use crate::input::{TransitionInput, OTHER};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// Reserved action copying the scratch fields out of the event.
pub const SAVE_SCRATCH_FIELDS: &str = "#save_scratch_fields";

/// Reserved action clearing the scratch fields.
pub const CLEAR_SCRATCH_FIELDS: &str = "#clear_scratch_fields";

/// Accepts a string or an array of strings.
pub(crate) fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct ListVisitor;

    impl<'de> Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut items = Vec::new();
            while let Some(item) = seq.next_element::<String>()? {
                items.push(item);
            }
            Ok(items)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}

/// A transition out of a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// AND-combined input ids; `other` always passes.
    #[serde(default, deserialize_with = "deserialize_list")]
    pub inputs: Vec<String>,

    pub target: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,

    /// Save scratch fields before the declared actions.
    #[serde(default)]
    pub save_scratch: bool,

    /// Clear scratch fields after the declared actions.
    #[serde(default)]
    pub clear_scratch: bool,
}

impl Transition {
    pub fn new(inputs: &[&str], target: impl Into<String>) -> Self {
        Self {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            target: target.into(),
            actions: Vec::new(),
            save_scratch: false,
            clear_scratch: false,
        }
    }

    /// Returns true if every input is `other` (or there are none).
    pub fn is_unconditional(&self) -> bool {
        self.inputs.iter().all(|id| id == OTHER)
    }

    /// Declared actions with the reserved scratch actions injected.
    pub fn action_ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.actions.len() + 2);
        if self.save_scratch {
            ids.push(SAVE_SCRATCH_FIELDS.to_string());
        }
        ids.extend(self.actions.iter().cloned());
        if self.clear_scratch {
            ids.push(CLEAR_SCRATCH_FIELDS.to_string());
        }
        ids
    }
}

/// A state and its ordered transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,

    /// Chain the next transition on the same event after entering this state.
    #[serde(default)]
    pub automatic: bool,

    #[serde(default)]
    pub transitions: Vec<Transition>,
}

impl StateDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            automatic: false,
            transitions: Vec::new(),
        }
    }
}

/// An FSM template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsmDefinition {
    pub id: String,

    pub initial: String,

    #[serde(rename = "final", default, skip_serializing_if = "Option::is_none")]
    pub final_state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abandon: Option<String>,

    /// OR-combined input ids gating the dispatch of an event to this FSM.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preconditions: Vec<String>,

    /// Allow several scenarios in progress at once.
    #[serde(default, alias = "allow_concurrent_instances")]
    pub concurrent: bool,

    pub states: Vec<StateDefinition>,

    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl FsmDefinition {
    pub fn state(&self, name: &str) -> Option<&StateDefinition> {
        self.index.get(name).map(|&i| &self.states[i])
    }

    pub fn initial_state(&self) -> Option<&StateDefinition> {
        self.state(&self.initial)
    }

    pub fn is_final(&self, state: &str) -> bool {
        self.final_state.as_deref() == Some(state)
    }

    pub fn is_abandon(&self, state: &str) -> bool {
        self.abandon.as_deref() == Some(state)
    }

    fn validate(&mut self) -> Result<(), CoreError> {
        if self.id.trim().is_empty() {
            return Err(CoreError::InvalidDefinition {
                reason: "fsm id must not be empty".to_string(),
            });
        }

        for terminal in [&self.final_state, &self.abandon].into_iter().flatten() {
            if *terminal == self.initial {
                return Err(CoreError::InvalidDefinition {
                    reason: format!(
                        "fsm '{}': state '{}' cannot be both initial and terminal",
                        self.id, terminal
                    ),
                });
            }
        }
        if self.final_state.is_some() && self.final_state == self.abandon {
            return Err(CoreError::InvalidDefinition {
                reason: format!(
                    "fsm '{}': final and abandon states must differ",
                    self.id
                ),
            });
        }

        // Undeclared terminal states are implicit empty states
        let implicit: Vec<String> = [&self.final_state, &self.abandon]
            .into_iter()
            .flatten()
            .filter(|name| !self.states.iter().any(|s| &s.name == *name))
            .cloned()
            .collect();
        self.states
            .extend(implicit.into_iter().map(StateDefinition::new));

        self.index.clear();
        for (i, state) in self.states.iter().enumerate() {
            if state.name.trim().is_empty() {
                return Err(CoreError::InvalidDefinition {
                    reason: format!("fsm '{}' has a state without a name", self.id),
                });
            }
            if self.index.insert(state.name.clone(), i).is_some() {
                return Err(CoreError::InvalidDefinition {
                    reason: format!("fsm '{}': duplicate state '{}'", self.id, state.name),
                });
            }
        }

        if !self.index.contains_key(&self.initial) {
            return Err(CoreError::UnknownState {
                fsm: self.id.clone(),
                state: self.initial.clone(),
            });
        }

        for state in &self.states {
            for t in &state.transitions {
                if !self.index.contains_key(&t.target) {
                    return Err(CoreError::UnknownState {
                        fsm: self.id.clone(),
                        state: t.target.clone(),
                    });
                }
            }
        }

        self.check_automatic_cycles()
    }

    /// Rejects automatic states whose first transitions chain forever.
    fn check_automatic_cycles(&self) -> Result<(), CoreError> {
        for start in self.states.iter().filter(|s| s.automatic) {
            let mut seen = HashSet::new();
            let mut current = start;
            while let Some(next) = forced_next(current) {
                if !seen.insert(current.name.as_str()) {
                    return Err(CoreError::AutomaticCycle {
                        fsm: self.id.clone(),
                        state: current.name.clone(),
                    });
                }
                match self.state(next) {
                    Some(state) if state.automatic => current = state,
                    _ => break,
                }
            }
        }
        Ok(())
    }
}

/// Target an automatic state always moves to, if its first transition is unconditional.
fn forced_next(state: &StateDefinition) -> Option<&str> {
    if !state.automatic {
        return None;
    }
    state
        .transitions
        .first()
        .filter(|t| t.is_unconditional() && t.target != state.name)
        .map(|t| t.target.as_str())
}

/// Raw definition document as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionSetRaw {
    pub id: String,

    #[serde(deserialize_with = "deserialize_list")]
    pub initial: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_list")]
    pub preconditions: Vec<String>,

    #[serde(default)]
    pub scratch_fields: BTreeMap<String, String>,

    #[serde(default)]
    pub tests: BTreeMap<String, TransitionInput>,

    #[serde(default)]
    pub actions: BTreeMap<String, Vec<ActionOp>>,

    pub fsms: Vec<FsmDefinition>,
}

/// Validated and indexed definition set.
#[derive(Debug, Clone)]
pub struct DefinitionSet {
    /// Pattern root attribute name.
    pub id: String,

    /// FSMs started when the first event arrives.
    pub initial: Vec<String>,

    pub preconditions: Vec<String>,

    /// Event field -> scratch slot.
    pub scratch_fields: BTreeMap<String, String>,

    tests: BTreeMap<String, TransitionInput>,
    actions: BTreeMap<String, Vec<ActionOp>>,
    fsms: Vec<FsmDefinition>,
    fsm_index: HashMap<String, usize>,

    /// Original raw document.
    pub raw: DefinitionSetRaw,

    /// crc32c of the canonical JSON encoding.
    pub checksum: String,
}

/// Parses YAML through the JSON data model, so tagged enums are written as
/// single-key maps (`{state_change: ...}`) in both formats.
pub(crate) fn from_yaml_str<T: DeserializeOwned>(yaml: &str) -> Result<T, CoreError> {
    let value: serde_json::Value = serde_yaml::from_str(yaml)?;
    Ok(serde_json::from_value(value)?)
}

impl DefinitionSet {
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        Self::from_raw(from_yaml_str(yaml)?)
    }

    pub fn from_json(json: &serde_json::Value) -> Result<Self, CoreError> {
        let raw: DefinitionSetRaw = serde_json::from_value(json.clone())?;
        Self::from_raw(raw)
    }

    /// Loads a `.json` file as JSON and anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let set = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&serde_json::from_str(&content)?)?,
            _ => Self::from_yaml(&content)?,
        };
        tracing::info!(
            "Loaded definition set '{}' from {} ({} fsms, checksum {})",
            set.id,
            path.display(),
            set.fsms.len(),
            set.checksum
        );
        Ok(set)
    }

    pub fn from_raw(raw: DefinitionSetRaw) -> Result<Self, CoreError> {
        if raw.id.trim().is_empty() {
            return Err(CoreError::InvalidDefinition {
                reason: "definition set id must not be empty".to_string(),
            });
        }

        // Tests
        if raw.tests.contains_key(OTHER) {
            return Err(CoreError::InvalidDefinition {
                reason: format!("test id '{}' is reserved", OTHER),
            });
        }
        let mut tests = raw.tests.clone();
        for (id, input) in tests.iter_mut() {
            input.validate(id)?;
        }
        let known_test = |id: &str| -> Result<(), CoreError> {
            if id == OTHER || tests.contains_key(id) {
                Ok(())
            } else {
                Err(CoreError::UnknownTest { id: id.to_string() })
            }
        };
        for id in &raw.preconditions {
            known_test(id)?;
        }

        // FSMs
        let mut fsms = raw.fsms.clone();
        let mut fsm_index = HashMap::new();
        for (i, fsm) in fsms.iter_mut().enumerate() {
            fsm.validate()?;
            if fsm_index.insert(fsm.id.clone(), i).is_some() {
                return Err(CoreError::InvalidDefinition {
                    reason: format!("duplicate fsm '{}'", fsm.id),
                });
            }
        }

        let initial: Vec<String> = raw
            .initial
            .iter()
            .flat_map(|entry| entry.split([',', '|']))
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        if initial.is_empty() {
            return Err(CoreError::InvalidDefinition {
                reason: "no initial fsm".to_string(),
            });
        }
        for id in &initial {
            if !fsm_index.contains_key(id) {
                return Err(CoreError::UnknownFsm { id: id.clone() });
            }
        }

        // Actions
        let mut actions = raw.actions.clone();
        for reserved in [SAVE_SCRATCH_FIELDS, CLEAR_SCRATCH_FIELDS] {
            if actions.contains_key(reserved) {
                return Err(CoreError::InvalidDefinition {
                    reason: format!("action id '{}' is reserved", reserved),
                });
            }
        }
        for (id, ops) in &actions {
            for op in ops {
                op.validate(id, |fsm| fsm_index.contains_key(fsm))?;
            }
        }
        actions.insert(
            SAVE_SCRATCH_FIELDS.to_string(),
            vec![ActionOp::SaveScratchFields],
        );
        actions.insert(
            CLEAR_SCRATCH_FIELDS.to_string(),
            vec![ActionOp::ClearScratchFields],
        );

        // References from transitions
        for fsm in &fsms {
            for id in &fsm.preconditions {
                known_test(id)?;
            }
            for state in &fsm.states {
                for t in &state.transitions {
                    for id in &t.inputs {
                        known_test(id)?;
                    }
                    for id in &t.actions {
                        if !actions.contains_key(id) {
                            return Err(CoreError::UnknownAction { id: id.clone() });
                        }
                    }
                }
            }
        }

        // Compute checksum
        let json_bytes = serde_json::to_vec(&raw)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));

        Ok(Self {
            id: raw.id.clone(),
            initial,
            preconditions: raw.preconditions.clone(),
            scratch_fields: raw.scratch_fields.clone(),
            tests,
            actions,
            fsms,
            fsm_index,
            raw,
            checksum,
        })
    }

    pub fn fsms(&self) -> &[FsmDefinition] {
        &self.fsms
    }

    pub fn fsm(&self, id: &str) -> Option<&FsmDefinition> {
        self.fsm_index(id).map(|i| &self.fsms[i])
    }

    pub fn fsm_index(&self, id: &str) -> Option<usize> {
        self.fsm_index.get(id).copied()
    }

    pub fn test(&self, id: &str) -> Result<&TransitionInput, CoreError> {
        self.tests
            .get(id)
            .ok_or_else(|| CoreError::UnknownTest { id: id.to_string() })
    }

    pub fn tests(&self) -> &BTreeMap<String, TransitionInput> {
        &self.tests
    }

    pub fn action(&self, id: &str) -> Result<&[ActionOp], CoreError> {
        self.actions
            .get(id)
            .map(Vec::as_slice)
            .ok_or_else(|| CoreError::UnknownAction { id: id.to_string() })
    }

    pub fn actions(&self) -> &BTreeMap<String, Vec<ActionOp>> {
        &self.actions
    }

    /// Returns the raw definition as JSON.
    pub fn to_json(&self) -> Result<serde_json::Value, CoreError> {
        Ok(serde_json::to_value(&self.raw)?)
    }
}
