//! Actions run on transitions, and their execution.
//!
//! Each action id names an ordered list of [`ActionOp`]s. Operations run
//! strictly in order; a failing operation is logged and the next one still runs.

use crate::attribute::{AttributePath, PathSegment, ValueSource};
use crate::definition::deserialize_list;
use crate::error::CoreError;
use crate::event::{Event, EventSink, SyntheticEvent, Timestamp};
use crate::guard::GuardContext;
use crate::handler::PatternHandler;
use crate::history::ScenarioHistory;
use crate::scenario::ScenarioId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracepat_state::StateStore;

/// Name of an emitted synthetic event, appended to the configured prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyntheticName {
    Literal(String),
    /// A resolved value, rendered as text.
    Value(ValueSource),
}

/// A primitive action operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOp {
    /// Writes a value below the scenario's attribute root.
    StateChange {
        path: AttributePath,
        value: ValueSource,
    },
    /// Copies the configured event fields into the scenario's scratch slots.
    SaveScratchFields,
    /// Nulls the scenario's scratch slots.
    ClearScratchFields,
    /// Emits a synthetic event spanning the scenario so far.
    SyntheticEvent {
        name: SyntheticName,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        fields: BTreeMap<String, ValueSource>,
    },
    /// Starts scenarios of the named FSMs, handing them the current event.
    Spawn {
        #[serde(deserialize_with = "deserialize_list")]
        fsms: Vec<String>,
    },
}

impl ActionOp {
    pub(crate) fn validate(
        &self,
        action: &str,
        known_fsm: impl Fn(&str) -> bool,
    ) -> Result<(), CoreError> {
        match self {
            ActionOp::StateChange { path, .. } => {
                if path.segments().is_empty() {
                    return Err(CoreError::InvalidDefinition {
                        reason: format!("action '{}': state change with an empty path", action),
                    });
                }
                if path
                    .segments()
                    .iter()
                    .any(|s| matches!(s, PathSegment::Scenario))
                {
                    return Err(CoreError::InvalidDefinition {
                        reason: format!(
                            "action '{}': state change paths are already relative to the scenario",
                            action
                        ),
                    });
                }
                Ok(())
            }
            ActionOp::Spawn { fsms } => {
                if fsms.is_empty() {
                    return Err(CoreError::InvalidDefinition {
                        reason: format!("action '{}': spawn without fsms", action),
                    });
                }
                for fsm in fsms {
                    if !known_fsm(fsm) {
                        return Err(CoreError::UnknownFsm { id: fsm.clone() });
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// What an operation needs to know about the scenario running it.
struct ActionScope {
    name: String,
    fsm: String,
    history: ScenarioHistory,
    start_time: Option<i64>,
}

impl<S: StateStore, K: EventSink> PatternHandler<S, K> {
    /// Runs the actions of a transition, in order, for one scenario.
    pub(crate) fn execute_actions(
        &mut self,
        id: ScenarioId,
        action_ids: &[String],
        event: &Event,
        seq: u64,
        depth: usize,
    ) {
        let defs = Arc::clone(&self.defs);
        let Some(scope) = self.scenarios.get(&id).map(|s| ActionScope {
            name: s.name.clone(),
            fsm: s.fsm.clone(),
            history: s.history,
            start_time: s.start_time,
        }) else {
            return;
        };

        for action_id in action_ids {
            let ops = match defs.action(action_id) {
                Ok(ops) => ops,
                Err(e) => {
                    tracing::error!("Scenario {}: {}", scope.name, e);
                    continue;
                }
            };

            for op in ops {
                if let Err(e) = self.execute_op(&scope, op, event, seq, depth) {
                    if e.is_configuration() {
                        tracing::error!(
                            "Action '{}' failed for scenario {}: {}",
                            action_id,
                            scope.name,
                            e
                        );
                    } else {
                        tracing::warn!(
                            "Action '{}' failed for scenario {}: {}",
                            action_id,
                            scope.name,
                            e
                        );
                    }
                }
            }
        }
    }

    fn execute_op(
        &mut self,
        scope: &ActionScope,
        op: &ActionOp,
        event: &Event,
        seq: u64,
        depth: usize,
    ) -> Result<(), CoreError> {
        let ts = event.nanos();

        match op {
            ActionOp::StateChange { path, value } => {
                let (names, value) = {
                    let ctx = GuardContext::new(&self.store, self.root, &scope.name, event);
                    (path.resolve_names(&ctx)?, value.resolve(&ctx)?)
                };
                let segments: Vec<&str> = names.iter().map(String::as_str).collect();
                scope.history.write(&mut self.store, ts, &segments, value)
            }

            ActionOp::SaveScratchFields => {
                let defs = Arc::clone(&self.defs);
                for (field, slot) in &defs.scratch_fields {
                    let Some(value) = event.field(field) else {
                        continue;
                    };
                    if let Err(e) =
                        scope
                            .history
                            .save_scratch(&mut self.store, ts, slot, value.clone())
                    {
                        tracing::warn!(
                            "Scenario {}: saving scratch field '{}' failed: {}",
                            scope.name,
                            slot,
                            e
                        );
                    }
                }
                Ok(())
            }

            ActionOp::ClearScratchFields => {
                let defs = Arc::clone(&self.defs);
                for slot in defs.scratch_fields.values() {
                    if let Err(e) = scope.history.clear_scratch(&mut self.store, ts, slot) {
                        tracing::warn!(
                            "Scenario {}: clearing scratch field '{}' failed: {}",
                            scope.name,
                            slot,
                            e
                        );
                    }
                }
                Ok(())
            }

            ActionOp::SyntheticEvent { name, fields } => {
                let synthetic = self.build_synthetic(scope, name, fields, event)?;
                tracing::debug!(
                    "Scenario {} emits {} [{}, {}]",
                    scope.name,
                    synthetic.name,
                    synthetic.start.to_nanos(),
                    synthetic.end.to_nanos()
                );
                self.sink.emit(synthetic);
                Ok(())
            }

            ActionOp::Spawn { fsms } => {
                for child in fsms {
                    let index = self
                        .defs
                        .fsm_index(child)
                        .ok_or_else(|| CoreError::UnknownFsm { id: child.clone() })?;
                    self.admit(index, Some(scope.fsm.as_str()), Some(event), seq, depth + 1);
                }
                Ok(())
            }
        }
    }

    fn build_synthetic(
        &self,
        scope: &ActionScope,
        name: &SyntheticName,
        fields: &BTreeMap<String, ValueSource>,
        event: &Event,
    ) -> Result<SyntheticEvent, CoreError> {
        let ctx = GuardContext::new(&self.store, self.root, &scope.name, event);

        let suffix = match name {
            SyntheticName::Literal(suffix) => suffix.clone(),
            SyntheticName::Value(source) => source.resolve(&ctx)?.to_string(),
        };

        let mut values = BTreeMap::new();
        for (field, source) in fields {
            match source.resolve(&ctx) {
                Ok(value) if value.is_null() => {}
                Ok(value) => {
                    values.insert(field.clone(), value);
                }
                Err(e) => tracing::warn!(
                    "Scenario {}: synthetic field '{}' skipped: {}",
                    scope.name,
                    field,
                    e
                ),
            }
        }
        for (slot, value) in scope.history.scratch_values(&self.store)? {
            values.entry(slot).or_insert(value);
        }

        Ok(SyntheticEvent {
            name: format!("{}{}", self.config.synthetic_prefix, suffix),
            start: scope
                .start_time
                .map(Timestamp::from_nanos)
                .unwrap_or(event.timestamp),
            end: event.end.unwrap_or(event.timestamp),
            fields: values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_ops_deserialize() {
        let ops: Vec<ActionOp> = crate::definition::from_yaml_str(
            r#"
- state_change:
    path: [{ name: files }, { field: fd }]
    value: { field: file }
- save_scratch_fields
- synthetic_event:
    name: { value: { scratch: kind } }
    fields:
      file: { field: file }
- spawn: { fsms: child }
- clear_scratch_fields
"#,
        )
        .unwrap();

        assert_eq!(ops.len(), 5);
        assert!(matches!(ops[1], ActionOp::SaveScratchFields));
        assert!(matches!(&ops[3], ActionOp::Spawn { fsms } if fsms == &vec!["child".to_string()]));
        assert!(matches!(ops[4], ActionOp::ClearScratchFields));
    }

    #[test]
    fn test_validate() {
        let spawn = ActionOp::Spawn {
            fsms: vec!["child".into()],
        };
        assert!(spawn.validate("a", |id| id == "child").is_ok());
        assert!(matches!(
            spawn.validate("a", |_| false),
            Err(CoreError::UnknownFsm { .. })
        ));

        let scoped = ActionOp::StateChange {
            path: AttributePath::new(vec![PathSegment::Scenario, PathSegment::Name("x".into())]),
            value: ValueSource::EventName,
        };
        assert!(scoped.validate("a", |_| true).is_err());

        let empty = ActionOp::StateChange {
            path: AttributePath::default(),
            value: ValueSource::EventName,
        };
        assert!(empty.validate("a", |_| true).is_err());
    }
}
