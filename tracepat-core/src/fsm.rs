//! Per-FSM scheduling state.

use crate::scenario::ScenarioId;
use serde::Serialize;

/// Runtime bookkeeping for one FSM definition.
#[derive(Debug, Clone, Default)]
pub struct FsmRuntime {
    pub id: String,

    /// Scenarios visible to dispatch passes.
    pub(crate) active: Vec<ScenarioId>,

    /// Scenarios admitted since the last pass of this FSM.
    pub(crate) pending: Vec<ScenarioId>,

    /// Tracked scenarios still in `WaitingStart`.
    pub(crate) waiting: usize,

    /// Last sequence number used in a scenario name.
    pub(crate) sequence: u64,

    pub(crate) matched: u64,
    pub(crate) abandoned: u64,

    /// Admit a new scenario before the next dispatch pass.
    pub(crate) start_next: bool,

    /// Started as an initial FSM of the definition set.
    pub(crate) root: bool,
}

impl FsmRuntime {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Active and pending scenario ids, in admission order.
    pub fn tracked(&self) -> impl Iterator<Item = ScenarioId> + '_ {
        self.active.iter().chain(self.pending.iter()).copied()
    }

    /// Moves pending scenarios into the active list.
    pub(crate) fn merge_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.active.extend(pending);
    }

    pub(crate) fn stats(&self, live: usize) -> FsmStats {
        FsmStats {
            id: self.id.clone(),
            created: self.sequence,
            live,
            waiting: self.waiting,
            matched: self.matched,
            abandoned: self.abandoned,
        }
    }
}

/// Counters reported for an FSM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FsmStats {
    pub id: String,
    /// Scenarios created so far.
    pub created: u64,
    /// Scenarios not yet matched or abandoned.
    pub live: usize,
    pub waiting: usize,
    pub matched: u64,
    pub abandoned: u64,
}
