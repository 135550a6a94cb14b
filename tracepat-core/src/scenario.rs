//! Scenario state: one running instance of an FSM.

use crate::history::ScenarioHistory;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Arena key of a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScenarioId(pub u64);

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scenario status.
///
/// Moves only forward: `WaitingStart -> InProgress -> Matched | Abandoned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    /// Created, still in the initial state.
    #[default]
    WaitingStart,
    /// Left the initial state.
    InProgress,
    /// Reached the final state.
    Matched,
    /// Reached the abandon state or was cancelled.
    Abandoned,
}

impl ScenarioStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioStatus::WaitingStart => "waiting_start",
            ScenarioStatus::InProgress => "in_progress",
            ScenarioStatus::Matched => "matched",
            ScenarioStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScenarioStatus::Matched | ScenarioStatus::Abandoned)
    }

    fn rank(self) -> u8 {
        match self {
            ScenarioStatus::WaitingStart => 0,
            ScenarioStatus::InProgress => 1,
            ScenarioStatus::Matched | ScenarioStatus::Abandoned => 2,
        }
    }

    /// Returns true if a scenario may move from `self` to `next`.
    pub fn can_become(self, next: ScenarioStatus) -> bool {
        self == next || (!self.is_terminal() && next.rank() > self.rank())
    }
}

impl fmt::Display for ScenarioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running FSM instance.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub id: ScenarioId,

    /// `<fsm>#<sequence>`, unique per handler.
    pub name: String,

    /// Owning FSM id.
    pub fsm: String,

    /// FSM that spawned this scenario, if any.
    pub parent: Option<String>,

    /// Current state name.
    pub state: String,

    pub status: ScenarioStatus,

    /// Store subtree of this scenario.
    pub history: ScenarioHistory,

    /// Sequence number of the last event handled.
    pub last_event: Option<u64>,

    /// Time the scenario left its initial state (ns).
    pub start_time: Option<i64>,

    /// Time the scenario terminated (ns).
    pub end_time: Option<i64>,
}

impl Scenario {
    pub fn new(
        id: ScenarioId,
        fsm: impl Into<String>,
        sequence: u64,
        initial_state: impl Into<String>,
        parent: Option<String>,
        history: ScenarioHistory,
    ) -> Self {
        let fsm = fsm.into();
        Self {
            id,
            name: format!("{}#{}", fsm, sequence),
            fsm,
            parent,
            state: initial_state.into(),
            status: ScenarioStatus::WaitingStart,
            history,
            last_event: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Returns true until the scenario is matched or abandoned.
    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn is_waiting(&self) -> bool {
        self.status == ScenarioStatus::WaitingStart
    }

    /// Returns true if the scenario has handled at least one event.
    pub fn has_started(&self) -> bool {
        self.last_event.is_some()
    }

    /// Moves the status forward. Backward moves are ignored.
    pub fn set_status(&mut self, next: ScenarioStatus) -> bool {
        if self.status.can_become(next) {
            self.status = next;
            true
        } else {
            tracing::warn!(
                "Scenario {} refused status change {} -> {}",
                self.name,
                self.status,
                next
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracepat_state::{MemoryStateStore, StateStore};

    fn scenario() -> Scenario {
        let mut store = MemoryStateStore::new(0);
        let root = store.get_or_create_path(&["p"]).unwrap();
        let history = ScenarioHistory::open(&mut store, root, "open#3").unwrap();
        Scenario::new(ScenarioId(7), "open", 3, "S0", None, history)
    }

    #[test]
    fn test_scenario_creation() {
        let s = scenario();
        assert_eq!(s.name, "open#3");
        assert_eq!(s.fsm, "open");
        assert_eq!(s.state, "S0");
        assert!(s.is_live());
        assert!(s.is_waiting());
        assert!(!s.has_started());
    }

    #[test]
    fn test_status_only_moves_forward() {
        let mut s = scenario();
        assert!(s.set_status(ScenarioStatus::InProgress));
        assert!(!s.set_status(ScenarioStatus::WaitingStart));
        assert!(s.set_status(ScenarioStatus::Matched));
        assert!(!s.set_status(ScenarioStatus::Abandoned));
        assert!(!s.set_status(ScenarioStatus::InProgress));
        assert_eq!(s.status, ScenarioStatus::Matched);
        assert!(!s.is_live());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(ScenarioStatus::WaitingStart.as_str(), "waiting_start");
        assert_eq!(
            serde_json::to_string(&ScenarioStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert!(ScenarioStatus::Abandoned.is_terminal());
        assert!(ScenarioStatus::WaitingStart.can_become(ScenarioStatus::Abandoned));
    }
}
