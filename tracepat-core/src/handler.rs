//! Pattern event handler - drives every FSM of a definition set, one event at a time.

use crate::definition::DefinitionSet;
use crate::error::CoreError;
use crate::event::{Event, EventSink};
use crate::fsm::{FsmRuntime, FsmStats};
use crate::guard::{GuardContext, GuardEvaluator};
use crate::history::{ScenarioHistory, ScenarioRecord};
use crate::scenario::{Scenario, ScenarioId, ScenarioStatus};
use crate::transition;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracepat_state::{Quark, StateStore};

/// Handler configuration.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Prefix of every synthetic event name.
    pub synthetic_prefix: String,

    /// Most automatic transitions chained on one event. Defaults to the
    /// number of states of the FSM.
    pub automatic_chain_limit: Option<usize>,

    /// Most nested spawns triggered by one event.
    pub max_spawn_depth: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            synthetic_prefix: "seg_".to_string(),
            automatic_chain_limit: None,
            max_spawn_depth: 16,
        }
    }
}

impl HandlerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_synthetic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.synthetic_prefix = prefix.into();
        self
    }

    pub fn with_automatic_chain_limit(mut self, limit: usize) -> Self {
        self.automatic_chain_limit = Some(limit);
        self
    }

    pub fn with_max_spawn_depth(mut self, depth: usize) -> Self {
        self.max_spawn_depth = depth;
        self
    }
}

/// Runs a definition set over an event stream.
///
/// Events are processed strictly in order; each one goes through every
/// FSM before `on_event` returns. Scenario progress is written to the state
/// store below `<definition id>/scenarios` and synthetic events go to the sink
/// in the order they are produced.
pub struct PatternHandler<S: StateStore, K: EventSink> {
    pub(crate) defs: Arc<DefinitionSet>,
    pub(crate) config: HandlerConfig,
    pub(crate) store: S,
    pub(crate) sink: K,
    pub(crate) root: Quark,

    /// Runtime state, parallel to `defs.fsms()`.
    pub(crate) fsms: Vec<FsmRuntime>,

    /// Scenario arena.
    pub(crate) scenarios: BTreeMap<ScenarioId, Scenario>,

    next_id: u64,
    initialized: bool,
    /// Sequence number of the last event received.
    sequence: u64,
    disposed: bool,
}

impl<S: StateStore, K: EventSink> PatternHandler<S, K> {
    /// Creates a handler writing below the definition set's root attribute.
    pub fn new(
        defs: impl Into<Arc<DefinitionSet>>,
        mut store: S,
        sink: K,
        config: HandlerConfig,
    ) -> Result<Self, CoreError> {
        let defs = defs.into();
        let root = store.get_or_create_path(&[defs.id.as_str()])?;
        let fsms = defs.fsms().iter().map(|f| FsmRuntime::new(&f.id)).collect();

        tracing::info!(
            "Pattern handler '{}' ready: {} fsms, initial {}",
            defs.id,
            defs.fsms().len(),
            defs.initial.join("|")
        );

        Ok(Self {
            defs,
            config,
            store,
            sink,
            root,
            fsms,
            scenarios: BTreeMap::new(),
            next_id: 0,
            initialized: false,
            sequence: 0,
            disposed: false,
        })
    }

    // =========================================================================
    // Event Dispatch
    // =========================================================================

    /// Handles one event.
    ///
    /// Never fails: errors inside a scenario are logged and do not keep the
    /// event from other scenarios or FSMs.
    pub fn on_event(&mut self, event: &Event) {
        if self.disposed {
            tracing::warn!(
                "Event '{}' at {} ignored: handler '{}' is disposed",
                event.name,
                event.nanos(),
                self.defs.id
            );
            return;
        }

        self.sequence += 1;
        let seq = self.sequence;
        self.store.update_end_time(event.nanos());
        tracing::debug!("Event #{} '{}' at {}", seq, event.name, event.nanos());

        if !self.initialized {
            self.initialized = true;
            self.start_initial_fsms(seq);
        }

        for index in 0..self.fsms.len() {
            if std::mem::take(&mut self.fsms[index].start_next) {
                self.admit(index, None, None, seq, 0);
            }
        }

        let defs = Arc::clone(&self.defs);
        if !self.preconditions_pass(&defs.preconditions, "", event) {
            tracing::debug!("Event #{} '{}' rejected by preconditions", seq, event.name);
            return;
        }

        for index in 0..self.fsms.len() {
            self.dispatch(index, event, seq);
        }
    }

    fn start_initial_fsms(&mut self, seq: u64) {
        let defs = Arc::clone(&self.defs);
        for id in &defs.initial {
            match defs.fsm_index(id) {
                Some(index) => {
                    self.fsms[index].root = true;
                    self.admit(index, None, None, seq, 0);
                }
                None => tracing::error!("Initial fsm '{}' is not defined", id),
            }
        }
    }

    /// One dispatch pass of an FSM.
    fn dispatch(&mut self, index: usize, event: &Event, seq: u64) {
        let defs = Arc::clone(&self.defs);
        let def = &defs.fsms()[index];

        self.fsms[index].merge_pending();
        self.retire_terminal(index);

        let ids = self.fsms[index].active.clone();
        for id in ids {
            let name = match self.scenarios.get(&id) {
                Some(s) if s.is_live() && s.last_event != Some(seq) => s.name.clone(),
                _ => continue,
            };
            if !self.preconditions_pass(&def.preconditions, &name, event) {
                continue;
            }
            self.handle_scenario(id, event, seq, 0);
        }
    }

    /// Drops matched and abandoned scenarios from the active list.
    fn retire_terminal(&mut self, index: usize) {
        let scenarios = &mut self.scenarios;
        self.fsms[index].active.retain(|id| {
            let live = scenarios.get(id).is_some_and(Scenario::is_live);
            if !live {
                scenarios.remove(id);
            }
            live
        });
    }

    /// OR of the named inputs; vacuously true when there are none.
    fn preconditions_pass(&self, ids: &[String], scenario: &str, event: &Event) -> bool {
        if ids.is_empty() {
            return true;
        }
        let ctx = GuardContext::new(&self.store, self.root, scenario, event);
        ids.iter().any(|id| match self.defs.test(id) {
            Ok(input) => GuardEvaluator::accept(input.try_evaluate(&ctx), &ctx),
            Err(e) => {
                tracing::error!("Precondition lookup failed: {}", e);
                false
            }
        })
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    fn live_count(&self, index: usize) -> usize {
        self.fsms[index]
            .tracked()
            .filter(|id| self.scenarios.get(id).is_some_and(Scenario::is_live))
            .count()
    }

    /// Schedules a fresh instance of a root FSM once none of its scenarios is live.
    fn restart_if_idle(&mut self, index: usize) {
        if self.fsms[index].root && self.live_count(index) == 0 {
            self.fsms[index].start_next = true;
        }
    }

    /// Creates a scenario of FSM `index` if its policy allows one.
    ///
    /// With a triggering event the new scenario handles it immediately; it
    /// becomes visible to dispatch passes on the FSM's next pass.
    pub(crate) fn admit(
        &mut self,
        index: usize,
        parent: Option<&str>,
        trigger: Option<&Event>,
        seq: u64,
        depth: usize,
    ) -> Option<ScenarioId> {
        let defs = Arc::clone(&self.defs);
        let def = &defs.fsms()[index];

        if depth > self.config.max_spawn_depth {
            tracing::error!(
                "Not starting fsm '{}': spawn depth limit {} reached",
                def.id,
                self.config.max_spawn_depth
            );
            return None;
        }

        let live = self.live_count(index);
        let waiting = self.fsms[index].waiting;
        if live > 0 && !(def.concurrent && waiting == 0) {
            tracing::debug!(
                "Fsm '{}' not admitting: {} live, {} waiting",
                def.id,
                live,
                waiting
            );
            return None;
        }

        let sequence = self.fsms[index].sequence + 1;
        let name = format!("{}#{}", def.id, sequence);
        let ts = trigger
            .map(Event::nanos)
            .unwrap_or_else(|| self.store.current_end_time());

        let history = match ScenarioHistory::open(&mut self.store, self.root, &name) {
            Ok(history) => history,
            Err(e) => {
                tracing::error!("Cannot record scenario {}: {}", name, e);
                return None;
            }
        };
        log_store_failure(&name, history.set_identity(&mut self.store, ts, &def.id, parent));

        self.next_id += 1;
        let id = ScenarioId(self.next_id);
        let scenario = Scenario::new(
            id,
            &def.id,
            sequence,
            &def.initial,
            parent.map(str::to_string),
            history,
        );
        self.scenarios.insert(id, scenario);

        let runtime = &mut self.fsms[index];
        runtime.sequence = sequence;
        runtime.pending.push(id);
        runtime.waiting += 1;

        match parent {
            Some(parent) => tracing::debug!("Scenario {} spawned by fsm '{}'", name, parent),
            None => tracing::debug!("Scenario {} started", name),
        }

        if let Some(event) = trigger {
            self.handle_scenario(id, event, seq, depth);
        }
        Some(id)
    }

    // =========================================================================
    // Scenario Lifecycle
    // =========================================================================

    /// Feeds an event to one scenario, following automatic states.
    fn handle_scenario(&mut self, id: ScenarioId, event: &Event, seq: u64, depth: usize) {
        let mut chained = 0;
        loop {
            match self.step(id, event, seq, depth) {
                Ok(None) => return,
                Ok(Some(limit)) => {
                    chained += 1;
                    if chained > limit {
                        if let Some(s) = self.scenarios.get(&id) {
                            let err = CoreError::AutomaticCycle {
                                fsm: s.fsm.clone(),
                                state: s.state.clone(),
                            };
                            tracing::error!("Scenario {}: {}", s.name, err);
                        }
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!("Scenario {} failed on event #{}: {}", id, seq, e);
                    return;
                }
            }
        }
    }

    /// Runs one transition. Returns the chain limit when the scenario entered
    /// an automatic state and must see the same event again.
    fn step(
        &mut self,
        id: ScenarioId,
        event: &Event,
        seq: u64,
        depth: usize,
    ) -> Result<Option<usize>, CoreError> {
        let defs = Arc::clone(&self.defs);
        let ts = event.nanos();

        let Some(scenario) = self.scenarios.get_mut(&id) else {
            return Ok(None);
        };
        if !scenario.is_live() {
            return Ok(None);
        }
        let index = defs
            .fsm_index(&scenario.fsm)
            .ok_or_else(|| CoreError::UnknownFsm {
                id: scenario.fsm.clone(),
            })?;
        let def = &defs.fsms()[index];
        let name = scenario.name.clone();
        let history = scenario.history;
        let current = scenario.state.clone();
        let first = !scenario.has_started();
        scenario.last_event = Some(seq);

        if first && current == def.initial {
            log_store_failure(
                &name,
                history.set_state(&mut self.store, ts, &current, ScenarioStatus::WaitingStart),
            );
            log_store_failure(&name, history.enter_state(&mut self.store, ts, &current));
        }

        let state = def.state(&current).ok_or_else(|| CoreError::UnknownState {
            fsm: def.id.clone(),
            state: current.clone(),
        })?;
        let resolution = {
            let ctx = GuardContext::new(&self.store, self.root, &name, event);
            transition::resolve(&defs, state, &ctx)
        };
        if !resolution.matched {
            return Ok(None);
        }

        // Actions run before the status changes
        if !resolution.actions.is_empty() {
            self.execute_actions(id, &resolution.actions, event, seq, depth);
        }

        let next = resolution.next_state;
        let changed = next != current;

        let Some(scenario) = self.scenarios.get_mut(&id) else {
            return Ok(None);
        };
        let mut left_initial = false;
        if changed && current == def.initial && scenario.is_waiting() {
            scenario.set_status(ScenarioStatus::InProgress);
            scenario.start_time = Some(ts);
            left_initial = true;
        }
        if def.is_abandon(&next) {
            scenario.set_status(ScenarioStatus::Abandoned);
            scenario.end_time = Some(ts);
        } else if def.is_final(&next) {
            scenario.set_status(ScenarioStatus::Matched);
            scenario.end_time = Some(ts);
        }
        scenario.state = next.clone();
        let status = scenario.status;

        let runtime = &mut self.fsms[index];
        if left_initial {
            runtime.waiting = runtime.waiting.saturating_sub(1);
            if def.concurrent {
                runtime.start_next = true;
            }
        }
        match status {
            ScenarioStatus::Matched => runtime.matched += 1,
            ScenarioStatus::Abandoned => runtime.abandoned += 1,
            _ => {}
        }

        if left_initial {
            log_store_failure(&name, history.set_start_time(&mut self.store, ts));
        }
        if changed {
            log_store_failure(&name, history.enter_state(&mut self.store, ts, &next));
        }
        if status.is_terminal() {
            log_store_failure(&name, history.set_end_time(&mut self.store, ts));
        }
        log_store_failure(&name, history.set_state(&mut self.store, ts, &next, status));

        if status.is_terminal() {
            tracing::debug!("Scenario {} {} in state {} at {}", name, status, next, ts);
            self.restart_if_idle(index);
            return Ok(None);
        }

        let automatic = def.state(&next).is_some_and(|s| s.automatic);
        if changed && automatic {
            let limit = self
                .config
                .automatic_chain_limit
                .unwrap_or(def.states.len());
            return Ok(Some(limit));
        }
        Ok(None)
    }

    /// Abandons a live scenario at the store's current end time.
    ///
    /// Returns false if the scenario is unknown or already terminal.
    pub fn cancel(&mut self, id: ScenarioId) -> bool {
        let ts = self.store.current_end_time();
        let Some(scenario) = self.scenarios.get_mut(&id) else {
            return false;
        };
        if !scenario.is_live() {
            return false;
        }

        let was_waiting = scenario.is_waiting();
        scenario.set_status(ScenarioStatus::Abandoned);
        scenario.end_time = Some(ts);
        let name = scenario.name.clone();
        let state = scenario.state.clone();
        let history = scenario.history;

        if let Some(index) = self.defs.fsm_index(&scenario.fsm) {
            let runtime = &mut self.fsms[index];
            if was_waiting {
                runtime.waiting = runtime.waiting.saturating_sub(1);
            }
            runtime.abandoned += 1;
            self.restart_if_idle(index);
        }

        log_store_failure(&name, history.set_end_time(&mut self.store, ts));
        log_store_failure(
            &name,
            history.set_state(&mut self.store, ts, &state, ScenarioStatus::Abandoned),
        );
        tracing::debug!("Scenario {} cancelled in state {}", name, state);
        true
    }

    /// Cancels every live scenario and stops accepting events.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }

        let ids: Vec<ScenarioId> = self.fsms.iter().flat_map(|f| f.tracked()).collect();
        let cancelled = ids.into_iter().filter(|&id| self.cancel(id)).count();
        self.disposed = true;

        tracing::info!(
            "Pattern handler '{}' disposed after {} events, {} scenarios cancelled",
            self.defs.id,
            self.sequence,
            cancelled
        );
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn definitions(&self) -> &DefinitionSet {
        &self.defs
    }

    /// Pattern root attribute.
    pub fn root(&self) -> Quark {
        self.root
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut K {
        &mut self.sink
    }

    pub fn into_parts(self) -> (S, K) {
        (self.store, self.sink)
    }

    /// Number of events received.
    pub fn events_handled(&self) -> u64 {
        self.sequence
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Tracked scenarios not yet matched or abandoned.
    pub fn live_scenarios(&self) -> Vec<&Scenario> {
        self.fsms
            .iter()
            .flat_map(|f| f.tracked())
            .filter_map(|id| self.scenarios.get(&id))
            .filter(|s| s.is_live())
            .collect()
    }

    pub fn scenario(&self, name: &str) -> Option<&Scenario> {
        self.scenarios.values().find(|s| s.name == name)
    }

    pub fn fsm_stats(&self, id: &str) -> Option<FsmStats> {
        let index = self.defs.fsm_index(id)?;
        Some(self.fsms[index].stats(self.live_count(index)))
    }

    /// Every scenario recorded in the store, terminal ones included.
    pub fn records(&self) -> Result<Vec<ScenarioRecord>, CoreError> {
        ScenarioHistory::list(&self.store, self.root)
    }
}

fn log_store_failure(scenario: &str, result: Result<(), CoreError>) {
    if let Err(e) = result {
        tracing::warn!("Scenario {}: store write failed: {}", scenario, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{SyntheticEvent, Timestamp};
    use tracepat_state::{
        Interval, MemoryStateStore, Quark, SharedStateStore, StateError, Value,
    };

    type TestHandler = PatternHandler<MemoryStateStore, Vec<SyntheticEvent>>;

    const BASIC: &str = r#"
id: p
initial: f
scratch_fields: { x: x }
tests:
  a: { event: { names: A } }
  b: { event: { names: B } }
  c: { event: { names: C } }
fsms:
  - id: f
    initial: S0
    final: S_end
    abandon: S_abandon
    concurrent: CONCURRENT
    states:
      - name: S0
        transitions:
          - { inputs: a, target: S1, save_scratch: true }
      - name: S1
        transitions:
          - { inputs: b, target: S_end }
          - { inputs: c, target: S_abandon }
"#;

    fn handler(yaml: &str) -> TestHandler {
        let defs = DefinitionSet::from_yaml(yaml).unwrap();
        PatternHandler::new(
            defs,
            MemoryStateStore::new(0),
            Vec::new(),
            HandlerConfig::default(),
        )
        .unwrap()
    }

    fn basic(concurrent: bool) -> TestHandler {
        handler(&BASIC.replace("CONCURRENT", if concurrent { "true" } else { "false" }))
    }

    fn ev(ts: i64, name: &str) -> Event {
        Event::new(Timestamp::from_nanos(ts), name)
    }

    fn record(handler: &TestHandler, name: &str) -> ScenarioRecord {
        handler
            .records()
            .unwrap()
            .into_iter()
            .find(|r| r.name == name)
            .unwrap()
    }

    fn history_of(handler: &TestHandler, scenario: &str, attribute: &str) -> Vec<(i64, Value)> {
        let store = handler.store();
        let q = store
            .quark_relative(handler.root(), &["scenarios", scenario, attribute])
            .unwrap();
        store
            .query_history(q)
            .unwrap()
            .into_iter()
            .map(|i| (i.start, i.value))
            .collect()
    }

    fn status_rank(status: &Value) -> u8 {
        match status.as_str() {
            Some("waiting_start") => 0,
            Some("in_progress") => 1,
            Some("matched") | Some("abandoned") => 2,
            other => panic!("unexpected status {:?}", other),
        }
    }

    fn assert_status_monotonic(handler: &TestHandler) {
        for r in handler.records().unwrap() {
            let ranks: Vec<u8> = history_of(handler, &r.name, "status")
                .iter()
                .map(|(_, v)| status_rank(v))
                .collect();
            assert!(
                ranks.windows(2).all(|w| w[0] < w[1]),
                "status of {} went {:?}",
                r.name,
                ranks
            );
        }
    }

    #[test]
    fn test_match_path() {
        let mut h = basic(false);
        h.on_event(&ev(10, "A").with_field("x", 5));
        h.on_event(&ev(20, "B"));

        let records = h.records().unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.name, "f#1");
        assert_eq!(r.status, "matched");
        assert_eq!(r.state, "S_end");
        assert_eq!(r.start_time, Some(10));
        assert_eq!(r.end_time, Some(20));
        assert_eq!(r.scratch.get("x"), Some(&Value::Int(5)));

        let stats = h.fsm_stats("f").unwrap();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.live, 0);

        // A new scenario starts with the next event
        h.on_event(&ev(30, "A").with_field("x", 6));
        let r2 = record(&h, "f#2");
        assert_eq!(r2.status, "in_progress");
        assert_eq!(r2.scratch.get("x"), Some(&Value::Int(6)));
        assert_status_monotonic(&h);
    }

    #[test]
    fn test_abandon_path() {
        let mut h = basic(false);
        h.on_event(&ev(10, "A"));
        h.on_event(&ev(25, "C"));

        let r = record(&h, "f#1");
        assert_eq!(r.status, "abandoned");
        assert_eq!(r.state, "S_abandon");
        assert_eq!(r.end_time, Some(25));
        assert_eq!(h.fsm_stats("f").unwrap().abandoned, 1);
    }

    #[test]
    fn test_non_concurrent_keeps_one_live_scenario() {
        let mut h = basic(false);
        for (ts, name) in [(10, "A"), (20, "A"), (30, "C"), (40, "A"), (50, "A"), (60, "B")] {
            h.on_event(&ev(ts, name));
            assert!(h.live_scenarios().len() <= 1);
        }

        let records = h.records().unwrap();
        let statuses: Vec<&str> = records.iter().map(|r| r.status.as_str()).collect();
        assert_eq!(statuses, vec!["abandoned", "matched"]);
        assert_status_monotonic(&h);
    }

    #[test]
    fn test_concurrent_scenarios() {
        let mut h = basic(true);
        for (ts, name) in [(10, "A"), (20, "A"), (30, "B")] {
            h.on_event(&ev(ts, name));
            let waiting = h.live_scenarios().iter().filter(|s| s.is_waiting()).count();
            assert!(waiting <= 1);
        }

        assert_eq!(record(&h, "f#1").status, "matched");
        assert_eq!(record(&h, "f#2").status, "matched");
        assert_eq!(record(&h, "f#3").status, "waiting_start");

        let stats = h.fsm_stats("f").unwrap();
        assert_eq!(stats.created, 3);
        assert_eq!(stats.matched, 2);
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.live, 1);
        assert_status_monotonic(&h);
    }

    #[test]
    fn test_cancelled_root_scenario_is_replaced() {
        let mut h = basic(false);
        h.on_event(&ev(10, "A"));
        let id = h.scenario("f#1").unwrap().id;
        assert!(h.cancel(id));
        assert!(!h.cancel(id));

        h.on_event(&ev(20, "A"));
        h.on_event(&ev(30, "B"));

        let first = record(&h, "f#1");
        assert_eq!(first.status, "abandoned");
        assert_eq!(first.end_time, Some(10));
        let second = record(&h, "f#2");
        assert_eq!(second.status, "matched");
        assert_eq!(second.start_time, Some(20));
        assert_eq!(second.end_time, Some(30));

        let stats = h.fsm_stats("f").unwrap();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.matched, 1);
        assert_status_monotonic(&h);
    }

    /// Memory store that refuses every write below one scenario.
    struct RejectingStore {
        inner: MemoryStateStore,
        scenario: String,
    }

    impl StateStore for RejectingStore {
        fn quark_relative(&self, base: Quark, segments: &[&str]) -> Result<Quark, StateError> {
            self.inner.quark_relative(base, segments)
        }

        fn quark_relative_or_create(
            &mut self,
            base: Quark,
            segments: &[&str],
        ) -> Result<Quark, StateError> {
            self.inner.quark_relative_or_create(base, segments)
        }

        fn sub_attributes(&self, quark: Quark) -> Result<Vec<Quark>, StateError> {
            self.inner.sub_attributes(quark)
        }

        fn attribute_name(&self, quark: Quark) -> Result<String, StateError> {
            self.inner.attribute_name(quark)
        }

        fn full_path(&self, quark: Quark) -> Result<String, StateError> {
            self.inner.full_path(quark)
        }

        fn write(&mut self, quark: Quark, timestamp: i64, value: Value) -> Result<(), StateError> {
            let path = self.inner.full_path(quark)?;
            if path.split('/').any(|s| s == self.scenario) {
                return Err(StateError::TimeOrdering {
                    path,
                    last: timestamp + 1,
                    attempted: timestamp,
                });
            }
            self.inner.write(quark, timestamp, value)
        }

        fn query_ongoing(&self, quark: Quark) -> Result<Value, StateError> {
            self.inner.query_ongoing(quark)
        }

        fn query_at(&self, quark: Quark, timestamp: i64) -> Result<(Value, i64), StateError> {
            self.inner.query_at(quark, timestamp)
        }

        fn query_history(&self, quark: Quark) -> Result<Vec<Interval>, StateError> {
            self.inner.query_history(quark)
        }

        fn start_time(&self) -> i64 {
            self.inner.start_time()
        }

        fn current_end_time(&self) -> i64 {
            self.inner.current_end_time()
        }

        fn update_end_time(&mut self, timestamp: i64) {
            self.inner.update_end_time(timestamp)
        }
    }

    #[test]
    fn test_store_failure_stays_inside_its_scenario() {
        let defs = DefinitionSet::from_yaml(
            r#"
id: p
initial: "f|g"
tests:
  a: { event: { names: A } }
  b: { event: { names: B } }
fsms:
  - id: f
    initial: S0
    final: S_end
    concurrent: true
    states:
      - name: S0
        transitions: [{ inputs: a, target: S1 }]
      - name: S1
        transitions: [{ inputs: b, target: S_end }]
  - id: g
    initial: S0
    final: S_end
    concurrent: true
    states:
      - name: S0
        transitions: [{ inputs: a, target: S1 }]
      - name: S1
        transitions: [{ inputs: b, target: S_end }]
"#,
        )
        .unwrap();
        let store = RejectingStore {
            inner: MemoryStateStore::new(0),
            scenario: "f#1".to_string(),
        };
        let sink: Vec<SyntheticEvent> = Vec::new();
        let mut h = PatternHandler::new(defs, store, sink, HandlerConfig::default()).unwrap();

        h.on_event(&ev(10, "A"));
        h.on_event(&ev(20, "B"));

        // The refused scenario still advances in memory
        assert_eq!(h.scenario("f#1").unwrap().status, ScenarioStatus::Matched);
        assert_eq!(h.fsm_stats("f").unwrap().matched, 1);

        let records = h.records().unwrap();
        let status_of = |name: &str| {
            records
                .iter()
                .find(|r| r.name == name)
                .map(|r| r.status.clone())
                .unwrap()
        };
        assert_eq!(status_of("f#1"), "");
        assert_eq!(status_of("f#2"), "waiting_start");
        assert_eq!(status_of("g#1"), "matched");
        assert_eq!(status_of("g#2"), "waiting_start");
    }

    #[test]
    fn test_same_stream_same_output() {
        let yaml = r#"
id: p
initial: f
scratch_fields: { fd: fd }
tests:
  open: { event: { names: "sys_open*" } }
  close: { event: { names: sys_close, when: "$fd == @fd" } }
actions:
  segment:
    - synthetic_event: { name: { literal: open }, fields: { closed_by: event_name } }
fsms:
  - id: f
    initial: S0
    final: S_end
    concurrent: true
    states:
      - name: S0
        transitions: [{ inputs: open, target: S1, save_scratch: true }]
      - name: S1
        transitions: [{ inputs: close, target: S_end, actions: [segment], clear_scratch: true }]
"#;
        let stream = vec![
            ev(10, "sys_open").with_field("fd", 3),
            ev(20, "sys_openat").with_field("fd", 4),
            ev(30, "sys_close").with_field("fd", 4),
            ev(40, "sys_close").with_field("fd", 9),
            ev(50, "sys_close").with_field("fd", 3),
        ];

        let run = || {
            let mut h = handler(yaml);
            for event in &stream {
                h.on_event(event);
            }
            let records = h.records().unwrap();
            let (_, sink) = h.into_parts();
            (sink, records)
        };

        let (sink_a, records_a) = run();
        let (sink_b, records_b) = run();
        assert_eq!(sink_a, sink_b);
        assert_eq!(records_a, records_b);

        assert_eq!(sink_a.len(), 2);
        assert_eq!(sink_a[0].name, "seg_open");
        assert_eq!(sink_a[0].start, Timestamp::from_nanos(20));
        assert_eq!(sink_a[0].end, Timestamp::from_nanos(30));
        assert_eq!(sink_a[0].fields.get("fd"), Some(&Value::Int(4)));
        assert_eq!(
            sink_a[0].fields.get("closed_by"),
            Some(&Value::from("sys_close"))
        );
        assert_eq!(sink_a[1].start, Timestamp::from_nanos(10));
        assert_eq!(sink_a[1].fields.get("fd"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_automatic_chaining_uses_event_timestamp() {
        let mut h = handler(
            r#"
id: p
initial: f
tests:
  a: { event: { names: A } }
fsms:
  - id: f
    initial: S0
    states:
      - name: S0
        transitions: [{ inputs: a, target: S1 }]
      - name: S1
        automatic: true
        transitions: [{ inputs: other, target: S2 }]
      - name: S2
"#,
        );
        h.on_event(&ev(10, "A"));

        assert_eq!(h.scenario("f#1").unwrap().state, "S2");
        let states = history_of(&h, "f#1", "state");
        assert_eq!(
            states,
            vec![
                (10, Value::from("S0")),
                (10, Value::from("S1")),
                (10, Value::from("S2")),
            ]
        );
    }

    #[test]
    fn test_automatic_cycle_is_bounded() {
        let mut h = handler(
            r#"
id: p
initial: f
tests:
  go: { event: { names: go } }
  stop: { event: { names: stop } }
fsms:
  - id: f
    initial: S0
    final: S_end
    states:
      - name: S0
        transitions: [{ inputs: go, target: A }]
      - name: A
        automatic: true
        transitions: [{ inputs: stop, target: S_end }, { inputs: go, target: B }]
      - name: B
        automatic: true
        transitions: [{ inputs: stop, target: S_end }, { inputs: go, target: A }]
"#,
        );
        h.on_event(&ev(10, "go"));
        assert_eq!(h.live_scenarios().len(), 1);

        // The handler keeps working after the cycle was cut
        h.on_event(&ev(20, "stop"));
        assert_eq!(record(&h, "f#1").status, "matched");
    }

    #[test]
    fn test_elapsed_time_transition() {
        let mut h = handler(
            r#"
id: p
initial: f
tests:
  a: { event: { names: A } }
  late: { time: { elapsed: { since: S1, op: more, value: 100 } } }
fsms:
  - id: f
    initial: S0
    final: S_end
    states:
      - name: S0
        transitions: [{ inputs: a, target: S1 }]
      - name: S1
        transitions: [{ inputs: late, target: S_end }]
"#,
        );
        h.on_event(&ev(100, "A"));
        h.on_event(&ev(150, "X"));
        assert_eq!(record(&h, "f#1").status, "in_progress");
        h.on_event(&ev(250, "X"));
        assert_eq!(record(&h, "f#1").status, "matched");
    }

    #[test]
    fn test_time_range_transition() {
        let mut h = handler(
            r#"
id: p
initial: f
tests:
  window: { time: { time_range: { begin: 100, end: 50, mode: in } } }
fsms:
  - id: f
    initial: S0
    final: S_end
    states:
      - name: S0
        transitions: [{ inputs: window, target: S_end }]
"#,
        );
        h.on_event(&ev(20, "X"));
        assert_eq!(record(&h, "f#1").status, "waiting_start");
        h.on_event(&ev(75, "X"));
        assert_eq!(record(&h, "f#1").status, "matched");
    }

    #[test]
    fn test_spawned_child_sees_event_once() {
        let mut h = handler(
            r#"
id: p
initial: watch
scratch_fields: { fd: fd }
tests:
  open: { event: { names: open } }
  close: { event: { names: close } }
actions:
  start_child:
    - spawn: { fsms: child }
fsms:
  - id: watch
    initial: idle
    states:
      - name: idle
        transitions: [{ inputs: open, target: idle, actions: [start_child] }]
  - id: child
    initial: S0
    final: S_end
    abandon: S_abandon
    states:
      - name: S0
        transitions: [{ inputs: open, target: S1 }]
      - name: S1
        transitions:
          - { inputs: open, target: S_abandon }
          - { inputs: close, target: S_end }
"#,
        );

        h.on_event(&ev(10, "open"));
        let child = record(&h, "child#1");
        assert_eq!(child.parent.as_deref(), Some("watch"));
        assert_eq!(child.state, "S1");
        assert_eq!(child.status, "in_progress");

        h.on_event(&ev(20, "close"));
        assert_eq!(record(&h, "child#1").status, "matched");

        // Spawned-only FSMs restart only through spawns
        h.on_event(&ev(25, "tick"));
        assert!(h.records().unwrap().iter().all(|r| r.name != "child#2"));

        h.on_event(&ev(30, "open"));
        assert_eq!(record(&h, "child#2").status, "in_progress");
    }

    #[test]
    fn test_concurrent_spawned_fsm_admits_next_instance() {
        let mut h = handler(
            r#"
id: p
initial: watch
tests:
  go: { event: { names: go } }
  a: { event: { names: A } }
  b: { event: { names: B } }
actions:
  start_child:
    - spawn: { fsms: child }
fsms:
  - id: watch
    initial: idle
    states:
      - name: idle
        transitions: [{ inputs: go, target: idle, actions: [start_child] }]
  - id: child
    initial: S0
    final: S_end
    concurrent: true
    states:
      - name: S0
        transitions: [{ inputs: a, target: S1 }]
      - name: S1
        transitions: [{ inputs: b, target: S_end }]
"#,
        );

        for (ts, name) in [(10, "go"), (20, "A"), (30, "A"), (40, "B")] {
            h.on_event(&ev(ts, name));
        }

        assert_eq!(record(&h, "child#1").status, "matched");
        assert_eq!(record(&h, "child#2").status, "matched");
        assert_eq!(record(&h, "child#3").status, "waiting_start");
        assert_eq!(h.fsm_stats("child").unwrap().created, 3);
        assert_status_monotonic(&h);
    }

    #[test]
    fn test_preconditions_gate_dispatch() {
        let mut h = handler(
            r#"
id: p
initial: f
tests:
  syscall: { event: { names: "sys_*" } }
fsms:
  - id: f
    initial: S0
    preconditions: [syscall]
    states:
      - name: S0
        transitions: [{ inputs: other, target: S1 }]
      - name: S1
"#,
        );
        h.on_event(&ev(10, "irq"));
        assert_eq!(h.scenario("f#1").unwrap().state, "S0");
        h.on_event(&ev(20, "sys_read"));
        assert_eq!(h.scenario("f#1").unwrap().state, "S1");
    }

    #[test]
    fn test_failed_operation_does_not_stop_the_next() {
        let mut h = handler(
            r#"
id: p
initial: f
tests:
  a: { event: { names: A } }
actions:
  mark:
    - state_change: { path: [{ name: first }], value: { field: missing } }
    - state_change: { path: [{ name: second }], value: { literal: { int: 1 } } }
fsms:
  - id: f
    initial: S0
    states:
      - name: S0
        transitions: [{ inputs: a, target: S1, actions: [mark] }]
      - name: S1
"#,
        );
        h.on_event(&ev(10, "A"));

        let store = h.store();
        let root = h.root();
        assert!(store
            .quark_relative(root, &["scenarios", "f#1", "first"])
            .is_err());
        let q = store
            .quark_relative(root, &["scenarios", "f#1", "second"])
            .unwrap();
        assert_eq!(store.query_ongoing(q).unwrap(), Value::Int(1));
        assert_eq!(h.scenario("f#1").unwrap().state, "S1");
    }

    #[test]
    fn test_dispose_cancels_live_scenarios() {
        let mut h = basic(true);
        h.on_event(&ev(10, "A"));
        h.on_event(&ev(15, "Z"));
        assert_eq!(h.live_scenarios().len(), 2);

        h.dispose();
        assert!(h.is_disposed());
        assert!(h.live_scenarios().is_empty());

        for r in h.records().unwrap() {
            assert_eq!(r.status, "abandoned");
            assert_eq!(r.end_time, Some(15));
        }
        let stats = h.fsm_stats("f").unwrap();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.abandoned, 2);

        // Events after disposal are ignored
        h.on_event(&ev(20, "B"));
        assert_eq!(h.events_handled(), 2);
        assert_status_monotonic(&h);
    }

    #[test]
    fn test_shared_store_readable_while_handling() {
        let defs = DefinitionSet::from_yaml(&BASIC.replace("CONCURRENT", "false")).unwrap();
        let shared = SharedStateStore::new(MemoryStateStore::new(0));
        let mut h = PatternHandler::new(
            defs,
            shared.clone(),
            crate::event::NoopSink,
            HandlerConfig::new().with_synthetic_prefix("x_"),
        )
        .unwrap();

        h.on_event(&ev(10, "A"));
        let root = h.root();
        let records = ScenarioHistory::list(&*shared.read(), root).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, "S1");
    }
}
