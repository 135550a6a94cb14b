//! # tracepat-core
//!
//! Pattern-matching automaton engine for tracepat.
//!
//! This crate provides:
//! - Declarative pattern definitions (FSMs, transition inputs, actions)
//! - Guard condition evaluation over events and recorded state
//! - First-match transition resolution and ordered action execution
//! - Scenario lifecycle management and per-FSM scheduling
//! - The pattern event handler that drives everything one event at a time

pub mod action;
pub mod attribute;
pub mod definition;
pub mod error;
pub mod event;
pub mod fsm;
pub mod guard;
pub mod handler;
pub mod history;
pub mod input;
pub mod scenario;
pub mod time;
pub mod transition;

pub use action::{ActionOp, SyntheticName};
pub use attribute::{AttributePath, PathSegment, ValueSource};
pub use definition::{DefinitionSet, FsmDefinition, StateDefinition, Transition};
pub use error::CoreError;
pub use event::{Event, EventSink, NoopSink, SyntheticEvent, Timestamp};
pub use fsm::FsmStats;
pub use guard::{CompareOp, Condition, GuardContext, GuardEvaluator};
pub use handler::{HandlerConfig, PatternHandler};
pub use history::{ScenarioHistory, ScenarioRecord};
pub use input::{EventTest, TransitionInput};
pub use scenario::{Scenario, ScenarioId, ScenarioStatus};
pub use time::{ElapsedOp, ElapsedTime, RangeMode, TimeRange, TimeUnit};
pub use tracepat_state::{MemoryStateStore, Quark, StateStore, Value};
