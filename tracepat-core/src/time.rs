//! Time conditions: absolute time ranges and elapsed time since a state was entered.

use crate::error::CoreError;
use crate::guard::GuardContext;
use crate::history;
use serde::{Deserialize, Serialize};
use tracepat_state::Value;

/// Duration unit for time conditions.
///
/// Both unit vocabularies found in pattern definitions are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[default]
    #[serde(alias = "nanoseconds")]
    Ns,
    #[serde(alias = "µs", alias = "microseconds")]
    Us,
    #[serde(alias = "milliseconds")]
    Ms,
    #[serde(alias = "sec", alias = "seconds")]
    S,
    #[serde(alias = "minutes")]
    Min,
}

impl TimeUnit {
    pub fn nanos_per_unit(self) -> i64 {
        match self {
            TimeUnit::Ns => 1,
            TimeUnit::Us => 1_000,
            TimeUnit::Ms => 1_000_000,
            TimeUnit::S => 1_000_000_000,
            TimeUnit::Min => 60_000_000_000,
        }
    }

    /// Converts an amount of this unit to nanoseconds, saturating on overflow.
    pub fn to_nanos(self, amount: i64) -> i64 {
        amount.saturating_mul(self.nanos_per_unit())
    }
}

/// Whether a time range condition holds inside or outside the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeMode {
    #[default]
    In,
    Out,
}

/// Event timestamp within (or outside) an absolute window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub begin: i64,
    pub end: i64,
    #[serde(default)]
    pub unit: TimeUnit,
    #[serde(default)]
    pub mode: RangeMode,
}

impl TimeRange {
    pub fn new(begin: i64, end: i64, unit: TimeUnit, mode: RangeMode) -> Self {
        Self {
            begin,
            end,
            unit,
            mode,
        }
    }

    /// Window in nanoseconds, ordered and clamped to `[start, end]`.
    pub fn window(&self, start: i64, end: i64) -> (i64, i64) {
        let mut begin_ns = self.unit.to_nanos(self.begin);
        let mut end_ns = self.unit.to_nanos(self.end);
        if begin_ns > end_ns {
            std::mem::swap(&mut begin_ns, &mut end_ns);
        }
        (begin_ns.max(start), end_ns.min(end))
    }

    pub fn evaluate(&self, ctx: &GuardContext<'_>) -> Result<bool, CoreError> {
        let ts = ctx.event.nanos();
        let (begin, end) = self.window(ctx.store.start_time(), ctx.store.current_end_time());
        let inside = begin <= ts && ts <= end;

        Ok(match self.mode {
            RangeMode::In => inside,
            RangeMode::Out => !inside,
        })
    }
}

/// Comparison applied to an elapsed duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElapsedOp {
    Less,
    Equal,
    More,
}

/// Time since the scenario entered a reference state, compared with a duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElapsedTime {
    /// Reference state name.
    pub since: String,
    pub op: ElapsedOp,
    pub value: i64,
    #[serde(default)]
    pub unit: TimeUnit,
}

impl ElapsedTime {
    pub fn new(since: impl Into<String>, op: ElapsedOp, value: i64, unit: TimeUnit) -> Self {
        Self {
            since: since.into(),
            op,
            value,
            unit,
        }
    }

    pub fn evaluate(&self, ctx: &GuardContext<'_>) -> Result<bool, CoreError> {
        let quark =
            history::state_start_quark(ctx.store, ctx.root, ctx.scenario, &self.since)?;
        let reference = match ctx.store.query_ongoing(quark)? {
            Value::Null => {
                return Err(CoreError::AttributeNotFound {
                    path: format!("start time of state '{}'", self.since),
                })
            }
            value => value.as_i64().ok_or_else(|| CoreError::TypeMismatch {
                left: format!("{} '{}'", value.kind(), value),
                right: "long".to_string(),
            })?,
        };

        let ts = ctx.event.nanos();
        if ts < reference {
            return Err(CoreError::TimeOrdering {
                reference,
                timestamp: ts,
            });
        }

        let elapsed = ts - reference;
        let limit = self.unit.to_nanos(self.value);
        Ok(match self.op {
            ElapsedOp::Less => elapsed < limit,
            ElapsedOp::Equal => elapsed == limit,
            ElapsedOp::More => elapsed > limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, Timestamp};
    use tracepat_state::{MemoryStateStore, StateStore};

    fn store_with_reference(reference: i64) -> (MemoryStateStore, tracepat_state::Quark) {
        let mut store = MemoryStateStore::new(0);
        let root = store.get_or_create_path(&["p"]).unwrap();
        let q = store
            .get_or_create_path(&["p", "scenarios", "f#1", "states", "S1", "start_time"])
            .unwrap();
        store.write(q, reference, Value::Long(reference)).unwrap();
        (store, root)
    }

    #[test]
    fn test_unit_tables() {
        assert_eq!(TimeUnit::Ns.to_nanos(7), 7);
        assert_eq!(TimeUnit::Us.to_nanos(7), 7_000);
        assert_eq!(TimeUnit::Ms.to_nanos(7), 7_000_000);
        assert_eq!(TimeUnit::S.to_nanos(2), 2_000_000_000);
        assert_eq!(TimeUnit::Min.to_nanos(1), 60_000_000_000);
        assert_eq!(TimeUnit::Min.to_nanos(i64::MAX), i64::MAX);

        let units: Vec<TimeUnit> =
            serde_yaml::from_str("[ns, us, µs, ms, s, min, seconds]").unwrap();
        assert_eq!(
            units,
            vec![
                TimeUnit::Ns,
                TimeUnit::Us,
                TimeUnit::Us,
                TimeUnit::Ms,
                TimeUnit::S,
                TimeUnit::Min,
                TimeUnit::S
            ]
        );
    }

    #[test]
    fn test_range_swaps_reversed_bounds() {
        let mut store = MemoryStateStore::new(0);
        store.update_end_time(200);
        let root = store.get_or_create_path(&["p"]).unwrap();
        let event = Event::new(Timestamp::from_nanos(75), "e");
        let ctx = GuardContext::new(&store, root, "f#1", &event);

        let range = TimeRange::new(100, 50, TimeUnit::Ns, RangeMode::In);
        assert_eq!(range.window(0, 200), (50, 100));
        assert!(range.evaluate(&ctx).unwrap());

        let range = TimeRange::new(100, 50, TimeUnit::Ns, RangeMode::Out);
        assert!(!range.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_range_clamps_to_store_bounds() {
        let range = TimeRange::new(0, 10, TimeUnit::S, RangeMode::In);
        assert_eq!(range.window(500, 900), (500, 900));

        let range = TimeRange::new(1_000, 2_000, TimeUnit::Ns, RangeMode::In);
        let (begin, end) = range.window(0, 500);
        assert!(begin > end);
    }

    #[test]
    fn test_elapsed_more_and_less() {
        let (store, root) = store_with_reference(100);
        let event = Event::new(Timestamp::from_nanos(250), "e");
        let ctx = GuardContext::new(&store, root, "f#1", &event);

        let more = ElapsedTime::new("S1", ElapsedOp::More, 100, TimeUnit::Ns);
        assert!(more.evaluate(&ctx).unwrap());

        let less = ElapsedTime::new("S1", ElapsedOp::Less, 100, TimeUnit::Ns);
        assert!(!less.evaluate(&ctx).unwrap());

        let equal = ElapsedTime::new("S1", ElapsedOp::Equal, 150, TimeUnit::Ns);
        assert!(equal.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_elapsed_before_reference_is_ordering_error() {
        let (store, root) = store_with_reference(300);
        let event = Event::new(Timestamp::from_nanos(250), "e");
        let ctx = GuardContext::new(&store, root, "f#1", &event);

        let cond = ElapsedTime::new("S1", ElapsedOp::More, 1, TimeUnit::Ns);
        let err = cond.evaluate(&ctx).unwrap_err();
        assert!(matches!(
            err,
            CoreError::TimeOrdering {
                reference: 300,
                timestamp: 250
            }
        ));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_elapsed_unknown_state_not_found() {
        let (store, root) = store_with_reference(100);
        let event = Event::new(Timestamp::from_nanos(250), "e");
        let ctx = GuardContext::new(&store, root, "f#1", &event);

        let cond = ElapsedTime::new("S9", ElapsedOp::More, 1, TimeUnit::Ns);
        assert!(cond.evaluate(&ctx).unwrap_err().is_attribute_not_found());
    }
}
