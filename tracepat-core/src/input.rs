//! Transition inputs ("tests"): named, reusable guards referenced by transitions.

use crate::definition::deserialize_list;
use crate::error::CoreError;
use crate::guard::{Condition, GuardContext};
use serde::{Deserialize, Serialize};

/// Event-name pattern matching every event.
pub const ANY: &str = "any";
const HASH_ANY: &str = "#any";

/// Input identifier that always passes.
pub const OTHER: &str = "other";

/// A named transition input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionInput {
    /// Event-name match plus an optional condition.
    Event(EventTest),
    /// A time-range or elapsed-time condition.
    Time(Condition),
}

/// Matches the event name against OR-combined patterns, then checks a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTest {
    #[serde(deserialize_with = "deserialize_list")]
    pub names: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    /// Condition in text form, AND-ed with `condition` when the definition is loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}

/// Matches an event name against a pattern.
///
/// `any` and `#any` match everything, `*x*` matches names containing `x`,
/// `x*` names starting with `x`, `*x` names ending with `x`. Anything else
/// must match exactly.
pub fn name_matches(pattern: &str, name: &str) -> bool {
    if pattern == ANY || pattern == HASH_ANY {
        return true;
    }
    if let Some(inner) = pattern.strip_prefix('*').and_then(|p| p.strip_suffix('*')) {
        return name.contains(inner);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return name.starts_with(prefix);
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return name.ends_with(suffix);
    }
    pattern == name
}

impl EventTest {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            condition: None,
            when: None,
        }
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.names.iter().any(|pattern| name_matches(pattern, name))
    }

    /// Folds the textual `when` condition into `condition`.
    pub(crate) fn compile(&mut self) -> Result<(), CoreError> {
        let Some(text) = self.when.take() else {
            return Ok(());
        };
        let parsed = Condition::parse(&text)?;
        self.condition = Some(match self.condition.take() {
            Some(existing) => Condition::And(vec![existing, parsed]),
            None => parsed,
        });
        Ok(())
    }
}

impl TransitionInput {
    pub fn try_evaluate(&self, ctx: &GuardContext<'_>) -> Result<bool, CoreError> {
        match self {
            TransitionInput::Event(test) => {
                if !test.matches_name(&ctx.event.name) {
                    return Ok(false);
                }
                match &test.condition {
                    Some(condition) => condition.try_evaluate(ctx),
                    None => Ok(true),
                }
            }
            TransitionInput::Time(condition) => condition.try_evaluate(ctx),
        }
    }

    /// Checks the input is well formed once loaded.
    pub(crate) fn validate(&mut self, id: &str) -> Result<(), CoreError> {
        match self {
            TransitionInput::Event(test) => {
                if test.names.is_empty() {
                    return Err(CoreError::InvalidDefinition {
                        reason: format!("event test '{}' has no event names", id),
                    });
                }
                test.compile()
            }
            TransitionInput::Time(condition) => {
                let mut non_time = false;
                condition.walk(&mut |c| {
                    if matches!(c, Condition::Compare { .. } | Condition::Equal(..)) {
                        non_time = true;
                    }
                });
                if non_time {
                    return Err(CoreError::InvalidDefinition {
                        reason: format!("time test '{}' contains a value condition", id),
                    });
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, Timestamp};
    use crate::time::{RangeMode, TimeRange, TimeUnit};
    use proptest::prelude::*;
    use tracepat_state::{MemoryStateStore, StateStore};

    #[test]
    fn test_name_patterns() {
        assert!(name_matches("sys_*", "sys_open"));
        assert!(name_matches("sys_*", "sys_"));
        assert!(!name_matches("sys_*", "syscall"));
        assert!(name_matches("*_exit", "sys_exit"));
        assert!(!name_matches("*_exit", "sys_exit_group"));
        assert!(name_matches("*open*", "sys_openat"));
        assert!(name_matches("any", "whatever"));
        assert!(name_matches("#any", ""));
        assert!(name_matches("sched_switch", "sched_switch"));
        assert!(!name_matches("sched_switch", "sched_switch2"));
    }

    #[test]
    fn test_event_test_with_when() {
        let mut input: TransitionInput = crate::definition::from_yaml_str(
            r#"
event:
  names: [sys_open, sys_openat]
  when: "$fd >= 3"
"#,
        )
        .unwrap();
        input.validate("open").unwrap();

        let mut store = MemoryStateStore::new(0);
        let root = store.get_or_create_path(&["p"]).unwrap();

        let hit = Event::new(Timestamp::from_nanos(1), "sys_openat").with_field("fd", 4);
        let ctx = GuardContext::new(&store, root, "f#1", &hit);
        assert!(input.try_evaluate(&ctx).unwrap());

        let low = Event::new(Timestamp::from_nanos(1), "sys_open").with_field("fd", 1);
        let ctx = GuardContext::new(&store, root, "f#1", &low);
        assert!(!input.try_evaluate(&ctx).unwrap());

        // Name mismatch never looks at the condition
        let other = Event::new(Timestamp::from_nanos(1), "sys_close");
        let ctx = GuardContext::new(&store, root, "f#1", &other);
        assert!(!input.try_evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_single_name_string() {
        let input: TransitionInput =
            serde_json::from_value(serde_json::json!({"event": {"names": "sys_*"}})).unwrap();
        match input {
            TransitionInput::Event(test) => assert_eq!(test.names, vec!["sys_*"]),
            _ => panic!("expected event test"),
        }
    }

    #[test]
    fn test_validate_rejects_bad_inputs() {
        let mut empty = TransitionInput::Event(EventTest::new(Vec::<String>::new()));
        assert!(empty.validate("t").is_err());

        let mut bad_when = TransitionInput::Event(EventTest {
            names: vec!["a".into()],
            condition: None,
            when: Some("$fd ==".into()),
        });
        assert!(bad_when.validate("t").is_err());

        let mut mixed = TransitionInput::Time(Condition::And(vec![
            Condition::TimeRange(TimeRange::new(0, 10, TimeUnit::Ns, RangeMode::In)),
            Condition::parse("$fd == 1").unwrap(),
        ]));
        assert!(mixed.validate("t").is_err());
    }

    proptest! {
        #[test]
        fn prop_prefix_pattern_matches_extensions(prefix in "[a-z_]{0,8}", rest in "[a-z_]{0,8}") {
            let pattern = format!("{}*", prefix);
            let name = format!("{}{}", prefix, rest);
            prop_assert!(name_matches(&pattern, &name));
        }

        #[test]
        fn prop_suffix_and_substring(head in "[a-z]{0,6}", mid in "[a-z]{1,6}", tail in "[a-z]{0,6}") {
            let name = format!("{}{}{}", head, mid, tail);
            let contains = format!("*{}*", mid);
            prop_assert!(name_matches(&contains, &name));
            let ends_with = format!("*{}{}", mid, tail);
            prop_assert!(name_matches(&ends_with, &name));
        }

        #[test]
        fn prop_exact_pattern_only_matches_itself(a in "[a-z]{1,8}", b in "[a-z]{1,8}") {
            prop_assume!(a != "any");
            prop_assert_eq!(name_matches(&a, &b), a == b);
        }
    }
}
