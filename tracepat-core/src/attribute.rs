//! Attribute paths and value sources.
//!
//! A value used by a condition or an action comes from a [`ValueSource`]: a
//! literal, a field of the current event, or a query against the state store.
//! Store queries walk an [`AttributePath`] from the pattern root; each segment
//! is a literal name or is computed from the event or from a nested query.

use crate::error::CoreError;
use crate::guard::GuardContext;
use crate::history;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracepat_state::{Quark, Value};

/// One step of an attribute path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathSegment {
    /// A literal attribute name.
    Name(String),
    /// The current event's field value, used as a name.
    Field(String),
    /// The ongoing value of another path, used as a name.
    Query(AttributePath),
    /// The current scenario's attribute root (`scenarios/<scenario>`).
    Scenario,
}

/// A path of segments resolved from the pattern root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributePath(pub Vec<PathSegment>);

impl AttributePath {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }

    /// Shorthand for a path made only of literal names.
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(|n| PathSegment::Name(n.into())).collect())
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    /// Computes the literal names of every segment.
    pub fn resolve_names(&self, ctx: &GuardContext<'_>) -> Result<Vec<String>, CoreError> {
        let mut names = Vec::with_capacity(self.0.len());
        for segment in &self.0 {
            match segment {
                PathSegment::Name(name) => names.push(name.clone()),
                PathSegment::Field(field) => {
                    let value = ctx.event.field(field).ok_or_else(|| missing_field(field))?;
                    names.push(value.as_name().ok_or_else(|| missing_field(field))?);
                }
                PathSegment::Query(path) => {
                    let value = path.query(ctx)?;
                    let name = value.as_name().ok_or_else(|| CoreError::AttributeNotFound {
                        path: format!("{} (null)", path),
                    })?;
                    names.push(name);
                }
                PathSegment::Scenario => {
                    names.push(history::SCENARIOS.to_string());
                    names.push(ctx.scenario.to_string());
                }
            }
        }
        Ok(names)
    }

    /// Resolves the path to an existing attribute.
    pub fn resolve(&self, ctx: &GuardContext<'_>) -> Result<Quark, CoreError> {
        let names = self.resolve_names(ctx)?;
        let segments: Vec<&str> = names.iter().map(String::as_str).collect();
        Ok(ctx.store.quark_relative(ctx.root, &segments)?)
    }

    /// Ongoing value of the attribute the path resolves to.
    pub fn query(&self, ctx: &GuardContext<'_>) -> Result<Value, CoreError> {
        let quark = self.resolve(ctx)?;
        Ok(ctx.store.query_ongoing(quark)?)
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            match segment {
                PathSegment::Name(name) => f.write_str(name)?,
                PathSegment::Field(field) => write!(f, "${{{}}}", field)?,
                PathSegment::Query(path) => write!(f, "[{}]", path)?,
                PathSegment::Scenario => f.write_str("<scenario>")?,
            }
        }
        Ok(())
    }
}

/// Where a value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    Literal(Value),
    /// A field of the current event.
    Field(String),
    EventName,
    /// The current event's timestamp in nanoseconds, as a long.
    Timestamp,
    /// A scratch field saved by the current scenario.
    Scratch(String),
    /// The ongoing value of an attribute.
    Query(AttributePath),
}

impl ValueSource {
    pub fn resolve(&self, ctx: &GuardContext<'_>) -> Result<Value, CoreError> {
        match self {
            ValueSource::Literal(value) => Ok(value.clone()),
            ValueSource::Field(field) => ctx
                .event
                .field(field)
                .cloned()
                .ok_or_else(|| missing_field(field)),
            ValueSource::EventName => Ok(Value::String(ctx.event.name.clone())),
            ValueSource::Timestamp => Ok(Value::Long(ctx.event.nanos())),
            ValueSource::Scratch(slot) => {
                let quark = history::scratch_quark(ctx.store, ctx.root, ctx.scenario, slot)?;
                Ok(ctx.store.query_ongoing(quark)?)
            }
            ValueSource::Query(path) => path.query(ctx),
        }
    }
}

fn missing_field(field: &str) -> CoreError {
    CoreError::AttributeNotFound {
        path: format!("event field '{}'", field),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, Timestamp};
    use tracepat_state::{MemoryStateStore, StateStore};

    fn setup() -> (MemoryStateStore, Quark) {
        let mut store = MemoryStateStore::new(0);
        let root = store.get_or_create_path(&["p"]).unwrap();
        let cpu = store
            .get_or_create_path(&["p", "cpus", "0", "current_thread"])
            .unwrap();
        store.write(cpu, 5, Value::Int(42)).unwrap();
        let status = store
            .get_or_create_path(&["p", "threads", "42", "status"])
            .unwrap();
        store.write(status, 5, Value::from("running")).unwrap();
        (store, root)
    }

    #[test]
    fn test_field_segment() {
        let (store, root) = setup();
        let event = Event::new(Timestamp::from_nanos(10), "sched").with_field("cpu", 0);
        let ctx = GuardContext::new(&store, root, "f#1", &event);

        let path = AttributePath::new(vec![
            PathSegment::Name("cpus".into()),
            PathSegment::Field("cpu".into()),
            PathSegment::Name("current_thread".into()),
        ]);
        assert_eq!(path.query(&ctx).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_nested_query_segment() {
        let (store, root) = setup();
        let event = Event::new(Timestamp::from_nanos(10), "sched").with_field("cpu", 0);
        let ctx = GuardContext::new(&store, root, "f#1", &event);

        let current = AttributePath::new(vec![
            PathSegment::Name("cpus".into()),
            PathSegment::Field("cpu".into()),
            PathSegment::Name("current_thread".into()),
        ]);
        let path = AttributePath::new(vec![
            PathSegment::Name("threads".into()),
            PathSegment::Query(current),
            PathSegment::Name("status".into()),
        ]);
        assert_eq!(path.query(&ctx).unwrap(), Value::from("running"));
    }

    #[test]
    fn test_unresolved_step_is_attribute_not_found() {
        let (store, root) = setup();
        let event = Event::new(Timestamp::from_nanos(10), "sched");
        let ctx = GuardContext::new(&store, root, "f#1", &event);

        let missing_field = AttributePath::new(vec![
            PathSegment::Name("cpus".into()),
            PathSegment::Field("cpu".into()),
        ]);
        assert!(missing_field.query(&ctx).unwrap_err().is_attribute_not_found());

        let missing_name = AttributePath::names(["cpus", "7"]);
        assert!(missing_name.query(&ctx).unwrap_err().is_attribute_not_found());
    }

    #[test]
    fn test_value_sources() {
        let (store, root) = setup();
        let event = Event::new(Timestamp::from_nanos(10), "sched").with_field("prio", 20);
        let ctx = GuardContext::new(&store, root, "f#1", &event);

        assert_eq!(
            ValueSource::Literal(Value::Long(1)).resolve(&ctx).unwrap(),
            Value::Long(1)
        );
        assert_eq!(
            ValueSource::Field("prio".into()).resolve(&ctx).unwrap(),
            Value::Int(20)
        );
        assert_eq!(
            ValueSource::EventName.resolve(&ctx).unwrap(),
            Value::from("sched")
        );
        assert_eq!(
            ValueSource::Timestamp.resolve(&ctx).unwrap(),
            Value::Long(10)
        );
        assert!(ValueSource::Scratch("fd".into())
            .resolve(&ctx)
            .unwrap_err()
            .is_attribute_not_found());
    }

    #[test]
    fn test_path_deserialize() {
        let path: AttributePath = crate::definition::from_yaml_str(
            "- name: threads\n- field: tid\n- query:\n    - name: cpus\n- scenario\n",
        )
        .unwrap();
        assert_eq!(path.segments().len(), 4);
        assert_eq!(path.segments()[3], PathSegment::Scenario);
        assert_eq!(path.to_string(), "threads/${tid}/[cpus]/<scenario>");
    }
}
