//! Guard condition evaluation.
//!
//! Conditions are boolean trees evaluated against one event and the scenario
//! that receives it. Leaves compare resolved values or check the event time.
//!
//! Besides the structured form, event-test conditions may be written as text:
//!
//! - `$field` - event field (a bare operand is true when the field is non-null)
//! - `@slot` - scratch field of the current scenario
//! - `name`, `ts` - event name, event timestamp (ns)
//! - `query(a/$field/~/b)` - ongoing store value; `$f` segments read event fields,
//!   `~` is the scenario root
//! - `"text"`, `42`, `4.2`, `null` - literals
//! - `==`, `!=`, `>`, `>=`, `<`, `<=` - comparisons
//! - `!expr`, `expr && expr`, `expr || expr`, `(expr)` - logic (`&&` binds tighter)
//!
//! Examples:
//! - `$fd == 3 && @fd != null`
//! - `!($prio > 100) || name == "sched_switch"`

use crate::attribute::{AttributePath, PathSegment, ValueSource};
use crate::error::CoreError;
use crate::event::Event;
use crate::time::{ElapsedTime, TimeRange};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracepat_state::{Quark, StateStore, Value};

/// Comparison operator of a value condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    #[default]
    Eq,
    Ne,
    Ge,
    Gt,
    Le,
    Lt,
}

impl CompareOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Ge => ordering != Ordering::Less,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Lt => ordering == Ordering::Less,
        }
    }
}

/// A condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Not(Box<Condition>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    /// A resolved value compared against a right-hand value.
    Compare {
        left: ValueSource,
        #[serde(default)]
        op: CompareOp,
        right: ValueSource,
    },
    /// Two resolved values, plain equality.
    Equal(ValueSource, ValueSource),
    TimeRange(TimeRange),
    Elapsed(ElapsedTime),
}

/// What a condition is evaluated against.
#[derive(Clone, Copy)]
pub struct GuardContext<'a> {
    pub store: &'a dyn StateStore,
    /// Pattern root attribute.
    pub root: Quark,
    /// Name of the scenario receiving the event.
    pub scenario: &'a str,
    pub event: &'a Event,
}

impl<'a> GuardContext<'a> {
    pub fn new(
        store: &'a dyn StateStore,
        root: Quark,
        scenario: &'a str,
        event: &'a Event,
    ) -> Self {
        Self {
            store,
            root,
            scenario,
            event,
        }
    }
}

impl Condition {
    /// Parses a textual condition.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CoreError::InvalidDefinition {
                reason: "empty condition expression".to_string(),
            });
        }

        let mut parser = Parser::new(s);
        let condition = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos < parser.input.len() {
            return Err(parser.error(format!(
                "unexpected trailing input '{}'",
                &parser.input[parser.pos..]
            )));
        }
        Ok(condition)
    }

    /// Evaluates the condition, short-circuiting AND/OR.
    ///
    /// An unresolved attribute, a type mismatch or a time ordering violation
    /// aborts the whole evaluation.
    pub fn try_evaluate(&self, ctx: &GuardContext<'_>) -> Result<bool, CoreError> {
        match self {
            Condition::Not(inner) => Ok(!inner.try_evaluate(ctx)?),
            Condition::And(children) => {
                for child in children {
                    if !child.try_evaluate(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or(children) => {
                for child in children {
                    if child.try_evaluate(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Compare { left, op, right } => {
                let left = left.resolve(ctx)?;
                let right = right.resolve(ctx)?;
                compare_values(&left, *op, &right)
            }
            Condition::Equal(first, second) => {
                let first = first.resolve(ctx)?;
                let second = second.resolve(ctx)?;
                Ok(first.same_as(&second))
            }
            Condition::TimeRange(range) => range.evaluate(ctx),
            Condition::Elapsed(elapsed) => elapsed.evaluate(ctx),
        }
    }

    /// Visits this condition and all nested ones.
    pub fn walk<'c>(&'c self, visit: &mut impl FnMut(&'c Condition)) {
        visit(self);
        match self {
            Condition::Not(inner) => inner.walk(visit),
            Condition::And(children) | Condition::Or(children) => {
                children.iter().for_each(|c| c.walk(visit))
            }
            _ => {}
        }
    }
}

fn compare_values(left: &Value, op: CompareOp, right: &Value) -> Result<bool, CoreError> {
    if left.is_null() || right.is_null() {
        return Ok(match op {
            CompareOp::Eq => left.same_as(right),
            CompareOp::Ne => !left.same_as(right),
            _ => false,
        });
    }

    let ordering = left
        .compare(right)
        .ok_or_else(|| CoreError::TypeMismatch {
            left: format!("{} '{}'", left.kind(), left),
            right: format!("{} '{}'", right.kind(), right),
        })?;
    Ok(op.holds(ordering))
}

/// Evaluation boundary: errors become `false` and are logged.
pub struct GuardEvaluator;

impl GuardEvaluator {
    /// Evaluates a condition against the context.
    pub fn evaluate(condition: &Condition, ctx: &GuardContext<'_>) -> bool {
        Self::accept(condition.try_evaluate(ctx), ctx)
    }

    /// Evaluates an optional condition (None = always true).
    pub fn evaluate_opt(condition: Option<&Condition>, ctx: &GuardContext<'_>) -> bool {
        condition.map(|c| Self::evaluate(c, ctx)).unwrap_or(true)
    }

    /// Maps an evaluation result to a boolean, logging any error.
    pub fn accept(result: Result<bool, CoreError>, ctx: &GuardContext<'_>) -> bool {
        match result {
            Ok(matched) => matched,
            Err(e) if e.is_attribute_not_found() => {
                tracing::debug!(
                    "Condition treated as false for scenario {} at {}: {}",
                    ctx.scenario,
                    ctx.event.nanos(),
                    e
                );
                false
            }
            Err(e) => {
                tracing::error!(
                    "Condition error for scenario {} on event '{}' at {}: {}",
                    ctx.scenario,
                    ctx.event.name,
                    ctx.event.nanos(),
                    e
                );
                false
            }
        }
    }
}

/// Recursive descent parser for textual conditions.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn error(&self, reason: impl Into<String>) -> CoreError {
        CoreError::InvalidDefinition {
            reason: format!(
                "condition '{}' at offset {}: {}",
                self.input,
                self.pos,
                reason.into()
            ),
        }
    }

    fn parse_expr(&mut self) -> Result<Condition, CoreError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Condition, CoreError> {
        let mut children = vec![self.parse_and()?];
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            children.push(self.parse_and()?);
            self.skip_whitespace();
        }

        Ok(if children.len() == 1 {
            children.remove(0)
        } else {
            Condition::Or(children)
        })
    }

    fn parse_and(&mut self) -> Result<Condition, CoreError> {
        let mut children = vec![self.parse_unary()?];
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            children.push(self.parse_unary()?);
            self.skip_whitespace();
        }

        Ok(if children.len() == 1 {
            children.remove(0)
        } else {
            Condition::And(children)
        })
    }

    fn parse_unary(&mut self) -> Result<Condition, CoreError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Condition::Not(Box::new(inner)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Condition, CoreError> {
        self.skip_whitespace();

        if self.peek_char() == Some('(') {
            self.pos += 1;
            let expr = self.parse_expr()?;
            self.skip_whitespace();
            if self.peek_char() != Some(')') {
                return Err(self.error("expected ')'"));
            }
            self.pos += 1;
            return Ok(expr);
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Condition, CoreError> {
        let left = self.parse_operand()?;
        self.skip_whitespace();

        let op = if self.peek_str("==") {
            Some((CompareOp::Eq, 2))
        } else if self.peek_str("!=") {
            Some((CompareOp::Ne, 2))
        } else if self.peek_str(">=") {
            Some((CompareOp::Ge, 2))
        } else if self.peek_str("<=") {
            Some((CompareOp::Le, 2))
        } else if self.peek_char() == Some('>') {
            Some((CompareOp::Gt, 1))
        } else if self.peek_char() == Some('<') {
            Some((CompareOp::Lt, 1))
        } else {
            None
        };

        match op {
            Some((op, width)) => {
                self.pos += width;
                let right = self.parse_operand()?;
                Ok(Condition::Compare { left, op, right })
            }
            // A bare operand holds when it resolves to a non-null value
            None => Ok(Condition::Compare {
                left,
                op: CompareOp::Ne,
                right: ValueSource::Literal(Value::Null),
            }),
        }
    }

    fn parse_operand(&mut self) -> Result<ValueSource, CoreError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('$') => {
                self.pos += 1;
                Ok(ValueSource::Field(self.parse_ident()?))
            }
            Some('@') => {
                self.pos += 1;
                Ok(ValueSource::Scratch(self.parse_ident()?))
            }
            Some('"') => Ok(ValueSource::Literal(self.parse_string()?)),
            Some(c) if c == '-' || c.is_ascii_digit() => {
                Ok(ValueSource::Literal(self.parse_number()?))
            }
            Some(_) => {
                let word = self.parse_ident()?;
                match word.as_str() {
                    "name" => Ok(ValueSource::EventName),
                    "ts" => Ok(ValueSource::Timestamp),
                    "null" => Ok(ValueSource::Literal(Value::Null)),
                    "query" => Ok(ValueSource::Query(self.parse_query_path()?)),
                    other => Err(self.error(format!("unknown operand '{}'", other))),
                }
            }
            None => Err(self.error("expected operand")),
        }
    }

    fn parse_query_path(&mut self) -> Result<AttributePath, CoreError> {
        self.skip_whitespace();
        if self.peek_char() != Some('(') {
            return Err(self.error("expected '(' after query"));
        }
        self.pos += 1;

        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c == ')' {
                break;
            }
            self.pos += c.len_utf8();
        }
        if self.peek_char() != Some(')') {
            return Err(self.error("unterminated query path"));
        }
        let body = self.input[start..self.pos].trim();
        self.pos += 1;

        if body.is_empty() {
            return Err(self.error("empty query path"));
        }

        let segments = body
            .split('/')
            .map(|segment| {
                let segment = segment.trim();
                if segment.is_empty() {
                    Err(self.error("empty query path segment"))
                } else if segment == "~" {
                    Ok(PathSegment::Scenario)
                } else if let Some(field) = segment.strip_prefix('$') {
                    Ok(PathSegment::Field(field.to_string()))
                } else {
                    Ok(PathSegment::Name(segment.to_string()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AttributePath::new(segments))
    }

    fn parse_ident(&mut self) -> Result<String, CoreError> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' || c == '-' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }

        let ident = &self.input[start..self.pos];
        if ident.is_empty() {
            return Err(self.error("empty identifier"));
        }
        Ok(ident.to_string())
    }

    fn parse_string(&mut self) -> Result<Value, CoreError> {
        self.pos += 1;

        let mut out = String::new();
        let mut chars = self.input[self.pos..].char_indices();
        while let Some((offset, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += offset + 1;
                    return Ok(Value::String(out));
                }
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        out.push(escaped);
                    }
                }
                other => out.push(other),
            }
        }

        Err(self.error("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<Value, CoreError> {
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        self.skip_digits();

        let mut is_float = false;
        if self.peek_char() == Some('.') {
            is_float = true;
            self.pos += 1;
            self.skip_digits();
        }

        let text = &self.input[start..self.pos];
        let invalid = || self.error(format!("invalid number '{}'", text));
        if is_float {
            return text.parse::<f64>().map(Value::Double).map_err(|_| invalid());
        }

        let n = text.parse::<i64>().map_err(|_| invalid())?;
        Ok(match i32::try_from(n) {
            Ok(small) => Value::Int(small),
            Err(_) => Value::Long(n),
        })
    }

    fn skip_digits(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}
