use std::cmp::Ordering;

use serde_json::Value;

use hearth_core::chain::{Combinator, ConditionDef, ConditionId, GroupId, Operator};

use crate::context::ExecutionContext;

/// A compiled predicate over one context path.
#[derive(Debug, Clone)]
pub struct Condition {
    pub id: ConditionId,
    pub path: String,
    pub operator: Operator,
    pub value: Value,
    pattern: Option<regex::Regex>,
}

impl Condition {
    /// Compile a condition. A `matches` pattern that does not compile makes
    /// the condition always false.
    pub fn new(def: &ConditionDef) -> Self {
        let pattern = match (def.operator, &def.value) {
            (Operator::Matches, Value::String(source)) => match regex::Regex::new(source) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(condition = %def.id, pattern = %source, error = %e, "Invalid match pattern");
                    None
                }
            },
            _ => None,
        };
        Self {
            id: def.id,
            path: def.path.clone(),
            operator: def.operator,
            value: def.value.clone(),
            pattern,
        }
    }

    /// Evaluate against the context. Every operator except `exists` is false
    /// when the path does not resolve.
    pub fn evaluate(&self, context: &ExecutionContext) -> bool {
        let actual = context.resolve(&self.path);
        if self.operator == Operator::Exists {
            return actual.is_some();
        }
        let Some(actual) = actual else {
            return false;
        };

        match self.operator {
            Operator::Equals => values_equal(actual, &self.value),
            Operator::NotEquals => !values_equal(actual, &self.value),
            Operator::Contains => contains(actual, &self.value),
            Operator::NotContains => !contains(actual, &self.value),
            Operator::GreaterThan => compare(actual, &self.value) == Some(Ordering::Greater),
            Operator::GreaterOrEqual => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::LessThan => compare(actual, &self.value) == Some(Ordering::Less),
            Operator::LessOrEqual => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Matches => self
                .pattern
                .as_ref()
                .is_some_and(|re| re.is_match(&render(actual))),
            Operator::Exists => true,
        }
    }
}

/// Conditions combined with AND or OR.
#[derive(Debug, Clone)]
pub struct ConditionGroup {
    pub id: GroupId,
    pub combinator: Combinator,
    pub conditions: Vec<Condition>,
}

impl ConditionGroup {
    /// An empty AND group is true and an empty OR group is false.
    pub fn evaluate(&self, context: &ExecutionContext) -> bool {
        match self.combinator {
            Combinator::And => self.conditions.iter().all(|c| c.evaluate(context)),
            Combinator::Or => self.conditions.iter().any(|c| c.evaluate(context)),
        }
    }
}

/// Evaluate a condition group. Pure: reads the context, never mutates it.
pub fn evaluate(group: &ConditionGroup, context: &ExecutionContext) -> bool {
    group.evaluate(context)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Exact integer view, so large ids never collide through `f64`.
fn as_integer(value: &Value) -> Option<i128> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from)),
        Value::String(s) => s.trim().parse::<i128>().ok(),
        _ => None,
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    if let (Some(a), Some(b)) = (as_integer(actual), as_integer(expected)) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        return a == b;
    }
    if actual.is_string() || expected.is_string() {
        return render(actual) == render(expected);
    }
    false
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(s) => s.contains(render(expected).as_str()),
        Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
        Value::Object(map) => expected.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (as_integer(actual), as_integer(expected)) {
        return Some(a.cmp(&b));
    }
    let a = as_number(actual)?;
    let b = as_number(expected)?;
    a.partial_cmp(&b)
}
