//! Path expressions: pure extraction from a projection.
//!
//! ```text
//! customer.name          field access
//! items[0].sku           index (negative counts from the end)
//! items.sku              maps over arrays, flattening one level
//! lines.*.qty            wildcard over object values
//! $count(items)          aggregates: $count $sum $min $max
//! $                      the projection itself
//! ```
//!
//! A result with one value is returned as that value, several as an array,
//! none as `null`.

use serde_json::{Number, Value};

use crate::error::QueryError;

#[derive(Debug, Clone, PartialEq)]
pub struct PathExpr {
    source: String,
    aggregate: Option<Aggregate>,
    steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aggregate {
    Count,
    Sum,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
enum Selector {
    Field(String),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    selector: Selector,
    indices: Vec<i64>,
}

impl PathExpr {
    pub fn parse(source: &str) -> Result<Self, QueryError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(QueryError::invalid_path(source, "empty expression"));
        }

        let (aggregate, body) = match trimmed.split_once('(') {
            Some((name, rest)) if name.starts_with('$') => {
                let inner = rest
                    .strip_suffix(')')
                    .ok_or_else(|| QueryError::invalid_path(source, "missing closing parenthesis"))?;
                let aggregate = match name {
                    "$count" => Aggregate::Count,
                    "$sum" => Aggregate::Sum,
                    "$min" => Aggregate::Min,
                    "$max" => Aggregate::Max,
                    other => {
                        return Err(QueryError::invalid_path(source, format!("unknown function {other}")));
                    }
                };
                (Some(aggregate), inner.trim())
            }
            _ => (None, trimmed),
        };

        Ok(Self {
            source: source.to_string(),
            aggregate,
            steps: parse_steps(source, body)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, doc: &Value) -> Value {
        let mut sequence = vec![doc];
        for step in &self.steps {
            let mut next = Vec::new();
            for value in &sequence {
                step.select_into(value, &mut next);
            }
            for index in &step.indices {
                next = pick(next, *index);
            }
            sequence = next;
        }

        match self.aggregate {
            None => collapse(&sequence),
            Some(aggregate) => aggregate.apply(&sequence),
        }
    }
}

impl core::str::FromStr for PathExpr {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_steps(source: &str, body: &str) -> Result<Vec<Step>, QueryError> {
    let body = body.strip_prefix("$.").unwrap_or(body);
    if body == "$" {
        return Ok(Vec::new());
    }

    body.split('.').map(|part| parse_step(source, part)).collect()
}

fn parse_step(source: &str, part: &str) -> Result<Step, QueryError> {
    let (name, mut rest) = match part.find('[') {
        Some(at) => (&part[..at], &part[at..]),
        None => (part, ""),
    };
    if name.is_empty() {
        return Err(QueryError::invalid_path(source, "empty path segment"));
    }

    let mut indices = Vec::new();
    while !rest.is_empty() {
        let close = rest
            .find(']')
            .ok_or_else(|| QueryError::invalid_path(source, "unclosed ["))?;
        let index = rest[1..close]
            .trim()
            .parse::<i64>()
            .map_err(|_| QueryError::invalid_path(source, format!("bad index {}", &rest[..=close])))?;
        indices.push(index);
        rest = &rest[close + 1..];
        if !rest.is_empty() && !rest.starts_with('[') {
            return Err(QueryError::invalid_path(source, format!("unexpected {rest}")));
        }
    }

    let selector = match name {
        "*" => Selector::Wildcard,
        field => Selector::Field(field.to_string()),
    };
    Ok(Step { selector, indices })
}

impl Step {
    fn select_into<'a>(&self, value: &'a Value, out: &mut Vec<&'a Value>) {
        match value {
            Value::Array(items) => {
                for item in items {
                    self.select_into(item, out);
                }
            }
            Value::Object(map) => match &self.selector {
                Selector::Field(name) => {
                    if let Some(found) = map.get(name) {
                        push_flat(found, out);
                    }
                }
                Selector::Wildcard => {
                    for found in map.values() {
                        push_flat(found, out);
                    }
                }
            },
            _ => {}
        }
    }
}

fn push_flat<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => out.extend(items.iter()),
        other => out.push(other),
    }
}

fn pick(values: Vec<&Value>, index: i64) -> Vec<&Value> {
    let len = values.len() as i64;
    let at = if index < 0 { len + index } else { index };
    if (0..len).contains(&at) {
        vec![values[at as usize]]
    } else {
        Vec::new()
    }
}

fn collapse(values: &[&Value]) -> Value {
    match values {
        [] => Value::Null,
        [single] => (*single).clone(),
        many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
    }
}

impl Aggregate {
    fn apply(self, values: &[&Value]) -> Value {
        if self == Self::Count {
            return Value::from(values.len());
        }

        let numbers: Vec<&Number> = values
            .iter()
            .filter_map(|v| match v {
                Value::Number(n) => Some(n),
                _ => None,
            })
            .collect();
        if numbers.is_empty() {
            return match self {
                Self::Sum => Value::from(0),
                _ => Value::Null,
            };
        }

        if numbers.iter().all(|n| n.is_i64()) {
            let mut ints = numbers.iter().filter_map(|n| n.as_i64());
            let exact = match self {
                Self::Sum => ints.try_fold(0i64, i64::checked_add).map(Value::from),
                Self::Min => Some(ints.min().map_or(Value::Null, Value::from)),
                Self::Max => Some(ints.max().map_or(Value::Null, Value::from)),
                Self::Count => Some(Value::Null),
            };
            // An overflowing sum falls through to floating point.
            if let Some(value) = exact {
                return value;
            }
        }

        let floats = numbers.iter().filter_map(|n| n.as_f64());
        let result = match self {
            Self::Sum => Some(floats.sum::<f64>()),
            Self::Min => floats.reduce(f64::min),
            Self::Max => floats.reduce(f64::max),
            Self::Count => None,
        };
        result
            .and_then(Number::from_f64)
            .map_or(Value::Null, Value::Number)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc() -> Value {
        json!({
            "customer": {"name": "Acme"},
            "items": [
                {"sku": "A", "qty": 2, "price": 1.5},
                {"sku": "B", "qty": 1, "price": 4.0},
                {"sku": "C", "qty": 5, "price": 0.5}
            ],
            "lines": {"x": {"qty": 1}, "y": {"qty": 3}}
        })
    }

    fn eval(expr: &str) -> Value {
        PathExpr::parse(expr).unwrap().evaluate(&doc())
    }

    #[test]
    fn field_and_index_access() {
        assert_eq!(eval("customer.name"), json!("Acme"));
        assert_eq!(eval("items[0].sku"), json!("A"));
        assert_eq!(eval("items[-1].sku"), json!("C"));
        assert_eq!(eval("items[7]"), Value::Null);
        assert_eq!(eval("missing.field"), Value::Null);
        assert_eq!(eval("$"), doc());
    }

    #[test]
    fn arrays_are_mapped_and_flattened() {
        assert_eq!(eval("items.sku"), json!(["A", "B", "C"]));
        assert_eq!(eval("lines.*.qty"), json!([1, 3]));
        assert_eq!(eval("$.items.qty"), json!([2, 1, 5]));
    }

    #[test]
    fn aggregates() {
        assert_eq!(eval("$count(items)"), json!(3));
        assert_eq!(eval("$sum(items.qty)"), json!(8));
        assert_eq!(eval("$max(items.qty)"), json!(5));
        assert_eq!(eval("$min(items.price)"), json!(0.5));
        assert_eq!(eval("$sum(items.price)"), json!(6.0));
        assert_eq!(eval("$sum(nothing)"), json!(0));
    }

    #[test]
    fn integer_sums_past_i64_fall_back_to_floats() {
        let total = PathExpr::parse("$sum(a)")
            .unwrap()
            .evaluate(&json!({"a": [i64::MAX, 1]}));

        assert_eq!(total, json!(i64::MAX as f64 + 1.0));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for bad in ["", "items[", "items[x]", "a..b", "$avg(items)", "$sum(items"] {
            assert!(PathExpr::parse(bad).is_err(), "{bad} should not parse");
        }
    }
}
