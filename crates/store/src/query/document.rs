//! Structured document queries (Mongo-style predicates).
//!
//! Supported: implicit equality, `$eq $ne $gt $gte $lt $lte $in $nin $exists
//! $not`, logical `$and $or $nor`, dotted field paths (numeric segments index
//! arrays, other segments map over them), and array membership for equality.

use core::cmp::Ordering;

use serde_json::{Map, Value};

use super::{QueryOptions, SortDirection};
use crate::error::QueryError;

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentQuery {
    filter: Value,
}

impl Default for DocumentQuery {
    fn default() -> Self {
        Self::all()
    }
}

impl DocumentQuery {
    /// Matches every document.
    pub fn all() -> Self {
        Self {
            filter: Value::Object(Map::new()),
        }
    }

    /// A query from its JSON filter; the filter must be an object.
    pub fn new(filter: Value) -> Result<Self, QueryError> {
        if !filter.is_object() {
            return Err(QueryError::invalid_filter("filter must be an object"));
        }
        Ok(Self { filter })
    }

    pub fn filter(&self) -> &Value {
        &self.filter
    }

    pub fn matches(&self, doc: &Value) -> Result<bool, QueryError> {
        matches_filter(doc, &self.filter)
    }

    /// Filter, sort and page `documents`, which must be an array.
    pub fn run(&self, documents: &Value, options: &QueryOptions) -> Result<Value, QueryError> {
        let Value::Array(items) = documents else {
            return Err(QueryError::NotAnArray(type_name(documents)));
        };

        let mut hits = Vec::new();
        for doc in items {
            if self.matches(doc)? {
                hits.push(doc);
            }
        }

        if !options.sort.is_empty() {
            hits.sort_by(|a, b| {
                for key in &options.sort {
                    let left = first_value(a, &key.field);
                    let right = first_value(b, &key.field);
                    let ord = compare_values(left, right);
                    let ord = match key.direction {
                        SortDirection::Ascending => ord,
                        SortDirection::Descending => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        let page = hits
            .into_iter()
            .skip(options.offset)
            .take(options.page_size.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(Value::Array(page))
    }
}

fn matches_filter(doc: &Value, filter: &Value) -> Result<bool, QueryError> {
    let Value::Object(clauses) = filter else {
        return Err(QueryError::invalid_filter(format!(
            "expected an object, got {}",
            type_name(filter)
        )));
    };

    for (key, condition) in clauses {
        let ok = match key.as_str() {
            "$and" => sub_filters(condition, key)?
                .iter()
                .try_fold(true, |acc, f| Ok::<_, QueryError>(acc && matches_filter(doc, f)?))?,
            "$or" => {
                let mut any = false;
                for f in sub_filters(condition, key)? {
                    if matches_filter(doc, f)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for f in sub_filters(condition, key)? {
                    if matches_filter(doc, f)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            op if op.starts_with('$') => {
                return Err(QueryError::invalid_filter(format!("unknown top-level operator {op}")));
            }
            path => matches_condition(&resolve(doc, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sub_filters<'a>(condition: &'a Value, op: &str) -> Result<&'a Vec<Value>, QueryError> {
    condition
        .as_array()
        .ok_or_else(|| QueryError::invalid_filter(format!("{op} expects an array of filters")))
}

fn is_operator_object(condition: &Value) -> bool {
    matches!(condition, Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')))
}

fn matches_condition(values: &[&Value], condition: &Value) -> Result<bool, QueryError> {
    if !is_operator_object(condition) {
        return Ok(equals_any(values, condition));
    }

    let Value::Object(ops) = condition else {
        return Ok(false);
    };
    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => equals_any(values, arg),
            "$ne" => !equals_any(values, arg),
            "$gt" => compares(values, arg, |o| o == Ordering::Greater),
            "$gte" => compares(values, arg, |o| o != Ordering::Less),
            "$lt" => compares(values, arg, |o| o == Ordering::Less),
            "$lte" => compares(values, arg, |o| o != Ordering::Greater),
            "$in" => in_list(values, arg, op)?,
            "$nin" => !in_list(values, arg, op)?,
            "$exists" => {
                let wanted = arg
                    .as_bool()
                    .ok_or_else(|| QueryError::invalid_filter("$exists expects a boolean"))?;
                !values.is_empty() == wanted
            }
            "$not" => !matches_condition(values, arg)?,
            other => return Err(QueryError::invalid_filter(format!("unknown operator {other}"))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Missing fields compare as `null`; arrays match when any element does.
fn equals_any(values: &[&Value], target: &Value) -> bool {
    if values.is_empty() {
        return target.is_null();
    }
    values.iter().any(|v| {
        *v == target || matches!(v, Value::Array(items) if items.iter().any(|i| i == target))
    })
}

fn compares(values: &[&Value], target: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    values.iter().any(|v| {
        let candidates: Vec<&Value> = match v {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        candidates
            .into_iter()
            .any(|c| same_kind(c, target) && accept(compare_values(Some(c), Some(target))))
    })
}

fn in_list(values: &[&Value], list: &Value, op: &str) -> Result<bool, QueryError> {
    let options = list
        .as_array()
        .ok_or_else(|| QueryError::invalid_filter(format!("{op} expects an array")))?;
    Ok(options.iter().any(|o| equals_any(values, o)))
}

fn same_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
    )
}

/// Every value reachable through the dotted `path`.
fn resolve<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![doc];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => next.extend(map.get(segment)),
                Value::Array(items) => match segment.parse::<usize>() {
                    Ok(index) => next.extend(items.get(index)),
                    Err(_) => next.extend(items.iter().filter_map(|item| item.get(segment))),
                },
                _ => {}
            }
        }
        current = next;
    }
    current
}

fn first_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    resolve(doc, path).into_iter().next()
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

/// Total order across JSON values: null < numbers < strings < objects <
/// arrays < booleans, then by value within a kind.
pub(crate) fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }

    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Array(x)), Some(Value::Array(y))) => {
            for (l, r) in x.iter().zip(y) {
                let ord = compare_values(Some(l), Some(r));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Some(Value::Object(x)), Some(Value::Object(y))) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y) {
                let ord = lk.cmp(rk).then_with(|| compare_values(Some(lv), Some(rv)));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn orders() -> Value {
        json!([
            {"id": 1, "status": "active", "total": 30, "tags": ["rush"], "customer": {"tier": "gold"}},
            {"id": 2, "status": "pending", "total": 10, "tags": [], "customer": {"tier": "silver"}},
            {"id": 3, "status": "active", "total": 20, "customer": {"tier": "gold"}},
            {"id": 4, "status": "cancelled", "total": 5, "tags": ["rush", "gift"]}
        ])
    }

    fn ids(result: &Value) -> Vec<i64> {
        result
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["id"].as_i64().unwrap())
            .collect()
    }

    fn run(filter: Value, options: QueryOptions) -> Value {
        DocumentQuery::new(filter).unwrap().run(&orders(), &options).unwrap()
    }

    #[test]
    fn implicit_equality_and_nested_paths() {
        assert_eq!(ids(&run(json!({"status": "active"}), QueryOptions::default())), vec![1, 3]);
        assert_eq!(ids(&run(json!({"customer.tier": "gold"}), QueryOptions::default())), vec![1, 3]);
    }

    #[test]
    fn comparison_and_set_operators() {
        assert_eq!(ids(&run(json!({"total": {"$gte": 20}}), QueryOptions::default())), vec![1, 3]);
        assert_eq!(
            ids(&run(json!({"total": {"$gt": 5, "$lt": 30}}), QueryOptions::default())),
            vec![2, 3]
        );
        assert_eq!(
            ids(&run(json!({"status": {"$in": ["pending", "cancelled"]}}), QueryOptions::default())),
            vec![2, 4]
        );
        assert_eq!(
            ids(&run(json!({"status": {"$nin": ["active"]}}), QueryOptions::default())),
            vec![2, 4]
        );
        assert_eq!(ids(&run(json!({"status": {"$ne": "active"}}), QueryOptions::default())), vec![2, 4]);
    }

    #[test]
    fn arrays_match_by_membership() {
        assert_eq!(ids(&run(json!({"tags": "rush"}), QueryOptions::default())), vec![1, 4]);
    }

    #[test]
    fn exists_and_logical_operators() {
        assert_eq!(ids(&run(json!({"tags": {"$exists": false}}), QueryOptions::default())), vec![3]);
        assert_eq!(
            ids(&run(
                json!({"$or": [{"total": {"$lt": 10}}, {"customer.tier": "silver"}]}),
                QueryOptions::default()
            )),
            vec![2, 4]
        );
        assert_eq!(
            ids(&run(json!({"$nor": [{"status": "active"}]}), QueryOptions::default())),
            vec![2, 4]
        );
        assert_eq!(
            ids(&run(json!({"total": {"$not": {"$gt": 10}}}), QueryOptions::default())),
            vec![2, 4]
        );
    }

    #[test]
    fn sort_skip_and_limit() {
        let options = QueryOptions::default()
            .sort_by("total", SortDirection::Descending)
            .offset(1)
            .page_size(2);
        assert_eq!(ids(&run(json!({}), options)), vec![3, 2]);
    }

    #[test]
    fn sort_puts_missing_fields_first() {
        let options = QueryOptions::default().sort_by("customer.tier", SortDirection::Ascending);
        assert_eq!(ids(&run(json!({}), options)), vec![4, 1, 3, 2]);
    }

    #[test]
    fn non_array_projection_is_an_error() {
        let err = DocumentQuery::all()
            .run(&json!({"a": 1}), &QueryOptions::default())
            .unwrap_err();
        assert_eq!(err, QueryError::NotAnArray("object"));
    }

    #[test]
    fn unknown_operators_are_rejected() {
        let query = DocumentQuery::new(json!({"total": {"$near": 1}})).unwrap();
        assert!(matches!(
            query.run(&orders(), &QueryOptions::default()),
            Err(QueryError::InvalidFilter(_))
        ));
        assert!(DocumentQuery::new(json!([1])).is_err());
    }
}
