//! Structural patches over JSON documents.
//!
//! A patch set describes how to turn one document into another. `diff`
//! produces it from two snapshots and `apply_patches` replays it, so the
//! following always holds for any `a` and `b`:
//!
//! ```text
//! let mut doc = a.clone();
//! apply_patches(&mut doc, &diff(&a, &b))?;
//! assert_eq!(doc, b);
//! ```
//!
//! The wire shape (`{op, path, value}` with mixed string/integer path
//! segments) matches what existing logs contain, including the
//! `replace [.., "length"]` form used to truncate arrays.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

/// One step of a path into a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl core::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Key(k) => f.write_str(k),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(value: &str) -> Self {
        Self::Key(value.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(value: usize) -> Self {
        Self::Index(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

/// A single structural change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub op: PatchOp,
    pub path: Vec<PathSegment>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

impl Patch {
    pub fn add(path: Vec<PathSegment>, value: Value) -> Self {
        Self { op: PatchOp::Add, path, value }
    }

    pub fn replace(path: Vec<PathSegment>, value: Value) -> Self {
        Self { op: PatchOp::Replace, path, value }
    }

    pub fn remove(path: Vec<PathSegment>) -> Self {
        Self { op: PatchOp::Remove, path, value: Value::Null }
    }
}

/// Compute the patches that turn `old` into `new`.
///
/// Equal documents produce an empty patch set. Objects are compared key by
/// key, arrays index by index (growth appends, shrinkage removes from the
/// tail), anything else is replaced wholesale.
pub fn diff(old: &Value, new: &Value) -> Vec<Patch> {
    let mut patches = Vec::new();
    let mut path = Vec::new();
    diff_into(old, new, &mut path, &mut patches);
    patches
}

fn diff_into(old: &Value, new: &Value, path: &mut Vec<PathSegment>, out: &mut Vec<Patch>) {
    if old == new {
        return;
    }

    match (old, new) {
        (Value::Object(before), Value::Object(after)) => {
            for (key, prev) in before {
                path.push(PathSegment::Key(key.clone()));
                match after.get(key) {
                    Some(next) => diff_into(prev, next, path, out),
                    None => out.push(Patch::remove(path.clone())),
                }
                path.pop();
            }
            for (key, next) in after {
                if !before.contains_key(key) {
                    path.push(PathSegment::Key(key.clone()));
                    out.push(Patch::add(path.clone(), next.clone()));
                    path.pop();
                }
            }
        }
        (Value::Array(before), Value::Array(after)) => {
            let common = before.len().min(after.len());
            for i in 0..common {
                path.push(PathSegment::Index(i));
                diff_into(&before[i], &after[i], path, out);
                path.pop();
            }
            for (i, next) in after.iter().enumerate().skip(common) {
                path.push(PathSegment::Index(i));
                out.push(Patch::add(path.clone(), next.clone()));
                path.pop();
            }
            for i in (common..before.len()).rev() {
                path.push(PathSegment::Index(i));
                out.push(Patch::remove(path.clone()));
                path.pop();
            }
        }
        _ => out.push(Patch::replace(path.clone(), new.clone())),
    }
}

/// Apply `patches` to `doc` in order.
///
/// Stops at the first patch that does not fit; `doc` may then be partially
/// modified, so callers that need atomicity apply to a copy.
pub fn apply_patches(doc: &mut Value, patches: &[Patch]) -> CoreResult<()> {
    for patch in patches {
        apply_patch(doc, patch)?;
    }
    Ok(())
}

fn apply_patch(doc: &mut Value, patch: &Patch) -> CoreResult<()> {
    let Some((last, parents)) = patch.path.split_last() else {
        *doc = match patch.op {
            PatchOp::Add | PatchOp::Replace => patch.value.clone(),
            PatchOp::Remove => Value::Null,
        };
        return Ok(());
    };

    let mut target = doc;
    for segment in parents {
        target = child_mut(target, segment)
            .ok_or_else(|| CoreError::invalid_path(render_path(&patch.path)))?;
    }

    match target {
        Value::Object(map) => {
            let key = last.to_string();
            match patch.op {
                PatchOp::Add | PatchOp::Replace => {
                    map.insert(key, patch.value.clone());
                }
                PatchOp::Remove => {
                    if map.remove(&key).is_none() {
                        return Err(CoreError::invalid_path(render_path(&patch.path)));
                    }
                }
            }
            Ok(())
        }
        Value::Array(items) => apply_to_array(items, last, patch),
        _ => Err(CoreError::invalid_path(render_path(&patch.path))),
    }
}

fn apply_to_array(items: &mut Vec<Value>, last: &PathSegment, patch: &Patch) -> CoreResult<()> {
    if matches!(last, PathSegment::Key(k) if k == "length") {
        if patch.op != PatchOp::Replace {
            return Err(CoreError::invalid_patch(format!(
                "{:?} on array length at {}",
                patch.op,
                render_path(&patch.path)
            )));
        }
        let len = patch
            .value
            .as_u64()
            .ok_or_else(|| CoreError::invalid_patch("array length must be a non-negative integer"))?;
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= items.len())
            .ok_or_else(|| {
                CoreError::invalid_patch(format!(
                    "array length {len} exceeds {} at {}",
                    items.len(),
                    render_path(&patch.path)
                ))
            })?;
        items.truncate(len);
        return Ok(());
    }

    let index = segment_index(last).ok_or_else(|| CoreError::invalid_path(render_path(&patch.path)))?;
    match patch.op {
        PatchOp::Add if index <= items.len() => items.insert(index, patch.value.clone()),
        PatchOp::Replace if index < items.len() => items[index] = patch.value.clone(),
        PatchOp::Replace if index == items.len() => items.push(patch.value.clone()),
        PatchOp::Remove if index < items.len() => {
            items.remove(index);
        }
        _ => {
            return Err(CoreError::invalid_path(format!(
                "{} (array length {})",
                render_path(&patch.path),
                items.len()
            )));
        }
    }
    Ok(())
}

fn child_mut<'a>(value: &'a mut Value, segment: &PathSegment) -> Option<&'a mut Value> {
    match value {
        Value::Object(map) => map.get_mut(&segment.to_string()),
        Value::Array(items) => items.get_mut(segment_index(segment)?),
        _ => None,
    }
}

fn segment_index(segment: &PathSegment) -> Option<usize> {
    match segment {
        PathSegment::Index(i) => Some(*i),
        PathSegment::Key(k) => k.parse().ok(),
    }
}

fn render_path(path: &[PathSegment]) -> String {
    let parts: Vec<String> = path.iter().map(ToString::to_string).collect();
    format!("/{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn roundtrip(a: &Value, b: &Value) -> Value {
        let mut doc = a.clone();
        apply_patches(&mut doc, &diff(a, b)).unwrap();
        doc
    }

    #[test]
    fn equal_documents_have_no_patches() {
        let doc = json!({"status": "active", "items": [1, 2, 3]});
        assert!(diff(&doc, &doc.clone()).is_empty());
    }

    #[test]
    fn initial_state_diffs_against_empty_object() {
        let patches = diff(&json!({}), &json!({"status": "pending"}));

        assert_eq!(
            patches,
            vec![Patch::add(vec!["status".into()], json!("pending"))]
        );
    }

    #[test]
    fn nested_change_produces_a_single_replace() {
        let patches = diff(
            &json!({"order": {"status": "pending", "total": 10}}),
            &json!({"order": {"status": "active", "total": 10}}),
        );

        assert_eq!(
            patches,
            vec![Patch::replace(vec!["order".into(), "status".into()], json!("active"))]
        );
    }

    #[test]
    fn array_shrink_removes_from_the_tail() {
        let a = json!({"items": [1, 2, 3, 4]});
        let b = json!({"items": [1, 9]});
        let patches = diff(&a, &b);

        assert_eq!(patches.iter().filter(|p| p.op == PatchOp::Remove).count(), 2);
        assert_eq!(roundtrip(&a, &b), b);
    }

    #[test]
    fn wire_shape_uses_lowercase_ops_and_mixed_segments() {
        let patch = Patch::replace(vec!["items".into(), 2.into()], json!("x"));
        let encoded = serde_json::to_value(&patch).unwrap();

        assert_eq!(encoded, json!({"op": "replace", "path": ["items", 2], "value": "x"}));

        let removal: Patch = serde_json::from_value(json!({"op": "remove", "path": ["a"]})).unwrap();
        assert_eq!(removal, Patch::remove(vec!["a".into()]));
    }

    #[test]
    fn array_length_replace_truncates() {
        let mut doc = json!({"items": [1, 2, 3]});
        let patch: Patch =
            serde_json::from_value(json!({"op": "replace", "path": ["items", "length"], "value": 1}))
                .unwrap();

        apply_patches(&mut doc, &[patch]).unwrap();
        assert_eq!(doc, json!({"items": [1]}));
    }

    #[test]
    fn array_length_replace_never_grows() {
        let mut doc = json!({"items": [1]});
        let patch: Patch = serde_json::from_value(
            json!({"op": "replace", "path": ["items", "length"], "value": u64::MAX}),
        )
        .unwrap();

        let err = apply_patches(&mut doc, &[patch]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidPatch(_)));
        assert_eq!(doc, json!({"items": [1]}));
    }

    #[test]
    fn patch_into_missing_parent_fails() {
        let mut doc = json!({});
        let err = apply_patches(
            &mut doc,
            &[Patch::add(vec!["missing".into(), "child".into()], json!(1))],
        )
        .unwrap_err();

        assert!(matches!(err, CoreError::InvalidPath(_)));
    }

    #[test]
    fn removing_a_missing_key_fails() {
        let mut doc = json!({"a": 1});
        assert!(apply_patches(&mut doc, &[Patch::remove(vec!["b".into()])]).is_err());
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            (-1000i64..1000).prop_map(Value::from),
            "[a-z]{0,6}".prop_map(Value::from),
        ];
        leaf.prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-d]{1,2}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn applying_a_diff_reproduces_the_target(a in arb_json(), b in arb_json()) {
            prop_assert_eq!(roundtrip(&a, &b), b);
        }

        #[test]
        fn diff_is_empty_only_for_equal_documents(a in arb_json(), b in arb_json()) {
            prop_assert_eq!(diff(&a, &b).is_empty(), a == b);
        }

        #[test]
        fn chained_diffs_replay_deterministically(
            states in prop::collection::vec(arb_json(), 1..6)
        ) {
            let mut frames = Vec::new();
            let mut prev = json!({});
            for s in &states {
                frames.push(diff(&prev, s));
                prev = s.clone();
            }

            let mut first = json!({});
            let mut second = json!({});
            for patches in &frames {
                apply_patches(&mut first, patches).unwrap();
                apply_patches(&mut second, patches).unwrap();
            }

            prop_assert_eq!(&first, &second);
            prop_assert_eq!(&first, states.last().unwrap());
        }
    }
}
