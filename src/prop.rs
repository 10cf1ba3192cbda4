use crate::control::{Control, Part, RebaseMode};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The property part's contents: document metadata keyed by name.
pub type PropMap = BTreeMap<String, Value>;

/// One property operation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropOp {
    /// Bind a property.
    Set(String, Value),
    /// Remove a property; removing an absent property is fine.
    Delete(String),
}

impl PropOp {
    fn name(&self) -> &str {
        match self {
            Self::Set(name, _) | Self::Delete(name) => name,
        }
    }
}

/// An ordered sequence of property operations.
///
/// Composition is last-writer-wins per key and canonicalizes to one op
/// per key in key order.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropDelta {
    ops: Vec<PropOp>,
}

impl PropDelta {
    /// Creates an empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// The ops, in order.
    pub fn ops(&self) -> &[PropOp] {
        &self.ops
    }

    /// Appends a set.
    pub fn set(mut self, name: impl Into<String>, value: Value) -> Self {
        self.ops.push(PropOp::Set(name.into(), value));
        self
    }

    /// Appends a delete.
    pub fn delete(mut self, name: impl Into<String>) -> Self {
        self.ops.push(PropOp::Delete(name.into()));
        self
    }

    /// True for a delta with no ops.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Last-writer-wins composition of `self` then `other`.
    pub fn compose(&self, other: &PropDelta) -> PropDelta {
        let mut effects: BTreeMap<&str, Option<&Value>> = BTreeMap::new();
        for op in self.ops.iter().chain(&other.ops) {
            let effect = match op {
                PropOp::Set(_, value) => Some(value),
                PropOp::Delete(_) => None,
            };
            effects.insert(op.name(), effect);
        }
        let ops = effects
            .into_iter()
            .map(|(name, effect)| match effect {
                Some(value) => PropOp::Set(name.into(), value.clone()),
                None => PropOp::Delete(name.into()),
            })
            .collect();
        PropDelta { ops }
    }

    /// Applies the delta to a property map.
    pub fn apply(&self, map: &PropMap) -> PropMap {
        let mut out = map.clone();
        for op in &self.ops {
            match op {
                PropOp::Set(name, value) => {
                    out.insert(name.clone(), value.clone());
                }
                PropOp::Delete(name) => {
                    out.remove(name);
                }
            }
        }
        out
    }

    /// The delta rewriting `old` into `new`.
    pub fn diff(old: &PropMap, new: &PropMap) -> PropDelta {
        let mut out = PropDelta::new();
        let names: std::collections::BTreeSet<&String> = old.keys().chain(new.keys()).collect();
        for name in names {
            match (old.get(name), new.get(name)) {
                (_, Some(value)) if old.get(name) != new.get(name) => {
                    out = out.set(name.clone(), value.clone());
                }
                (Some(_), None) => out = out.delete(name.clone()),
                _ => {}
            }
        }
        out
    }
}

/// The durable key-value metadata part.
#[derive(Debug)]
pub struct PropPart;

impl Part for PropPart {
    type Delta = PropDelta;
    type Contents = PropMap;

    const NAME: &'static str = "prop";
    const EPHEMERAL: bool = false;
    const REBASE: RebaseMode = RebaseMode::Converge;

    fn empty_contents() -> PropMap {
        PropMap::new()
    }

    fn apply(contents: &PropMap, delta: &PropDelta) -> Result<PropMap> {
        Ok(delta.apply(contents))
    }

    fn compose(a: &PropDelta, b: &PropDelta) -> PropDelta {
        a.compose(b)
    }

    // identity on non-overlapping keys, second argument wins on overlaps
    fn transform(_a: &PropDelta, b: &PropDelta, _a_first: bool) -> PropDelta {
        b.clone()
    }

    fn diff(old: &PropMap, new: &PropMap) -> PropDelta {
        PropDelta::diff(old, new)
    }

    fn is_empty(delta: &PropDelta) -> bool {
        delta.is_empty()
    }

    fn validate(delta: &PropDelta) -> Result<()> {
        for op in delta.ops() {
            if op.name().is_empty() {
                return Err(Error::bad_value("empty property name"));
            }
        }
        Ok(())
    }
}

/// The control over a document's key-value metadata.
pub type PropertyControl = Control<PropPart>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, Value)]) -> PropMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn compose_is_last_writer_wins() {
        let a = PropDelta::new()
            .set("title", json!("one"))
            .delete("stale");
        let b = PropDelta::new()
            .set("title", json!("two"))
            .set("stale", json!(3));
        let composed = a.compose(&b);
        assert_eq!(
            composed.ops(),
            &[
                PropOp::Set("stale".into(), json!(3)),
                PropOp::Set("title".into(), json!("two")),
            ]
        );
    }

    #[test]
    fn compose_matches_sequential_application() {
        let base = map(&[("keep", json!(true)), ("title", json!("zero"))]);
        let a = PropDelta::new().set("title", json!("one")).delete("keep");
        let b = PropDelta::new().set("extra", json!([1, 2]));
        assert_eq!(a.compose(&b).apply(&base), b.apply(&a.apply(&base)));
    }

    #[test]
    fn diff_round_trips() {
        let old = map(&[("a", json!(1)), ("b", json!(2)), ("c", json!(3))]);
        let new = map(&[("a", json!(1)), ("b", json!(20)), ("d", json!(4))]);
        let delta = PropDelta::diff(&old, &new);
        assert_eq!(delta.apply(&old), new);
        assert!(PropDelta::diff(&old, &old).is_empty());
    }

    #[test]
    fn delete_of_absent_key_is_tolerated() {
        let delta = PropDelta::new().delete("ghost");
        assert_eq!(delta.apply(&PropMap::new()), PropMap::new());
    }
}
