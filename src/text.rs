use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// Attribute map attached to retained or inserted content.
///
/// A `null` value inside a retain's attributes removes the attribute; the
/// null survives composition against retains and is dropped when composed
/// over an insert.
pub type Attrs = BTreeMap<String, Value>;

/// One rich-text operation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextOp {
    /// Keep `n` elements, optionally patching their attributes.
    Retain(u64, Option<Attrs>),
    /// Insert text with optional attributes.
    Insert(String, Option<Attrs>),
    /// Insert a single embedded object (image, rule, …) with optional attributes.
    Embed(Value, Option<Attrs>),
    /// Remove `n` elements.
    Delete(u64),
}

impl TextOp {
    /// The number of document elements this op spans. Text counts unicode
    /// scalar values; an embed counts one.
    pub fn len(&self) -> u64 {
        match self {
            Self::Retain(n, _) | Self::Delete(n) => *n,
            Self::Insert(s, _) => s.chars().count() as u64,
            Self::Embed(..) => 1,
        }
    }

    /// True for a zero-span op.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_insert(&self) -> bool {
        matches!(self, Self::Insert(..) | Self::Embed(..))
    }

    fn is_delete(&self) -> bool {
        matches!(self, Self::Delete(_))
    }

    fn attrs(&self) -> Option<&Attrs> {
        match self {
            Self::Retain(_, attrs) | Self::Insert(_, attrs) | Self::Embed(_, attrs) => {
                attrs.as_ref()
            }
            Self::Delete(_) => None,
        }
    }

    /// The sub-span `[offset, offset + len)` of this op.
    fn slice(&self, offset: u64, len: u64) -> TextOp {
        match self {
            Self::Retain(_, attrs) => Self::Retain(len, attrs.clone()),
            Self::Delete(_) => Self::Delete(len),
            Self::Insert(s, attrs) => Self::Insert(
                s.chars().skip(offset as usize).take(len as usize).collect(),
                attrs.clone(),
            ),
            Self::Embed(value, attrs) => Self::Embed(value.clone(), attrs.clone()),
        }
    }
}

fn normalize_attrs(attrs: Option<Attrs>) -> Option<Attrs> {
    attrs.filter(|a| !a.is_empty())
}

/// Merge `b` over `a`. `keep_null` preserves removal markers, which is
/// only meaningful when the result lands on a retain.
fn compose_attrs(a: Option<&Attrs>, b: Option<&Attrs>, keep_null: bool) -> Option<Attrs> {
    let mut out = a.cloned().unwrap_or_default();
    if let Some(b) = b {
        for (key, value) in b {
            out.insert(key.clone(), value.clone());
        }
    }
    if !keep_null {
        out.retain(|_, value| !value.is_null());
    }
    normalize_attrs(Some(out))
}

/// Rebase `b`'s attributes to apply after `a`'s. When `a_first`, `a` wins
/// conflicting keys; otherwise `b` is preserved wholesale.
fn transform_attrs(a: Option<&Attrs>, b: Option<&Attrs>, a_first: bool) -> Option<Attrs> {
    let (Some(a), Some(b)) = (a, b) else {
        return normalize_attrs(b.cloned());
    };
    if !a_first {
        return normalize_attrs(Some(b.clone()));
    }
    let out: Attrs = b
        .iter()
        .filter(|(key, _)| !a.contains_key(*key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    normalize_attrs(Some(out))
}

/// The patch that rewrites attribute set `a` into `b`.
fn diff_attrs(a: Option<&Attrs>, b: Option<&Attrs>) -> Option<Attrs> {
    let empty = Attrs::new();
    let a = a.unwrap_or(&empty);
    let b = b.unwrap_or(&empty);
    let mut out = Attrs::new();
    for key in a.keys().chain(b.keys()) {
        if a.get(key) != b.get(key) {
            out.insert(key.clone(), b.get(key).cloned().unwrap_or(Value::Null));
        }
    }
    normalize_attrs(Some(out))
}

/// An ordered sequence of [`TextOp`]s.
///
/// A delta whose ops are all inserts is a *document*; the body snapshot
/// contents are exactly such deltas, and applying a change means composing
/// it onto the document.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TextDelta {
    ops: SmallVec<[TextOp; 4]>,
}

impl TextDelta {
    /// Creates an empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// The ops, in order.
    pub fn ops(&self) -> &[TextOp] {
        &self.ops
    }

    /// Appends a retain.
    pub fn retain(mut self, n: u64, attrs: Option<Attrs>) -> Self {
        self.push(TextOp::Retain(n, normalize_attrs(attrs)));
        self
    }

    /// Appends a text insert.
    pub fn insert(mut self, text: impl Into<String>, attrs: Option<Attrs>) -> Self {
        self.push(TextOp::Insert(text.into(), normalize_attrs(attrs)));
        self
    }

    /// Appends an embed insert.
    pub fn embed(mut self, value: Value, attrs: Option<Attrs>) -> Self {
        self.push(TextOp::Embed(value, normalize_attrs(attrs)));
        self
    }

    /// Appends a delete.
    pub fn delete(mut self, n: u64) -> Self {
        self.push(TextOp::Delete(n));
        self
    }

    /// True if applying this delta cannot change any document.
    pub fn is_empty(&self) -> bool {
        self.ops
            .iter()
            .all(|op| matches!(op, TextOp::Retain(_, None)))
    }

    /// The length of document this delta consumes.
    pub fn base_len(&self) -> u64 {
        self.ops
            .iter()
            .map(|op| match op {
                TextOp::Retain(n, _) | TextOp::Delete(n) => *n,
                _ => 0,
            })
            .sum()
    }

    /// The length of document this delta produces.
    pub fn target_len(&self) -> u64 {
        self.ops
            .iter()
            .map(|op| match op {
                TextOp::Retain(n, _) => *n,
                TextOp::Delete(_) => 0,
                op => op.len(),
            })
            .sum()
    }

    /// True if every op inserts, i.e. the delta is a document over empty.
    pub fn is_document(&self) -> bool {
        self.ops.iter().all(TextOp::is_insert)
    }

    /// The plain text of a document delta; embeds render as one
    /// object-replacement character.
    pub fn document_text(&self) -> String {
        let mut out = String::new();
        for op in &self.ops {
            match op {
                TextOp::Insert(s, _) => out.push_str(s),
                TextOp::Embed(..) => out.push('\u{fffc}'),
                _ => {}
            }
        }
        out
    }

    fn push(&mut self, op: TextOp) {
        if op.is_empty() {
            return;
        }
        // canonical order: an insert lands before an immediately preceding
        // delete so equal deltas compare equal
        if op.is_insert() {
            if let Some(TextOp::Delete(_)) = self.ops.last() {
                let delete = self.ops.pop().unwrap();
                self.push_merged(op);
                self.ops.push(delete);
                return;
            }
        }
        self.push_merged(op);
    }

    fn push_merged(&mut self, op: TextOp) {
        match (self.ops.last_mut(), op) {
            (Some(TextOp::Delete(a)), TextOp::Delete(b)) => *a += b,
            (Some(TextOp::Retain(a, aa)), TextOp::Retain(b, ref ba)) if aa == ba => *a += b,
            (Some(TextOp::Insert(a, aa)), TextOp::Insert(ref b, ref ba)) if aa == ba => {
                a.push_str(b)
            }
            (_, op) => self.ops.push(op),
        }
    }

    fn chop(mut self) -> Self {
        if let Some(TextOp::Retain(_, None)) = self.ops.last() {
            self.ops.pop();
        }
        self
    }

    /// Sequential application: applying `compose(a, b)` equals applying
    /// `a` and then `b`.
    pub fn compose(&self, other: &TextDelta) -> TextDelta {
        let mut a = OpCursor::new(&self.ops);
        let mut b = OpCursor::new(&other.ops);
        let mut out = TextDelta::new();
        while a.has_next() || b.has_next() {
            if b.peek_is_insert() {
                out.push(b.next(u64::MAX));
            } else if a.peek_is_delete() {
                out.push(a.next(u64::MAX));
            } else {
                let len = a.peek_len().min(b.peek_len());
                let op_a = a.next(len);
                let op_b = b.next(len);
                match op_b {
                    TextOp::Retain(_, ref patch) => {
                        let keep_null = matches!(op_a, TextOp::Retain(..));
                        let attrs = compose_attrs(op_a.attrs(), patch.as_ref(), keep_null);
                        match op_a {
                            TextOp::Retain(..) => out.push(TextOp::Retain(len, attrs)),
                            TextOp::Insert(s, _) => out.push(TextOp::Insert(s, attrs)),
                            TextOp::Embed(value, _) => out.push(TextOp::Embed(value, attrs)),
                            TextOp::Delete(_) => unreachable!("delete consumed above"),
                        }
                    }
                    TextOp::Delete(_) => {
                        if matches!(op_a, TextOp::Retain(..)) {
                            out.push(TextOp::Delete(len));
                        }
                        // op_a inserted content deleted by op_b: cancels
                    }
                    _ => unreachable!("insert consumed above"),
                }
            }
        }
        out.chop()
    }

    /// Rebases `other` to apply after `self`.
    ///
    /// `self_first` breaks ties between inserts at the same position:
    /// when true, `self`'s insert precedes `other`'s.
    pub fn transform(&self, other: &TextDelta, self_first: bool) -> TextDelta {
        let mut a = OpCursor::new(&self.ops);
        let mut b = OpCursor::new(&other.ops);
        let mut out = TextDelta::new();
        while a.has_next() || b.has_next() {
            if a.peek_is_insert() && (self_first || !b.peek_is_insert()) {
                out.push(TextOp::Retain(a.next(u64::MAX).len(), None));
            } else if b.peek_is_insert() {
                out.push(b.next(u64::MAX));
            } else {
                let len = a.peek_len().min(b.peek_len());
                let op_a = a.next(len);
                let op_b = b.next(len);
                if op_a.is_delete() {
                    // content gone; other's op has nothing to act on
                    continue;
                }
                if op_b.is_delete() {
                    out.push(TextOp::Delete(len));
                } else {
                    let attrs = transform_attrs(op_a.attrs(), op_b.attrs(), self_first);
                    out.push(TextOp::Retain(len, attrs));
                }
            }
        }
        out.chop()
    }

    /// A delta `d` with `compose(self, d) == other`. Both operands must be
    /// documents.
    pub fn diff(&self, other: &TextDelta) -> TextDelta {
        let xs = elements(self);
        let ys = elements(other);
        let mut prefix = 0;
        while prefix < xs.len() && prefix < ys.len() && xs[prefix].atom == ys[prefix].atom {
            prefix += 1;
        }
        let mut suffix = 0;
        while suffix < xs.len() - prefix
            && suffix < ys.len() - prefix
            && xs[xs.len() - 1 - suffix].atom == ys[ys.len() - 1 - suffix].atom
        {
            suffix += 1;
        }
        let mut out = TextDelta::new();
        emit_retains(&mut out, &xs[..prefix], &ys[..prefix]);
        out.push(TextOp::Delete((xs.len() - prefix - suffix) as u64));
        emit_inserts(&mut out, &ys[prefix..ys.len() - suffix]);
        emit_retains(&mut out, &xs[xs.len() - suffix..], &ys[ys.len() - suffix..]);
        out.chop()
    }
}

/// One document element: a character or an embed, with its attributes.
struct Element<'a> {
    atom: Atom<'a>,
    attrs: Option<&'a Attrs>,
}

#[derive(PartialEq)]
enum Atom<'a> {
    Char(char),
    Embed(&'a Value),
}

fn elements(doc: &TextDelta) -> Vec<Element<'_>> {
    let mut out = Vec::new();
    for op in doc.ops() {
        match op {
            TextOp::Insert(s, attrs) => {
                for ch in s.chars() {
                    out.push(Element {
                        atom: Atom::Char(ch),
                        attrs: attrs.as_ref(),
                    });
                }
            }
            TextOp::Embed(value, attrs) => out.push(Element {
                atom: Atom::Embed(value),
                attrs: attrs.as_ref(),
            }),
            // non-insert ops cannot occur in a document
            _ => {}
        }
    }
    out
}

fn emit_retains(out: &mut TextDelta, xs: &[Element<'_>], ys: &[Element<'_>]) {
    for (x, y) in xs.iter().zip(ys) {
        out.push(TextOp::Retain(1, diff_attrs(x.attrs, y.attrs)));
    }
}

fn emit_inserts(out: &mut TextDelta, ys: &[Element<'_>]) {
    for y in ys {
        match y.atom {
            Atom::Char(ch) => out.push(TextOp::Insert(ch.into(), y.attrs.cloned())),
            Atom::Embed(value) => out.push(TextOp::Embed(value.clone(), y.attrs.cloned())),
        }
    }
}

/// Walks an op sequence in element-granular steps.
struct OpCursor<'a> {
    ops: &'a [TextOp],
    index: usize,
    offset: u64,
}

impl<'a> OpCursor<'a> {
    fn new(ops: &'a [TextOp]) -> Self {
        Self {
            ops,
            index: 0,
            offset: 0,
        }
    }

    fn has_next(&self) -> bool {
        self.index < self.ops.len()
    }

    fn peek_len(&self) -> u64 {
        match self.ops.get(self.index) {
            Some(op) => op.len() - self.offset,
            None => u64::MAX,
        }
    }

    fn peek_is_insert(&self) -> bool {
        self.ops.get(self.index).is_some_and(TextOp::is_insert)
    }

    fn peek_is_delete(&self) -> bool {
        self.ops.get(self.index).is_some_and(TextOp::is_delete)
    }

    /// Takes up to `n` elements of the current op; past the end of the
    /// sequence an implicit attribute-less retain is produced.
    fn next(&mut self, n: u64) -> TextOp {
        let Some(op) = self.ops.get(self.index) else {
            return TextOp::Retain(n, None);
        };
        let remaining = op.len() - self.offset;
        let take = n.min(remaining);
        let piece = op.slice(self.offset, take);
        if take == remaining {
            self.index += 1;
            self.offset = 0;
        } else {
            self.offset += take;
        }
        piece
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, Value)]) -> Option<Attrs> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    fn doc(text: &str) -> TextDelta {
        TextDelta::new().insert(text, None)
    }

    #[test]
    fn push_merges_and_orders() {
        let delta = TextDelta::new()
            .insert("ab", None)
            .insert("cd", None)
            .delete(1)
            .delete(2)
            .retain(0, None);
        assert_eq!(
            delta.ops(),
            &[TextOp::Insert("abcd".into(), None), TextOp::Delete(3)]
        );
        // insert after delete swaps into canonical order
        let delta = TextDelta::new().delete(2).insert("x", None);
        assert_eq!(
            delta.ops(),
            &[TextOp::Insert("x".into(), None), TextOp::Delete(2)]
        );
    }

    #[test]
    fn compose_applies_sequentially() {
        let a = doc("Hello");
        let b = TextDelta::new().retain(5, None).insert(" World", None);
        assert_eq!(a.compose(&b), doc("Hello World"));

        let strike = TextDelta::new().retain(2, None).delete(2);
        assert_eq!(doc("abcd").compose(&strike), doc("ab"));
    }

    #[test]
    fn compose_cancels_inserted_then_deleted() {
        let a = TextDelta::new().retain(1, None).insert("xy", None);
        let b = TextDelta::new().retain(1, None).delete(2);
        // "xy" never existed as far as the composition is concerned
        assert_eq!(a.compose(&b), TextDelta::new());
    }

    #[test]
    fn compose_attrs_over_insert_drop_nulls() {
        let a = TextDelta::new().insert("hi", attrs(&[("bold", json!(true))]));
        let b = TextDelta::new().retain(
            2,
            attrs(&[("bold", Value::Null), ("href", json!("x"))]),
        );
        assert_eq!(
            a.compose(&b).ops(),
            &[TextOp::Insert("hi".into(), attrs(&[("href", json!("x"))]))]
        );
        // over a retain the null removal marker survives
        let c = TextDelta::new().retain(2, attrs(&[("bold", json!(true))]));
        let d = TextDelta::new().retain(2, attrs(&[("bold", Value::Null)]));
        assert_eq!(
            c.compose(&d).ops(),
            &[TextOp::Retain(2, attrs(&[("bold", Value::Null)]))]
        );
    }

    #[test]
    fn transform_server_wins_position_ties() {
        let server = doc("Hello");
        let client = doc(" World");
        let rebased = server.transform(&client, true);
        assert_eq!(
            rebased.ops(),
            &[TextOp::Retain(5, None), TextOp::Insert(" World".into(), None)]
        );
        assert_eq!(doc("").compose(&server).compose(&rebased), doc("Hello World"));
    }

    #[test]
    fn transform_tiebreak_is_directional() {
        let a = doc("X");
        let b = doc("Y");
        let b_after_a = a.transform(&b, true);
        let a_after_b = b.transform(&a, false);
        assert_eq!(doc("").compose(&a).compose(&b_after_a), doc("XY"));
        assert_eq!(doc("").compose(&b).compose(&a_after_b), doc("XY"));
    }

    #[test]
    fn transform_delete_consumes() {
        let a = TextDelta::new().delete(3);
        let b = TextDelta::new().retain(1, None).insert("x", None).retain(2, None);
        let rebased = a.transform(&b, true);
        assert_eq!(rebased.ops(), &[TextOp::Insert("x".into(), None)]);
    }

    #[test]
    fn transform_attr_priority() {
        let a = TextDelta::new().retain(1, attrs(&[("color", json!("red"))]));
        let b = TextDelta::new().retain(
            1,
            attrs(&[("color", json!("blue")), ("bold", json!(true))]),
        );
        assert_eq!(
            a.transform(&b, true).ops(),
            &[TextOp::Retain(1, attrs(&[("bold", json!(true))]))]
        );
        assert_eq!(a.transform(&b, false), b);
    }

    #[test]
    fn diff_produces_minimal_edges() {
        let x = doc(" World");
        let y = doc("Hello World");
        let d = x.diff(&y);
        assert_eq!(d.ops(), &[TextOp::Insert("Hello".into(), None)]);
        assert_eq!(x.compose(&d), y);
    }

    #[test]
    fn diff_patches_attributes_in_place() {
        let x = TextDelta::new().insert("ab", attrs(&[("bold", json!(true))]));
        let y = TextDelta::new()
            .insert("a", attrs(&[("bold", json!(true))]))
            .insert("b", None);
        let d = x.diff(&y);
        assert_eq!(
            d.ops(),
            &[
                TextOp::Retain(1, None),
                TextOp::Retain(1, attrs(&[("bold", Value::Null)])),
            ]
        );
        assert_eq!(x.compose(&d), y);
    }

    #[test]
    fn diff_round_trips_embeds() {
        let x = doc("ab");
        let y = TextDelta::new()
            .insert("a", None)
            .embed(json!({"image": "u.png"}), None)
            .insert("b", None);
        assert_eq!(x.compose(&x.diff(&y)), y);
        assert_eq!(y.compose(&y.diff(&x)), x);
    }

    #[test]
    fn empty_detection() {
        assert!(TextDelta::new().is_empty());
        assert!(TextDelta::new().retain(7, None).is_empty());
        assert!(!TextDelta::new().delete(1).is_empty());
        assert!(!TextDelta::new().retain(1, attrs(&[("b", json!(1))])).is_empty());
        assert!(!doc("x").is_empty());
    }

    #[test]
    fn lengths() {
        let d = TextDelta::new()
            .retain(2, None)
            .insert("abc", None)
            .delete(1)
            .embed(json!({"hr": true}), None);
        assert_eq!(d.base_len(), 3);
        assert_eq!(d.target_len(), 6);
    }

    #[test]
    fn serde_round_trip() {
        let d = TextDelta::new()
            .retain(1, attrs(&[("bold", json!(true))]))
            .insert("héllo", None)
            .embed(json!({"image": "u.png"}), None)
            .delete(2);
        let bytes = serde_json::to_vec(&d).unwrap();
        let back: TextDelta = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, d);
    }
}
