use crate::control::{Control, Part, RebaseMode};
use crate::error::{Error, Result};
use crate::text::TextDelta;

/// The durable rich-text part. Contents are documents: deltas composed
/// over the empty base, insert ops only. Body history is never truncated.
#[derive(Debug)]
pub struct BodyPart;

impl Part for BodyPart {
    type Delta = TextDelta;
    type Contents = TextDelta;

    const NAME: &'static str = "body";
    const EPHEMERAL: bool = false;
    const REBASE: RebaseMode = RebaseMode::Transform;

    fn empty_contents() -> TextDelta {
        TextDelta::new()
    }

    fn apply(contents: &TextDelta, delta: &TextDelta) -> Result<TextDelta> {
        if delta.base_len() > contents.target_len() {
            return Err(Error::bad_value(format!(
                "delta consumes {} elements of a {}-element document",
                delta.base_len(),
                contents.target_len()
            )));
        }
        Ok(contents.compose(delta))
    }

    fn compose(a: &TextDelta, b: &TextDelta) -> TextDelta {
        a.compose(b)
    }

    fn transform(a: &TextDelta, b: &TextDelta, a_first: bool) -> TextDelta {
        a.transform(b, a_first)
    }

    fn diff(old: &TextDelta, new: &TextDelta) -> TextDelta {
        old.diff(new)
    }

    fn is_empty(delta: &TextDelta) -> bool {
        delta.is_empty()
    }

    fn validate(delta: &TextDelta) -> Result<()> {
        for op in delta.ops() {
            if op.is_empty() {
                return Err(Error::bad_value("zero-length op in body delta"));
            }
        }
        Ok(())
    }
}

/// The control over a document's authoritative text.
pub type BodyControl = Control<BodyPart>;
