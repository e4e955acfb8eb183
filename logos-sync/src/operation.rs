//! Edit operations and the pairwise transform rules.
//!
//! Positions and lengths count Unicode scalar values (`char`s), never bytes.
//!
//! Boundary policy for mixed insert/delete pairs:
//! - An insert at the start of a concurrent delete range stays before it.
//! - An insert at the end of a concurrent delete range stays after it.
//! - An insert strictly inside a concurrent delete range is absorbed: applied
//!   after the delete it becomes an empty insert; when the delete is applied
//!   after it, the delete grows to cover the inserted text.
//!
//! Both arrival orders therefore remove the same characters, which keeps every
//! replica convergent without splitting a delete into two operations.

use serde::{Deserialize, Serialize};

/// Edit kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Delete => "delete",
        }
    }
}

/// One edit intent submitted by a client.
///
/// `version` is the document version the author saw, not the one it will be
/// assigned. Once applied, the history copy carries the transformed position
/// and content and `version` is rewritten to the version it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Unique per originating client; the idempotency key
    pub id: String,
    pub client_id: String,
    pub user_id: String,
    pub version: u64,
    #[serde(rename = "type")]
    pub kind: OpKind,
    pub position: usize,
    /// Inserted text, or the text being removed
    pub content: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl Operation {
    /// Create an insert authored against `version`.
    pub fn insert(
        id: impl Into<String>,
        client_id: impl Into<String>,
        version: u64,
        position: usize,
        content: impl Into<String>,
    ) -> Self {
        Self::new(id, client_id, version, OpKind::Insert, position, content)
    }

    /// Create a delete of `content` at `position`, authored against `version`.
    pub fn delete(
        id: impl Into<String>,
        client_id: impl Into<String>,
        version: u64,
        position: usize,
        content: impl Into<String>,
    ) -> Self {
        Self::new(id, client_id, version, OpKind::Delete, position, content)
    }

    fn new(
        id: impl Into<String>,
        client_id: impl Into<String>,
        version: u64,
        kind: OpKind,
        position: usize,
        content: impl Into<String>,
    ) -> Self {
        let client_id = client_id.into();
        Self {
            id: id.into(),
            user_id: client_id.clone(),
            client_id,
            version,
            kind,
            position,
            content: content.into(),
            timestamp: crate::now_millis(),
        }
    }

    /// Set the authoring user (defaults to the client id).
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    /// Length of `content` in chars.
    pub fn len(&self) -> usize {
        char_len(&self.content)
    }

    /// An operation that no longer changes the document.
    pub fn is_noop(&self) -> bool {
        self.content.is_empty()
    }

    /// Net change in document length when applied.
    pub fn length_delta(&self) -> i64 {
        match self.kind {
            OpKind::Insert => self.len() as i64,
            OpKind::Delete => -(self.len() as i64),
        }
    }

    /// Exclusive end of the affected range (chars), saturating at `usize::MAX`.
    pub fn end(&self) -> usize {
        self.position.saturating_add(self.len())
    }

    /// Exclusive end of the affected range, `None` if it overflows.
    pub fn checked_end(&self) -> Option<usize> {
        self.position.checked_add(self.len())
    }
}

/// Transform `op` so it applies after `applied`, which was authored concurrently.
pub fn transform(op: &Operation, applied: &Operation) -> Operation {
    let mut out = op.clone();
    if applied.is_noop() {
        return out;
    }

    match (op.kind, applied.kind) {
        (OpKind::Insert, OpKind::Insert) => {
            let applied_first = applied.position < op.position
                || (applied.position == op.position && applied.client_id < op.client_id);
            if applied_first {
                out.position += applied.len();
            }
        }

        (OpKind::Insert, OpKind::Delete) => {
            if op.position >= applied.end() {
                out.position -= applied.len();
            } else if op.position > applied.position {
                out.position = applied.position;
                out.content.clear();
            }
        }

        (OpKind::Delete, OpKind::Insert) => {
            if applied.position <= op.position {
                out.position += applied.len();
            } else if applied.position < op.end() {
                let offset = applied.position - op.position;
                // Offset is inside the range, so the splice cannot fail.
                if let Some(grown) = insert_at(&op.content, offset, &applied.content) {
                    out.content = grown;
                }
            }
        }

        (OpKind::Delete, OpKind::Delete) => {
            let overlap_start = op.position.max(applied.position);
            let overlap_end = op.end().min(applied.end());

            if overlap_end > overlap_start {
                let from = overlap_start - op.position;
                let len = overlap_end - overlap_start;
                if let Some((rest, _)) = remove_range(&op.content, from, len) {
                    out.content = rest;
                }
            }

            if applied.position < op.position {
                out.position -= applied.len().min(op.position - applied.position);
            }
        }
    }

    out
}

/// Transform `op` against every operation in `history`, in applied order.
///
/// `history` is everything applied after the version `op` was authored at,
/// including earlier operations from the same client. Positions are always
/// relative to the authored version.
pub fn transform_against<'a, I>(op: &Operation, history: I) -> Operation
where
    I: IntoIterator<Item = &'a Operation>,
{
    history
        .into_iter()
        .fold(op.clone(), |acc, applied| transform(&acc, applied))
}

/// Length of `s` in chars.
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of char index `idx`; `idx == char_len(s)` maps to `s.len()`.
fn byte_offset(s: &str, idx: usize) -> Option<usize> {
    s.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(s.len()))
        .nth(idx)
}

/// Insert `text` at char index `pos`. `None` if `pos` is past the end.
pub fn insert_at(s: &str, pos: usize, text: &str) -> Option<String> {
    let at = byte_offset(s, pos)?;
    let mut out = String::with_capacity(s.len() + text.len());
    out.push_str(&s[..at]);
    out.push_str(text);
    out.push_str(&s[at..]);
    Some(out)
}

/// Remove `len` chars starting at char index `pos`.
///
/// Returns `(remaining, removed)`, or `None` if the range runs past the end.
pub fn remove_range(s: &str, pos: usize, len: usize) -> Option<(String, String)> {
    let start = byte_offset(s, pos)?;
    let end = byte_offset(s, pos + len)?;
    let mut rest = String::with_capacity(s.len() - (end - start));
    rest.push_str(&s[..start]);
    rest.push_str(&s[end..]);
    Some((rest, s[start..end].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(doc: &str, op: &Operation) -> String {
        match op.kind {
            OpKind::Insert => insert_at(doc, op.position, &op.content).unwrap(),
            OpKind::Delete => remove_range(doc, op.position, op.len()).unwrap().0,
        }
    }

    /// Apply `a` then `b'` and `b` then `a'`; both must produce the same text.
    fn assert_converges(doc: &str, a: &Operation, b: &Operation) -> String {
        let ab = apply(&apply(doc, a), &transform(b, a));
        let ba = apply(&apply(doc, b), &transform(a, b));
        assert_eq!(ab, ba, "diverged for a={a:?} b={b:?}");
        ab
    }

    #[test]
    fn test_insert_insert_before() {
        let a = Operation::insert("1", "A", 0, 5, "xx");
        let b = Operation::insert("1", "B", 0, 2, "yyy");
        assert_eq!(transform(&a, &b).position, 8);
        assert_eq!(transform(&b, &a).position, 2);
        assert_eq!(assert_converges("abcdefg", &a, &b), "abyyycdexxfg");
    }

    #[test]
    fn test_insert_insert_tie_break() {
        let a = Operation::insert("1", "A", 0, 0, "Hello");
        let b = Operation::insert("1", "B", 0, 0, "Hi ");
        // "B" sorts after "A" so B moves right
        assert_eq!(transform(&b, &a).position, 5);
        assert_eq!(transform(&a, &b).position, 0);
        assert_eq!(assert_converges("", &a, &b), "HelloHi ");
    }

    #[test]
    fn test_insert_after_delete_shifts_left() {
        let ins = Operation::insert("1", "B", 0, 11, "!");
        let del = Operation::delete("1", "A", 0, 5, " ");
        assert_eq!(transform(&ins, &del).position, 10);
        assert_eq!(assert_converges("Hello World", &ins, &del), "HelloWorld!");
    }

    #[test]
    fn test_insert_at_delete_start_survives() {
        let ins = Operation::insert("1", "B", 0, 2, "XY");
        let del = Operation::delete("1", "A", 0, 2, "cd");
        assert_eq!(assert_converges("abcdef", &ins, &del), "abXYef");
    }

    #[test]
    fn test_insert_at_delete_end_survives() {
        let ins = Operation::insert("1", "B", 0, 4, "XY");
        let del = Operation::delete("1", "A", 0, 2, "cd");
        assert_eq!(transform(&ins, &del).position, 2);
        assert_eq!(assert_converges("abcdef", &ins, &del), "abXYef");
    }

    #[test]
    fn test_insert_inside_delete_is_absorbed() {
        let ins = Operation::insert("1", "B", 0, 3, "XY");
        let del = Operation::delete("1", "A", 0, 2, "cde");

        let moved = transform(&ins, &del);
        assert!(moved.is_noop());
        assert_eq!(moved.position, 2);

        let grown = transform(&del, &ins);
        assert_eq!(grown.content, "cXYde");
        assert_eq!(assert_converges("abcdefg", &ins, &del), "abfg");
    }

    #[test]
    fn test_delete_delete_disjoint() {
        let a = Operation::delete("1", "A", 0, 6, "gh");
        let b = Operation::delete("1", "B", 0, 1, "bc");
        assert_eq!(transform(&a, &b).position, 4);
        assert_eq!(assert_converges("abcdefghij", &a, &b), "adefij");
    }

    #[test]
    fn test_delete_delete_overlap() {
        let a = Operation::delete("1", "A", 0, 2, "cdef");
        let b = Operation::delete("1", "B", 0, 4, "efgh");
        let a2 = transform(&a, &b);
        assert_eq!(a2.position, 2);
        assert_eq!(a2.content, "cd");
        assert_eq!(assert_converges("abcdefghij", &a, &b), "abij");
    }

    #[test]
    fn test_delete_delete_contained() {
        let outer = Operation::delete("1", "A", 0, 1, "bcdef");
        let inner = Operation::delete("1", "B", 0, 2, "cd");
        assert_eq!(transform(&outer, &inner).content, "bef");
        assert!(transform(&inner, &outer).is_noop());
        assert_eq!(assert_converges("abcdefg", &outer, &inner), "ag");
    }

    #[test]
    fn test_identical_deletes() {
        let a = Operation::delete("1", "A", 0, 1, "bc");
        let b = Operation::delete("1", "B", 0, 1, "bc");
        let a2 = transform(&a, &b);
        assert!(a2.is_noop());
        assert_eq!(a2.position, 1);
        assert_eq!(assert_converges("abcd", &a, &b), "ad");
    }

    #[test]
    fn test_transform_against_includes_own_client() {
        let own = Operation::insert("1", "A", 0, 0, "zzz");
        let other = Operation::insert("1", "B", 0, 0, "q");
        let op = Operation::insert("2", "A", 0, 3, "!");
        let moved = transform_against(&op, [&own, &other]);
        assert_eq!(moved.position, 7);
    }

    #[test]
    fn test_end_does_not_overflow() {
        let op = Operation::delete("1", "A", 0, usize::MAX, "ab");
        assert_eq!(op.checked_end(), None);
        assert_eq!(op.end(), usize::MAX);
        assert_eq!(Operation::delete("1", "A", 0, 2, "ab").checked_end(), Some(4));
    }

    #[test]
    fn test_noop_applied_has_no_effect() {
        let op = Operation::insert("1", "A", 0, 4, "x");
        let empty = Operation::insert("1", "B", 0, 0, "");
        assert_eq!(transform(&op, &empty), op);
    }

    #[test]
    fn test_char_offsets_multibyte() {
        assert_eq!(char_len("héllo"), 5);
        assert_eq!(insert_at("héllo", 2, "X").unwrap(), "héXllo");
        let (rest, removed) = remove_range("日本語テキスト", 1, 2).unwrap();
        assert_eq!(rest, "日テキスト");
        assert_eq!(removed, "本語");
        assert_eq!(insert_at("ab", 2, "c").unwrap(), "abc");
        assert!(insert_at("ab", 3, "c").is_none());
        assert!(remove_range("ab", 1, 2).is_none());
    }

    #[test]
    fn test_kind_serde_names() {
        assert_eq!(serde_json::to_string(&OpKind::Insert).unwrap(), "\"insert\"");
        let op = Operation::delete("op-1", "c1", 3, 0, "x");
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "delete");
        assert_eq!(json["clientId"], "c1");
    }
}
