//! Text transform: diff, rebase and apply over insert/delete edit lists.
//!
//! Rebase contract for two edits `existing` and `incoming` computed against
//! the same base text:
//! ```text
//!   base ──existing──► base₁ ──rebase(existing, incoming)──► base₁₂
//!   base ──incoming──► base₂
//! ```
//! `base₁₂` contains both edits. At equal positions the existing insert goes
//! first; an existing delete never removes text the incoming side inserted.
//! An incoming insert strictly inside a range the existing side deleted is
//! dropped, except for the cursor markers (`\0`) it carried.
//!
//! All indices are `char` offsets, not byte offsets.
//!
//! Reference: Ellis & Gibbs, Concurrency Control in Groupware Systems (1989)

use crate::commit::{Commit, CommitBody, CommitError, EditOp};

/// Diff/rebase/apply collaborator used by the document engine.
///
/// Implementations must be deterministic: every replica runs them on the
/// same inputs and must produce identical output.
pub trait TextTransform: Send + Sync {
    /// Edit list turning `base` into `target`.
    fn diff(&self, base: &str, target: &str) -> Vec<EditOp>;

    /// Rewrite `incoming` to apply on top of `existing`; the result's parent
    /// is one past `incoming`'s.
    fn rebase(&self, existing: &Commit, incoming: &Commit) -> Result<Commit, TransformError>;

    /// Apply `commit`'s edit list to `text`.
    fn apply_diff(&self, text: &str, commit: &Commit) -> Result<String, TransformError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error("Edit at {index} is outside text of length {len}")]
    OutOfRange { index: usize, len: usize },

    #[error("Edit at {index} precedes previous edit ending at {cursor}")]
    Unordered { index: usize, cursor: usize },
}

/// Native operational-transform implementation.
#[derive(Debug, Clone)]
pub struct OtTransform {
    /// Above this many LCS table cells the differing middle is replaced
    /// wholesale instead of diffed character by character.
    pub max_lcs_cells: usize,
}

impl Default for OtTransform {
    fn default() -> Self {
        Self {
            max_lcs_cells: 4 * 1024 * 1024,
        }
    }
}

impl OtTransform {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TextTransform for OtTransform {
    fn diff(&self, base: &str, target: &str) -> Vec<EditOp> {
        let a: Vec<char> = base.chars().collect();
        let b: Vec<char> = target.chars().collect();

        let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
        let suffix = a[prefix..]
            .iter()
            .rev()
            .zip(b[prefix..].iter().rev())
            .take_while(|(x, y)| x == y)
            .count();
        let am = &a[prefix..a.len() - suffix];
        let bm = &b[prefix..b.len() - suffix];

        let mut ops = Vec::new();
        if am.is_empty() || bm.is_empty() || am.len().saturating_mul(bm.len()) > self.max_lcs_cells {
            push_replace(&mut ops, prefix, bm.iter().collect(), am.len());
            return ops;
        }
        lcs_diff(&mut ops, prefix, am, bm);
        ops
    }

    fn rebase(&self, existing: &Commit, incoming: &Commit) -> Result<Commit, TransformError> {
        let existing = existing.body()?;
        let mut body: CommitBody = incoming.body()?;
        body.diff = transform_ops(&existing.diff, &body.diff);
        body.parent += 1;
        Ok(Commit::from_body(&body)?)
    }

    fn apply_diff(&self, text: &str, commit: &Commit) -> Result<String, TransformError> {
        let body = commit.body()?;
        apply_ops(text, &body.diff)
    }
}

/// Replace `deleted` chars at `index` with `inserted`. Insert first so both
/// ops share the same base index.
fn push_replace(ops: &mut Vec<EditOp>, index: usize, inserted: String, deleted: usize) {
    if !inserted.is_empty() {
        ops.push(EditOp::Insert { index, val: inserted });
    }
    if deleted > 0 {
        ops.push(EditOp::Delete { index, size: deleted });
    }
}

fn lcs_diff(ops: &mut Vec<EditOp>, offset: usize, a: &[char], b: &[char]) {
    let (n, m) = (a.len(), b.len());
    let width = m + 1;
    // table[i * width + j] = LCS length of a[i..] and b[j..]
    let mut table = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * width + j] = if a[i] == b[j] {
                table[(i + 1) * width + j + 1] + 1
            } else {
                table[(i + 1) * width + j].max(table[i * width + j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    let mut run_start = 0;
    let mut inserted = String::new();
    let mut deleted = 0;
    while i < n || j < m {
        if i < n && j < m && a[i] == b[j] {
            push_replace(ops, offset + run_start, std::mem::take(&mut inserted), deleted);
            deleted = 0;
            i += 1;
            j += 1;
            continue;
        }
        if inserted.is_empty() && deleted == 0 {
            run_start = i;
        }
        let prefer_insert = j < m && (i == n || table[i * width + j + 1] >= table[(i + 1) * width + j]);
        if prefer_insert {
            inserted.push(b[j]);
            j += 1;
        } else {
            deleted += 1;
            i += 1;
        }
    }
    push_replace(ops, offset + run_start, inserted, deleted);
}

/// Where base position `pos` lands after `applied` has run.
///
/// Inserts at `pos` itself count as before it (existing inserts win ties).
fn map_position(applied: &[EditOp], pos: usize) -> usize {
    let mut shifted = pos;
    let mut removed = 0;
    for op in applied {
        match op {
            EditOp::Insert { index, val } if *index <= pos => shifted += val.chars().count(),
            EditOp::Delete { index, size } if *index < pos => {
                removed += (*size).min(pos - *index);
            }
            _ => {}
        }
    }
    shifted.saturating_sub(removed)
}

/// Rewrite `incoming` (against base) to apply after `applied` (against base).
fn transform_ops(applied: &[EditOp], incoming: &[EditOp]) -> Vec<EditOp> {
    let mut out = Vec::with_capacity(incoming.len());
    for op in incoming {
        match op {
            EditOp::Insert { index, val } => {
                let val = if deletes_around(applied, *index) {
                    surviving_cursors(val)
                } else {
                    val.clone()
                };
                if !val.is_empty() {
                    out.push(EditOp::Insert {
                        index: map_position(applied, *index),
                        val,
                    });
                }
            }
            EditOp::Delete { index, size } => {
                for (start, end) in surviving_ranges(applied, *index, index.saturating_add(*size)) {
                    out.push(EditOp::Delete {
                        index: map_position(applied, start),
                        size: end - start,
                    });
                }
            }
        }
    }
    out
}

/// Cursor marker clients embed in their text.
pub const CURSOR_MARKER: char = '\u{0}';

/// Whether `applied` deleted text on both sides of base position `pos`.
fn deletes_around(applied: &[EditOp], pos: usize) -> bool {
    applied.iter().any(|op| match op {
        EditOp::Delete { index, size } => *index < pos && pos < index.saturating_add(*size),
        EditOp::Insert { .. } => false,
    })
}

/// What is left of an insert swallowed by a concurrent delete: its cursor
/// markers, at most two (first and last).
fn surviving_cursors(val: &str) -> String {
    let markers = val.chars().filter(|c| *c == CURSOR_MARKER).count().min(2);
    std::iter::repeat(CURSOR_MARKER).take(markers).collect()
}

/// Sub-ranges of base `[start, end)` not already deleted by `applied`, split
/// around text `applied` inserted strictly inside the range.
fn surviving_ranges(applied: &[EditOp], start: usize, end: usize) -> Vec<(usize, usize)> {
    let mut pieces = vec![(start, end)];
    for op in applied {
        let mut next = Vec::with_capacity(pieces.len() + 1);
        match op {
            EditOp::Delete { index, size } => {
                let (d_start, d_end) = (*index, index.saturating_add(*size));
                for (x, y) in pieces {
                    if d_end <= x || y <= d_start {
                        next.push((x, y));
                        continue;
                    }
                    if x < d_start {
                        next.push((x, d_start));
                    }
                    if d_end < y {
                        next.push((d_end, y));
                    }
                }
            }
            EditOp::Insert { index, .. } => {
                for (x, y) in pieces {
                    if x < *index && *index < y {
                        next.push((x, *index));
                        next.push((*index, y));
                    } else {
                        next.push((x, y));
                    }
                }
            }
        }
        pieces = next;
    }
    pieces.retain(|(x, y)| x < y);
    pieces
}

/// Walk `ops` over `text`.
pub fn apply_ops(text: &str, ops: &[EditOp]) -> Result<String, TransformError> {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for op in ops {
        let index = op.index();
        if index < cursor {
            return Err(TransformError::Unordered { index, cursor });
        }
        if index > len {
            return Err(TransformError::OutOfRange { index, len });
        }
        out.extend(&chars[cursor..index]);
        match op {
            EditOp::Insert { val, .. } => {
                out.push_str(val);
                cursor = index;
            }
            EditOp::Delete { size, .. } => {
                let end = index.saturating_add(*size);
                if end > len {
                    return Err(TransformError::OutOfRange { index: end, len });
                }
                cursor = end;
            }
        }
    }
    out.extend(&chars[cursor..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(index: usize, val: &str) -> EditOp {
        EditOp::Insert { index, val: val.to_string() }
    }

    fn del(index: usize, size: usize) -> EditOp {
        EditOp::Delete { index, size }
    }

    fn commit(parent: usize, diff: Vec<EditOp>) -> Commit {
        Commit::from_body(&CommitBody::new(parent, diff)).unwrap()
    }

    /// Apply `first` then rebase `second` over it.
    fn merge(base: &str, first: Vec<EditOp>, second: Vec<EditOp>) -> String {
        let t = OtTransform::new();
        let c1 = commit(0, first);
        let c2 = commit(0, second);
        let after_first = t.apply_diff(base, &c1).unwrap();
        let rebased = t.rebase(&c1, &c2).unwrap();
        assert_eq!(rebased.parent().unwrap(), 1);
        t.apply_diff(&after_first, &rebased).unwrap()
    }

    // ─── apply ────────────────────────────────────────────────────────

    #[test]
    fn test_apply_inserts_and_deletes() {
        let out = apply_ops("hello world", &[ins(0, ">> "), del(5, 6), ins(11, "!")]).unwrap();
        assert_eq!(out, ">> hello!");
    }

    #[test]
    fn test_apply_insert_then_delete_same_index() {
        assert_eq!(apply_ops("abcdef", &[ins(2, "XY"), del(2, 2)]).unwrap(), "abXYef");
    }

    #[test]
    fn test_apply_rejects_out_of_range() {
        assert!(matches!(
            apply_ops("abc", &[ins(4, "x")]),
            Err(TransformError::OutOfRange { index: 4, len: 3 })
        ));
        assert!(matches!(
            apply_ops("abc", &[del(2, 5)]),
            Err(TransformError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_apply_rejects_unordered() {
        assert!(matches!(
            apply_ops("abcdef", &[del(1, 3), ins(2, "x")]),
            Err(TransformError::Unordered { index: 2, cursor: 4 })
        ));
    }

    #[test]
    fn test_apply_counts_chars_not_bytes() {
        assert_eq!(apply_ops("héllo", &[del(1, 1), ins(1, "e")]).unwrap_err().to_string(),
            "Edit at 1 precedes previous edit ending at 2");
        assert_eq!(apply_ops("héllo", &[ins(1, "e"), del(1, 1)]).unwrap(), "hello");
    }

    // ─── diff ─────────────────────────────────────────────────────────

    #[test]
    fn test_diff_reconstructs_target() {
        let t = OtTransform::new();
        let cases = [
            ("", ""),
            ("", "abc"),
            ("abc", ""),
            ("kitten", "sitting"),
            ("the quick brown fox", "the slow brown dog"),
            ("aaaa", "aa"),
            ("abc", "xabcx"),
            ("naïve café", "naive cafe"),
        ];
        for (a, b) in cases {
            let ops = t.diff(a, b);
            assert_eq!(apply_ops(a, &ops).unwrap(), b, "diff({a:?}, {b:?}) = {ops:?}");
        }
    }

    #[test]
    fn test_diff_identical_is_empty() {
        assert!(OtTransform::new().diff("same", "same").is_empty());
    }

    #[test]
    fn test_diff_is_minimal_for_single_insert() {
        assert_eq!(OtTransform::new().diff("helo", "hello"), vec![ins(3, "l")]);
    }

    #[test]
    fn test_diff_falls_back_when_too_large() {
        let t = OtTransform { max_lcs_cells: 4 };
        let ops = t.diff("xabcx", "xdefgx");
        assert_eq!(ops, vec![ins(1, "defg"), del(1, 3)]);
    }

    // ─── rebase ───────────────────────────────────────────────────────

    #[test]
    fn test_rebase_inserts_at_different_positions() {
        assert_eq!(merge("hello world", vec![ins(0, "A ")], vec![ins(11, " B")]), "A hello world B");
        assert_eq!(merge("hello world", vec![ins(11, " B")], vec![ins(0, "A ")]), "A hello world B");
    }

    #[test]
    fn test_rebase_tie_existing_insert_first() {
        assert_eq!(merge("ab", vec![ins(1, "X")], vec![ins(1, "Y")]), "aXYb");
    }

    #[test]
    fn test_rebase_overlapping_deletes() {
        // existing deletes "bcd", incoming deletes "cdef"
        assert_eq!(merge("abcdefg", vec![del(1, 3)], vec![del(2, 4)]), "ag");
        // identical deletes collapse
        assert_eq!(merge("abcdefg", vec![del(2, 2)], vec![del(2, 2)]), "abefg");
    }

    #[test]
    fn test_rebase_delete_spares_concurrent_insert() {
        // incoming deletes "bcde"; existing inserted "XY" in the middle of it
        assert_eq!(merge("abcdef", vec![ins(3, "XY")], vec![del(1, 4)]), "aXYf");
    }

    #[test]
    fn test_rebase_insert_inside_deleted_range() {
        // existing deleted "bcd", incoming inserts inside it: insert is dropped
        assert_eq!(merge("abcde", vec![del(1, 3)], vec![ins(2, "Z")]), "ae");
        // at either edge of the deleted range it survives
        assert_eq!(merge("abcde", vec![del(1, 3)], vec![ins(1, "Z")]), "aZe");
        assert_eq!(merge("abcde", vec![del(1, 3)], vec![ins(4, "Z")]), "aZe");
    }

    #[test]
    fn test_rebase_keeps_cursors_from_deleted_insert() {
        let one = format!("Z{CURSOR_MARKER}Z");
        assert_eq!(merge("abcde", vec![del(1, 3)], vec![ins(2, &one)]), "a\0e");

        let many = format!("{CURSOR_MARKER}x{CURSOR_MARKER}y{CURSOR_MARKER}");
        assert_eq!(merge("abcde", vec![del(1, 3)], vec![ins(3, &many)]), "a\0\0e");

        // shifted by what the existing side inserted before the range
        assert_eq!(
            merge("abcde", vec![ins(0, ">>"), del(1, 3)], vec![ins(2, &one)]),
            ">>a\0e"
        );
    }

    #[test]
    fn test_rebase_preserves_client_and_bumps_parent() {
        let t = OtTransform::new();
        let c1 = commit(3, vec![ins(0, "a")]);
        let c2 = Commit::from_body(&CommitBody::new(3, vec![ins(0, "b")]).with_client(77)).unwrap();
        let body = t.rebase(&c1, &c2).unwrap().body().unwrap();
        assert_eq!(body.parent, 4);
        assert_eq!(body.client_id, Some(77));
        assert_eq!(body.diff, vec![ins(1, "b")]);
    }

    #[test]
    fn test_rebase_converges_both_orders_for_disjoint_edits() {
        let base = "The quick brown fox";
        let t = OtTransform::new();
        let d1 = t.diff(base, "The quick red fox");
        let d2 = t.diff(base, "The quick brown fox jumps");
        assert_eq!(merge(base, d1.clone(), d2.clone()), "The quick red fox jumps");
        assert_eq!(merge(base, d2, d1), "The quick red fox jumps");
    }

    #[test]
    fn test_rebase_malformed_commit() {
        let t = OtTransform::new();
        let good = commit(0, vec![]);
        assert!(matches!(
            t.rebase(&good, &Commit::new("{oops")),
            Err(TransformError::Commit(_))
        ));
    }
}
