//! Unified-diff application and creation.
//!
//! Lines are compared without their terminators, and every line keeps the
//! terminator it had: untouched and context lines keep the file's, added
//! lines keep the diff's. When the diff was written in a different line
//! ending style than the file (its context lines disagree with the file's
//! terminators), added lines take the file's dominant style instead, so a
//! CRLF file patched with an LF diff stays CRLF.

use std::fmt::Write;

use similar::{ChangeTag, TextDiff};
use tracing::debug;

use crate::core::errors::{CoreError, CoreResult};
use crate::core::patch_parser::{
    dominant_ending, split_lines, FilePatch, Line, LineEnding, PatchHunk, PatchLine,
};

const CONTEXT_RADIUS: usize = 3;

/// Apply a single-file unified diff to `original`.
///
/// Hunks must match exactly at the positions their headers declare; the
/// first mismatch is reported as [`CoreError::PatchConflict`]. A diff with no
/// hunks returns `original` unchanged.
pub fn apply_patch(original: &str, diff: &str) -> CoreResult<String> {
    let patch = FilePatch::parse(diff)?;
    if patch.hunks.is_empty() {
        return Ok(original.to_string());
    }

    let file_lines = split_lines(original);
    check_hunk_order(&patch.hunks)?;

    let mut eol_mismatch = false;
    let mut compared = 0usize;
    for (index, hunk) in patch.hunks.iter().enumerate() {
        let (n, mismatch) = verify_hunk(&file_lines, hunk, index)?;
        compared += n;
        eol_mismatch |= mismatch;
    }

    let file_ending = dominant_ending(&file_lines);
    let translate_to = match file_ending {
        Some(ending) if compared > 0 && eol_mismatch => Some(ending),
        Some(ending) if compared == 0 && patch.uniform_ending.is_some_and(|u| u != ending) => {
            Some(ending)
        }
        _ => None,
    };

    let mut result = file_lines;
    for hunk in patch.hunks.iter().rev() {
        let pos = hunk.position();
        let old_len = hunk.old_count;
        let mut replacement = Vec::with_capacity(hunk.new_count);
        let mut cursor = pos;
        for line in &hunk.lines {
            match line {
                PatchLine::Context(_) => {
                    replacement.push(result[cursor].clone());
                    cursor += 1;
                }
                PatchLine::Remove(_) => cursor += 1,
                PatchLine::Add(added) => {
                    let eol = match (added.eol, translate_to) {
                        (LineEnding::None, _) => LineEnding::None,
                        (_, Some(ending)) => ending,
                        (own, None) => own,
                    };
                    replacement.push(Line {
                        text: added.text.clone(),
                        eol,
                    });
                }
            }
        }
        result.splice(pos..pos + old_len, replacement);
    }

    // Only the final line may lack a terminator.
    let fill = file_ending.or(patch.uniform_ending).unwrap_or(LineEnding::Lf);
    let last = result.len().saturating_sub(1);
    for line in result.iter_mut().take(last) {
        if line.eol == LineEnding::None {
            line.eol = fill;
        }
    }

    debug!(
        target: "editgate::patch",
        hunks = patch.hunks.len(),
        translated = translate_to.is_some(),
        "patch applied"
    );

    let mut out = String::with_capacity(original.len());
    for line in &result {
        out.push_str(&line.text);
        out.push_str(line.eol.as_str());
    }
    Ok(out)
}

fn check_hunk_order(hunks: &[PatchHunk]) -> CoreResult<()> {
    let mut next_free = 0usize;
    for hunk in hunks {
        let pos = hunk.position();
        if pos < next_free {
            return Err(CoreError::invalid_diff(
                format!("hunk '{}' overlaps or precedes the previous hunk", hunk.header),
                None,
            ));
        }
        next_free = pos + hunk.old_count;
    }
    Ok(())
}

/// Check a hunk's old side against the file. Returns how many lines were
/// compared and whether any of them disagreed on the line terminator.
fn verify_hunk(file: &[Line], hunk: &PatchHunk, index: usize) -> CoreResult<(usize, bool)> {
    let pos = hunk.position();
    let mut compared = 0;
    let mut eol_mismatch = false;

    let old_side = hunk.lines.iter().filter_map(|line| match line {
        PatchLine::Context(l) | PatchLine::Remove(l) => Some(l),
        PatchLine::Add(_) => None,
    });
    for (offset, expected) in old_side.enumerate() {
        let at = pos + offset;
        let found = file.get(at);
        match found {
            Some(actual) if actual.text == expected.text => {
                compared += 1;
                if actual.eol != expected.eol {
                    eol_mismatch = true;
                }
            }
            _ => {
                return Err(CoreError::PatchConflict {
                    hunk: index + 1,
                    header: hunk.header.clone(),
                    line: at + 1,
                    expected: expected.text.clone(),
                    found: found.map(|l| l.text.clone()),
                })
            }
        }
    }
    if hunk.old_count == 0 && pos > file.len() {
        return Err(CoreError::PatchConflict {
            hunk: index + 1,
            header: hunk.header.clone(),
            line: pos,
            expected: String::new(),
            found: None,
        });
    }
    Ok((compared, eol_mismatch))
}

/// Unified diff turning `original` into `modified`, with `a/` and `b/`
/// prefixed headers for `display_name`. Identical inputs give an empty diff.
///
/// Lines are split on `\n` only, matching [`apply_patch`], so a stray `\r`
/// stays part of its line.
pub fn create_patch(original: &str, modified: &str, display_name: &str) -> String {
    let old: Vec<&str> = original.split_inclusive('\n').collect();
    let new: Vec<&str> = modified.split_inclusive('\n').collect();
    let diff = TextDiff::from_slices(&old, &new);

    let mut out = String::new();
    for group in diff.grouped_ops(CONTEXT_RADIUS) {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        if out.is_empty() {
            let _ = writeln!(out, "--- a/{}", display_name);
            let _ = writeln!(out, "+++ b/{}", display_name);
        }
        let _ = writeln!(
            out,
            "@@ -{} +{} @@",
            format_range(first.old_range().start, last.old_range().end),
            format_range(first.new_range().start, last.new_range().end),
        );
        for op in &group {
            for change in diff.iter_changes(op) {
                out.push(match change.tag() {
                    ChangeTag::Equal => ' ',
                    ChangeTag::Delete => '-',
                    ChangeTag::Insert => '+',
                });
                let value = change.value();
                out.push_str(value);
                if !value.ends_with('\n') {
                    out.push_str("\n\\ No newline at end of file\n");
                }
            }
        }
    }
    out
}

fn format_range(start: usize, end: usize) -> String {
    match end - start {
        0 => format!("{},0", start),
        1 => format!("{}", start + 1),
        len => format!("{},{}", start + 1, len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(original: &str, modified: &str) {
        let diff = create_patch(original, modified, "file.txt");
        let patched = apply_patch(original, &diff).unwrap_or_else(|e| {
            panic!("apply failed: {e}\n--- diff ---\n{diff}");
        });
        assert_eq!(patched, modified, "diff was:\n{diff}");
    }

    #[test]
    fn huge_hunk_starts_are_rejected_without_overflow() {
        let err = apply_patch("a\nb\n", &format!("@@ -{},2 +1,2 @@\n a\n b\n", usize::MAX)).unwrap_err();
        assert_eq!(err.error_code(), "E_INVALID_DIFF");

        let err = apply_patch("a\n", &format!("@@ -{},0 +1 @@\n+x\n", usize::MAX)).unwrap_err();
        assert_eq!(err.error_code(), "E_PATCH_CONFLICT");
    }

    #[test]
    fn round_trips_common_edits() {
        round_trip("a\nb\nc\n", "a\nB\nc\n");
        round_trip("", "new file\ncontent\n");
        round_trip("gone\n", "");
        round_trip("a\nb\n", "a\nb\nc\n");
        round_trip("a\nb\nc\n", "z\na\nb\nc\n");
        round_trip("same\n", "same\n");
    }

    #[test]
    fn round_trips_missing_trailing_newlines() {
        round_trip("a\nb", "a\nb\nc\n");
        round_trip("a\nb\n", "a\nb");
        round_trip("only", "changed");
        round_trip("x\ny", "x\nz");
    }

    #[test]
    fn round_trips_crlf_and_mixed_files() {
        round_trip("a\r\nb\r\nc\r\n", "a\r\nB\r\nc\r\n");
        round_trip("a\r\nb\nc\r\n", "a\r\nb\nC\r\nd\n");
        round_trip("1\r\n2\r\n3\r\n4\n5\n6\n7\n", "1\r\n2\r\n3\r\n4\n5\n6\nseven\n");
        round_trip("lone\r", "lone\r\nnext\r\n");
    }

    #[test]
    fn round_trips_multi_hunk_edits() {
        let original: String = (1..=40).map(|i| format!("line {i}\n")).collect();
        let modified = original
            .replace("line 3\n", "line three\n")
            .replace("line 20\n", "")
            .replace("line 38\n", "line 38\ninserted\n");
        round_trip(&original, &modified);
    }

    #[test]
    fn lf_diff_against_crlf_file_keeps_crlf() {
        let original = "fn main() {\r\n    old();\r\n}\r\n";
        let diff = "--- a/main.rs\n+++ b/main.rs\n@@ -1,3 +1,4 @@\n fn main() {\n-    old();\n+    new();\n+    more();\n }\n";
        let patched = apply_patch(original, diff).unwrap();
        assert_eq!(patched, "fn main() {\r\n    new();\r\n    more();\r\n}\r\n");
    }

    #[test]
    fn mismatched_context_is_a_conflict() {
        let diff = "@@ -1,2 +1,2 @@\n a\n-b\n+c\n";
        let err = apply_patch("a\nx\n", diff).unwrap_err();
        match err {
            CoreError::PatchConflict {
                hunk,
                line,
                expected,
                found,
                ..
            } => {
                assert_eq!(hunk, 1);
                assert_eq!(line, 2);
                assert_eq!(expected, "b");
                assert_eq!(found.as_deref(), Some("x"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn hunk_past_end_of_file_is_a_conflict() {
        let diff = "@@ -5,1 +5,1 @@\n-e\n+E\n";
        assert!(matches!(
            apply_patch("a\n", diff),
            Err(CoreError::PatchConflict { found: None, .. })
        ));
    }

    #[test]
    fn hand_written_insert_after_line() {
        let diff = "@@ -2,0 +3,1 @@\n+inserted\n";
        assert_eq!(apply_patch("a\nb\nc\n", diff).unwrap(), "a\nb\ninserted\nc\n");
    }

    #[test]
    fn appending_after_unterminated_last_line_keeps_lines_apart() {
        let diff = "@@ -1,0 +2,1 @@\n+b\n";
        assert_eq!(apply_patch("a", diff).unwrap(), "a\nb\n");
    }

    #[test]
    fn overlapping_hunks_are_invalid() {
        let diff = "@@ -1,2 +1,2 @@\n a\n-b\n+B\n@@ -1,1 +1,1 @@\n-a\n+A\n";
        let err = apply_patch("a\nb\n", diff).unwrap_err();
        assert_eq!(err.error_code(), "E_INVALID_DIFF");
    }

    #[test]
    fn empty_diff_is_a_no_op() {
        assert_eq!(apply_patch("keep\r\n", "").unwrap(), "keep\r\n");
    }
}
