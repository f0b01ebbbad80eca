use crate::core::errors::{CoreError, CoreResult};
use std::path::PathBuf;

/// Line terminator as it appears in the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
    /// Last line of a text without a trailing newline.
    None,
}

impl LineEnding {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
            LineEnding::None => "",
        }
    }
}

/// One line of text split from its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    pub eol: LineEnding,
}

/// Split `content` into lines, keeping each line's own terminator.
pub fn split_lines(content: &str) -> Vec<Line> {
    content
        .split_inclusive('\n')
        .map(|raw| {
            if let Some(text) = raw.strip_suffix("\r\n") {
                Line {
                    text: text.to_string(),
                    eol: LineEnding::CrLf,
                }
            } else if let Some(text) = raw.strip_suffix('\n') {
                Line {
                    text: text.to_string(),
                    eol: LineEnding::Lf,
                }
            } else {
                Line {
                    text: raw.to_string(),
                    eol: LineEnding::None,
                }
            }
        })
        .collect()
}

/// Most frequent terminator among `lines`, ties going to LF.
pub fn dominant_ending(lines: &[Line]) -> Option<LineEnding> {
    let crlf = lines.iter().filter(|l| l.eol == LineEnding::CrLf).count();
    let lf = lines.iter().filter(|l| l.eol == LineEnding::Lf).count();
    match (lf, crlf) {
        (0, 0) => None,
        (lf, crlf) if crlf > lf => Some(LineEnding::CrLf),
        _ => Some(LineEnding::Lf),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchLine {
    Context(Line),
    Add(Line),
    Remove(Line),
}

impl PatchLine {
    fn line_mut(&mut self) -> &mut Line {
        match self {
            PatchLine::Context(l) | PatchLine::Add(l) | PatchLine::Remove(l) => l,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatchHunk {
    pub header: String,
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<PatchLine>,
}

impl PatchHunk {
    /// Zero-based index of the first old-side line this hunk covers.
    pub fn position(&self) -> usize {
        if self.old_count == 0 {
            self.old_start
        } else {
            self.old_start - 1
        }
    }
}

/// A unified diff against a single file.
#[derive(Debug, Clone)]
pub struct FilePatch {
    pub old_path: Option<PathBuf>,
    pub new_path: Option<PathBuf>,
    pub hunks: Vec<PatchHunk>,
    /// The terminator style of the diff text itself, if uniform.
    pub uniform_ending: Option<LineEnding>,
}

const HEADER_PREFIXES: &[&str] = &[
    "diff ",
    "index ",
    "new file mode",
    "deleted file mode",
    "old mode",
    "new mode",
    "similarity index",
    "rename from",
    "rename to",
];

impl FilePatch {
    pub fn parse(diff: &str) -> CoreResult<Self> {
        let mut lines = split_lines(diff);
        // A diff missing its final newline still means a terminated line;
        // only the "\ No newline" marker removes a terminator.
        let fallback = dominant_ending(&lines).unwrap_or(LineEnding::Lf);
        if let Some(last) = lines.last_mut() {
            if last.eol == LineEnding::None {
                last.eol = fallback;
            }
        }
        let mut old_path = None;
        let mut new_path = None;
        let mut hunks: Vec<PatchHunk> = Vec::new();
        let mut unrecognized = false;
        let mut i = 0;

        while i < lines.len() {
            let text = lines[i].text.as_str();
            if text.starts_with("@@") {
                let (hunk, next) = parse_hunk(&lines, i)?;
                hunks.push(hunk);
                i = next;
                continue;
            }

            let starts_file = text.starts_with("--- ") || text.starts_with("diff --git ");
            if starts_file && !hunks.is_empty() {
                return Err(CoreError::invalid_diff(
                    "diff touches more than one file",
                    Some(i + 1),
                ));
            }

            if let Some(rest) = text.strip_prefix("--- ") {
                old_path = header_path(rest, "a/");
            } else if let Some(rest) = text.strip_prefix("+++ ") {
                new_path = header_path(rest, "b/");
            } else if text.starts_with("Binary files ") || text == "GIT binary patch" {
                return Err(CoreError::invalid_diff(
                    "binary diffs are not supported",
                    Some(i + 1),
                ));
            } else if !text.trim().is_empty()
                && !HEADER_PREFIXES.iter().any(|p| text.starts_with(p))
            {
                unrecognized = true;
            }
            i += 1;
        }

        if hunks.is_empty() && unrecognized {
            return Err(CoreError::invalid_diff("no hunks found in diff", None));
        }

        let has_crlf = lines.iter().any(|l| l.eol == LineEnding::CrLf);
        let has_lf = lines.iter().any(|l| l.eol == LineEnding::Lf);
        let uniform_ending = match (has_lf, has_crlf) {
            (true, false) => Some(LineEnding::Lf),
            (false, true) => Some(LineEnding::CrLf),
            _ => None,
        };

        Ok(FilePatch {
            old_path,
            new_path,
            hunks,
            uniform_ending,
        })
    }
}

fn header_path(rest: &str, prefix: &str) -> Option<PathBuf> {
    // Drop a trailing "\t<timestamp>" as written by diff -u.
    let path = rest.split('\t').next().unwrap_or(rest).trim();
    if path == "/dev/null" || path.is_empty() {
        return None;
    }
    Some(PathBuf::from(path.strip_prefix(prefix).unwrap_or(path)))
}

fn parse_hunk(lines: &[Line], start: usize) -> CoreResult<(PatchHunk, usize)> {
    let header = lines[start].text.clone();
    let invalid_header = || {
        CoreError::invalid_diff(format!("invalid hunk header: {}", header), Some(start + 1))
    };

    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 4 || parts[0] != "@@" || parts[3] != "@@" {
        return Err(invalid_header());
    }
    let old_range = parts[1].strip_prefix('-').ok_or_else(invalid_header)?;
    let new_range = parts[2].strip_prefix('+').ok_or_else(invalid_header)?;
    let (old_start, old_count) = parse_range(old_range, start + 1)?;
    let (new_start, new_count) = parse_range(new_range, start + 1)?;
    if old_count > 0 && old_start == 0 {
        return Err(invalid_header());
    }
    if old_start.checked_add(old_count).is_none() || new_start.checked_add(new_count).is_none() {
        return Err(CoreError::invalid_diff(
            format!("hunk '{}' range is out of bounds", header),
            Some(start + 1),
        ));
    }

    let mut hunk_lines: Vec<PatchLine> = Vec::new();
    let mut old_left = old_count;
    let mut new_left = new_count;
    let mut i = start + 1;

    while old_left > 0 || new_left > 0 {
        let line = lines.get(i).ok_or_else(|| {
            CoreError::invalid_diff(
                format!("hunk '{}' ends before its declared line counts", header),
                Some(i + 1),
            )
        })?;
        let overrun = || {
            CoreError::invalid_diff(
                format!("hunk '{}' has more lines than its header declares", header),
                Some(i + 1),
            )
        };

        let mut chars = line.text.chars();
        let body = || Line {
            text: line.text.get(1..).unwrap_or_default().to_string(),
            eol: line.eol,
        };
        match chars.next() {
            Some(' ') | None => {
                if old_left == 0 || new_left == 0 {
                    return Err(overrun());
                }
                old_left -= 1;
                new_left -= 1;
                // A bare empty line is an empty context line with its
                // leading space stripped.
                let context = if line.text.is_empty() {
                    line.clone()
                } else {
                    body()
                };
                hunk_lines.push(PatchLine::Context(context));
            }
            Some('-') => {
                old_left = old_left.checked_sub(1).ok_or_else(overrun)?;
                hunk_lines.push(PatchLine::Remove(body()));
            }
            Some('+') => {
                new_left = new_left.checked_sub(1).ok_or_else(overrun)?;
                hunk_lines.push(PatchLine::Add(body()));
            }
            Some('\\') => mark_no_newline(&mut hunk_lines),
            Some(_) => {
                return Err(CoreError::invalid_diff(
                    format!("unexpected line in hunk '{}': {:?}", header, line.text),
                    Some(i + 1),
                ))
            }
        }
        i += 1;
    }

    // "\ No newline at end of file" for the hunk's final line.
    if lines.get(i).is_some_and(|l| l.text.starts_with('\\')) {
        mark_no_newline(&mut hunk_lines);
        i += 1;
    }

    Ok((
        PatchHunk {
            header,
            old_start,
            old_count,
            new_start,
            new_count,
            lines: hunk_lines,
        },
        i,
    ))
}

/// The previous line's terminator was added by the diff format, not the file.
fn mark_no_newline(hunk_lines: &mut [PatchLine]) {
    if let Some(last) = hunk_lines.last_mut() {
        let line = last.line_mut();
        if line.eol == LineEnding::CrLf {
            // Only the '\n' was synthetic; the '\r' is content.
            line.text.push('\r');
        }
        line.eol = LineEnding::None;
    }
}

fn parse_range(range: &str, line_number: usize) -> CoreResult<(usize, usize)> {
    let invalid = || CoreError::invalid_diff(format!("invalid range: {}", range), Some(line_number));
    match range.split_once(',') {
        Some((start, count)) => Ok((
            start.parse().map_err(|_| invalid())?,
            count.parse().map_err(|_| invalid())?,
        )),
        None => Ok((range.parse().map_err(|_| invalid())?, 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_headers_and_hunks() {
        let diff = "\
diff --git a/src/lib.rs b/src/lib.rs
index 1111111..2222222 100644
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,3 +1,3 @@ fn main
 one
-two
+TWO
 three
";
        let patch = FilePatch::parse(diff).unwrap();
        assert_eq!(patch.old_path, Some(PathBuf::from("src/lib.rs")));
        assert_eq!(patch.new_path, Some(PathBuf::from("src/lib.rs")));
        assert_eq!(patch.hunks.len(), 1);
        let hunk = &patch.hunks[0];
        assert_eq!((hunk.old_start, hunk.old_count), (1, 3));
        assert_eq!(hunk.position(), 0);
        assert_eq!(hunk.lines.len(), 4);
        assert_eq!(patch.uniform_ending, Some(LineEnding::Lf));
    }

    #[test]
    fn no_newline_marker_clears_the_terminator() {
        let diff = "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-old\n\\ No newline at end of file\n+new\n";
        let patch = FilePatch::parse(diff).unwrap();
        let lines = &patch.hunks[0].lines;
        assert_eq!(
            lines[0],
            PatchLine::Remove(Line {
                text: "old".into(),
                eol: LineEnding::None
            })
        );
        assert_eq!(
            lines[1],
            PatchLine::Add(Line {
                text: "new".into(),
                eol: LineEnding::Lf
            })
        );
    }

    #[test]
    fn hunk_body_may_contain_header_like_lines() {
        let diff = "@@ -1,2 +1,1 @@\n--- not a header\n keep\n";
        let patch = FilePatch::parse(diff).unwrap();
        assert!(matches!(&patch.hunks[0].lines[0], PatchLine::Remove(l) if l.text == "-- not a header"));
    }

    #[test]
    fn rejects_multi_file_and_truncated_diffs() {
        let two_files = "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n--- a/y\n+++ b/y\n@@ -1 +1 @@\n-c\n+d\n";
        let err = FilePatch::parse(two_files).unwrap_err();
        assert_eq!(err.error_code(), "E_INVALID_DIFF");

        let truncated = "@@ -1,3 +1,3 @@\n a\n-b\n";
        assert!(FilePatch::parse(truncated).is_err());

        assert!(FilePatch::parse("@@ -x +1 @@\n").is_err());
        assert!(FilePatch::parse("just some prose\n").is_err());
    }

    #[test]
    fn empty_and_header_only_diffs_have_no_hunks() {
        assert!(FilePatch::parse("").unwrap().hunks.is_empty());
        assert!(FilePatch::parse("--- a/x\n+++ b/x\n").unwrap().hunks.is_empty());
    }

    #[test]
    fn split_and_dominant_ending() {
        let lines = split_lines("a\r\nb\r\nc\nd");
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0].eol, LineEnding::CrLf);
        assert_eq!(lines[2].eol, LineEnding::Lf);
        assert_eq!(lines[3].eol, LineEnding::None);
        assert_eq!(dominant_ending(&lines), Some(LineEnding::CrLf));
        assert_eq!(dominant_ending(&split_lines("x")), None);
    }
}
