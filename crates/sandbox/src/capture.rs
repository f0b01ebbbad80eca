use std::io::Read;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const CHUNK: usize = 8192;

#[derive(Debug, Default)]
struct Buffer {
    bytes: Vec<u8>,
    total: u64,
    truncated: bool,
}

/// Text captured from one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub text: String,
    pub truncated: bool,
    /// Everything the process wrote, including discarded bytes.
    pub total_bytes: u64,
}

impl CapturedOutput {
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            truncated: false,
            total_bytes: 0,
        }
    }
}

pub fn truncation_marker(limit: usize) -> String {
    format!("\n[output truncated at {limit} bytes]")
}

/// Drains a pipe on a background thread, keeping at most `limit` bytes.
///
/// The pipe is read to EOF even after the ceiling is reached so the writer
/// never blocks on a full pipe.
pub struct OutputCapture {
    shared: Arc<Mutex<Buffer>>,
    done: Receiver<()>,
    limit: usize,
}

impl OutputCapture {
    pub fn spawn<R>(mut reader: R, limit: usize) -> Self
    where
        R: Read + Send + 'static,
    {
        let shared = Arc::new(Mutex::new(Buffer::default()));
        let (tx, done) = mpsc::channel();
        let sink = Arc::clone(&shared);

        thread::spawn(move || {
            let mut chunk = [0u8; CHUNK];
            loop {
                let n = match reader.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                };
                let Ok(mut buf) = sink.lock() else { break };
                buf.total += n as u64;
                let room = limit.saturating_sub(buf.bytes.len());
                if n > room {
                    buf.truncated = true;
                }
                let keep = n.min(room);
                buf.bytes.extend_from_slice(&chunk[..keep]);
            }
            let _ = tx.send(());
        });

        Self {
            shared,
            done,
            limit,
        }
    }

    /// Wait up to `grace` for EOF, then return whatever was captured.
    pub fn finish(self, grace: Duration) -> CapturedOutput {
        let _ = self.done.recv_timeout(grace);
        let buf = match self.shared.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        render(buf, self.limit)
    }
}

fn render(buf: Buffer, limit: usize) -> CapturedOutput {
    let mut text = String::from_utf8_lossy(&buf.bytes).into_owned();
    if buf.truncated {
        append_within(&mut text, &truncation_marker(limit), limit);
    } else {
        // Replacement characters can grow the text past the byte ceiling.
        truncate_on_char_boundary(&mut text, limit);
    }
    CapturedOutput {
        text,
        truncated: buf.truncated,
        total_bytes: buf.total,
    }
}

/// Append `note` to `text`, dropping the tail of `text` as needed so the
/// result stays within `limit` bytes.
pub fn append_within(text: &mut String, note: &str, limit: usize) {
    truncate_on_char_boundary(text, limit.saturating_sub(note.len()));
    text.push_str(note);
    truncate_on_char_boundary(text, limit);
}

fn truncate_on_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn small_output_is_kept_whole() {
        let out = OutputCapture::spawn(Cursor::new(b"hello\n".to_vec()), 64)
            .finish(Duration::from_secs(5));
        assert_eq!(out.text, "hello\n");
        assert!(!out.truncated);
        assert_eq!(out.total_bytes, 6);
    }

    #[test]
    fn large_output_is_cut_at_the_ceiling_and_marked() {
        let data = vec![b'x'; 100_000];
        let out = OutputCapture::spawn(Cursor::new(data), 1000).finish(Duration::from_secs(5));
        assert!(out.truncated);
        assert_eq!(out.total_bytes, 100_000);
        let marker = truncation_marker(1000);
        assert!(out.text.ends_with(&marker));
        assert_eq!(out.text.len(), 1000);
    }

    #[test]
    fn marker_never_pushes_output_past_a_tiny_ceiling() {
        let out = OutputCapture::spawn(Cursor::new(vec![b'x'; 100]), 8).finish(Duration::from_secs(5));
        assert!(out.truncated);
        assert_eq!(out.text.len(), 8);
    }

    #[test]
    fn append_within_keeps_the_note_whole() {
        let mut text = "abcdefghij".to_string();
        append_within(&mut text, "[note]", 12);
        assert_eq!(text, "abcdef[note]");
    }

    #[test]
    fn multibyte_text_is_cut_on_a_char_boundary() {
        let data = "é".repeat(10).into_bytes();
        let out = OutputCapture::spawn(Cursor::new(data), 5).finish(Duration::from_secs(5));
        let body = out.text.trim_end_matches(&truncation_marker(5));
        assert!(body.len() <= 5);
        assert!(body.chars().all(|c| c == 'é' || c == '\u{FFFD}'));
    }
}
