//! Bounded output capture.

/// Marker appended to output that exceeded the cap.
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Append-only byte buffer that keeps at most `cap` bytes.
///
/// Bytes past the cap are counted and discarded, so a producer that never
/// stops writing cannot grow memory beyond the cap.
#[derive(Debug)]
pub struct BoundedOutput {
    buf: Vec<u8>,
    cap: usize,
    total: usize,
}

impl BoundedOutput {
    pub fn new(cap: usize) -> Self {
        Self { buf: Vec::with_capacity(cap.min(64 * 1024)), cap, total: 0 }
    }

    /// Append a chunk, keeping only what fits under the cap.
    pub fn push(&mut self, chunk: &[u8]) {
        self.total = self.total.saturating_add(chunk.len());
        let room = self.cap.saturating_sub(self.buf.len());
        self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    /// Whether anything was discarded.
    pub fn is_truncated(&self) -> bool {
        self.total > self.buf.len()
    }

    /// Bytes offered, including discarded ones.
    pub fn total_bytes(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Captured text (lossy UTF-8) with the truncation marker when truncated.
    ///
    /// The result is at most `cap + TRUNCATION_MARKER.len()` bytes.
    pub fn into_string(self) -> String {
        let truncated = self.is_truncated();
        let mut text = String::from_utf8_lossy(&self.buf).into_owned();
        if truncated {
            // A multi-byte char split at the cap decodes to U+FFFD (3 bytes)
            // which can push the text past the cap.
            cut_at_char_boundary(&mut text, self.cap);
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// Truncate `text` to at most `max_bytes`, appending the marker when cut.
///
/// Returns whether the text was cut.
pub fn truncate_text(text: &mut String, max_bytes: usize) -> bool {
    if text.len() <= max_bytes {
        return false;
    }
    cut_at_char_boundary(text, max_bytes);
    text.push_str(TRUNCATION_MARKER);
    true
}

fn cut_at_char_boundary(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_under_cap_is_untouched() {
        let mut out = BoundedOutput::new(16);
        out.push(b"hello ");
        out.push(b"world");
        assert!(!out.is_truncated());
        assert_eq!(out.into_string(), "hello world");
    }

    #[test]
    fn test_over_cap_is_truncated_with_marker() {
        let mut out = BoundedOutput::new(8);
        for _ in 0..1000 {
            out.push(b"0123456789");
        }
        assert!(out.is_truncated());
        assert_eq!(out.total_bytes(), 10_000);
        let text = out.into_string();
        assert_eq!(text, format!("01234567{TRUNCATION_MARKER}"));
        assert!(text.len() <= 8 + TRUNCATION_MARKER.len());
    }

    #[test]
    fn test_split_multibyte_char_stays_within_bound() {
        let mut out = BoundedOutput::new(4);
        out.push("aaaé".as_bytes());
        out.push(b"more");
        let text = out.into_string();
        assert!(text.len() <= 4 + TRUNCATION_MARKER.len());
        assert!(text.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_truncate_text() {
        let mut text = "héllo wörld".to_string();
        assert!(truncate_text(&mut text, 2));
        assert_eq!(text, format!("h{TRUNCATION_MARKER}"));

        let mut short = "ok".to_string();
        assert!(!truncate_text(&mut short, 10));
        assert_eq!(short, "ok");
    }
}
