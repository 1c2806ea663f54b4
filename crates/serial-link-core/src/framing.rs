//! Sentinel-delimited text framing.
//!
//! Frames look like `<payload>`. A start delimiter always discards whatever
//! was buffered, so an unterminated frame is superseded by the next one. An
//! end delimiter only completes a frame that was opened; outside a frame it
//! drops the buffered noise instead.

/// Start-of-frame delimiter.
pub const FRAME_START: char = '<';
/// End-of-frame delimiter.
pub const FRAME_END: char = '>';
/// Byte written back after every completed frame (ASCII `A`).
pub const ACK_BYTE: u8 = 65;

/// Accumulates characters into frames.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: String,
    in_frame: bool,
}

impl FrameReader {
    /// Create a reader with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one character.
    ///
    /// Returns the frame payload when `c` completes a frame; the buffer is
    /// empty again afterwards.
    pub fn push(&mut self, c: char) -> Option<String> {
        match c {
            FRAME_START => {
                self.buffer.clear();
                self.in_frame = true;
                None
            }
            FRAME_END => {
                let payload = std::mem::take(&mut self.buffer);
                std::mem::replace(&mut self.in_frame, false).then_some(payload)
            }
            _ => {
                self.buffer.push(c);
                None
            }
        }
    }

    /// Feed a run of text and collect every completed frame, in order.
    pub fn push_str(&mut self, text: &str) -> Vec<String> {
        text.chars().filter_map(|c| self.push(c)).collect()
    }

    /// Content buffered since the last delimiter.
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Whether a start delimiter has been seen without its end.
    #[must_use]
    pub const fn in_frame(&self) -> bool {
        self.in_frame
    }

    /// Drop any buffered content.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_frame = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_between_frames_discarded() {
        let mut reader = FrameReader::new();
        let frames = reader.push_str("noise<AB>junk<CD>");
        assert_eq!(frames, vec!["AB", "CD"]);
        assert_eq!(reader.pending(), "");
    }

    #[test]
    fn test_restart_supersedes_unterminated_frame() {
        let mut reader = FrameReader::new();
        assert_eq!(reader.push_str("<AB<CD>"), vec!["CD"]);
    }

    #[test]
    fn test_frame_split_across_pushes() {
        let mut reader = FrameReader::new();
        assert!(reader.push_str("<he").is_empty());
        assert_eq!(reader.pending(), "he");
        assert_eq!(reader.push_str("llo>"), vec!["hello"]);
    }

    #[test]
    fn test_empty_frame() {
        let mut reader = FrameReader::new();
        assert_eq!(reader.push_str("<>"), vec![String::new()]);
    }

    #[test]
    fn test_unterminated_tail_never_emitted() {
        let mut reader = FrameReader::new();
        assert_eq!(reader.push_str("<A><B"), vec!["A"]);
        assert_eq!(reader.pending(), "B");
        reader.reset();
        assert_eq!(reader.pending(), "");
    }

    #[test]
    fn test_stray_end_discards_noise() {
        let mut reader = FrameReader::new();
        assert!(reader.push_str("xy>").is_empty());
        assert_eq!(reader.pending(), "");
        assert_eq!(reader.push_str("<AB>junk>"), vec!["AB"]);
        assert!(!reader.in_frame());
    }
}
