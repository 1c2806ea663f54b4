//! Streaming UTF-8 decoding for chunked serial input.

/// Decodes byte chunks into text, carrying split multi-byte sequences over
/// to the next chunk.
///
/// Invalid sequences decode to U+FFFD, matching lossy decoding.
#[derive(Debug, Default)]
pub struct TextDecoder {
    pending: Vec<u8>,
}

impl TextDecoder {
    /// Create a decoder with no carried-over bytes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next chunk.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());

                    if let Some(invalid_len) = e.error_len() {
                        out.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[invalid_len..];
                    } else {
                        // Incomplete sequence at the end of the chunk
                        self.pending = after.to_vec();
                        break;
                    }
                }
            }
        }

        out
    }

    /// Flush a dangling partial sequence.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}
