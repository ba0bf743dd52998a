//! Sentence segmentation for streaming synthesis.
//!
//! Buffers a live token stream into sentence-sized units so synthesis can
//! start before the full reply is generated, without firing on tiny
//! fragments. A flush happens when the buffer ends on a sentence
//! terminator, or when it has grown past the length threshold and the
//! newly appended token brought a terminator with it. Whatever remains at
//! stream end is flushed as-is.

/// Characters that end a sentence, CJK and ASCII.
const SENTENCE_TERMINATORS: &[char] = &['。', '！', '？', '；', '!', '?', ';', '.'];

/// Buffer length threshold (in characters) past which a terminator
/// anywhere in the incoming token forces a flush.
const DEFAULT_MAX_BUFFERED_CHARS: usize = 50;

fn is_terminator(c: char) -> bool {
    SENTENCE_TERMINATORS.contains(&c)
}

/// Stateful token-to-sentence buffer. Not restartable: one segmenter per
/// generation stream.
#[derive(Debug)]
pub struct SentenceSegmenter {
    buffer: String,
    max_buffered_chars: usize,
}

impl Default for SentenceSegmenter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFERED_CHARS)
    }
}

impl SentenceSegmenter {
    pub fn new(max_buffered_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            max_buffered_chars,
        }
    }

    /// Append one token. Returns the buffered text when the token
    /// completes a flush-ready unit.
    pub fn push(&mut self, token: &str) -> Option<String> {
        if token.is_empty() {
            return None;
        }
        self.buffer.push_str(token);

        let ends_on_terminator = self
            .buffer
            .chars()
            .last()
            .map(is_terminator)
            .unwrap_or(false);
        let over_threshold = self.buffer.chars().count() > self.max_buffered_chars
            && token.chars().any(is_terminator);

        if ends_on_terminator || over_threshold {
            Some(std::mem::take(&mut self.buffer))
        } else {
            None
        }
    }

    /// Flush whatever remains at stream end, terminator or not.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
