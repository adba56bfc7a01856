//! Resuming truncated generations.
//!
//! When a 200 OK reply fails validation, whatever text it did carry is kept
//! and the next attempt asks the model to pick up where it stopped. The
//! continuation request is always rebuilt from the request as it was before
//! any continuation, with the full accumulated text as the assistant turn.

use bytes::Bytes;

use crate::format::{self, FormatError, WireFormat};

/// Text of a partial reply. Empty when the body is not JSON or has no text.
pub fn extract_partial_text(body: &[u8], format: &dyn WireFormat) -> String {
    format::extract_text(body, format)
}

/// Rewrite `original` so the model continues after `accumulated`.
///
/// Returns `original` unchanged when there is nothing to continue from.
pub fn build_continuation_request(
    original: &Bytes,
    accumulated: &str,
    format: &dyn WireFormat,
) -> Result<Bytes, FormatError> {
    if accumulated.trim().is_empty() {
        return Ok(original.clone());
    }
    let mut request = format::parse_object(original)?;
    format.insert_continuation_turns(&mut request, accumulated);
    Ok(Bytes::from(serde_json::to_vec(&request)?))
}

/// Partial output gathered across the attempts of one client request.
#[derive(Debug, Default)]
pub struct AccumulatedText {
    text: String,
    chars: usize,
    /// Maximum length in characters; 0 means unlimited.
    cap: usize,
}

impl AccumulatedText {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            ..Self::default()
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.chars
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.chars = 0;
    }

    /// Append `piece`, dropping whatever would exceed the cap.
    /// Returns `true` if anything was dropped.
    pub fn append(&mut self, piece: &str) -> bool {
        let incoming = piece.chars().count();
        if self.cap == 0 || self.chars + incoming <= self.cap {
            self.text.push_str(piece);
            self.chars += incoming;
            return false;
        }

        let room = self.cap.saturating_sub(self.chars);
        let cut = piece
            .char_indices()
            .nth(room)
            .map_or(piece.len(), |(idx, _)| idx);
        self.text.push_str(&piece[..cut]);
        self.chars += room;
        tracing::warn!(
            cap = self.cap,
            dropped = incoming - room,
            "accumulated continuation text hit its cap; tail dropped"
        );
        true
    }
}
