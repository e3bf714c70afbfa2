//! Bounded splitting of text into stream-sized pieces.

/// Maximum size of one tool-call argument fragment frame.
pub const TOOL_ARGUMENT_CHUNK_BYTES: usize = 32;

/// Maximum size of one content delta frame.
pub const TEXT_CHUNK_BYTES: usize = 1024;

/// Split `text` into pieces of at most `max_bytes` bytes, never cutting a
/// UTF-8 character. A character wider than `max_bytes` forms its own piece.
/// Concatenating the pieces yields `text`; the empty string yields `[""]`.
pub fn chunk_text(text: &str, max_bytes: usize) -> Vec<&str> {
    if text.is_empty() {
        return vec![""];
    }

    let max_bytes = max_bytes.max(1);
    let mut chunks = Vec::with_capacity(text.len() / max_bytes + 1);
    let mut rest = text;

    while !rest.is_empty() {
        let mut end = rest.len().min(max_bytes);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }

    chunks
}
