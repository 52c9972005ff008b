//! Sentence-aware overlapping chunking.
//!
//! Operates on characters, not bytes, so multi-byte text never splits inside
//! a code point. Boundary candidates are tried in preference order and only
//! accepted past the midpoint of the target chunk, which keeps chunks from
//! collapsing when a document front-loads punctuation.

pub const DEFAULT_CHUNK_SIZE: usize = 2000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 400;

/// Boundary patterns in preference order: paragraph break first, semicolon last.
const SENTENCE_ENDINGS: &[&str] = &[
    "\n\n", ".\n", "!\n", "?\n", ". ", "! ", "? ", ".\t", "\n", "; ",
];

/// Split `text` into overlapping chunks of roughly `chunk_size` characters.
///
/// Returns `(chunk_text, chunk_index)` pairs; whitespace-only chunks are
/// dropped and indices stay contiguous. Empty input yields no chunks.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<(String, u32)> {
    if text.is_empty() || chunk_size == 0 {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let endings: Vec<Vec<char>> = SENTENCE_ENDINGS
        .iter()
        .map(|b| b.chars().collect())
        .collect();

    let mut chunks = Vec::new();
    let mut start = 0_usize;
    let mut chunk_idx = 0_u32;
    let mut prev_start = usize::MAX;

    while start < chars.len() {
        // Guard against a stuck cursor.
        if start == prev_start {
            start = start.saturating_add(chunk_size / 2);
            if start >= chars.len() {
                break;
            }
        }
        prev_start = start;

        let end = (start.saturating_add(chunk_size)).min(chars.len());
        let mut window_end = end;

        // If not at end of text, prefer a sentence boundary in the latter half.
        if end < chars.len() {
            let window = chars.get(start..end).unwrap_or_default();
            for ending in &endings {
                if let Some(pos) = rfind_chars(window, ending) {
                    if pos > chunk_size / 2 {
                        window_end = start
                            .saturating_add(pos)
                            .saturating_add(ending.len());
                        break;
                    }
                }
            }
        }

        let chunk: String = chars
            .get(start..window_end)
            .unwrap_or_default()
            .iter()
            .collect();
        let stripped = chunk.trim();
        if !stripped.is_empty() {
            chunks.push((stripped.to_string(), chunk_idx));
            chunk_idx = chunk_idx.saturating_add(1);
        }

        // Step back by the overlap, but never stall.
        let next_start = window_end.saturating_sub(overlap);
        start = if next_start <= start { window_end } else { next_start };
    }

    chunks
}

/// Chunk a document, prefixing the first chunk with a short provenance header.
pub fn chunk_document(
    title: &str,
    sender: Option<&str>,
    content: &str,
    chunk_size: usize,
    overlap: usize,
) -> Vec<(String, u32)> {
    let mut chunks = chunk_text(content, chunk_size, overlap);

    if let Some((first, _)) = chunks.first_mut() {
        let mut header = format!("Title: {}\n", if title.is_empty() { "Untitled" } else { title });
        if let Some(sender) = sender {
            header.push_str(&format!("From: {sender}\n"));
        }
        header.push('\n');
        *first = format!("{header}{first}");
    }

    chunks
}

/// Last occurrence of `needle` in `haystack`, as a char offset.
fn rfind_chars(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len().saturating_sub(needle.len()))
        .rev()
        .find(|&i| haystack.get(i..i.saturating_add(needle.len())) == Some(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_text("", DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP).is_empty());
        assert!(chunk_text("   \n  ", DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP).is_empty());
    }

    #[test]
    fn short_input_is_a_single_chunk() {
        let chunks = chunk_text("one small note", DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP);
        assert_eq!(chunks, vec![("one small note".to_string(), 0)]);
    }

    #[test]
    fn breaks_land_on_sentence_boundaries_with_bounded_lengths() {
        // "A. B. C. " repeated out to ~5000 chars.
        let unit = "A. B. C. ";
        let text: String = unit.repeat(5000 / unit.len() + 1);
        let text = &text[..5000];

        let chunks = chunk_text(text, 2000, 400);
        assert!(chunks.len() >= 3);

        for (i, (chunk, idx)) in chunks.iter().enumerate() {
            assert_eq!(*idx as usize, i);
            let is_last = i == chunks.len() - 1;
            if !is_last {
                // Interior chunks end at a sentence boundary and stay within
                // (chunk_size/2, chunk_size] before whitespace stripping.
                assert!(chunk.ends_with('.'), "chunk {i} ends with {:?}", chunk.chars().last());
                let len = chunk.chars().count();
                assert!((999..=2000).contains(&len), "chunk {i} length {len}");
            }
        }
    }

    #[test]
    fn chunks_cover_the_input_with_bounded_overlap() {
        // Non-repeating sentences so each chunk matches a unique offset.
        let text: String = (0..200)
            .map(|i| format!("Sentence number {i} covers topic {}. ", i * 7))
            .collect();

        let chunks = chunk_text(&text, 2000, 400);

        // Every chunk is a verbatim window of the input; windows advance and
        // leave no gap between consecutive chunks.
        let mut search_from = 0_usize;
        let mut prev_end = 0_usize;
        for (i, (chunk, _)) in chunks.iter().enumerate() {
            let at = text[search_from..]
                .find(chunk.as_str())
                .map(|p| p + search_from)
                .unwrap_or_else(|| panic!("chunk {i} not found in input"));
            if i > 0 {
                assert!(at <= prev_end, "gap before chunk {i}");
                assert!(prev_end - at <= 400 + 1, "overlap beyond bound at chunk {i}");
            }
            prev_end = at + chunk.len();
            search_from = at + 1;
        }
        // Tail is covered.
        assert!(prev_end >= text.trim_end().len());
    }

    #[test]
    fn boundary_only_accepted_past_half_chunk() {
        // One period early on, then an unbroken run: the early period must not
        // become the break point.
        let mut text = String::from("Intro. ");
        text.push_str(&"x".repeat(3000));

        let chunks = chunk_text(&text, 2000, 400);
        let first_len = chunks[0].0.chars().count();
        assert!(first_len > 1000, "broke too early at {first_len}");
    }

    #[test]
    fn forward_progress_without_any_boundary() {
        // No sentence boundaries at all; chunking must still terminate and
        // advance by whole windows.
        let text = "z".repeat(7000);
        let chunks = chunk_text(&text, 2000, 400);
        assert!(chunks.len() >= 3);
        let total: usize = chunks.iter().map(|(c, _)| c.chars().count()).sum();
        assert!(total >= 7000);
    }

    #[test]
    fn first_chunk_carries_provenance_header() {
        let chunks = chunk_document(
            "Q3 Retro",
            Some("pat@example.com"),
            "What went well: shipping. What did not: paging.",
            2000,
            400,
        );
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].0.starts_with("Title: Q3 Retro\nFrom: pat@example.com\n\n"));
        assert!(chunks[0].0.ends_with("paging."));
    }

    #[test]
    fn header_defaults_title_and_skips_missing_sender() {
        let chunks = chunk_document("", None, "body text", 2000, 400);
        assert!(chunks[0].0.starts_with("Title: Untitled\n\n"));
    }

    #[test]
    fn multibyte_text_does_not_split_inside_code_points() {
        let text = "日本語のテキスト。".repeat(600);
        let chunks = chunk_text(&text, 2000, 400);
        assert!(!chunks.is_empty());
        for (chunk, _) in &chunks {
            // Reconstructing through chars round-trips cleanly.
            assert_eq!(chunk.chars().collect::<String>(), *chunk);
        }
    }
}
