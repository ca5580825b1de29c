//! Recursive separator-aware text chunker.
//!
//! Splits document text into overlapping segments honoring semantic
//! separators. The splitter tries the coarsest separator first (paragraph,
//! line, sentence punctuation, word) and only descends to finer separators
//! for pieces that are still larger than `chunk_size` after a split. Pieces
//! are then accumulated into chunks, carrying the tail of the previous
//! chunk up to `chunk_overlap` characters into the next one.
//!
//! Sizes are measured in characters (`char` count, not bytes), so
//! multibyte text never splits inside a code point. The function is pure:
//! identical input and options always produce identical output.

/// Approximate chars-per-token ratio used for chunk token counts.
const CHARS_PER_TOKEN: usize = 4;

/// Chunking parameters. The empty-string separator means "split anywhere"
/// and acts as the final fallback for pieces no separator can break up.
#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub separators: Vec<String>,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            separators: vec![
                "\n\n".to_string(),
                "\n".to_string(),
                ". ".to_string(),
                " ".to_string(),
                String::new(),
            ],
        }
    }
}

/// Per-job chunking overrides, carried in index and reindex payloads.
/// Unset fields fall back to the resolved profile's settings.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChunkOverride {
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub chunk_overlap: Option<usize>,
    #[serde(default)]
    pub separators: Option<Vec<String>>,
}

impl ChunkOverride {
    /// Resolve against base options, taking set fields over the base.
    pub fn apply(&self, base: ChunkOptions) -> ChunkOptions {
        ChunkOptions {
            chunk_size: self.chunk_size.unwrap_or(base.chunk_size),
            chunk_overlap: self.chunk_overlap.unwrap_or(base.chunk_overlap),
            separators: self.separators.clone().unwrap_or(base.separators),
        }
    }
}

/// A produced segment with its ordinal position within the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPiece {
    pub content: String,
    pub index: usize,
}

/// Estimate the token count of a text segment.
pub fn approx_token_count(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Split `text` into chunks of at most `chunk_size` characters (plus
/// overlap carry), with contiguous indices starting at 0. Blank segments
/// are dropped after trimming; blank input yields an empty vec.
pub fn chunk_text(text: &str, opts: &ChunkOptions) -> Vec<ChunkPiece> {
    if text.trim().is_empty() || opts.chunk_size == 0 {
        return Vec::new();
    }

    let pieces = split_recursive(text, &opts.separators, opts.chunk_size);

    let mut chunks: Vec<ChunkPiece> = Vec::new();
    let mut buf = String::new();
    // Whether buf holds anything beyond the carried overlap tail. A buf
    // that is pure overlap must never be flushed as its own chunk.
    let mut buf_has_new = false;

    for piece in pieces {
        let piece_len = char_len(&piece);
        if buf_has_new && char_len(&buf) + piece_len > opts.chunk_size {
            push_chunk(&mut chunks, &buf);
            buf = char_tail(&buf, opts.chunk_overlap);
            buf_has_new = false;
        }
        buf.push_str(&piece);
        buf_has_new = true;
    }

    if buf_has_new {
        push_chunk(&mut chunks, &buf);
    }

    chunks
}

fn push_chunk(chunks: &mut Vec<ChunkPiece>, buf: &str) {
    let trimmed = buf.trim();
    if trimmed.is_empty() {
        return;
    }
    chunks.push(ChunkPiece {
        content: trimmed.to_string(),
        index: chunks.len(),
    });
}

/// Break text into pieces of at most `chunk_size` characters, descending
/// from coarse to fine separators. Separators stay attached to the end of
/// each piece so merged chunks read like the original text.
fn split_recursive(text: &str, separators: &[String], chunk_size: usize) -> Vec<String> {
    let Some((sep, finer)) = separators.split_first() else {
        return hard_split(text, chunk_size);
    };

    if sep.is_empty() {
        return hard_split(text, chunk_size);
    }

    let mut out = Vec::new();
    for part in text.split_inclusive(sep.as_str()) {
        if char_len(part) <= chunk_size {
            out.push(part.to_string());
        } else {
            out.extend(split_recursive(part, finer, chunk_size));
        }
    }
    out
}

/// Last-resort split at fixed character offsets.
fn hard_split(text: &str, chunk_size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_size.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Last `n` characters of `s` (char-boundary safe).
fn char_tail(s: &str, n: usize) -> String {
    if n == 0 {
        return String::new();
    }
    let len = char_len(s);
    if len <= n {
        return s.to_string();
    }
    s.chars().skip(len - n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(size: usize, overlap: usize) -> ChunkOptions {
        ChunkOptions {
            chunk_size: size,
            chunk_overlap: overlap,
            ..ChunkOptions::default()
        }
    }

    #[test]
    fn small_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", &ChunkOptions::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].content, "Hello, world!");
    }

    #[test]
    fn blank_input_yields_no_chunks() {
        assert!(chunk_text("", &ChunkOptions::default()).is_empty());
        assert!(chunk_text("   \n\n  \t ", &ChunkOptions::default()).is_empty());
    }

    #[test]
    fn indices_contiguous_from_zero() {
        let text = (0..60)
            .map(|i| format!("Paragraph number {} with some extra words in it.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text(&text, &opts(120, 20));
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
        }
    }

    #[test]
    fn no_chunk_is_blank_after_trim() {
        let text = "alpha\n\n\n\n   \n\nbeta\n\ngamma";
        for c in chunk_text(&text, &opts(10, 2)) {
            assert!(!c.content.trim().is_empty());
        }
    }

    #[test]
    fn deterministic() {
        let text = "Alpha beta gamma.\n\nDelta epsilon zeta.\n\nEta theta iota kappa lambda.";
        let a = chunk_text(text, &opts(30, 8));
        let b = chunk_text(text, &opts(30, 8));
        assert_eq!(a, b);
    }

    #[test]
    fn respects_chunk_size_plus_overlap_tolerance() {
        let text = "word ".repeat(400);
        let o = opts(100, 20);
        let chunks = chunk_text(&text, &o);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(
                c.content.chars().count() <= o.chunk_size + o.chunk_overlap,
                "chunk too large: {}",
                c.content.chars().count()
            );
        }
    }

    #[test]
    fn overlap_carries_tail_of_previous_chunk() {
        let text = "one two three four five six seven eight nine ten eleven twelve";
        let chunks = chunk_text(&text, &opts(25, 10));
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            // The second chunk starts with text drawn from the end of the
            // first (modulo trimming).
            let tail: String = pair[0].content.chars().rev().take(10).collect();
            let head: String = pair[1].content.chars().take(4).collect();
            let tail_rev: String = tail.chars().rev().collect();
            assert!(
                tail_rev.contains(head.trim()),
                "no overlap between {:?} and {:?}",
                pair[0].content,
                pair[1].content
            );
        }
    }

    #[test]
    fn scenario_1200_chars_default_options() {
        // 1200-character plain-text document with defaults 500/50.
        let sentence = "The quick brown fox jumps over the lazy dog near the river bank. ";
        let mut text = String::new();
        while text.chars().count() < 1200 {
            text.push_str(sentence);
        }
        let text: String = text.chars().take(1200).collect();

        let o = ChunkOptions::default();
        let chunks = chunk_text(&text, &o);
        assert!(chunks.len() >= 2, "expected >=2 chunks, got {}", chunks.len());
        for c in &chunks {
            assert!(c.content.chars().count() <= o.chunk_size + o.chunk_overlap);
        }
    }

    #[test]
    fn multibyte_text_never_splits_code_points() {
        let text = "é".repeat(1000);
        let chunks = chunk_text(&text, &opts(100, 10));
        let total: usize = chunks.iter().map(|c| c.content.chars().count()).sum();
        assert!(total >= 1000); // overlap duplicates some chars
    }

    #[test]
    fn all_words_survive_chunking() {
        let text = "alpha bravo charlie delta echo foxtrot golf hotel india juliett";
        let chunks = chunk_text(&text, &opts(20, 5));
        let joined: String = chunks
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        for word in text.split_whitespace() {
            assert!(joined.contains(word), "lost word {}", word);
        }
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(approx_token_count(""), 0);
        assert_eq!(approx_token_count("abcd"), 1);
        assert_eq!(approx_token_count("abcde"), 2);
    }

    #[test]
    fn override_takes_set_fields_over_base() {
        let base = ChunkOptions::default();
        let resolved = ChunkOverride {
            chunk_size: Some(120),
            ..ChunkOverride::default()
        }
        .apply(base.clone());
        assert_eq!(resolved.chunk_size, 120);
        assert_eq!(resolved.chunk_overlap, base.chunk_overlap);
        assert_eq!(resolved.separators, base.separators);

        let untouched = ChunkOverride::default().apply(base.clone());
        assert_eq!(untouched.chunk_size, base.chunk_size);
    }
}
