//! Overlapping text chunker.
//!
//! Splits document text into segments of at most `target_size` characters,
//! cutting on paragraph boundaries (`\n\n`) where possible, then sentence
//! ends, then whitespace, and only hard character cuts when a single
//! sentence exceeds the target. Each chunk after the first repeats the last
//! `overlap` characters of the previous chunk's non-overlapping portion, so
//! context survives across chunk boundaries.
//!
//! Reconstruction invariant: dropping the overlap prefix of every chunk
//! after the first and concatenating yields the source text exactly. The
//! overlap prefix of chunk `i` is `min(overlap, core_len(i-1))` characters,
//! where `core_len` is the chunk's length minus its own overlap prefix.
//!
//! Chunking is pure (no I/O); [`Chunker::chunk`] returns a lazy, finite
//! iterator and can be called again on the same text to restart.

use crate::error::{EngineError, Result};

/// Splits text into overlapping chunks. Sizes are in characters.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    target_size: usize,
    overlap: usize,
}

impl Chunker {
    /// Create a chunker.
    ///
    /// Fails with `InvalidInput` when `target_size` is zero or
    /// `overlap >= target_size`.
    pub fn new(target_size: usize, overlap: usize) -> Result<Self> {
        if target_size == 0 {
            return Err(EngineError::InvalidInput(
                "chunk target_size must be > 0".to_string(),
            ));
        }
        if overlap >= target_size {
            return Err(EngineError::InvalidInput(format!(
                "chunk overlap ({}) must be smaller than target_size ({})",
                overlap, target_size
            )));
        }
        Ok(Self {
            target_size,
            overlap,
        })
    }

    /// Lazily chunk `text`. Fails with `InvalidInput` on empty text.
    pub fn chunk<'a>(&self, text: &'a str) -> Result<ChunkIter<'a>> {
        if text.is_empty() {
            return Err(EngineError::InvalidInput(
                "cannot chunk empty text".to_string(),
            ));
        }
        // Byte offset of every char, plus the end sentinel, so cuts always
        // land on char boundaries.
        let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        offsets.push(text.len());
        Ok(ChunkIter {
            text,
            offsets,
            pos: 0,
            prev_core_start: 0,
            target_size: self.target_size,
            overlap: self.overlap,
        })
    }

    /// Chunk `text` and collect the pieces.
    pub fn chunk_text(&self, text: &str) -> Result<Vec<String>> {
        Ok(self.chunk(text)?.collect())
    }
}

/// Lazy iterator over chunk texts. Obtained from [`Chunker::chunk`].
#[derive(Debug, Clone)]
pub struct ChunkIter<'a> {
    text: &'a str,
    offsets: Vec<usize>,
    /// Char index where the next non-overlapping core begins.
    pos: usize,
    prev_core_start: usize,
    target_size: usize,
    overlap: usize,
}

impl<'a> ChunkIter<'a> {
    fn char_count(&self) -> usize {
        self.offsets.len() - 1
    }

    fn slice(&self, from: usize, to: usize) -> &'a str {
        &self.text[self.offsets[from]..self.offsets[to]]
    }

    fn char_at(&self, idx: usize) -> char {
        self.text[self.offsets[idx]..].chars().next().unwrap_or(' ')
    }

    /// Pick the best cut position in `(lo, hi]`, preferring paragraph
    /// breaks, then sentence ends, then whitespace. Falls back to a hard
    /// cut at `hi` when the window is one unbroken run.
    fn find_cut(&self, lo: usize, hi: usize) -> usize {
        let mut sentence_cut = None;
        let mut space_cut = None;

        // Walk backward so the latest acceptable boundary wins.
        let mut idx = hi;
        while idx > lo + 1 {
            idx -= 1;
            let c = self.char_at(idx);
            let prev = self.char_at(idx - 1);

            if c == '\n' && prev == '\n' {
                // Cut after the paragraph break.
                return idx + 1;
            }
            if sentence_cut.is_none()
                && c.is_whitespace()
                && matches!(prev, '.' | '!' | '?' | '\n')
            {
                sentence_cut = Some(idx + 1);
            }
            if space_cut.is_none() && c.is_whitespace() {
                space_cut = Some(idx + 1);
            }
        }

        sentence_cut.or(space_cut).unwrap_or(hi)
    }
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let nchars = self.char_count();
        if self.pos >= nchars {
            return None;
        }

        let core_end = if nchars - self.pos <= self.target_size {
            nchars
        } else {
            self.find_cut(self.pos, self.pos + self.target_size)
        };

        // Overlap reaches back into the previous core only — never past its
        // start, so every source character appears in at most two chunks.
        let start = self.pos.saturating_sub(self.overlap).max(self.prev_core_start);
        let piece = self.slice(start, core_end).to_string();

        self.prev_core_start = self.pos;
        self.pos = core_end;
        Some(piece)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Strip overlap prefixes and concatenate; must equal the source.
    fn reconstruct(chunks: &[String], overlap: usize) -> String {
        let mut out = String::new();
        let mut prev_core_len = 0usize;
        for (i, chunk) in chunks.iter().enumerate() {
            let skip = if i == 0 { 0 } else { overlap.min(prev_core_len) };
            let core: String = chunk.chars().skip(skip).collect();
            prev_core_len = core.chars().count();
            out.push_str(&core);
        }
        out
    }

    #[test]
    fn test_empty_text_rejected() {
        let chunker = Chunker::new(100, 10).unwrap();
        assert!(matches!(
            chunker.chunk(""),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_overlap_must_be_smaller_than_target() {
        assert!(matches!(
            Chunker::new(100, 100),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            Chunker::new(100, 150),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(Chunker::new(100, 99).is_ok());
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunker = Chunker::new(700, 50).unwrap();
        let chunks = chunker.chunk_text("Hello, world!").unwrap();
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_splits_on_paragraph_boundary() {
        let text = "First paragraph here.\n\nSecond paragraph follows along.";
        let chunker = Chunker::new(30, 0).unwrap();
        let chunks = chunker.chunk_text(text).unwrap();
        assert!(chunks.len() >= 2);
        assert!(chunks[0].starts_with("First paragraph"));
        assert_eq!(reconstruct(&chunks, 0), text);
    }

    #[test]
    fn test_hard_cut_when_no_boundary() {
        // One unbroken run longer than the target forces character cuts.
        let text = "x".repeat(250);
        let chunker = Chunker::new(100, 0).unwrap();
        let chunks = chunker.chunk_text(&text).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 100);
        assert_eq!(reconstruct(&chunks, 0), text);
    }

    #[test]
    fn test_overlap_carried_from_previous_chunk() {
        let text = "aaaaaaaaaa bbbbbbbbbb cccccccccc dddddddddd";
        let chunker = Chunker::new(15, 5).unwrap();
        let chunks = chunker.chunk_text(text).unwrap();
        assert!(chunks.len() > 1);
        for window in chunks.windows(2) {
            let prev: Vec<char> = window[0].chars().collect();
            let next: Vec<char> = window[1].chars().collect();
            // The next chunk opens with the previous chunk's tail.
            let carried: String = next.iter().take(5).collect();
            let tail: String = prev[prev.len().saturating_sub(5)..].iter().collect();
            assert_eq!(carried, tail);
        }
        assert_eq!(reconstruct(&chunks, 5), text);
    }

    #[test]
    fn test_reconstruction_multibyte() {
        let text = "héllo wörld. ".repeat(40);
        let chunker = Chunker::new(50, 10).unwrap();
        let chunks = chunker.chunk_text(&text).unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(reconstruct(&chunks, 10), text);
    }

    #[test]
    fn test_iterator_is_restartable() {
        let text = "Alpha beta gamma delta. ".repeat(20);
        let chunker = Chunker::new(60, 12).unwrap();
        let first: Vec<String> = chunker.chunk(&text).unwrap().collect();
        let second: Vec<String> = chunker.chunk(&text).unwrap().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_three_paragraph_document() {
        // ~3 paragraphs at target 500 / overlap 50 should land in 2..=4 chunks.
        let para = "The quarterly report covers revenue, churn, and expansion. \
                    Each region contributed to growth this cycle. "
            .repeat(3);
        let text = format!("{p}\n\n{p}\n\n{p}", p = para.trim_end());
        let chunker = Chunker::new(500, 50).unwrap();
        let chunks = chunker.chunk_text(&text).unwrap();
        assert!(
            (2..=4).contains(&chunks.len()),
            "expected 2..=4 chunks, got {}",
            chunks.len()
        );
        assert_eq!(reconstruct(&chunks, 50), text);
    }

    #[test]
    fn test_every_chunk_within_budget() {
        let text = "Sentence one is short. Sentence two runs a little longer than that. "
            .repeat(30);
        let chunker = Chunker::new(120, 20).unwrap();
        for chunk in chunker.chunk(&text).unwrap() {
            // Core at most target_size, plus at most `overlap` carried chars.
            assert!(chunk.chars().count() <= 140, "oversized chunk: {}", chunk.len());
        }
    }
}
