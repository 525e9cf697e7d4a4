//! Fixed-window character chunking with overlap.
//!
//! Windows are `chunk_size` characters long and start `chunk_size - overlap`
//! characters apart, so consecutive chunks of a document share exactly
//! `overlap` characters. The last window stops at the end of the text and may
//! be shorter. Offsets are character offsets, never byte offsets, so
//! multi-byte text is never split inside a code point.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{chunk_id, Chunk, Document};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { chunk_size: 1000, overlap: 200 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    /// Validates the window geometry once, so per-document chunking cannot fail.
    pub fn new(config: ChunkingConfig) -> Result<Self, ConfigError> {
        if config.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be greater than zero".to_string()));
        }
        if config.overlap >= config.chunk_size {
            return Err(ConfigError::Invalid(format!(
                "overlap ({}) must be smaller than chunk_size ({})",
                config.overlap, config.chunk_size
            )));
        }
        Ok(Self { chunk_size: config.chunk_size, overlap: config.overlap })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    fn step(&self) -> usize {
        self.chunk_size - self.overlap
    }

    /// Lazily yields the windows of `text`. Cloning the iterator restarts nothing;
    /// calling `spans` again starts over from the beginning.
    pub fn spans<'a>(&self, text: &'a str) -> Spans<'a> {
        Spans { text, byte_pos: 0, char_pos: 0, size: self.chunk_size, step: self.step(), done: false }
    }

    /// Number of windows produced for a text of `char_len` characters.
    pub fn expected_chunks(&self, char_len: usize) -> usize {
        if char_len <= self.chunk_size {
            1
        } else {
            (char_len - self.overlap).div_ceil(self.step())
        }
    }

    /// Turns a document into chunks carrying its identity, hash and metadata.
    pub fn chunk_document<'a>(&self, doc: &'a Document) -> impl Iterator<Item = Chunk> + 'a {
        self.spans(&doc.content).map(move |span| Chunk {
            chunk_id: chunk_id(&doc.source_id, span.start),
            source_id: doc.source_id.clone(),
            text: span.text.to_string(),
            start_offset: span.start,
            end_offset: span.end,
            content_hash: doc.content_hash.clone(),
            added_at: doc.added_at,
            metadata: doc.metadata.clone(),
        })
    }
}

/// One window of the source text; `start..end` in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span<'a> {
    pub start: usize,
    pub end: usize,
    pub text: &'a str,
}

#[derive(Debug, Clone)]
pub struct Spans<'a> {
    text: &'a str,
    byte_pos: usize,
    char_pos: usize,
    size: usize,
    step: usize,
    done: bool,
}

impl<'a> Iterator for Spans<'a> {
    type Item = Span<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let rest = &self.text[self.byte_pos..];
        let mut count = 0usize;
        let mut end = rest.len();
        for (i, _) in rest.char_indices() {
            if count == self.size {
                end = i;
                break;
            }
            count += 1;
        }
        let span = Span { start: self.char_pos, end: self.char_pos + count, text: &rest[..end] };
        if end == rest.len() {
            self.done = true;
        } else {
            // step < size <= count, so the next start is inside this window
            let advance = rest.char_indices().nth(self.step).map_or(rest.len(), |(i, _)| i);
            self.byte_pos += advance;
            self.char_pos += self.step;
        }
        Some(span)
    }
}

impl std::iter::FusedIterator for Spans<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Meta;

    fn chunker(size: usize, overlap: usize) -> Chunker {
        Chunker::new(ChunkingConfig { chunk_size: size, overlap }).expect("valid config")
    }

    #[test]
    fn rejects_overlap_not_smaller_than_size() {
        assert!(Chunker::new(ChunkingConfig { chunk_size: 100, overlap: 100 }).is_err());
        assert!(Chunker::new(ChunkingConfig { chunk_size: 100, overlap: 150 }).is_err());
        assert!(Chunker::new(ChunkingConfig { chunk_size: 0, overlap: 0 }).is_err());
        assert!(Chunker::new(ChunkingConfig { chunk_size: 100, overlap: 99 }).is_ok());
    }

    #[test]
    fn short_text_is_one_chunk() {
        let c = chunker(1000, 200);
        let spans: Vec<_> = c.spans("Short text").collect();
        assert_eq!(spans.len(), 1);
        assert_eq!((spans[0].start, spans[0].end), (0, 10));
        assert_eq!(spans[0].text, "Short text");

        let empty: Vec<_> = c.spans("").collect();
        assert_eq!(empty.len(), 1);
        assert_eq!((empty[0].start, empty[0].end), (0, 0));
    }

    #[test]
    fn twenty_five_hundred_chars_make_three_windows() {
        let text: String = (0..2500).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let c = chunker(1000, 200);
        let offsets: Vec<_> = c.spans(&text).map(|s| (s.start, s.end)).collect();
        assert_eq!(offsets, vec![(0, 1000), (800, 1800), (1600, 2500)]);
    }

    #[test]
    fn count_matches_formula_and_overlap_is_exact() {
        let c = chunker(10, 3);
        for len in 0..120usize {
            let text: String = (0..len).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
            let spans: Vec<_> = c.spans(&text).collect();
            assert_eq!(spans.len(), c.expected_chunks(len), "len={len}");
            for s in &spans {
                assert!(s.end - s.start <= 10);
                assert_eq!(s.text.chars().count(), s.end - s.start);
            }
            for pair in spans.windows(2) {
                assert_eq!(pair[0].end - pair[1].start, 3, "len={len}");
            }
            assert_eq!(spans.last().map(|s| s.end), Some(len));
        }
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "héllo wörld ünïcode ✓✓✓ ok";
        let c = chunker(8, 2);
        let spans: Vec<_> = c.spans(text).collect();
        let rebuilt: String = spans
            .iter()
            .enumerate()
            .map(|(i, s)| if i == 0 { s.text.to_string() } else { s.text.chars().skip(2).collect() })
            .collect();
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn iteration_is_restartable() {
        let c = chunker(4, 1);
        let first: Vec<_> = c.spans("abcdefghij").collect();
        let second: Vec<_> = c.spans("abcdefghij").collect();
        assert_eq!(first, second);
    }

    #[test]
    fn document_chunks_carry_identity() {
        let mut meta = Meta::new();
        meta.insert("lang".into(), "en".into());
        let doc = Document::new("doc1", "abcdefghij", meta);
        let chunks: Vec<_> = chunker(4, 1).chunk_document(&doc).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].chunk_id, "doc1#3");
        assert_eq!(chunks[1].text, "defg");
        assert!(chunks.iter().all(|c| c.metadata.get("lang").map(String::as_str) == Some("en")));
        assert!(chunks.iter().all(|c| c.content_hash == doc.content_hash));
    }
}
