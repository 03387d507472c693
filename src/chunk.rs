//! Heading-aware sliding-window chunker.
//!
//! Splits a markdown document into [`Chunk`]s. Heading lines (`#` through
//! the configured depth) open a new section labelled with the heading
//! text; each section body is then walked with a token window of
//! `target_tokens` and a stride of `target_tokens - overlap_tokens`
//! (never less than one token).
//!
//! # Algorithm
//!
//! 1. Scan line by line; a heading line closes the current section.
//! 2. Content before the first heading is labelled `Preamble`; a file with
//!    no headings at all is one section labelled `Document`.
//! 3. Tokenize each section body on whitespace, remembering byte spans so
//!    the emitted chunk text keeps its original formatting.
//! 4. Emit windows until the section is exhausted or the per-file cap is
//!    hit; tokens past the cap are dropped.
//!
//! Chunk ids are `{path}::{label}-{ordinal}` with a per-file ordinal, which
//! makes them deterministic and unique within a file.
//!
//! # Example
//!
//! ```rust
//! use vault_context::chunk::{chunk_document, ChunkOptions};
//!
//! let chunks = chunk_document("a.md", "# Intro\nHello world.", &ChunkOptions::default());
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].block_id, "Intro");
//! ```

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::Chunk;

/// Label for content that precedes the first heading.
pub const PREAMBLE_LABEL: &str = "Preamble";
/// Label for files without any heading.
pub const DOCUMENT_LABEL: &str = "Document";
/// Label for a heading line with no text (`#`).
const UNTITLED_LABEL: &str = "Section";

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "his", "how", "its", "may", "new", "now", "see", "two",
    "who", "did", "she", "use", "this", "that", "with", "from", "they", "will", "would", "there",
    "their", "what", "about", "which", "when", "were", "been", "into", "than", "then", "them",
    "these", "those", "some", "also", "just", "more", "most", "only", "over", "such", "very",
];

/// Tunables for [`chunk_document`].
#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
    pub max_chunks_per_file: usize,
    pub heading_depth: usize,
    pub keywords_per_chunk: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            target_tokens: 200,
            overlap_tokens: 40,
            max_chunks_per_file: 200,
            heading_depth: 3,
            keywords_per_chunk: 8,
        }
    }
}

impl From<&ChunkingConfig> for ChunkOptions {
    fn from(cfg: &ChunkingConfig) -> Self {
        Self {
            target_tokens: cfg.target_tokens,
            overlap_tokens: cfg.overlap_tokens,
            max_chunks_per_file: cfg.max_chunks_per_file,
            heading_depth: cfg.heading_depth,
            keywords_per_chunk: cfg.keywords_per_chunk,
        }
    }
}

impl ChunkOptions {
    /// Window advance per step; always at least one token.
    pub fn stride(&self) -> usize {
        self.target_tokens.saturating_sub(self.overlap_tokens).max(1)
    }
}

struct Section<'a> {
    label: String,
    lines: Vec<&'a str>,
}

/// Split a document into chunks. Never returns a chunk with blank content.
pub fn chunk_document(path: &str, text: &str, opts: &ChunkOptions) -> Vec<Chunk> {
    let sections = split_sections(text, opts.heading_depth);
    let window = opts.target_tokens.max(1);
    let stride = opts.stride();

    let mut chunks = Vec::new();
    let mut ordinal = 0usize;

    'sections: for section in sections {
        let body = section.lines.join("\n");
        let spans = token_spans(&body);
        if spans.is_empty() {
            continue;
        }

        let mut start = 0;
        loop {
            if chunks.len() >= opts.max_chunks_per_file {
                break 'sections;
            }
            let end = (start + window).min(spans.len());
            let content = &body[spans[start].0..spans[end - 1].1];
            chunks.push(make_chunk(path, &section.label, ordinal, content, opts));
            ordinal += 1;

            if end == spans.len() {
                break;
            }
            start += stride;
        }
    }

    chunks
}

/// Group lines into labelled sections.
fn split_sections(text: &str, depth: usize) -> Vec<Section<'_>> {
    let mut sections: Vec<Section<'_>> = Vec::new();
    let mut current = Section {
        label: PREAMBLE_LABEL.to_string(),
        lines: Vec::new(),
    };
    let mut saw_heading = false;

    for line in text.lines() {
        if let Some(label) = heading_label(line, depth) {
            saw_heading = true;
            sections.push(std::mem::replace(
                &mut current,
                Section {
                    label,
                    lines: Vec::new(),
                },
            ));
        } else {
            current.lines.push(line);
        }
    }
    sections.push(current);

    if !saw_heading {
        for s in &mut sections {
            s.label = DOCUMENT_LABEL.to_string();
        }
    }
    sections
}

/// Returns the trimmed heading text if `line` is a heading of level `1..=depth`.
fn heading_label(line: &str, depth: usize) -> Option<String> {
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > depth {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let label = rest.trim().trim_end_matches('#').trim();
    if label.is_empty() {
        Some(UNTITLED_LABEL.to_string())
    } else {
        Some(label.to_string())
    }
}

/// Byte spans of whitespace-delimited tokens.
fn token_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push((s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

/// Lowercased alphanumeric terms, shared by keyword search and the
/// fallback embedder.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// The `n` most frequent non-stopword terms, ties broken alphabetically.
pub fn extract_keywords(text: &str, n: usize) -> Vec<String> {
    if n == 0 {
        return Vec::new();
    }
    let mut counts: HashMap<String, usize> = HashMap::new();
    for term in tokenize(text) {
        if term.chars().count() < 3 || STOPWORDS.contains(&term.as_str()) {
            continue;
        }
        *counts.entry(term).or_insert(0) += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(n).map(|(t, _)| t).collect()
}

/// SHA-256 hex digest of `text`.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(path: &str, label: &str, ordinal: usize, text: &str, opts: &ChunkOptions) -> Chunk {
    Chunk {
        id: format!("{}::{}-{}", path, label, ordinal),
        content: text.to_string(),
        file_path: path.to_string(),
        block_id: label.to_string(),
        embedding: Vec::new(),
        keywords: extract_keywords(text, opts.keywords_per_chunk),
        hash: content_hash(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(target: usize, overlap: usize) -> ChunkOptions {
        ChunkOptions {
            target_tokens: target,
            overlap_tokens: overlap,
            ..Default::default()
        }
    }

    #[test]
    fn test_two_headings_two_chunks() {
        let text = "# Intro\nHello world.\n# Details\nMore text here.";
        let chunks = chunk_document("notes/a.md", text, &ChunkOptions::default());
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].block_id, "Intro");
        assert_eq!(chunks[0].content, "Hello world.");
        assert_eq!(chunks[1].block_id, "Details");
        assert_eq!(chunks[1].content, "More text here.");
        assert_eq!(chunks[0].id, "notes/a.md::Intro-0");
        assert_eq!(chunks[1].id, "notes/a.md::Details-1");
    }

    #[test]
    fn test_no_headings_is_document() {
        let chunks = chunk_document("a.md", "Just some text.\n\nAnother paragraph.", &ChunkOptions::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].block_id, DOCUMENT_LABEL);
        assert!(chunks[0].content.contains("Another paragraph."));
    }

    #[test]
    fn test_leading_content_is_preamble() {
        let chunks = chunk_document("a.md", "intro line\n## Body\ntext", &ChunkOptions::default());
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].block_id, PREAMBLE_LABEL);
        assert_eq!(chunks[1].block_id, "Body");
    }

    #[test]
    fn test_empty_and_whitespace_yield_nothing() {
        assert!(chunk_document("a.md", "", &ChunkOptions::default()).is_empty());
        assert!(chunk_document("a.md", "   \n\t\n", &ChunkOptions::default()).is_empty());
        assert!(chunk_document("a.md", "# Only\n\n", &ChunkOptions::default()).is_empty());
    }

    #[test]
    fn test_heading_depth_respected() {
        let o = ChunkOptions {
            heading_depth: 1,
            ..Default::default()
        };
        let chunks = chunk_document("a.md", "# Top\nx\n## Sub\ny", &o);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.contains("## Sub"));
    }

    #[test]
    fn test_hashtag_is_not_heading() {
        assert!(heading_label("#tag line", 3).is_none());
        assert_eq!(heading_label("## Title ##", 3).as_deref(), Some("Title"));
        assert_eq!(heading_label("#", 3).as_deref(), Some(UNTITLED_LABEL));
    }

    #[test]
    fn test_window_overlap() {
        let text = "a b c d e f g h i j";
        let chunks = chunk_document("a.md", text, &opts(4, 2));
        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["a b c d", "c d e f", "e f g h", "g h i j"]);
    }

    #[test]
    fn test_overlap_ge_target_still_progresses() {
        let text = (0..30).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        for (t, o) in [(3, 3), (3, 10), (1, 0), (0, 0)] {
            let chunks = chunk_document("a.md", &text, &opts(t, o));
            assert!(!chunks.is_empty());
            assert!(chunks.len() <= 30, "target={} overlap={}", t, o);
            assert!(chunks.last().unwrap().content.ends_with("w29"));
        }
    }

    #[test]
    fn test_cap_drops_remaining_tokens() {
        let text = (0..100).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        let o = ChunkOptions {
            target_tokens: 10,
            overlap_tokens: 0,
            max_chunks_per_file: 3,
            ..Default::default()
        };
        let chunks = chunk_document("a.md", &text, &o);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[2].content.ends_with("w29"));
    }

    #[test]
    fn test_deterministic() {
        let text = "# A\nalpha beta\n# B\ngamma delta\n\nepsilon";
        let c1 = chunk_document("x.md", text, &opts(2, 1));
        let c2 = chunk_document("x.md", text, &opts(2, 1));
        assert_eq!(c1, c2);
        let ids: std::collections::HashSet<_> = c1.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids.len(), c1.len());
    }

    #[test]
    fn test_preserves_multibyte_text() {
        let text = "# Ünïcode\n┌──┐ naïve café\n└──┘";
        let chunks = chunk_document("a.md", text, &opts(2, 0));
        assert_eq!(chunks[0].content, "┌──┐ naïve");
        assert_eq!(chunks[0].block_id, "Ünïcode");
    }

    #[test]
    fn test_keywords() {
        let kws = extract_keywords("Rust rust cargo the and crates cargo rust", 2);
        assert_eq!(kws, vec!["rust".to_string(), "cargo".to_string()]);
        assert!(extract_keywords("anything", 0).is_empty());
    }
}
