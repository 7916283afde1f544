//! Token-bounded text chunker.
//!
//! Splits document text into [`Chunk`]s whose token counts stay within a
//! configurable `[min_tokens, max_tokens]` band, with a configurable overlap
//! between consecutive chunks so retrieval never loses context at a cut
//! point. Code-shaped input is split on line boundaries (`unit = "line"`);
//! opaque text is split on whitespace segments (`unit = "char"`). Byte
//! offsets into the original document are preserved on every chunk, and
//! overlap makes consecutive offset ranges monotone non-strict.
//!
//! The chunker holds no state across calls beyond its shared [`Tokenizer`].

use std::sync::Arc;

use crate::models::Chunk;
use crate::tokenizer::Tokenizer;

/// Semantic content classification used to tag chunks and choose the split
/// granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Code,
    Markdown,
    Text,
}

/// Stable string form of a [`ContentType`] (stored in the `type` column).
pub fn content_type_to_str(kind: ContentType) -> &'static str {
    match kind {
        ContentType::Code => "code",
        ContentType::Markdown => "markdown",
        ContentType::Text => "text",
    }
}

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "c", "cc", "cpp", "cxx", "h", "hh", "hpp", "py", "js", "jsx", "ts", "tsx", "java",
    "go", "cs", "rb", "php", "swift", "kt", "scala", "sh", "bash", "zsh", "sql", "lua", "pl",
    "m", "mm", "zig", "toml", "yaml", "yml", "json", "xml", "html", "css",
];

/// Classify `text` as code, markdown, or prose. The filename extension wins
/// when recognized; otherwise content heuristics decide.
pub fn detect_content_type(text: &str, filename: &str) -> ContentType {
    if let Some(ext) = filename.rsplit('.').next().filter(|e| *e != filename) {
        let ext = ext.to_ascii_lowercase();
        if ext == "md" || ext == "markdown" {
            return ContentType::Markdown;
        }
        if ext == "txt" || ext == "rst" {
            return ContentType::Text;
        }
        if CODE_EXTENSIONS.contains(&ext.as_str()) {
            return ContentType::Code;
        }
    }

    let sample: Vec<&str> = text.lines().take(80).collect();
    if sample.is_empty() {
        return ContentType::Text;
    }

    let markdown_markers = sample
        .iter()
        .filter(|l| {
            let t = l.trim_start();
            t.starts_with('#') || t.starts_with("```") || t.starts_with("- ") || t.starts_with("* ")
        })
        .count();
    if markdown_markers * 4 >= sample.len() && markdown_markers > 1 {
        return ContentType::Markdown;
    }

    let code_markers = sample
        .iter()
        .filter(|l| {
            let t = l.trim();
            t.ends_with(';')
                || t.ends_with('{')
                || t.ends_with('}')
                || t.starts_with("fn ")
                || t.starts_with("def ")
                || t.starts_with("class ")
                || t.starts_with("import ")
                || t.starts_with("#include")
                || t.starts_with("//")
        })
        .count();
    if code_markers * 3 >= sample.len() && code_markers > 1 {
        return ContentType::Code;
    }

    ContentType::Text
}

/// A byte span of the input with its token count.
#[derive(Debug, Clone, Copy)]
struct Segment {
    start: usize,
    end: usize,
    tokens: usize,
}

pub struct Chunker {
    tokenizer: Arc<Tokenizer>,
    min_tokens: usize,
    max_tokens: usize,
    overlap: f32,
}

impl Chunker {
    /// `overlap` is the fraction of `max_tokens` shared between consecutive
    /// chunks, in `[0, 1)`.
    pub fn new(tokenizer: Arc<Tokenizer>, min_tokens: usize, max_tokens: usize, overlap: f32) -> Self {
        Self {
            tokenizer,
            min_tokens: min_tokens.max(1),
            max_tokens: max_tokens.max(1),
            overlap: overlap.clamp(0.0, 0.99),
        }
    }

    /// Split `text` into ordered chunks. Empty input yields an empty list.
    ///
    /// `semantic` is accepted for config parity; both modes currently share
    /// the same boundary-driven splitter.
    pub fn chunk_text(&self, text: &str, source_id: &str, _semantic: bool) -> Vec<Chunk> {
        if text.is_empty() {
            return Vec::new();
        }

        let kind = detect_content_type(text, source_id);
        let line_unit = kind != ContentType::Text && text.contains('\n');
        let unit = if line_unit { "line" } else { "char" };

        let raw = if line_unit {
            line_segments(text)
        } else {
            word_segments(text)
        };
        let segments = self.measure_and_split(text, raw);
        if segments.is_empty() {
            return Vec::new();
        }

        let overlap_tokens = (self.overlap * self.max_tokens as f32) as usize;
        let mut chunks = Vec::new();
        let mut i = 0;

        while i < segments.len() {
            let mut j = i;
            let mut tokens = 0;
            while j < segments.len() && tokens + segments[j].tokens <= self.max_tokens {
                tokens += segments[j].tokens;
                j += 1;
            }
            if j == i {
                // measure_and_split keeps segments under budget; never
                // loop forever regardless.
                tokens = segments[i].tokens;
                j = i + 1;
            }

            let start = segments[i].start;
            let end = segments[j - 1].end;
            let slice = text[start..end].trim_end_matches('\n');
            if !slice.trim().is_empty() {
                chunks.push(Chunk {
                    text: slice.to_string(),
                    source_id: source_id.to_string(),
                    start,
                    end: start + slice.len(),
                    token_count: tokens.max(1),
                    unit: unit.to_string(),
                    kind: content_type_to_str(kind).to_string(),
                });
            }

            if j >= segments.len() {
                break;
            }

            // Step the window back so the next chunk re-reads ~overlap_tokens.
            let mut back = 0;
            let mut back_tokens = 0;
            while back < j - i - 1 && back_tokens + segments[j - 1 - back].tokens <= overlap_tokens {
                back_tokens += segments[j - 1 - back].tokens;
                back += 1;
            }
            i = j - back;
        }

        chunks
    }

    /// Longest prefix of `text` whose token count is at most `max_tokens`.
    pub fn truncate_to_tokens(&self, text: &str, max_tokens: usize) -> String {
        if self.tokenizer.count(text, false) <= max_tokens {
            return text.to_string();
        }
        let mut used = 0;
        let mut end = 0;
        for seg in word_segments(text) {
            let tokens = self.tokenizer.count(&text[seg.0..seg.1], false);
            if used + tokens > max_tokens {
                break;
            }
            used += tokens;
            end = seg.1;
        }
        text[..end].to_string()
    }

    /// Count segments, splitting any that alone would leave a chunk unable
    /// to reach `min_tokens` without blowing `max_tokens`.
    fn measure_and_split(&self, text: &str, raw: Vec<(usize, usize)>) -> Vec<Segment> {
        let budget = (self.max_tokens - self.min_tokens.min(self.max_tokens - 1)).max(1);
        let mut segments: Vec<Segment> = Vec::with_capacity(raw.len());
        for (start, end) in raw {
            if text[start..end].trim().is_empty() {
                // Blank segments glue onto the previous one so offsets stay
                // contiguous.
                if let Some(last) = segments.last_mut() {
                    last.end = end;
                }
                continue;
            }
            let tokens = self.tokenizer.count(&text[start..end], false);
            if tokens <= budget {
                segments.push(Segment { start, end, tokens });
            } else {
                self.split_span(text, start, end, budget, &mut segments);
            }
        }
        segments
    }

    /// Hard-split an oversized span at char boundaries into pieces of at
    /// most `budget` tokens each.
    fn split_span(
        &self,
        text: &str,
        start: usize,
        end: usize,
        budget: usize,
        out: &mut Vec<Segment>,
    ) {
        let mut s = start;
        while s < end {
            let mut guess = (budget * 4).min(end - s).max(1);
            loop {
                let e = char_floor(text, (s + guess).min(end)).max(next_char(text, s));
                let tokens = self.tokenizer.count(&text[s..e], false);
                if tokens <= budget || e - s <= 4 {
                    out.push(Segment {
                        start: s,
                        end: e,
                        tokens: tokens.max(1),
                    });
                    s = e;
                    break;
                }
                guess = (guess * budget / tokens).max(1).min(guess - 1);
            }
        }
    }
}

fn line_segments(text: &str) -> Vec<(usize, usize)> {
    let mut segments = Vec::new();
    let mut start = 0;
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' {
            segments.push((start, i + 1));
            start = i + 1;
        }
    }
    if start < text.len() {
        segments.push((start, text.len()));
    }
    segments
}

/// Whitespace-delimited words, each span including its trailing whitespace
/// so spans tile the input exactly.
fn word_segments(text: &str) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        // scan word
        while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        // absorb trailing whitespace
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        segments.push((start, i));
        start = i;
    }
    segments
}

fn char_floor(text: &str, mut idx: usize) -> usize {
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn next_char(text: &str, idx: usize) -> usize {
    let mut e = idx + 1;
    while e < text.len() && !text.is_char_boundary(e) {
        e += 1;
    }
    e.min(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(min: usize, max: usize, overlap: f32) -> Chunker {
        Chunker::new(Arc::new(Tokenizer::approximate()), min, max, overlap)
    }

    #[test]
    fn empty_input_yields_empty_list() {
        let c = chunker(5, 50, 0.1);
        assert!(c.chunk_text("", "a.txt", false).is_empty());
    }

    #[test]
    fn small_text_single_chunk() {
        let c = chunker(1, 500, 0.1);
        let chunks = c.chunk_text("hello world", "a.txt", false);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello world");
        assert_eq!(chunks[0].start, 0);
        assert!(chunks[0].token_count > 0);
    }

    #[test]
    fn chunks_respect_max_tokens() {
        let c = chunker(2, 8, 0.0);
        let text: String = (0..100).map(|i| format!("word{} ", i)).collect();
        let chunks = c.chunk_text(&text, "a.txt", false);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.token_count <= 8, "chunk over budget: {}", chunk.token_count);
        }
    }

    #[test]
    fn non_last_chunks_reach_min_tokens() {
        let c = chunker(4, 10, 0.0);
        let text: String = (0..200).map(|i| format!("w{} ", i)).collect();
        let chunks = c.chunk_text(&text, "a.txt", false);
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.token_count >= 4, "undersized chunk: {}", chunk.token_count);
        }
    }

    #[test]
    fn chunks_ordered_and_overlapping() {
        let c = chunker(2, 10, 0.3);
        let text: String = (0..120).map(|i| format!("tok{} ", i)).collect();
        let chunks = c.chunk_text(&text, "a.txt", false);
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            assert!(pair[1].start >= pair[0].start, "chunks out of order");
            assert!(
                pair[1].start <= pair[0].end,
                "gap between consecutive chunks"
            );
        }
    }

    #[test]
    fn code_uses_line_unit() {
        let c = chunker(1, 100, 0.0);
        let code = "fn main() {\n    println!(\"hi\");\n}\n";
        let chunks = c.chunk_text(code, "main.rs", false);
        assert_eq!(chunks[0].unit, "line");
        assert_eq!(chunks[0].kind, "code");
    }

    #[test]
    fn prose_uses_char_unit() {
        let c = chunker(1, 100, 0.0);
        let chunks = c.chunk_text("Just a plain sentence with no newline.", "", false);
        assert_eq!(chunks[0].unit, "char");
    }

    #[test]
    fn offsets_slice_back_to_text() {
        let c = chunker(2, 12, 0.2);
        let text: String = (0..80)
            .map(|i| format!("line number {}\n", i))
            .collect();
        let chunks = c.chunk_text(&text, "file.rs", false);
        for chunk in &chunks {
            assert_eq!(&text[chunk.start..chunk.end], chunk.text);
        }
    }

    #[test]
    fn oversized_line_is_split() {
        let c = chunker(2, 10, 0.0);
        // One very long line in an otherwise code-shaped file.
        let text = format!("int x = 0;\n{}\n", "a ".repeat(500));
        let chunks = c.chunk_text(&text, "a.c", false);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.token_count <= 10);
        }
    }

    #[test]
    fn truncate_to_tokens_returns_prefix() {
        let c = chunker(1, 50, 0.0);
        let text: String = (0..100).map(|i| format!("alpha{} ", i)).collect();
        let truncated = c.truncate_to_tokens(&text, 10);
        assert!(truncated.len() < text.len());
        assert!(text.starts_with(&truncated));
        assert!(
            Tokenizer::approximate().count(&truncated, false) <= 10,
            "truncation exceeded the token cap"
        );
    }

    #[test]
    fn detect_content_type_by_extension() {
        assert_eq!(detect_content_type("", "main.rs"), ContentType::Code);
        assert_eq!(detect_content_type("", "README.md"), ContentType::Markdown);
        assert_eq!(detect_content_type("", "notes.txt"), ContentType::Text);
    }

    #[test]
    fn detect_content_type_by_content() {
        let code = "int a = 0;\nint b = 1;\nreturn a + b;\n";
        assert_eq!(detect_content_type(code, ""), ContentType::Code);

        let md = "# Title\n\n- item one\n- item two\n# Another\n";
        assert_eq!(detect_content_type(md, ""), ContentType::Markdown);

        let prose = "It was a bright cold day in April.";
        assert_eq!(detect_content_type(prose, ""), ContentType::Text);
    }

    #[test]
    fn deterministic() {
        let c = chunker(3, 20, 0.15);
        let text: String = (0..60).map(|i| format!("w{} ", i)).collect();
        let a = c.chunk_text(&text, "x.txt", false);
        let b = c.chunk_text(&text, "x.txt", false);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.start, y.start);
            assert_eq!(x.token_count, y.token_count);
        }
    }
}
