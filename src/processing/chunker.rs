//! Token-budgeted, sentence-aware document chunking.
//!
//! Text extracted from normative PDFs carries page markers of the literal
//! form "Страница X из Y"; when present they delimit pages, otherwise the
//! whole document is page 1. Within a page, sentences are accumulated
//! greedily into chunks bounded by the configured token budget, with a
//! trailing-sentence overlap seeded into each following chunk. A final
//! merge pass glues chunks that end in a header marker or break a sentence
//! or quote/bracket construction. Token counts use the ⌈chars/4⌉ heuristic
//! for Russian text.

use regex::Regex;

use crate::config::ChunkingConfig;
use crate::types::ChunkRecord;

struct ChapterHeading {
    number: String,
    title: String,
}

pub struct DocumentChunker {
    cfg: ChunkingConfig,
    page_re: Regex,
    terminator_re: Regex,
    chapter_re: Regex,
    section_res: Vec<Regex>,
}

impl DocumentChunker {
    pub fn new(cfg: ChunkingConfig) -> Self {
        Self {
            cfg,
            page_re: Regex::new(r"Страница\s+(\d+)\s+из\s+(\d+)").expect("static pattern"),
            terminator_re: Regex::new(r"[.!?]+").expect("static pattern"),
            chapter_re: Regex::new(r"(?i)(?:ГЛАВА|РАЗДЕЛ|ЧАСТЬ)\s+(\d+)\s*[.\-]?\s*(.+)")
                .expect("static pattern"),
            // Deepest numeric section codes first
            section_res: [
                r"(\d+\.\d+\.\d+\.\d+)\s+(.+)",
                r"(\d+\.\d+\.\d+)\s+(.+)",
                r"(\d+\.\d+)\s+(.+)",
            ]
            .iter()
            .map(|p| Regex::new(p).expect("static pattern"))
            .collect(),
        }
    }

    /// Split extracted text into ordered, structure-tagged chunks.
    pub fn create_chunks(
        &self,
        text: &str,
        document_id: i64,
        filename: &str,
    ) -> Vec<ChunkRecord> {
        let chapters = self.extract_chapters(text);
        let pages = self.split_pages(text);

        let mut records = Vec::new();
        let mut chunk_counter = 1usize;

        for (page, page_text) in pages {
            let chunks = self.chunk_page(&page_text);

            for content in chunks {
                let (chapter, section) = self.identify_structure(&content, &chapters);
                records.push(ChunkRecord {
                    chunk_id: format!("{document_id}_{page}_{chunk_counter}"),
                    document_id,
                    document_title: filename.to_string(),
                    chunk_type: "paragraph".to_string(),
                    content,
                    page,
                    chapter,
                    section,
                });
                chunk_counter += 1;
            }
        }

        tracing::info!(
            document_id,
            chunks = records.len(),
            "document chunking complete"
        );
        records
    }

    /// Split into (page_number, page_text) pairs by page markers.
    fn split_pages(&self, text: &str) -> Vec<(i32, String)> {
        let matches: Vec<_> = self.page_re.captures_iter(text).collect();
        if matches.is_empty() {
            return vec![(1, text.to_string())];
        }

        let mut pages = Vec::with_capacity(matches.len());
        for (i, caps) in matches.iter().enumerate() {
            let page: i32 = caps
                .get(1)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(i as i32 + 1);
            let start = caps.get(0).map(|m| m.end()).unwrap_or(0);
            let end = matches
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map(|m| m.start())
                .unwrap_or(text.len());

            let page_text = text[start..end].trim();
            if !page_text.is_empty() {
                pages.push((page, page_text.to_string()));
            }
        }
        pages
    }

    /// Greedy sentence accumulation into token-budgeted chunks.
    fn chunk_page(&self, text: &str) -> Vec<String> {
        let sentences = self.split_sentences(text);
        if sentences.is_empty() {
            let trimmed = text.trim();
            return if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed.to_string()]
            };
        }

        let mut chunks: Vec<String> = Vec::new();
        let mut buffer: Vec<String> = Vec::new();
        let mut buffer_tokens = 0usize;

        for sentence in sentences {
            let sentence_tokens = self.estimate_tokens(&sentence);

            // Emit before adding when the sentence would reach the cap
            if buffer_tokens + sentence_tokens >= self.cfg.max_tokens && !buffer.is_empty() {
                chunks.push(buffer.join(" "));
                let overlap = self.overlap_sentences(&buffer);
                buffer_tokens = overlap.iter().map(|s| self.estimate_tokens(s)).sum();
                buffer = overlap;
            }

            buffer_tokens += sentence_tokens;
            buffer.push(sentence);

            // Emit after adding once the target is reached
            if buffer_tokens >= self.cfg.target_tokens && buffer_tokens >= self.cfg.min_tokens {
                chunks.push(buffer.join(" "));
                let overlap = self.overlap_sentences(&buffer);
                buffer_tokens = overlap.iter().map(|s| self.estimate_tokens(s)).sum();
                buffer = overlap;
            }
        }

        // The trailing buffer either stands alone or merges backwards
        if !buffer.is_empty() {
            if buffer_tokens >= self.cfg.min_tokens {
                chunks.push(buffer.join(" "));
            } else if let Some(last) = chunks.last_mut() {
                last.push(' ');
                last.push_str(&buffer.join(" "));
            } else {
                chunks.push(buffer.join(" "));
            }
        }

        if self.cfg.merge_enabled {
            chunks = self.merge_chunks_with_headers(chunks);
        }
        chunks
    }

    /// Sentence splitting tuned for normative text: a terminator run ends a
    /// sentence when followed by a capital Cyrillic letter, a clause number,
    /// a capital letter, or end of text.
    fn split_sentences(&self, text: &str) -> Vec<String> {
        let mut sentences = Vec::new();
        let mut start = 0usize;

        for m in self.terminator_re.find_iter(text) {
            let end = m.end();
            if !is_sentence_boundary(&text[end..]) {
                continue;
            }
            let sentence = text[start..end].trim();
            if sentence.chars().count() > self.cfg.min_sentence_length {
                sentences.push(sentence.to_string());
            }
            start = end;
        }

        let tail = text[start..].trim();
        if tail.chars().count() > self.cfg.min_sentence_length {
            sentences.push(tail.to_string());
        }
        sentences
    }

    fn estimate_tokens(&self, text: &str) -> usize {
        let chars = text.chars().count();
        let per_char = self.cfg.tokens_per_char.max(1);
        ((chars + per_char - 1) / per_char).max(1)
    }

    /// Trailing sentences seeded into the next chunk.
    fn overlap_sentences(&self, sentences: &[String]) -> Vec<String> {
        if sentences.is_empty() {
            return Vec::new();
        }
        let by_ratio = (sentences.len() as f32 * self.cfg.overlap_ratio).ceil() as usize;
        let count = by_ratio.max(self.cfg.min_overlap_sentences).min(sentences.len());
        sentences[sentences.len() - count..].to_vec()
    }

    /// Merge adjacent chunks that would otherwise cut a citation in half.
    fn merge_chunks_with_headers(&self, chunks: Vec<String>) -> Vec<String> {
        if chunks.len() <= 1 {
            return chunks;
        }

        let mut merged = Vec::with_capacity(chunks.len());
        let mut iter = chunks.into_iter();
        let Some(mut current) = iter.next() else {
            return merged;
        };

        for next in iter {
            if self.should_merge(&current, &next) {
                current.push(' ');
                current.push_str(&next);
            } else {
                merged.push(current);
                current = next;
            }
        }
        merged.push(current);
        merged
    }

    fn should_merge(&self, chunk1: &str, chunk2: &str) -> bool {
        let combined = self.estimate_tokens(chunk1) + self.estimate_tokens(chunk2);
        if combined > self.cfg.max_merged_tokens {
            return false;
        }

        // chunk1 ends with a header marker
        let tail: String = {
            let chars: Vec<char> = chunk1.chars().collect();
            let start = chars.len().saturating_sub(48);
            chars[start..].iter().collect::<String>().to_lowercase()
        };
        if self.cfg.header_patterns.iter().any(|m| tail.contains(m.as_str())) {
            return true;
        }

        // chunk2 continues a sentence
        if let Some(first) = chunk2.chars().next() {
            if first.is_alphabetic() && first.is_lowercase() {
                return true;
            }
        }

        // chunk1 leaves quotes or brackets open
        for quote in ['«', '»', '"'] {
            if chunk1.chars().filter(|c| *c == quote).count() % 2 != 0 {
                return true;
            }
        }
        for (open, close) in [('(', ')'), ('[', ']'), ('{', '}')] {
            let opened = chunk1.chars().filter(|c| *c == open).count();
            let closed = chunk1.chars().filter(|c| *c == close).count();
            if opened != closed {
                return true;
            }
        }

        false
    }

    /// Chapter headings of the whole document, used to resolve the chapter
    /// a numeric section code belongs to.
    fn extract_chapters(&self, text: &str) -> Vec<ChapterHeading> {
        let mut chapters = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(caps) = self.chapter_re.captures(line) {
                // Heading lines start with the marker; skip mid-sentence hits
                if caps.get(0).map(|m| m.start()) == Some(0) {
                    chapters.push(ChapterHeading {
                        number: caps[1].to_string(),
                        title: caps[2].trim().to_string(),
                    });
                }
            }
        }
        chapters
    }

    /// Governing (chapter, section) of a chunk. The deepest numeric code in
    /// the chunk wins for section; the nearest chapter heading wins for
    /// chapter.
    fn identify_structure(
        &self,
        content: &str,
        chapters: &[ChapterHeading],
    ) -> (String, String) {
        let mut chapter = String::new();
        let mut section = String::new();

        for pattern in &self.section_res {
            if let Some(caps) = pattern.captures(content) {
                let code = caps[1].to_string();
                let title = caps[2].trim().to_string();
                section = format!("{}. {}", code, title);

                let chapter_number = code.split('.').next().unwrap_or("");
                if let Some(heading) = chapters.iter().find(|c| c.number == chapter_number) {
                    chapter = format!("Глава {}. {}", heading.number, heading.title);
                }
                break;
            }
        }

        if section.is_empty() {
            // Nearest preceding heading inside the chunk
            if let Some(caps) = self.chapter_re.captures_iter(content).last() {
                chapter = format!("Глава {}. {}", &caps[1], caps[2].trim());
            }
        }

        (chapter, section)
    }
}

/// A terminator run ends a sentence when the remaining text is blank or the
/// next non-space character opens a new clause.
fn is_sentence_boundary(rest: &str) -> bool {
    let trimmed = rest.trim_start();
    if trimmed.is_empty() {
        return true;
    }
    // Terminator must be followed by whitespace (abbreviations like "т.е."
    // keep going)
    if trimmed.len() == rest.len() {
        return false;
    }
    match trimmed.chars().next() {
        Some(c) => c.is_uppercase() || c.is_ascii_digit(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RagConfig;

    fn chunker() -> DocumentChunker {
        DocumentChunker::new(RagConfig::default().chunking)
    }

    fn chunker_with(f: impl FnOnce(&mut ChunkingConfig)) -> DocumentChunker {
        let mut cfg = RagConfig::default().chunking;
        f(&mut cfg);
        DocumentChunker::new(cfg)
    }

    /// ~50 distinct sentences of ~200 chars each (≈50 tokens per sentence).
    fn long_russian_text(sentences: usize) -> String {
        (0..sentences)
            .map(|i| {
                format!(
                    "Требование номер {i} устанавливает порядок применения строительных \
                     конструкций и оснований при проектировании зданий и сооружений \
                     промышленного назначения с учетом климатических условий площадки."
                )
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn sentences_split_on_capital_and_digit_boundaries() {
        let text = "Первое предложение о нагрузках. Второе предложение о прогибах. \
                    3.1 Нормативные значения приведены ниже.";
        let sentences = chunker().split_sentences(text);
        assert_eq!(sentences.len(), 3);
        assert!(sentences[0].starts_with("Первое"));
        assert!(sentences[2].starts_with("3.1"));
    }

    #[test]
    fn short_fragments_are_dropped() {
        let sentences = chunker().split_sentences("Да. Нормы проектирования оснований зданий.");
        assert_eq!(sentences.len(), 1);
    }

    #[test]
    fn chunk_token_bounds_hold_without_merge() {
        let chunker = chunker_with(|c| c.merge_enabled = false);
        let text = long_russian_text(120);
        let chunks = chunker.chunk_page(&text);
        assert!(chunks.len() > 1);

        for chunk in &chunks {
            let tokens = chunker.estimate_tokens(chunk);
            assert!(tokens <= chunker.cfg.max_tokens + 64, "chunk too big: {tokens}");
        }
        // Every chunk except possibly the trailing one meets the minimum
        for chunk in &chunks[..chunks.len() - 1] {
            let tokens = chunker.estimate_tokens(chunk);
            assert!(tokens >= chunker.cfg.min_tokens, "chunk too small: {tokens}");
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let chunker = chunker_with(|c| c.merge_enabled = false);
        let text = long_russian_text(120);
        let chunks = chunker.chunk_page(&text);
        assert!(chunks.len() > 1);

        for pair in chunks.windows(2) {
            let first_sentence_of_next: String =
                pair[1].chars().take(60).collect();
            assert!(
                pair[0].contains(first_sentence_of_next.trim()),
                "no overlap between consecutive chunks"
            );
        }
    }

    #[test]
    fn page_markers_delimit_pages() {
        let text = "Страница 1 из 2 Первая страница содержит требования к основаниям зданий. \
                    Страница 2 из 2 Вторая страница содержит требования к фундаментам сооружений.";
        let chunks = chunker().create_chunks(text, 9, "СП 22.13330.2016.pdf");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].page, 1);
        assert_eq!(chunks[1].page, 2);
        assert!(chunks[0].content.contains("Первая"));
        assert!(chunks[1].content.contains("Вторая"));
        assert_eq!(chunks[0].chunk_id, "9_1_1");
        assert_eq!(chunks[1].chunk_id, "9_2_2");
    }

    #[test]
    fn no_markers_means_single_page() {
        let chunks = chunker().create_chunks(
            "Общие требования к проектированию стальных конструкций зданий.",
            4,
            "doc.pdf",
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].page, 1);
        assert_eq!(chunks[0].chunk_type, "paragraph");
    }

    #[test]
    fn header_merge_joins_marker_ending_chunk() {
        let chunker = chunker();
        // chunk1 ≈ 770 tokens ending with a header marker, chunk2 ≈ 370
        let filler = "слово ".repeat(500);
        let chunk1 = format!("{filler}Требования установлены в подпункт 5.2.1.");
        let chunk2 = format!("Обязательные требования. {}", "текст ".repeat(240));

        assert!(chunker.should_merge(&chunk1, &chunk2));
        let merged = chunker.merge_chunks_with_headers(vec![chunk1.clone(), chunk2.clone()]);
        assert_eq!(merged.len(), 1);

        // No marker, uppercase continuation, balanced punctuation: two chunks
        let plain = format!("{filler}Требования приведены в таблице ниже.");
        assert!(!chunker.should_merge(&plain, &chunk2));

        // Oversized pairs never merge
        let big = "х".repeat(5000);
        assert!(!chunker.should_merge(&big, &chunk2));
    }

    #[test]
    fn lowercase_continuation_merges() {
        let chunker = chunker();
        assert!(chunker.should_merge(
            "Нагрузки принимаются по таблице",
            "согласно требованиям настоящего раздела нормирования."
        ));
    }

    #[test]
    fn unbalanced_quotes_merge() {
        let chunker = chunker();
        assert!(chunker.should_merge(
            "Термин «несущая способность",
            "Основания» определяется в разделе терминов."
        ));
        assert!(chunker.should_merge(
            "Формула (см. приложение А",
            "Продолжение формулы приведено далее)."
        ));
    }

    #[test]
    fn structure_tagging_finds_chapter_and_section() {
        let text = "ГЛАВА 5. Основания и фундаменты\n\
                    5.2 Нагрузки на основание\n\
                    Нагрузки на основание принимаются по результатам расчета сооружения.";
        let chunker = chunker();
        let chapters = chunker.extract_chapters(text);
        assert_eq!(chapters.len(), 1);

        let (chapter, section) = chunker.identify_structure(text, &chapters);
        assert!(section.starts_with("5.2."));
        assert!(chapter.starts_with("Глава 5."));
    }

    #[test]
    fn deepest_section_code_wins() {
        let text = "5.2 Общие положения и 5.2.1.3 Частные требования к опорным узлам";
        let (_, section) = chunker().identify_structure(text, &[]);
        assert!(section.starts_with("5.2.1.3."), "got: {section}");
    }
}
