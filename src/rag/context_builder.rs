//! Structured context assembly.
//!
//! Turns a ranked result list into the typed bundle handed to answer
//! generation: candidates are grouped by (code, section) and page-adjacent
//! chunks merged, each merged candidate gets an LLM auto-summary, and a
//! heuristic meta-summary describes the whole bundle. Summary failures
//! leave the candidate unsummarized; retrieval data is never lost here.

use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;

use crate::llm::{GenerateClient, GenerationOptions};
use crate::types::{
    ChunkSummary, ContextItem, MetaSummary, SearchResult, SearchType, StructuredContext,
};

const SNIPPET_CHARS: usize = 200;
const SUMMARY_CONTENT_CHARS: usize = 1000;
const SUMMARY_TIMEOUT: Duration = Duration::from_secs(30);

struct Candidate {
    doc: String,
    section: String,
    page: i32,
    why: String,
    score: f32,
    content: String,
    document_title: String,
    section_title: String,
    chunk_type: String,
    metadata: serde_json::Value,
}

pub struct ContextBuilder {
    llm: GenerateClient,
}

impl ContextBuilder {
    pub fn new(llm: GenerateClient) -> Self {
        Self { llm }
    }

    /// Build the structured context for a query from ranked results.
    pub async fn build(&self, results: Vec<SearchResult>, query: &str) -> StructuredContext {
        if results.is_empty() {
            return StructuredContext::empty(query);
        }

        tracing::info!(candidates = results.len(), "building structured context");

        let candidates = deduplicate_and_merge(to_candidates(results));

        let mut context = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let summary = match self.summarize(&candidate, query).await {
                Some(summary) => Some(summary),
                None => {
                    tracing::debug!(doc = %candidate.doc, "candidate left unsummarized");
                    None
                }
            };
            context.push(candidate_to_item(candidate, summary));
        }

        let meta_summary = build_meta_summary(&context, query);
        let avg_score = if context.is_empty() {
            0.0
        } else {
            context.iter().map(|c| c.score).sum::<f32>() / context.len() as f32
        };

        StructuredContext {
            query: query.to_string(),
            timestamp: Utc::now(),
            total_candidates: context.len(),
            avg_score,
            context,
            meta_summary,
        }
    }

    async fn summarize(&self, candidate: &Candidate, query: &str) -> Option<ChunkSummary> {
        let content: String = candidate.content.chars().take(SUMMARY_CONTENT_CHARS).collect();
        let prompt = format!(
            "Проанализируй следующий фрагмент нормативного документа и создай краткую сводку (5-7 строк):\n\n\
             Документ: {} - {}\n\
             Раздел: {} - {}\n\
             Запрос пользователя: {}\n\n\
             Содержимое:\n{}\n\n\
             Создай сводку в формате:\n\
             ТЕМА: [о чем раздел в 1-2 предложениях]\n\
             ТИП_НОРМЫ: [обязательная/рекомендательная/информационная]\n\
             КЛЮЧЕВЫЕ_МОМЕНТЫ: [3-4 ключевых момента через точку с запятой]\n\
             ПРИЧИНА_РЕЛЕВАНТНОСТИ: [почему этот фрагмент релевантен запросу]",
            candidate.doc,
            candidate.document_title,
            candidate.section,
            candidate.section_title,
            query,
            content,
        );

        let opts = GenerationOptions::deterministic(200);
        match self
            .llm
            .generate_with_timeout(&prompt, &opts, SUMMARY_TIMEOUT)
            .await
        {
            Ok(output) => parse_summary(&output),
            Err(e) => {
                tracing::warn!(doc = %candidate.doc, error = %e, "summary generation failed");
                None
            }
        }
    }
}

fn to_candidates(results: Vec<SearchResult>) -> Vec<Candidate> {
    results
        .into_iter()
        .map(|result| {
            let why = relevance_reason(&result);
            Candidate {
                doc: result.code,
                section: result.section,
                page: result.page,
                why,
                score: result.score,
                content: result.content,
                document_title: result.document_title,
                section_title: result.section_title,
                chunk_type: result.chunk_type,
                metadata: result.metadata,
            }
        })
        .collect()
}

fn relevance_reason(result: &SearchResult) -> String {
    if result.search_type == SearchType::Fallback {
        return "fallback".to_string();
    }
    if result.score > 0.8 {
        "high_relevance".to_string()
    } else if result.score > 0.6 {
        "medium_relevance".to_string()
    } else {
        "low_relevance".to_string()
    }
}

/// Group by (code, section), order each group by page, merge candidates
/// whose pages are at most 2 apart. The merged candidate keeps the higher
/// score and the higher scorer's relevance reason.
fn deduplicate_and_merge(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let before = candidates.len();

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Candidate>> = HashMap::new();
    for candidate in candidates {
        let key = format!("{}_{}", candidate.doc, candidate.section);
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(candidate);
    }

    let mut merged_candidates = Vec::with_capacity(order.len());
    for key in order {
        let mut group = groups.remove(&key).unwrap_or_default();
        if group.len() == 1 {
            merged_candidates.extend(group);
            continue;
        }
        group.sort_by_key(|c| c.page);

        let mut iter = group.into_iter();
        let mut current = match iter.next() {
            Some(first) => first,
            None => continue,
        };
        for next in iter {
            if (next.page - current.page).abs() <= 2 {
                current.content.push_str("\n\n");
                current.content.push_str(&next.content);
                if next.score > current.score {
                    current.score = next.score;
                    current.why = next.why;
                }
            } else {
                merged_candidates.push(current);
                current = next;
            }
        }
        merged_candidates.push(current);
    }

    tracing::info!(before, after = merged_candidates.len(), "candidate dedup/merge");
    merged_candidates
}

fn candidate_to_item(candidate: Candidate, summary: Option<ChunkSummary>) -> ContextItem {
    let snippet = if candidate.content.chars().count() > SNIPPET_CHARS {
        let cut: String = candidate.content.chars().take(SNIPPET_CHARS).collect();
        format!("{cut}...")
    } else {
        candidate.content.clone()
    };

    ContextItem {
        doc: candidate.doc,
        section: candidate.section,
        page: candidate.page,
        snippet,
        why: candidate.why,
        score: (candidate.score * 1000.0).round() / 1000.0,
        document_title: candidate.document_title,
        section_title: candidate.section_title,
        chunk_type: candidate.chunk_type,
        metadata: candidate.metadata,
        summary,
    }
}

/// Parse the line-prefixed summary format. Missing topic and key points
/// together mean the output was unusable.
fn parse_summary(output: &str) -> Option<ChunkSummary> {
    let mut topic = String::new();
    let mut norm_type = String::new();
    let mut key_points = Vec::new();
    let mut relevance_reason = String::new();

    for line in output.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("ТЕМА:") {
            topic = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("ТИП_НОРМЫ:") {
            norm_type = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("КЛЮЧЕВЫЕ_МОМЕНТЫ:") {
            key_points = value
                .split(';')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        } else if let Some(value) = line.strip_prefix("ПРИЧИНА_РЕЛЕВАНТНОСТИ:") {
            relevance_reason = value.trim().to_string();
        }
    }

    if topic.is_empty() && key_points.is_empty() {
        return None;
    }

    Some(ChunkSummary {
        topic: if topic.is_empty() {
            "Не удалось определить тему".to_string()
        } else {
            topic
        },
        norm_type: if norm_type.is_empty() {
            "неопределенный".to_string()
        } else {
            norm_type
        },
        key_points,
        relevance_reason: if relevance_reason.is_empty() {
            "Релевантность не определена".to_string()
        } else {
            relevance_reason
        },
    })
}

fn build_meta_summary(context: &[ContextItem], query: &str) -> MetaSummary {
    let mut documents: Vec<&str> = Vec::new();
    let mut sections: Vec<&str> = Vec::new();
    for item in context {
        if !item.doc.is_empty() && !documents.contains(&item.doc.as_str()) {
            documents.push(&item.doc);
        }
        if !item.section.is_empty() && !sections.contains(&item.section.as_str()) {
            sections.push(&item.section);
        }
    }

    let avg_score = if context.is_empty() {
        0.0
    } else {
        context.iter().map(|c| c.score).sum::<f32>() / context.len() as f32
    };

    let query_lower = query.to_lowercase();
    let query_type = if ["требования", "обязательно", "должен", "необходимо"]
        .iter()
        .any(|w| query_lower.contains(w))
    {
        "требования"
    } else if ["рекомендации", "рекомендуется", "желательно"]
        .iter()
        .any(|w| query_lower.contains(w))
    {
        "рекомендации"
    } else if ["определение", "что такое", "означает"]
        .iter()
        .any(|w| query_lower.contains(w))
    {
        "определения"
    } else {
        "общая информация"
    };

    let coverage_quality = if avg_score > 0.7 {
        "высокая"
    } else if avg_score > 0.5 {
        "средняя"
    } else {
        "низкая"
    };

    MetaSummary {
        query_type: query_type.to_string(),
        documents_found: documents.len(),
        sections_covered: sections.len(),
        avg_relevance: (avg_score * 1000.0).round() / 1000.0,
        coverage_quality: coverage_quality.to_string(),
        key_documents: documents.iter().take(3).map(|d| d.to_string()).collect(),
        key_sections: sections.iter().take(3).map(|s| s.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(doc: &str, section: &str, page: i32, score: f32, content: &str) -> Candidate {
        Candidate {
            doc: doc.to_string(),
            section: section.to_string(),
            page,
            why: relevance_reason_for(score),
            score,
            content: content.to_string(),
            document_title: format!("{doc} Полное название"),
            section_title: "Название раздела".to_string(),
            chunk_type: "paragraph".to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    fn relevance_reason_for(score: f32) -> String {
        if score > 0.8 {
            "high_relevance".to_string()
        } else {
            "low_relevance".to_string()
        }
    }

    #[test]
    fn adjacent_pages_merge_keeping_best_score() {
        let merged = deduplicate_and_merge(vec![
            candidate("СП 22", "5.2", 10, 0.6, "первый фрагмент"),
            candidate("СП 22", "5.2", 11, 0.9, "второй фрагмент"),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].score, 0.9);
        assert_eq!(merged[0].why, "high_relevance");
        assert!(merged[0].content.contains("первый фрагмент"));
        assert!(merged[0].content.contains("второй фрагмент"));
    }

    #[test]
    fn distant_pages_stay_separate() {
        let merged = deduplicate_and_merge(vec![
            candidate("СП 22", "5.2", 10, 0.6, "первый"),
            candidate("СП 22", "5.2", 40, 0.7, "второй"),
        ]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn different_sections_never_merge() {
        let merged = deduplicate_and_merge(vec![
            candidate("СП 22", "5.2", 10, 0.6, "первый"),
            candidate("СП 22", "6.1", 10, 0.7, "второй"),
            candidate("ГОСТ 27751", "5.2", 10, 0.8, "третий"),
        ]);
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn summary_parses_line_prefixed_format() {
        let output = "ТЕМА: Нагрузки на основание\n\
                      ТИП_НОРМЫ: обязательная\n\
                      КЛЮЧЕВЫЕ_МОМЕНТЫ: расчет по деформациям; предельные состояния; коэффициенты\n\
                      ПРИЧИНА_РЕЛЕВАНТНОСТИ: прямо отвечает на вопрос о несущей способности";
        let summary = parse_summary(output).unwrap();
        assert_eq!(summary.topic, "Нагрузки на основание");
        assert_eq!(summary.norm_type, "обязательная");
        assert_eq!(summary.key_points.len(), 3);
    }

    #[test]
    fn unusable_summary_is_none() {
        assert!(parse_summary("Извините, не могу проанализировать").is_none());
    }

    #[test]
    fn partial_summary_fills_defaults() {
        let summary = parse_summary("ТЕМА: Общие положения").unwrap();
        assert_eq!(summary.norm_type, "неопределенный");
        assert_eq!(summary.relevance_reason, "Релевантность не определена");
    }

    #[test]
    fn meta_summary_detects_query_type_and_quality() {
        let items = vec![
            candidate_to_item(candidate("СП 22", "5.2", 1, 0.9, "текст"), None),
            candidate_to_item(candidate("ГОСТ 27751", "4.1", 2, 0.7, "текст"), None),
        ];
        let meta = build_meta_summary(&items, "Какие требования к основаниям?");
        assert_eq!(meta.query_type, "требования");
        assert_eq!(meta.documents_found, 2);
        assert_eq!(meta.sections_covered, 2);
        assert_eq!(meta.coverage_quality, "высокая");
        assert_eq!(meta.key_documents, vec!["СП 22", "ГОСТ 27751"]);
    }

    #[test]
    fn low_scores_mean_low_coverage() {
        let items = vec![candidate_to_item(
            candidate("СП 22", "5.2", 1, 0.2, "текст"),
            None,
        )];
        let meta = build_meta_summary(&items, "что такое основание");
        assert_eq!(meta.query_type, "определения");
        assert_eq!(meta.coverage_quality, "низкая");
    }

    #[test]
    fn long_content_is_snippeted() {
        let long = "б".repeat(500);
        let item = candidate_to_item(candidate("СП 22", "5.2", 1, 0.5, &long), None);
        assert!(item.snippet.ends_with("..."));
        assert_eq!(item.snippet.chars().count(), SNIPPET_CHARS + 3);
    }
}
