//! Primary reranker: batched listwise scoring prompt.
//!
//! Sends batches of up to `max_batch_size` (query, passage) pairs in one
//! enumerated prompt and asks for one relevance score per line in [0, 1].
//! Batches are formed in input order and scores are assigned positionally,
//! so the pass is deterministic for a given model output.

use regex::Regex;
use std::sync::OnceLock;

/// Passages are truncated to this many characters in the prompt.
const SNIPPET_CHARS: usize = 500;

pub fn build_batch_prompt(query: &str, passages: &[&str]) -> String {
    let mut parts = Vec::with_capacity(passages.len() * 3 + 4);
    parts.push("Задача: Оцените релевантность документов к запросу.".to_string());
    parts.push(
        "Формат ответа: Только числа от 0.0 до 1.0, по одному на строку.".to_string(),
    );
    parts.push(String::new());

    for (i, passage) in passages.iter().enumerate() {
        let snippet: String = passage.chars().take(SNIPPET_CHARS).collect();
        parts.push(format!("Запрос {}: {}", i + 1, query));
        parts.push(format!("Документ {}: {}...", i + 1, snippet));
        parts.push(String::new());
    }

    parts.push("Оценки релевантности (по одной на строку):".to_string());
    parts.join("\n")
}

/// Extract exactly `expected` scores from the model output.
///
/// Numeric tokens are taken in order; values above 1 are divided by 10 and
/// clamped; shortfalls are padded with the neutral 0.5 and extras dropped.
pub fn parse_batch_scores(output: &str, expected: usize) -> Vec<f32> {
    static NUMBER_RE: OnceLock<Regex> = OnceLock::new();
    let number_re = NUMBER_RE.get_or_init(|| Regex::new(r"\d+\.?\d*").expect("static pattern"));

    let mut scores: Vec<f32> = number_re
        .find_iter(output)
        .filter_map(|m| m.as_str().parse::<f32>().ok())
        .map(|mut score| {
            if score > 1.0 {
                score /= 10.0;
            }
            score.clamp(0.0, 1.0)
        })
        .collect();

    scores.truncate(expected);
    while scores.len() < expected {
        scores.push(0.5);
    }
    scores
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_enumerates_pairs_and_truncates_passages() {
        let long_passage = "х".repeat(1000);
        let prompt = build_batch_prompt("несущая способность", &["короткий текст", &long_passage]);
        assert!(prompt.contains("Запрос 1"));
        assert!(prompt.contains("Документ 2"));
        // 500-char cap plus ellipsis
        assert!(!prompt.contains(&"х".repeat(501)));
        assert!(prompt.contains(&"х".repeat(500)));
    }

    #[test]
    fn parses_one_score_per_line() {
        let scores = parse_batch_scores("0.9\n0.3\n0.7", 3);
        assert_eq!(scores, vec![0.9, 0.3, 0.7]);
    }

    #[test]
    fn ten_scale_values_are_rescaled() {
        let scores = parse_batch_scores("8\n3\n10", 3);
        assert_eq!(scores, vec![0.8, 0.3, 1.0]);
    }

    #[test]
    fn huge_values_clamp_to_one() {
        let scores = parse_batch_scores("95", 1);
        assert_eq!(scores, vec![1.0]);
    }

    #[test]
    fn shortfall_pads_with_neutral() {
        let scores = parse_batch_scores("0.9", 3);
        assert_eq!(scores, vec![0.9, 0.5, 0.5]);
    }

    #[test]
    fn surplus_is_truncated() {
        let scores = parse_batch_scores("0.1 0.2 0.3 0.4", 2);
        assert_eq!(scores, vec![0.1, 0.2]);
    }

    #[test]
    fn garbage_output_pads_fully() {
        let scores = parse_batch_scores("не могу оценить", 2);
        assert_eq!(scores, vec![0.5, 0.5]);
    }
}
