//! Fallback reranker: single-pair prompt on a 1-10 scale.
//!
//! Used when the batched reranker fails at transport or parsing. One
//! prompt per (query, passage) pair; the answer is mined for a score with
//! prioritized patterns, and a keyword heuristic covers free-form answers.

use regex::Regex;
use std::sync::OnceLock;

pub fn build_pointwise_prompt(query: &str, passage: &str) -> String {
    format!(
        "Запрос: {query}\n\n\
         Документ: {passage}\n\n\
         Оцените, насколько документ отвечает на запрос. Поставьте оценку от 1 до 10, где:\n\
         10 - документ полностью отвечает на запрос\n\
         5 - документ частично отвечает на запрос\n\
         1 - документ не отвечает на запрос\n\n\
         Оценка:"
    )
}

/// Extract a [0, 1] score from a free-form answer.
pub fn extract_score(response: &str) -> f32 {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"оценка[:\s]*(\d+)",
            r"(\d+)\s*из\s*10",
            r"(\d+)/10",
            r"(\d+)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect()
    });

    let lower = response.to_lowercase();
    for pattern in patterns.iter() {
        if let Some(caps) = pattern.captures(&lower) {
            if let Ok(mut score) = caps[1].parse::<f32>() {
                if score > 10.0 {
                    score /= 100.0;
                } else if score > 1.0 {
                    // 1-10 scale to [0, 1]
                    score = (score - 1.0) / 9.0;
                }
                return score.clamp(0.0, 1.0);
            }
        }
    }

    // No number at all: judge the wording
    keyword_score(&lower)
}

fn keyword_score(lower: &str) -> f32 {
    const POSITIVE: &[&str] = &[
        "релевантн", "хорош", "отличн", "высок", "сильн", "точн", "подходящ",
    ];
    const NEGATIVE: &[&str] = &[
        "нерелевантн", "плох", "слаб", "низк", "неточн", "неподходящ",
    ];

    let positive = POSITIVE.iter().filter(|w| lower.contains(**w)).count();
    let negative = NEGATIVE.iter().filter(|w| lower.contains(**w)).count();

    if positive > negative {
        0.8
    } else if negative > positive {
        0.2
    } else {
        0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labelled_score_has_priority() {
        assert_eq!(extract_score("Оценка: 8"), (8.0 - 1.0) / 9.0);
    }

    #[test]
    fn out_of_ten_forms() {
        assert_eq!(extract_score("Я думаю, 7 из 10"), (7.0 - 1.0) / 9.0);
        assert_eq!(extract_score("9/10"), (9.0 - 1.0) / 9.0);
    }

    #[test]
    fn extremes_map_to_unit_interval() {
        assert_eq!(extract_score("Оценка: 10"), 1.0);
        assert_eq!(extract_score("Оценка: 1"), 0.0);
    }

    #[test]
    fn percent_like_values_are_scaled_down() {
        let score = extract_score("85");
        assert!((score - 0.85).abs() < 1e-6);
    }

    #[test]
    fn wordy_answer_uses_keyword_heuristic() {
        assert_eq!(extract_score("Документ весьма релевантный запросу"), 0.8);
        assert_eq!(extract_score("Документ плохо подходит"), 0.2);
        assert_eq!(extract_score("Сложно сказать"), 0.5);
    }
}
