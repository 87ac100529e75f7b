pub mod bm25;
pub mod dense;
pub mod hybrid;
pub mod mmr;

pub use bm25::Bm25Engine;
pub use dense::DenseRetriever;
pub use hybrid::{FusionMode, HybridSearcher};
pub use mmr::MmrDiversifier;

use std::collections::HashSet;
use std::sync::OnceLock;

/// Russian-aware tokenization shared by BM25 and MMR: lowercase, strip
/// non-word characters, split on whitespace, drop short tokens and stop
/// words.
pub fn tokenize(text: &str) -> Vec<String> {
    let stop_words = russian_stop_words();
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|token| token.chars().count() > 2 && !stop_words.contains(*token))
        .map(str::to_string)
        .collect()
}

fn russian_stop_words() -> &'static HashSet<&'static str> {
    static STOP_WORDS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    STOP_WORDS.get_or_init(|| {
        [
            "и", "в", "на", "с", "по", "для", "от", "до", "из", "к", "о", "у", "за", "при",
            "без", "через", "над", "под", "между", "среди", "вокруг", "около", "близ",
            "далеко", "здесь", "там", "где", "когда", "как", "что", "кто", "который", "это",
            "тот", "этот", "такой", "какой", "весь", "все", "вся", "всё", "каждый", "любой",
            "другой", "иной", "сам", "сама", "само", "сами", "себя", "себе", "собой", "мой",
            "моя", "моё", "мои", "твой", "твоя", "твоё", "твои", "его", "её", "их", "наш",
            "наша", "наше", "наши", "ваш", "ваша", "ваше", "ваши", "или", "но", "да", "нет",
            "не", "ни", "же", "ли", "бы",
        ]
        .into_iter()
        .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_drops_stop_words_and_short_tokens() {
        // "и", "в", "на" are stop words; "сп" and "22" are too short, so
        // only the registry number survives to contribute to scoring
        let tokens = tokenize("и в на СП 22.13330");
        assert_eq!(tokens, vec!["13330".to_string()]);
    }

    #[test]
    fn tokenize_lowercases_and_strips_punctuation() {
        let tokens = tokenize("Несущая способность: основания!");
        assert_eq!(
            tokens,
            vec![
                "несущая".to_string(),
                "способность".to_string(),
                "основания".to_string()
            ]
        );
    }
}
