//! Query intent classification and rewriting.
//!
//! A rule-based keyword scorer is the floor: it always produces a result
//! and is accepted outright at high confidence. Below that, an LLM
//! classification is requested with a fixed JSON contract and the more
//! confident of the two wins. LLM failures never poison the path.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::error::Result;
use crate::llm::{GenerateClient, GenerationOptions};

/// Closed intent taxonomy for normative-document queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentType {
    Definition,
    Applicability,
    Requirements,
    Procedure,
    Exceptions,
    General,
}

impl IntentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentType::Definition => "definition",
            IntentType::Applicability => "applicability",
            IntentType::Requirements => "requirements",
            IntentType::Procedure => "procedure",
            IntentType::Exceptions => "exceptions",
            IntentType::General => "general",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "definition" => IntentType::Definition,
            "applicability" => IntentType::Applicability,
            "requirements" => IntentType::Requirements,
            "procedure" => IntentType::Procedure,
            "exceptions" => IntentType::Exceptions,
            _ => IntentType::General,
        }
    }

    fn scored() -> [IntentType; 5] {
        [
            IntentType::Definition,
            IntentType::Applicability,
            IntentType::Requirements,
            IntentType::Procedure,
            IntentType::Exceptions,
        ]
    }

    fn keywords(&self) -> &'static [&'static str] {
        match self {
            IntentType::Definition => &[
                "определение", "термин", "понятие", "что такое", "означает", "расшифровка",
                "аббревиатура", "сокращение", "значение", "смысл", "определить", "описать",
                "классификация", "тип", "вид", "категория", "группа", "разновидность",
            ],
            IntentType::Applicability => &[
                "применение", "область", "сфера", "где", "когда", "для чего", "назначение",
                "использование", "применимо", "подходит", "соответствует", "относится",
                "распространяется", "действует", "действительно", "актуально", "релевантно",
            ],
            IntentType::Requirements => &[
                "требование", "обязательно", "должен", "необходимо", "нужно", "следует",
                "обязан", "требуется", "предусмотрено", "установлено", "определено", "норма",
                "стандарт", "критерий", "условие", "параметр", "характеристика", "показатель",
                "величина", "размер", "расстояние", "высота", "ширина",
            ],
            IntentType::Procedure => &[
                "процедура", "метод", "способ", "порядок", "алгоритм", "этап", "шаг",
                "выполнение", "осуществление", "проведение", "реализация", "применение",
                "действие", "операция", "процесс", "технология", "техника", "прием", "как",
                "каким образом", "последовательность", "стадия", "фаза",
            ],
            IntentType::Exceptions => &[
                "исключение", "особый", "специальный", "отдельный", "частный", "конкретный",
                "не распространяется", "не применяется", "не относится", "не действует",
                "кроме", "за исключением", "помимо", "исключая", "не включая", "ограничение",
                "ограничено", "не допускается", "запрещено", "нельзя",
            ],
            IntentType::General => &[],
        }
    }

    /// Section-heading keywords the intent points at.
    pub fn section_filters(&self) -> &'static [&'static str] {
        match self {
            IntentType::Definition => &[
                "термины и определения", "определения", "термины", "понятия", "сокращения",
                "аббревиатуры", "глоссарий", "словарь терминов",
            ],
            IntentType::Applicability => &[
                "область применения", "сфера применения", "назначение", "применение",
                "распространение", "действие", "применимость", "использование",
            ],
            IntentType::Requirements => &[
                "требования", "общие требования", "технические требования",
                "нормативные требования", "обязательные требования", "параметры",
                "характеристики", "показатели", "критерии", "условия",
            ],
            IntentType::Procedure => &[
                "методы", "процедуры", "порядок", "алгоритм", "этапы", "стадии",
                "выполнение", "осуществление", "проведение", "реализация", "технология",
                "техника", "приемы", "операции",
            ],
            IntentType::Exceptions => &[
                "исключения", "особые случаи", "ограничения", "запреты",
                "не распространяется", "не применяется", "не относится",
            ],
            IntentType::General => &[],
        }
    }

    /// Chunk types the intent points at.
    pub fn chunk_type_filters(&self) -> &'static [&'static str] {
        match self {
            IntentType::Definition => &["definition", "term", "glossary"],
            IntentType::Applicability => &["scope", "application", "coverage"],
            IntentType::Requirements => &["requirement", "mandatory", "obligatory"],
            IntentType::Procedure => &["procedure", "method", "process", "step"],
            IntentType::Exceptions => &["exception", "limitation", "restriction"],
            IntentType::General => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentClassification {
    pub intent_type: IntentType,
    pub confidence: f32,
    pub keywords: Vec<String>,
    pub reasoning: String,
    pub suggested_sections: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRewriting {
    pub original_query: String,
    pub intent_type: IntentType,
    pub rewritten_queries: Vec<String>,
    pub section_filters: Vec<String>,
    pub chunk_type_filters: Vec<String>,
}

/// JSON contract of the LLM classification answer.
#[derive(Debug, Deserialize)]
struct LlmIntentAnswer {
    intent_type: String,
    confidence: f32,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    keywords: Vec<String>,
}

pub struct IntentClassifier {
    llm: GenerateClient,
}

impl IntentClassifier {
    pub fn new(llm: GenerateClient) -> Self {
        Self { llm }
    }

    /// Classify the query intent: rule floor first, LLM when the rules
    /// are unsure, higher confidence wins.
    pub async fn classify(&self, query: &str) -> IntentClassification {
        let rule_based = rule_based_classification(query);

        if rule_based.confidence >= 0.8 {
            tracing::info!(
                intent = rule_based.intent_type.as_str(),
                confidence = rule_based.confidence,
                "rule-based intent accepted"
            );
            return rule_based;
        }

        match self.llm_classification(query).await {
            Ok(llm_result) if llm_result.confidence > rule_based.confidence => {
                tracing::info!(
                    intent = llm_result.intent_type.as_str(),
                    confidence = llm_result.confidence,
                    "LLM intent accepted"
                );
                llm_result
            }
            Ok(_) => rule_based,
            Err(e) => {
                tracing::warn!(error = %e, "LLM intent classification failed, using rules");
                rule_based
            }
        }
    }

    async fn llm_classification(&self, query: &str) -> Result<IntentClassification> {
        let prompt = format!(
            "Задача: Классифицировать намерение запроса к нормативным документам.\n\n\
             Запрос: \"{query}\"\n\n\
             Типы намерений:\n\
             1. definition - запрос определений, терминов, понятий\n\
             2. applicability - запрос области применения, сферы действия\n\
             3. requirements - запрос требований, обязательств, норм\n\
             4. procedure - запрос процедур, методов, алгоритмов\n\
             5. exceptions - запрос исключений, ограничений, особых случаев\n\
             6. general - общие вопросы\n\n\
             Ответь в формате JSON:\n\
             {{\n\
                 \"intent_type\": \"тип_намерения\",\n\
                 \"confidence\": 0.0-1.0,\n\
                 \"reasoning\": \"объяснение выбора\",\n\
                 \"keywords\": [\"ключевые\", \"слова\"]\n\
             }}"
        );

        let opts = GenerationOptions::consistent(200);
        let output = self.llm.generate(&prompt, &opts).await?;
        let answer = parse_intent_answer(&output)?;

        let intent_type = IntentType::parse(&answer.intent_type);
        Ok(IntentClassification {
            intent_type,
            confidence: answer.confidence.clamp(0.0, 1.0),
            keywords: answer.keywords,
            reasoning: answer.reasoning,
            suggested_sections: intent_type
                .section_filters()
                .iter()
                .map(|s| s.to_string())
                .collect(),
        })
    }

    /// Expand the query with intent-specific reformulations and derive
    /// the section / chunk-type filters.
    pub fn rewrite_query(
        &self,
        query: &str,
        classification: &IntentClassification,
    ) -> QueryRewriting {
        let intent_type = classification.intent_type;
        let rewritten_queries = rewrite_queries(query, intent_type);

        QueryRewriting {
            original_query: query.to_string(),
            intent_type,
            rewritten_queries,
            section_filters: intent_type
                .section_filters()
                .iter()
                .map(|s| s.to_string())
                .collect(),
            chunk_type_filters: intent_type
                .chunk_type_filters()
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Score each intent by the share of its keyword list present in the query.
fn rule_based_classification(query: &str) -> IntentClassification {
    let query_lower = query.to_lowercase();

    let mut best: Option<(IntentType, f32, Vec<String>)> = None;
    for intent in IntentType::scored() {
        let keywords = intent.keywords();
        let matched: Vec<String> = keywords
            .iter()
            .filter(|k| query_lower.contains(**k))
            .map(|k| k.to_string())
            .collect();
        let score = matched.len() as f32 / keywords.len() as f32;

        let better = match &best {
            Some((_, best_score, _)) => score > *best_score,
            None => true,
        };
        if better {
            best = Some((intent, score, matched));
        }
    }

    match best {
        Some((intent, score, matched)) if score > 0.0 => IntentClassification {
            intent_type: intent,
            confidence: (score * 2.0).min(0.95),
            reasoning: format!(
                "Правило-основанная классификация: найдено {} ключевых слов",
                matched.len()
            ),
            keywords: matched,
            suggested_sections: intent.section_filters().iter().map(|s| s.to_string()).collect(),
        },
        _ => IntentClassification {
            intent_type: IntentType::General,
            confidence: 0.3,
            keywords: Vec::new(),
            reasoning: "Не найдено ключевых слов для классификации".to_string(),
            suggested_sections: Vec::new(),
        },
    }
}

fn parse_intent_answer(output: &str) -> Result<LlmIntentAnswer> {
    static JSON_RE: OnceLock<Regex> = OnceLock::new();
    let json_re = JSON_RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("static pattern"));

    let json_text = json_re
        .find(output)
        .map(|m| m.as_str())
        .ok_or_else(|| crate::error::RagError::Upstream("no JSON in intent answer".into()))?;
    Ok(serde_json::from_str(json_text)?)
}

/// Up to 5 expansions, original query first, duplicates removed in order.
fn rewrite_queries(query: &str, intent: IntentType) -> Vec<String> {
    let mut queries = vec![query.to_string()];

    match intent {
        IntentType::Definition => queries.extend([
            format!("определение {query}"),
            format!("что такое {query}"),
            format!("термин {query}"),
            format!("понятие {query}"),
        ]),
        IntentType::Applicability => queries.extend([
            format!("область применения {query}"),
            format!("где применяется {query}"),
            format!("сфера использования {query}"),
            format!("назначение {query}"),
        ]),
        IntentType::Requirements => queries.extend([
            format!("требования к {query}"),
            format!("нормы для {query}"),
            format!("обязательные условия {query}"),
            format!("параметры {query}"),
        ]),
        IntentType::Procedure => queries.extend([
            format!("метод {query}"),
            format!("процедура {query}"),
            format!("как выполнить {query}"),
            format!("порядок {query}"),
        ]),
        IntentType::Exceptions => queries.extend([
            format!("исключения для {query}"),
            format!("ограничения {query}"),
            format!("не применяется к {query}"),
            format!("особые случаи {query}"),
        ]),
        IntentType::General => {}
    }

    let mut seen = std::collections::HashSet::new();
    queries.retain(|q| seen.insert(q.clone()));
    queries.truncate(5);
    queries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_query_classified_by_rules() {
        let result = rule_based_classification("Что такое несущая способность основания?");
        assert_eq!(result.intent_type, IntentType::Definition);
        assert!(result.confidence > 0.0);
        assert!(result.keywords.contains(&"что такое".to_string()));
    }

    #[test]
    fn requirements_query_scores_higher_with_more_keywords() {
        let result = rule_based_classification(
            "Какие требования и нормы обязательно должен выполнить проектировщик?",
        );
        assert_eq!(result.intent_type, IntentType::Requirements);
        assert!(result.keywords.len() >= 2);
        assert!(result.confidence > 0.1);
    }

    #[test]
    fn no_keywords_yields_general() {
        let result = rule_based_classification("СП 22.13330");
        assert_eq!(result.intent_type, IntentType::General);
        assert_eq!(result.confidence, 0.3);
    }

    #[test]
    fn confidence_is_capped() {
        // Saturate the exceptions list
        let query = "исключение особый специальный отдельный частный конкретный кроме \
                     помимо исключая ограничение запрещено нельзя не допускается";
        let result = rule_based_classification(query);
        assert!(result.confidence <= 0.95);
    }

    #[test]
    fn definition_rewrites_match_templates() {
        let queries = rewrite_queries("несущая способность", IntentType::Definition);
        assert_eq!(
            queries,
            vec![
                "несущая способность".to_string(),
                "определение несущая способность".to_string(),
                "что такое несущая способность".to_string(),
                "термин несущая способность".to_string(),
                "понятие несущая способность".to_string(),
            ]
        );
    }

    #[test]
    fn rewrites_dedup_and_cap_at_five() {
        let queries = rewrite_queries("порядок", IntentType::Procedure);
        // "порядок порядок" and the original are distinct; count stays ≤ 5
        assert!(queries.len() <= 5);
        assert_eq!(queries[0], "порядок");
        let mut unique = queries.clone();
        unique.dedup();
        assert_eq!(unique.len(), queries.len());
    }

    #[test]
    fn intent_filters_are_derived_from_taxonomy() {
        assert_eq!(IntentType::Definition.chunk_type_filters()[0], "definition");
        assert_eq!(
            IntentType::Applicability.section_filters()[0],
            "область применения"
        );
        assert!(IntentType::General.section_filters().is_empty());
    }

    #[test]
    fn llm_answer_parses_from_noisy_output() {
        let output = "Вот мой ответ:\n{\"intent_type\": \"definition\", \
                      \"confidence\": 0.9, \"reasoning\": \"вопрос о термине\", \
                      \"keywords\": [\"что такое\"]}\nНадеюсь, помог.";
        let answer = parse_intent_answer(output).unwrap();
        assert_eq!(answer.intent_type, "definition");
        assert!((answer.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn garbage_llm_answer_is_an_error() {
        assert!(parse_intent_answer("не понимаю вопроса").is_err());
    }

    #[test]
    fn intent_type_round_trips() {
        for intent in IntentType::scored() {
            assert_eq!(IntentType::parse(intent.as_str()), intent);
        }
        assert_eq!(IntentType::parse("nonsense"), IntentType::General);
    }
}
