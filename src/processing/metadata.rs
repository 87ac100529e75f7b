//! Metadata extraction from filenames and chunk text.
//!
//! Normative documents carry their identity in the filename: the document
//! family (ГОСТ, СП, СНиП, ФНП, ПБ, corporate albums), number, and edition
//! year. Recognition rules are ordered; the first match wins.

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;

use crate::types::{content_hash, ChunkRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocType {
    #[serde(rename = "GOST")]
    Gost,
    #[serde(rename = "SP")]
    Sp,
    #[serde(rename = "SNiP")]
    Snip,
    #[serde(rename = "FNP")]
    Fnp,
    #[serde(rename = "CORP_STD")]
    CorpStd,
    #[serde(rename = "OTHER")]
    Other,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Gost => "GOST",
            DocType::Sp => "SP",
            DocType::Snip => "SNiP",
            DocType::Fnp => "FNP",
            DocType::CorpStd => "CORP_STD",
            DocType::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    Active,
    Repealed,
    Replaced,
    Unknown,
}

impl DocStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocStatus::Active => "active",
            DocStatus::Repealed => "repealed",
            DocStatus::Replaced => "replaced",
            DocStatus::Unknown => "unknown",
        }
    }
}

/// Document-level metadata record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocMetadata {
    pub doc_id: String,
    pub doc_type: DocType,
    pub doc_number: String,
    pub doc_title: String,
    pub edition_year: Option<i32>,
    pub status: DocStatus,
    pub replaced_by: Option<String>,
    pub tags: Vec<String>,
    pub checksum: Option<String>,
    pub ingested_at: String,
    pub lang: String,
}

pub struct MetadataExtractor {
    name_patterns: Vec<(Regex, DocType)>,
    year_re: Regex,
    code_patterns: Vec<Regex>,
    query_code_patterns: Vec<(Regex, &'static str)>,
    paragraph_patterns: Vec<Regex>,
    extension_re: Regex,
}

impl MetadataExtractor {
    pub fn new() -> Self {
        // Ordered: year-qualified forms before bare numbers so the first
        // match captures the edition year when present.
        let name_patterns = vec![
            (r"(?i)ГОСТ\s+(\d+(?:\.\d+)*)-(\d{4})", DocType::Gost),
            (r"(?i)ГОСТ\s+(\d+(?:\.\d+)*)", DocType::Gost),
            (r"(?i)СП\s+(\d+(?:\.\d+)*)\.(\d{4})", DocType::Sp),
            (r"(?i)СП\s+(\d+(?:\.\d+)*)", DocType::Sp),
            (r"(?i)СНиП\s+(\d+(?:\.\d+)*)-(\d{4})", DocType::Snip),
            (r"(?i)СНиП\s+(\d+(?:\.\d+)*)\.(\d{4})", DocType::Snip),
            (r"(?i)СНиП\s+(\d+(?:\.\d+)*)-(\d{2})(?:\.|$)", DocType::Snip),
            (r"(?i)СНиП\s+(\d+(?:\.\d+)*)", DocType::Snip),
            (r"(?i)ФНП\s+(\d+(?:\.\d+)*)-(\d{4})", DocType::Fnp),
            (r"(?i)ФНП\s+(\d+(?:\.\d+)*)", DocType::Fnp),
            (r"(?i)ПБ\s+(\d+(?:\.\d+)*)-(\d{4})", DocType::CorpStd),
            (r"(?i)ПБ\s+(\d+(?:\.\d+)*)", DocType::CorpStd),
            (r"(?i)А(\d+(?:\.\d+)*)\.(\d{4})", DocType::CorpStd),
            (r"(?i)А(\d+(?:\.\d+)*)\.(\d{2})", DocType::CorpStd),
            (r"(?i)А(\d+(?:\.\d+)*)", DocType::CorpStd),
        ]
        .into_iter()
        .map(|(p, t)| (Regex::new(p).expect("static pattern"), t))
        .collect();

        let code_patterns = [
            r"(?i)ГОСТ\s+[\d.\-]+",
            r"(?i)СП\s+[\d.\-]+",
            r"(?i)СНиП\s+[\d.\-]+",
            r"(?i)ТР\s+ТС\s+[\d.\-]+",
            r"(?i)СТО\s+[\d.\-]+",
            r"(?i)РД\s+[\d.\-]+",
            r"(?i)ТУ\s+[\d.\-]+",
            r"(?i)ПБ\s+[\d.\-]+",
            r"(?i)НПБ\s+[\d.\-]+",
            r"(?i)МГСН\s+[\d.\-]+",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect();

        let query_code_patterns = [
            (r"(?i)СП\s+(\d+\.\d+(?:\.\d+)?)", "СП"),
            (r"(?i)СНиП\s+(\d+\.\d+(?:[.\-]\d+)?)", "СНиП"),
            (r"(?i)ГОСТ\s+(\d+(?:[.\-]\d+)+)", "ГОСТ"),
            (r"(?i)ТУ\s+(\d+\.\d+(?:\.\d+)?)", "ТУ"),
            (r"(?i)ПБ\s+(\d+[.\-]\d+(?:[.\-]\d+)?)", "ПБ"),
            (r"(?i)НПБ\s+(\d+[.\-]\d+)", "НПБ"),
            (r"(?i)МГСН\s+(\d+\.\d+(?:[.\-]\d+)?)", "МГСН"),
        ]
        .iter()
        .map(|(p, prefix)| (Regex::new(p).expect("static pattern"), *prefix))
        .collect();

        // Deepest paragraph references first
        let paragraph_patterns = [
            r"\d+\.\d+\.\d+\.\d+",
            r"\d+\.\d+\.\d+",
            r"п\.\s*(\d+\.\d+)",
            r"пункт\s*(\d+\.\d+)",
            r"\d+\.\d+",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect();

        Self {
            name_patterns,
            year_re: Regex::new(r"(\d{4})").expect("static pattern"),
            code_patterns,
            query_code_patterns,
            paragraph_patterns,
            extension_re: Regex::new(r"(?i)\.(pdf|txt|doc|docx)$").expect("static pattern"),
        }
    }

    /// Derive the document metadata record from its filename.
    pub fn extract_document_metadata(
        &self,
        filename: &str,
        document_id: i64,
        file_path: Option<&Path>,
    ) -> DocMetadata {
        let name = self.extension_re.replace(filename, "").into_owned();

        let (doc_type, doc_number, edition_year) = self.parse_document_name(&name);
        let status = determine_status(filename);
        let tags = extract_tags(doc_type, filename);

        let doc_id = match (&doc_number, edition_year) {
            (number, Some(year)) if !number.is_empty() => {
                format!("{}_{}_{}", doc_type.as_str().to_lowercase(), number, year)
            }
            _ => format!("doc_{document_id}"),
        };

        let checksum = file_path.and_then(|path| match std::fs::read(path) {
            Ok(bytes) => Some(content_hash(&bytes)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "checksum read failed");
                None
            }
        });

        DocMetadata {
            doc_id,
            doc_type,
            doc_number,
            doc_title: filename.to_string(),
            edition_year,
            status,
            replaced_by: None,
            tags,
            checksum,
            ingested_at: Utc::now().format("%Y-%m-%d").to_string(),
            lang: "ru".to_string(),
        }
    }

    fn parse_document_name(&self, name: &str) -> (DocType, String, Option<i32>) {
        for (pattern, doc_type) in &self.name_patterns {
            if let Some(caps) = pattern.captures(name) {
                let number = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
                let year = match caps.get(2) {
                    Some(year_match) => Some(normalize_year(year_match.as_str())),
                    // No year in the pattern; look for a bare 4-digit year
                    None => self
                        .year_re
                        .captures(name)
                        .and_then(|c| c.get(1))
                        .and_then(|m| m.as_str().parse().ok()),
                };
                return (*doc_type, number, year);
            }
        }

        let year = self
            .year_re
            .captures(name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok());
        (DocType::Other, String::new(), year)
    }

    /// Extract the normative code (e.g. "СП 22.13330") from a title.
    pub fn extract_document_code(&self, title: &str) -> Option<String> {
        let name = self.extension_re.replace(title, "");
        for pattern in &self.code_patterns {
            if let Some(m) = pattern.find(&name) {
                return Some(m.as_str().trim().trim_end_matches('.').to_string());
            }
        }
        None
    }

    /// Extract a requested document code from a free-form user query.
    pub fn extract_code_from_query(&self, query: &str) -> Option<String> {
        for (pattern, prefix) in &self.query_code_patterns {
            if let Some(caps) = pattern.captures(query) {
                if let Some(number) = caps.get(1) {
                    return Some(format!("{} {}", prefix, number.as_str()));
                }
            }
        }
        None
    }

    /// First paragraph reference found in chunk content.
    pub fn extract_paragraph(&self, content: &str) -> Option<String> {
        for pattern in &self.paragraph_patterns {
            if let Some(caps) = pattern.captures(content) {
                let text = caps
                    .get(1)
                    .map(|m| m.as_str())
                    .unwrap_or_else(|| caps.get(0).map(|m| m.as_str()).unwrap_or(""));
                if !text.is_empty() {
                    return Some(text.to_string());
                }
            }
        }
        None
    }

    /// Extend the document record with per-chunk fields, as an opaque map
    /// for the vector-point payload.
    pub fn chunk_metadata(&self, chunk: &ChunkRecord, doc: &DocMetadata) -> serde_json::Value {
        json!({
            "doc_id": doc.doc_id,
            "doc_type": doc.doc_type.as_str(),
            "doc_number": doc.doc_number,
            "doc_title": doc.doc_title,
            "edition_year": doc.edition_year,
            "status": doc.status.as_str(),
            "replaced_by": doc.replaced_by,
            "tags": doc.tags,
            "checksum": doc.checksum,
            "ingested_at": doc.ingested_at,
            "lang": doc.lang,
            "section": chunk.section,
            "paragraph": self.extract_paragraph(&chunk.content),
            "page": chunk.page,
            "chunk_id": chunk.chunk_id,
            "chunk_type": chunk.chunk_type,
        })
    }
}

impl Default for MetadataExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalize 2-digit years: `yy ≤ 30 → 20yy`, else `19yy`.
fn normalize_year(year: &str) -> i32 {
    let value: i32 = year.parse().unwrap_or(0);
    if year.len() == 2 {
        if value <= 30 {
            2000 + value
        } else {
            1900 + value
        }
    } else {
        value
    }
}

fn determine_status(filename: &str) -> DocStatus {
    let lower = filename.to_lowercase();
    if ["отменен", "недействителен", "repealed"]
        .iter()
        .any(|w| lower.contains(w))
    {
        DocStatus::Repealed
    } else if ["заменен", "заменяет", "replaced", "изм"]
        .iter()
        .any(|w| lower.contains(w))
    {
        DocStatus::Replaced
    } else if ["действующий", "актуальный", "active"]
        .iter()
        .any(|w| lower.contains(w))
    {
        DocStatus::Active
    } else {
        DocStatus::Unknown
    }
}

fn extract_tags(doc_type: DocType, filename: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();

    let type_tags: &[&str] = match doc_type {
        DocType::Gost => &["государственный стандарт", "гост"],
        DocType::Sp => &["свод правил", "строительство"],
        DocType::Snip => &["строительные нормы", "строительство"],
        DocType::Fnp => &["федеральные нормы", "промышленность"],
        DocType::CorpStd => &["корпоративный стандарт", "внутренний стандарт"],
        DocType::Other => &[],
    };
    tags.extend(type_tags.iter().map(|t| t.to_string()));

    let content_keywords: &[(&str, &[&str])] = &[
        ("электр", &["электроснабжение", "электротехника"]),
        ("пожар", &["пожарная безопасность", "пожар"]),
        ("строит", &["строительство", "конструкции"]),
        ("безопасн", &["охрана труда", "безопасность"]),
        ("проект", &["проектирование", "проектная документация"]),
        ("конструкц", &["конструкции", "строительные конструкции"]),
        ("стальн", &["стальные конструкции", "металлоконструкции"]),
        ("документац", &["документооборот", "документация"]),
    ];

    let lower = filename.to_lowercase();
    for (keyword, keyword_tags) in content_keywords {
        if lower.contains(keyword) {
            tags.extend(keyword_tags.iter().map(|t| t.to_string()));
        }
    }

    tags.sort();
    tags.dedup();
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> MetadataExtractor {
        MetadataExtractor::new()
    }

    #[test]
    fn gost_with_year() {
        let meta = extractor().extract_document_metadata("ГОСТ 27751-2014.pdf", 7, None);
        assert_eq!(meta.doc_type, DocType::Gost);
        assert_eq!(meta.doc_number, "27751");
        assert_eq!(meta.edition_year, Some(2014));
        assert_eq!(meta.doc_id, "gost_27751_2014");
        assert_eq!(meta.lang, "ru");
    }

    #[test]
    fn sp_with_dotted_year() {
        let meta = extractor().extract_document_metadata("СП 22.13330.2016.pdf", 1, None);
        assert_eq!(meta.doc_type, DocType::Sp);
        assert_eq!(meta.doc_number, "22.13330");
        assert_eq!(meta.edition_year, Some(2016));
    }

    #[test]
    fn snip_two_digit_year_normalization() {
        let (doc_type, number, year) = extractor().parse_document_name("СНиП 2.01.07-85");
        assert_eq!(doc_type, DocType::Snip);
        assert_eq!(number, "2.01.07");
        assert_eq!(year, Some(1985));

        let (_, _, recent) = extractor().parse_document_name("СНиП 1.02.03-05.");
        assert_eq!(recent, Some(2005));
    }

    #[test]
    fn unknown_name_falls_back_to_other() {
        let meta = extractor().extract_document_metadata("Отчёт по проекту 2021.pdf", 3, None);
        assert_eq!(meta.doc_type, DocType::Other);
        assert_eq!(meta.doc_id, "doc_3");
        assert_eq!(meta.edition_year, Some(2021));
    }

    #[test]
    fn status_keywords() {
        assert_eq!(
            determine_status("СП 50.13330 (отменен).pdf"),
            DocStatus::Repealed
        );
        assert_eq!(
            determine_status("ГОСТ 123 заменен на ГОСТ 456.pdf"),
            DocStatus::Replaced
        );
        assert_eq!(
            determine_status("СП 1.13130 действующий.pdf"),
            DocStatus::Active
        );
        assert_eq!(determine_status("СП 1.13130.pdf"), DocStatus::Unknown);
    }

    #[test]
    fn tags_union_type_and_keywords() {
        let meta = extractor().extract_document_metadata(
            "СП 76.13330 Электротехнические устройства.pdf",
            5,
            None,
        );
        assert!(meta.tags.contains(&"свод правил".to_string()));
        assert!(meta.tags.contains(&"электроснабжение".to_string()));
    }

    #[test]
    fn code_from_title_and_query() {
        let ex = extractor();
        assert_eq!(
            ex.extract_document_code("СП 22.13330.2016 Основания зданий.pdf"),
            Some("СП 22.13330.2016".to_string())
        );
        assert_eq!(
            ex.extract_code_from_query("Что говорит СП 22.13330.2016 про основания?"),
            Some("СП 22.13330.2016".to_string())
        );
        assert_eq!(ex.extract_code_from_query("Что такое фундамент?"), None);
    }

    #[test]
    fn paragraph_prefers_deepest_reference() {
        let ex = extractor();
        assert_eq!(
            ex.extract_paragraph("Согласно 5.2.1.1 и 5.2 настоящих норм"),
            Some("5.2.1.1".to_string())
        );
        assert_eq!(
            ex.extract_paragraph("см. пункт 4.3 настоящего свода"),
            Some("4.3".to_string())
        );
        assert_eq!(ex.extract_paragraph("без ссылок"), None);
    }
}
