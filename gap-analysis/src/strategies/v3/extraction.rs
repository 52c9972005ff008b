use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use common::{
    storage::types::document::Document,
    utils::llm::{parse_json_payload, LlmClient},
};

use crate::strategies::truncate;

/// Per-document char cap for the extraction prompt.
const EXTRACTION_INPUT_CHARS: usize = 8_000;

const SYSTEM_MESSAGE: &str = "You are a precise information extraction engine. Always respond with valid JSON.";

const EXTRACTION_PROMPT: &str = r#"Extract structured knowledge from this document.

TITLE: {title}
CONTENT:
{content}

Respond in JSON:
{
  "entities": [{"name": "...", "kind": "person|system|team|term"}],
  "decisions": [{"text": "...", "has_rationale": true|false}],
  "processes": ["..."],
  "claims": ["..."],
  "terms": ["jargon, codenames and acronyms used without definition"],
  "dependencies": ["systems or services this document says something depends on"]
}"#;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractedEntity {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractedDecision {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub has_rationale: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    entities: Vec<ExtractedEntity>,
    #[serde(default)]
    decisions: Vec<ExtractedDecision>,
    #[serde(default)]
    processes: Vec<String>,
    #[serde(default)]
    claims: Vec<String>,
    #[serde(default)]
    terms: Vec<String>,
    #[serde(default)]
    dependencies: Vec<String>,
}

/// Everything the pipeline knows about one document after deep extraction.
#[derive(Debug, Clone, Default)]
pub struct DocExtraction {
    pub doc_id: String,
    pub title: String,
    pub author: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub entities: Vec<ExtractedEntity>,
    pub decisions: Vec<ExtractedDecision>,
    pub processes: Vec<String>,
    pub claims: Vec<String>,
    pub terms: Vec<String>,
    pub dependencies: Vec<String>,
    /// True when the LLM produced this extraction; false for the heuristic path.
    pub from_llm: bool,
}

/// Deep extraction for one document: LLM first, heuristics when the call or
/// its JSON fails. The pipeline never aborts on a bad extraction.
pub async fn extract(llm: &dyn LlmClient, doc: &Document) -> DocExtraction {
    let body = analysis_body(doc);
    let prompt = EXTRACTION_PROMPT
        .replace("{title}", &doc.title)
        .replace("{content}", &truncate(&body, EXTRACTION_INPUT_CHARS));

    match llm.chat_json(SYSTEM_MESSAGE, &prompt, 0.1, 1_500).await {
        Ok(raw) => match parse_json_payload::<ExtractionResponse>(&raw) {
            Ok(parsed) => DocExtraction {
                doc_id: doc.id.clone(),
                title: doc.title.clone(),
                author: doc.sender.clone(),
                created_at: doc.source_created_at,
                entities: parsed.entities,
                decisions: parsed.decisions,
                processes: parsed.processes,
                claims: parsed.claims,
                terms: parsed.terms,
                dependencies: parsed.dependencies,
                from_llm: true,
            },
            Err(err) => {
                debug!(doc_id = %doc.id, error = %err, "extraction JSON invalid; heuristic fallback");
                heuristic_extraction(doc)
            }
        },
        Err(err) => {
            debug!(doc_id = %doc.id, error = %err, "extraction call failed; heuristic fallback");
            heuristic_extraction(doc)
        }
    }
}

/// The text the extraction looks at: structured summary fields when present,
/// raw content otherwise.
fn analysis_body(doc: &Document) -> String {
    match &doc.structured_summary {
        Some(summary) => {
            let mut parts = vec![summary.summary.clone()];
            if !summary.decisions.is_empty() {
                parts.push(format!("Decisions: {}", summary.decisions.join("; ")));
            }
            if !summary.processes.is_empty() {
                parts.push(format!("Processes: {}", summary.processes.join("; ")));
            }
            if !summary.technical_details.is_empty() {
                parts.push(format!("Technical: {}", summary.technical_details.join("; ")));
            }
            parts.join("\n")
        }
        None => doc.content.clone(),
    }
}

static DECISION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[^.!?\n]*\b(decided to|chose|opted for|went with|will use)\b[^.!?\n]*")
        .expect("valid decision regex")
});
static RATIONALE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(because|since|due to|so that)\b").expect("valid rationale regex")
});
static PROCESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[^.!?\n]*\b(process|procedure|runbook|steps to|workflow)\b[^.!?\n]*")
        .expect("valid process regex")
});
static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z][a-zA-Z0-9]{2,}\b").expect("valid entity regex")
});
static ACRONYM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z]{2,6}[0-9]*\b").expect("valid acronym regex"));
static DEPENDENCY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:depends on|relies on|requires|built on)\s+([A-Za-z][A-Za-z0-9_-]{2,})")
        .expect("valid dependency regex")
});

/// Regex-only extraction used when the LLM is unavailable or unparseable.
pub fn heuristic_extraction(doc: &Document) -> DocExtraction {
    let body = analysis_body(doc);

    let decisions: Vec<ExtractedDecision> = DECISION_RE
        .find_iter(&body)
        .take(20)
        .map(|m| ExtractedDecision {
            text: m.as_str().trim().to_string(),
            has_rationale: RATIONALE_RE.is_match(m.as_str()),
        })
        .collect();

    let processes: Vec<String> = PROCESS_RE
        .find_iter(&body)
        .take(20)
        .map(|m| m.as_str().trim().to_string())
        .collect();

    let mut entities: Vec<ExtractedEntity> = Vec::new();
    for m in ENTITY_RE.find_iter(&body).take(200) {
        let name = m.as_str().to_string();
        if !entities.iter().any(|e| e.name == name) {
            entities.push(ExtractedEntity {
                name,
                kind: "term".to_string(),
            });
        }
    }

    let mut terms: Vec<String> = Vec::new();
    for m in ACRONYM_RE.find_iter(&body).take(100) {
        let term = m.as_str().to_string();
        if !terms.contains(&term) {
            terms.push(term);
        }
    }

    let dependencies: Vec<String> = DEPENDENCY_RE
        .captures_iter(&body)
        .take(50)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect();

    DocExtraction {
        doc_id: doc.id.clone(),
        title: doc.title.clone(),
        author: doc.sender.clone(),
        created_at: doc.source_created_at,
        entities,
        decisions,
        processes,
        claims: Vec::new(),
        terms,
        dependencies,
        from_llm: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::document::{DocumentClassification, DocumentStatus};
    use common::storage::types::source_connector::SourceType;

    fn doc(content: &str) -> Document {
        let now = Utc::now();
        Document {
            id: "d1".to_string(),
            created_at: now,
            updated_at: now,
            tenant_id: "t1".to_string(),
            project_id: None,
            source_type: SourceType::EmailSource,
            external_id: "e1".to_string(),
            title: "Thread".to_string(),
            content: content.to_string(),
            content_hash: "h".to_string(),
            doc_type: "email".to_string(),
            sender: Some("lead".to_string()),
            source_created_at: Some(now),
            source_updated_at: None,
            classification: DocumentClassification::Work,
            classification_confidence: 0.9,
            classification_borderline: false,
            status: DocumentStatus::Confirmed,
            user_confirmed: true,
            structured_summary: None,
            structured_summary_at: None,
            embedding_generated: false,
            embedded_chunk_count: 0,
            embedded_at: None,
            is_deleted: false,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn heuristics_find_decisions_processes_and_dependencies() {
        let document = doc(
            "We decided to use Vault for secrets because rotation matters. \
             The deploy process runs nightly and depends on Harbor. \
             Everyone calls the staging cluster STG2.",
        );
        let extraction = heuristic_extraction(&document);

        assert!(!extraction.from_llm);
        assert_eq!(extraction.decisions.len(), 1);
        assert!(extraction.decisions[0].has_rationale);
        assert!(!extraction.processes.is_empty());
        assert_eq!(extraction.dependencies, vec!["Harbor"]);
        assert!(extraction.terms.iter().any(|t| t == "STG2"));
        assert!(extraction.entities.iter().any(|e| e.name == "Vault"));
    }

    #[test]
    fn decision_without_reason_is_marked() {
        let document = doc("They chose DynamoDB for the session store.");
        let extraction = heuristic_extraction(&document);
        assert_eq!(extraction.decisions.len(), 1);
        assert!(!extraction.decisions[0].has_rationale);
    }
}
