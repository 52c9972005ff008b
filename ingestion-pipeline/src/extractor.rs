use tracing::{debug, info, warn};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::document::{Document, StructuredSummary},
    },
    utils::llm::{parse_json_payload, LlmClient},
};

/// Input cap for a single extraction call.
pub const MAX_EXTRACTION_CONTENT: usize = 50_000;
/// Documents shorter than this carry nothing worth summarizing.
const MIN_EXTRACTABLE_CHARS: usize = 50;

const SYSTEM_MESSAGE: &str = "You are a document analyst. Extract structured information from documents accurately. Return only valid JSON.";

const EXTRACTION_PROMPT: &str = r#"Analyze this document and extract structured information.

DOCUMENT TITLE: {title}
DOCUMENT TYPE: {doc_type}
CONTENT:
{content}

Extract the following information. Be specific and reference actual content from the document.
If a field has no relevant information, use an empty list.

Return a JSON object with this structure:
{
    "summary": "2-3 sentence overview of what this document is about",
    "key_topics": ["topic1", "topic2"],
    "entities": {
        "people": ["person names mentioned"],
        "systems": ["systems, tools, software mentioned"],
        "organizations": ["companies, teams, departments mentioned"]
    },
    "decisions": ["any decisions mentioned or implied"],
    "processes": ["any processes, workflows, or procedures described"],
    "dates": [
        {"date": "YYYY-MM-DD or description", "event": "what happened/will happen"}
    ],
    "action_items": ["any tasks, todos, or next steps mentioned"],
    "technical_details": ["any technical specifications, configurations, or implementations"],
    "word_count": 0
}

Focus on extracting CONCRETE, SPECIFIC information that would help someone understand:
1. What this document is about
2. Who is involved
3. What systems/tools are mentioned
4. What decisions were made
5. What needs to be done

Return ONLY the JSON object, no other text."#;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    pub total: usize,
    pub extracted: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Produce a structured summary for one document's content.
///
/// Returns `Ok(None)` when the content is too short, or when the LLM output
/// cannot be parsed; a missing summary is an expected outcome and the analyzer
/// falls back to truncated raw text.
pub async fn summarize_content(
    llm: &dyn LlmClient,
    title: &str,
    doc_type: &str,
    content: &str,
) -> Result<Option<StructuredSummary>, AppError> {
    if content.trim().chars().count() < MIN_EXTRACTABLE_CHARS {
        return Ok(None);
    }

    let total_chars = content.chars().count();
    let mut truncated: String = content.chars().take(MAX_EXTRACTION_CONTENT).collect();
    if total_chars > MAX_EXTRACTION_CONTENT {
        truncated.push_str(&format!(
            "\n\n[... Content truncated. Original length: {total_chars} chars]"
        ));
    }

    let prompt = EXTRACTION_PROMPT
        .replace("{title}", if title.is_empty() { "Untitled" } else { title })
        .replace("{doc_type}", doc_type)
        .replace("{content}", &truncated);

    let raw = match llm.chat_json(SYSTEM_MESSAGE, &prompt, 0.1, 2_000).await {
        Ok(raw) => raw,
        Err(AppError::Parse(message)) => {
            warn!(%message, "extraction response unusable");
            return Ok(None);
        }
        Err(err) => return Err(err),
    };

    match parse_json_payload::<StructuredSummary>(&raw) {
        Ok(summary) => Ok(Some(summary)),
        Err(err) => {
            warn!(error = %err, "extraction JSON invalid; document left without summary");
            Ok(None)
        }
    }
}

/// Summarize one stored document and persist the result.
///
/// Idempotent per `(document, content_hash)`: a document that already has a
/// summary for its current content is skipped unless `force` is set.
pub async fn extract_document(
    db: &SurrealDbClient,
    llm: &dyn LlmClient,
    document: &Document,
    force: bool,
) -> Result<bool, AppError> {
    if !force && document.structured_summary.is_some() {
        return Ok(true);
    }
    if document.content.trim().is_empty() {
        return Ok(false);
    }

    debug!(doc_id = %document.id, title = %document.title, "extracting structured summary");
    let summary = summarize_content(llm, &document.title, &document.doc_type, &document.content)
        .await?;

    match summary {
        Some(summary) => {
            info!(
                doc_id = %document.id,
                topics = summary.key_topics.len(),
                decisions = summary.decisions.len(),
                "structured summary extracted"
            );
            Document::set_structured_summary(db, &document.id, summary).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Batch extraction over stored documents.
pub async fn extract_documents(
    db: &SurrealDbClient,
    llm: &dyn LlmClient,
    documents: &[Document],
    force: bool,
) -> ExtractionStats {
    let mut stats = ExtractionStats {
        total: documents.len(),
        ..Default::default()
    };

    for document in documents {
        if (!force && document.structured_summary.is_some()) || document.content.is_empty() {
            stats.skipped = stats.skipped.saturating_add(1);
            continue;
        }

        match extract_document(db, llm, document, force).await {
            Ok(true) => stats.extracted = stats.extracted.saturating_add(1),
            Ok(false) => stats.errors = stats.errors.saturating_add(1),
            Err(err) => {
                warn!(doc_id = %document.id, error = %err, "extraction failed; continuing batch");
                stats.errors = stats.errors.saturating_add(1);
            }
        }
    }

    stats
}
