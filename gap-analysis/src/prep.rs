use serde::Serialize;
use tracing::{info, warn};

use common::storage::types::document::Document;

/// Hard cap on the assembled corpus view (~100K tokens at 4 chars/token),
/// leaving headroom for prompt and response.
pub const MAX_ANALYSIS_CHARS: usize = 400_000;
/// Raw-content fallback cap per document.
pub const FALLBACK_CONTENT_CHARS: usize = 4_000;
/// Second attempt when a document would blow the remaining budget.
pub const FALLBACK_RETRY_CHARS: usize = 2_000;

/// Preparation statistics returned alongside every analysis result.
#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct PrepStats {
    pub total_documents: usize,
    pub documents_included: usize,
    pub documents_with_summary: usize,
    pub documents_with_fallback: usize,
    pub documents_skipped: usize,
    pub total_chars: usize,
    pub estimated_tokens: usize,
}

/// Render one document for analysis.
///
/// The structured summary is the primary representation; documents without
/// one fall back to raw content truncated at `max_content_chars`.
pub fn prepare_document(doc: &Document, max_content_chars: usize) -> String {
    let mut text = String::from("---\n");
    text.push_str(&format!(
        "Title: {}\n",
        if doc.title.is_empty() { "Untitled" } else { &doc.title }
    ));
    text.push_str(&format!("Type: {}\n", doc.source_type.as_str()));
    if let Some(created) = doc.source_created_at {
        text.push_str(&format!("Date: {}\n", created.to_rfc3339()));
    }
    if let Some(sender) = &doc.sender {
        text.push_str(&format!("From: {sender}\n"));
    }

    if let Some(summary) = &doc.structured_summary {
        text.push_str(&format!("\nSummary: {}\n", summary.summary));
        if !summary.key_topics.is_empty() {
            text.push_str(&format!("Key Topics: {}\n", summary.key_topics.join(", ")));
        }
        if !summary.entities.people.is_empty() {
            text.push_str(&format!("People: {}\n", summary.entities.people.join(", ")));
        }
        if !summary.entities.systems.is_empty() {
            text.push_str(&format!("Systems: {}\n", summary.entities.systems.join(", ")));
        }
        if !summary.entities.organizations.is_empty() {
            text.push_str(&format!(
                "Organizations: {}\n",
                summary.entities.organizations.join(", ")
            ));
        }
        if !summary.decisions.is_empty() {
            text.push_str(&format!("Decisions: {}\n", summary.decisions.join("; ")));
        }
        if !summary.processes.is_empty() {
            text.push_str(&format!("Processes: {}\n", summary.processes.join("; ")));
        }
        if !summary.dates.is_empty() {
            let dates: Vec<String> = summary
                .dates
                .iter()
                .take(5)
                .map(|d| format!("{}: {}", d.date, d.event))
                .collect();
            text.push_str(&format!("Key Dates: {}\n", dates.join("; ")));
        }
        if !summary.action_items.is_empty() {
            let items: Vec<&str> = summary
                .action_items
                .iter()
                .take(5)
                .map(String::as_str)
                .collect();
            text.push_str(&format!("Action Items: {}\n", items.join("; ")));
        }
        if !summary.technical_details.is_empty() {
            let details: Vec<&str> = summary
                .technical_details
                .iter()
                .take(3)
                .map(String::as_str)
                .collect();
            text.push_str(&format!("Technical: {}\n", details.join("; ")));
        }
        text.push_str(&format!("Word Count: ~{}\n", summary.word_count));
    } else {
        let content_chars = doc.content.chars().count();
        let body: String = doc.content.chars().take(max_content_chars).collect();
        text.push_str(&format!("\nContent:\n{body}\n"));
        if content_chars > max_content_chars {
            text.push_str(&format!("[... truncated, {content_chars} total chars]\n"));
        }
    }

    text.push_str("---\n");
    text
}

/// Assemble the corpus view under the character budget.
///
/// Documents are consumed most-recent-first (the snapshot query orders them,
/// and the sort here keeps the law independent of the caller). A document
/// that would overflow is retried at the smaller fallback size, then skipped.
pub fn prepare_documents(documents: &[Document], max_total_chars: usize) -> (String, PrepStats) {
    let mut ordered: Vec<&Document> = documents.iter().collect();
    ordered.sort_by(|a, b| b.source_created_at.cmp(&a.source_created_at));

    let mut parts: Vec<String> = Vec::new();
    let mut stats = PrepStats {
        total_documents: documents.len(),
        ..Default::default()
    };
    let mut total_chars = 0_usize;

    for doc in ordered {
        if total_chars >= max_total_chars {
            break;
        }

        let has_summary = doc.structured_summary.is_some();
        let mut text = prepare_document(doc, FALLBACK_CONTENT_CHARS);

        if total_chars.saturating_add(text.chars().count()) > max_total_chars {
            text = prepare_document(doc, FALLBACK_RETRY_CHARS);
            if total_chars.saturating_add(text.chars().count()) > max_total_chars {
                continue;
            }
        }

        total_chars = total_chars.saturating_add(text.chars().count());
        parts.push(text);
        stats.documents_included = stats.documents_included.saturating_add(1);
        if has_summary {
            stats.documents_with_summary = stats.documents_with_summary.saturating_add(1);
        } else {
            stats.documents_with_fallback = stats.documents_with_fallback.saturating_add(1);
        }
    }

    stats.documents_skipped = stats
        .total_documents
        .saturating_sub(stats.documents_included);
    stats.total_chars = total_chars;
    stats.estimated_tokens = total_chars / 4;

    if stats.documents_skipped > 0 {
        warn!(
            included = stats.documents_included,
            skipped = stats.documents_skipped,
            "analysis budget reached; corpus truncated"
        );
    }
    info!(
        total = stats.total_documents,
        included = stats.documents_included,
        with_summary = stats.documents_with_summary,
        with_fallback = stats.documents_with_fallback,
        total_chars = stats.total_chars,
        est_tokens = stats.estimated_tokens,
        "analysis corpus prepared"
    );

    (parts.join("\n"), stats)
}
