//! Pattern-based gap detection.
//!
//! Six layers over the corpus, none of which call an LLM: frame extraction,
//! semantic-role gaps, discourse gaps, entity-graph gaps, cross-document
//! verification, and grounded question generation. Findings always cite the
//! sentence and document they came from.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;
use tracing::info;

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::document::Document},
};

use crate::prep::{PrepStats, FALLBACK_CONTENT_CHARS, MAX_ANALYSIS_CHARS};
use crate::{AnalysisContext, AnalysisResult};

use super::{persist_gaps, truncate, GapDraft};

const MAX_GAPS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Decision,
    Process,
    Claim,
    Result,
}

#[derive(Debug, Clone)]
struct Frame {
    kind: FrameKind,
    sentence: String,
    doc_id: String,
    doc_title: String,
}

static DECISION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(decided to|chose|opted for|went with|selected|will use|agreed to)\b")
        .expect("valid decision regex")
});
static PROCESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(process for|steps to|procedure|workflow|runbook|how to)\b")
        .expect("valid process regex")
});
static CLAIM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(should|must|need to|have to|it is (critical|important|essential))\b")
        .expect("valid claim regex")
});
static RESULT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(resulted in|led to|caused|fixed|resolved|broke)\b")
        .expect("valid result regex")
});
static RATIONALE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(because|since|due to|so that|in order to|the reason)\b")
        .expect("valid rationale regex")
});
static AGENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(we|i|they|team|[A-Z][a-z]+)\s+(decided|chose|opted|went|selected|agreed)")
        .expect("valid agent regex")
});
static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Capitalized tokens and acronyms; crude but grounded in the text.
    Regex::new(r"\b([A-Z][a-zA-Z0-9]{2,}|[A-Z]{2,8}[0-9]*)\b").expect("valid entity regex")
});
static NEGATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(not|never|no longer|don't|doesn't|won't|shouldn't|deprecated)\b")
        .expect("valid negation regex")
});

/// Words too common to be entities even when capitalized (sentence starts).
const ENTITY_STOPWORDS: &[&str] = &[
    "The", "This", "That", "These", "Those", "There", "Then", "When", "Where", "What", "Which",
    "While", "After", "Before", "Also", "And", "But", "For", "From", "With", "Our", "Your",
    "Their", "His", "Her", "She", "Its", "They", "You", "Not", "All", "Any", "Each", "Every",
    "Some", "Most", "Both", "Only", "Once", "First", "Second", "Third", "Next", "Last", "Now",
    "Today", "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday",
    "January", "February", "March", "April", "June", "July", "August", "September", "October",
    "November", "December", "Yes", "Please", "Thanks", "Hello",
];

fn split_sentences(text: &str) -> Vec<String> {
    text.split_terminator(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| s.split_whitespace().count() >= 4)
        .map(str::to_string)
        .collect()
}

/// Layer 1: structured frame detection.
fn extract_frames(doc_id: &str, doc_title: &str, sentences: &[String]) -> Vec<Frame> {
    let mut frames = Vec::new();
    for sentence in sentences {
        let kind = if DECISION_RE.is_match(sentence) {
            Some(FrameKind::Decision)
        } else if PROCESS_RE.is_match(sentence) {
            Some(FrameKind::Process)
        } else if RESULT_RE.is_match(sentence) {
            Some(FrameKind::Result)
        } else if CLAIM_RE.is_match(sentence) {
            Some(FrameKind::Claim)
        } else {
            None
        };

        if let Some(kind) = kind {
            frames.push(Frame {
                kind,
                sentence: sentence.clone(),
                doc_id: doc_id.to_string(),
                doc_title: doc_title.to_string(),
            });
        }
    }
    frames
}

/// Layers 2 and 3: role and discourse gaps on the extracted frames.
fn frame_gaps(frames: &[Frame]) -> Vec<GapDraft> {
    let mut drafts = Vec::new();

    for frame in frames {
        match frame.kind {
            FrameKind::Decision => {
                let missing_rationale = !RATIONALE_RE.is_match(&frame.sentence);
                let missing_agent = !AGENT_RE.is_match(&frame.sentence);
                if missing_rationale {
                    drafts.push(GapDraft {
                        title: format!("Unexplained decision in \"{}\"", frame.doc_title),
                        description: format!(
                            "A decision is recorded without its reasoning: \"{}\"",
                            truncate(&frame.sentence, 300)
                        ),
                        category_label: "rationale".to_string(),
                        priority: 4,
                        questions: vec![
                            format!(
                                "What was the reasoning behind: \"{}\"?",
                                truncate(&frame.sentence, 200)
                            ),
                            "What alternatives were considered and rejected?".to_string(),
                        ],
                        context: evidence(frame, "decision_without_rationale"),
                    });
                }
                if missing_agent {
                    drafts.push(GapDraft {
                        title: format!("Decision owner unclear in \"{}\"", frame.doc_title),
                        description: format!(
                            "No one is named as the decision maker for: \"{}\"",
                            truncate(&frame.sentence, 300)
                        ),
                        category_label: "relationship".to_string(),
                        priority: 3,
                        questions: vec![format!(
                            "Who made this decision and who should be consulted about changing it: \"{}\"?",
                            truncate(&frame.sentence, 200)
                        )],
                        context: evidence(frame, "decision_without_agent"),
                    });
                }
            }
            FrameKind::Process => {
                drafts.push(GapDraft {
                    title: format!("Referenced process may be undocumented: \"{}\"", frame.doc_title),
                    description: format!(
                        "A process is referenced but not described end to end: \"{}\"",
                        truncate(&frame.sentence, 300)
                    ),
                    category_label: "process".to_string(),
                    priority: 3,
                    questions: vec![
                        format!(
                            "What are the exact steps of the process mentioned here: \"{}\"?",
                            truncate(&frame.sentence, 200)
                        ),
                        "Who owns this process and how often does it run?".to_string(),
                    ],
                    context: evidence(frame, "process_reference"),
                });
            }
            FrameKind::Claim => {
                if !RATIONALE_RE.is_match(&frame.sentence) {
                    drafts.push(GapDraft {
                        title: format!("Claim without evidence in \"{}\"", frame.doc_title),
                        description: format!(
                            "A normative claim carries no supporting reasoning: \"{}\"",
                            truncate(&frame.sentence, 300)
                        ),
                        category_label: "context".to_string(),
                        priority: 2,
                        questions: vec![format!(
                            "What is the evidence or incident behind: \"{}\"?",
                            truncate(&frame.sentence, 200)
                        )],
                        context: evidence(frame, "claim_without_evidence"),
                    });
                }
            }
            FrameKind::Result => {
                if !RATIONALE_RE.is_match(&frame.sentence) {
                    drafts.push(GapDraft {
                        title: format!("Outcome without cause in \"{}\"", frame.doc_title),
                        description: format!(
                            "An outcome is recorded without its cause: \"{}\"",
                            truncate(&frame.sentence, 300)
                        ),
                        category_label: "outcome".to_string(),
                        priority: 3,
                        questions: vec![format!(
                            "What caused this outcome and could it recur: \"{}\"?",
                            truncate(&frame.sentence, 200)
                        )],
                        context: evidence(frame, "result_without_cause"),
                    });
                }
            }
        }
    }

    drafts
}

fn evidence(frame: &Frame, pattern: &str) -> serde_json::Value {
    json!({
        "pattern": pattern,
        "source_doc": frame.doc_id.clone(),
        "source_title": frame.doc_title.clone(),
        "evidence": truncate(&frame.sentence, 400),
    })
}

#[derive(Debug, Default)]
struct EntityStats {
    mentions: usize,
    docs: HashSet<String>,
    co_occurring: HashSet<String>,
}

/// Layer 4: capitalized-entity co-occurrence graph.
fn build_entity_graph(docs: &[(String, String, Vec<String>)]) -> HashMap<String, EntityStats> {
    let mut graph: HashMap<String, EntityStats> = HashMap::new();

    for (doc_id, _, sentences) in docs {
        for sentence in sentences {
            let entities: Vec<String> = ENTITY_RE
                .captures_iter(sentence)
                .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
                .filter(|e| !ENTITY_STOPWORDS.contains(&e.as_str()))
                .collect();

            for entity in &entities {
                let stats = graph.entry(entity.clone()).or_default();
                stats.mentions = stats.mentions.saturating_add(1);
                stats.docs.insert(doc_id.clone());
                for other in &entities {
                    if other != entity {
                        stats.co_occurring.insert(other.clone());
                    }
                }
            }
        }
    }

    graph
}

/// Layers 4 and 5: single-source knowledge and isolated entities.
fn entity_gaps(graph: &HashMap<String, EntityStats>) -> Vec<GapDraft> {
    let mut drafts = Vec::new();

    let mut entities: Vec<(&String, &EntityStats)> = graph.iter().collect();
    entities.sort_by(|a, b| b.1.mentions.cmp(&a.1.mentions).then_with(|| a.0.cmp(b.0)));

    for (entity, stats) in entities {
        // Frequently referenced but known from a single document: classic
        // bus-factor knowledge.
        if stats.mentions >= 3 && stats.docs.len() == 1 {
            let doc = stats.docs.iter().next().cloned().unwrap_or_default();
            drafts.push(GapDraft {
                title: format!("\"{entity}\" is single-source knowledge"),
                description: format!(
                    "\"{entity}\" is mentioned {} times but only ever in one document; losing that source loses the knowledge.",
                    stats.mentions
                ),
                category_label: "context".to_string(),
                priority: 4,
                questions: vec![
                    format!("What is \"{entity}\" and what role does it play?"),
                    format!("Who else understands \"{entity}\" besides the author of its one document?"),
                ],
                context: json!({
                    "pattern": "single_source_entity",
                    "entity": entity,
                    "mentions": stats.mentions,
                    "source_doc": doc,
                }),
            });
        }
    }

    drafts
}

/// Layer 5: cross-document contradiction candidates, i.e. the same entity
/// asserted with opposite polarity in different documents.
fn contradiction_gaps(docs: &[(String, String, Vec<String>)]) -> Vec<GapDraft> {
    struct Mention<'a> {
        doc_id: &'a str,
        doc_title: &'a str,
        sentence: &'a str,
        negated: bool,
    }

    let mut by_entity: HashMap<String, Vec<Mention>> = HashMap::new();
    for (doc_id, doc_title, sentences) in docs {
        for sentence in sentences {
            for captures in ENTITY_RE.captures_iter(sentence) {
                let Some(entity) = captures.get(1).map(|m| m.as_str()) else {
                    continue;
                };
                if ENTITY_STOPWORDS.contains(&entity) {
                    continue;
                }
                by_entity.entry(entity.to_string()).or_default().push(Mention {
                    doc_id,
                    doc_title,
                    sentence,
                    negated: NEGATION_RE.is_match(sentence),
                });
            }
        }
    }

    let mut drafts = Vec::new();
    let mut seen_entities = HashSet::new();
    for (entity, mentions) in by_entity {
        let positive = mentions.iter().find(|m| !m.negated);
        let negative = mentions.iter().find(|m| m.negated);
        let (Some(positive), Some(negative)) = (positive, negative) else {
            continue;
        };
        if positive.doc_id == negative.doc_id || !seen_entities.insert(entity.clone()) {
            continue;
        }

        drafts.push(GapDraft {
            title: format!("Possible contradiction about \"{entity}\""),
            description: format!(
                "\"{}\" ({}) vs \"{}\" ({})",
                truncate(positive.sentence, 200),
                positive.doc_title,
                truncate(negative.sentence, 200),
                negative.doc_title
            ),
            category_label: "context".to_string(),
            priority: 4,
            questions: vec![format!(
                "These documents appear to disagree about \"{entity}\"; which statement is current?"
            )],
            context: json!({
                "pattern": "cross_document_contradiction",
                "entity": entity,
                "positive_doc": positive.doc_id,
                "negative_doc": negative.doc_id,
            }),
        });
    }

    drafts
}

/// Pattern-based analysis entry point. No LLM involved.
pub async fn analyze(db: &SurrealDbClient, ctx: &AnalysisContext) -> Result<AnalysisResult, AppError> {
    let documents = Document::list_for_analysis(db, &ctx.tenant_id, &ctx.filter()).await?;
    if documents.is_empty() {
        return Ok(AnalysisResult::default());
    }
    info!(
        tenant_id = %ctx.tenant_id,
        documents = documents.len(),
        "intelligent gap analysis starting"
    );

    // Pattern layers read raw text (summaries drop the phrasing the patterns
    // key on) but stay within the same per-document and corpus budgets.
    let mut prepared: Vec<(String, String, Vec<String>)> = Vec::new();
    let mut total_chars = 0_usize;
    let mut stats = PrepStats {
        total_documents: documents.len(),
        ..Default::default()
    };
    for doc in &documents {
        if total_chars >= MAX_ANALYSIS_CHARS {
            break;
        }
        let body: String = doc.content.chars().take(FALLBACK_CONTENT_CHARS * 2).collect();
        if body.trim().len() < 40 {
            continue;
        }
        total_chars = total_chars.saturating_add(body.chars().count());
        stats.documents_included = stats.documents_included.saturating_add(1);
        if doc.structured_summary.is_some() {
            stats.documents_with_summary = stats.documents_with_summary.saturating_add(1);
        } else {
            stats.documents_with_fallback = stats.documents_with_fallback.saturating_add(1);
        }
        prepared.push((doc.id.clone(), doc.title.clone(), split_sentences(&body)));
    }
    stats.documents_skipped = stats.total_documents.saturating_sub(stats.documents_included);
    stats.total_chars = total_chars;
    stats.estimated_tokens = total_chars / 4;

    // Layers 1-3.
    let mut frames = Vec::new();
    for (doc_id, doc_title, sentences) in &prepared {
        frames.extend(extract_frames(doc_id, doc_title, sentences));
    }
    let mut drafts = frame_gaps(&frames);

    // Layers 4-5.
    let graph = build_entity_graph(&prepared);
    drafts.extend(entity_gaps(&graph));
    drafts.extend(contradiction_gaps(&prepared));

    // Layer 6 already happened inline: every draft carries grounded
    // questions citing its evidence. Keep the strongest findings.
    drafts.sort_by(|a, b| b.priority.cmp(&a.priority));
    drafts.truncate(MAX_GAPS);

    info!(
        frames = frames.len(),
        entities = graph.len(),
        gaps = drafts.len(),
        "intelligent analysis layers complete"
    );

    persist_gaps(db, ctx, "intelligent", drafts, documents.len(), stats).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::document::DocumentDraft;
    use common::storage::types::knowledge_gap::{GapFilter, KnowledgeGap};
    use common::storage::types::source_connector::SourceType;
    use uuid::Uuid;

    #[test]
    fn frames_are_detected_by_kind() {
        let sentences = split_sentences(
            "We decided to use Postgres for the ledger. \
             The steps to rotate credentials are in the vault. \
             You must always drain the queue first. \
             The outage resulted in a full reindex.",
        );
        let frames = extract_frames("d1", "Ops notes", &sentences);

        let kinds: Vec<FrameKind> = frames.iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&FrameKind::Decision));
        assert!(kinds.contains(&FrameKind::Process));
        assert!(kinds.contains(&FrameKind::Claim));
        assert!(kinds.contains(&FrameKind::Result));
    }

    #[test]
    fn decision_without_rationale_raises_a_rationale_gap() {
        let sentences = vec!["We decided to use Postgres for the ledger".to_string()];
        let frames = extract_frames("d1", "Ops notes", &sentences);
        let drafts = frame_gaps(&frames);

        assert!(drafts
            .iter()
            .any(|d| d.category_label == "rationale" && d.title.contains("Unexplained decision")));

        // With a rationale present, the same sentence raises none.
        let sentences =
            vec!["We decided to use Postgres because the ledger needs transactions".to_string()];
        let frames = extract_frames("d1", "Ops notes", &sentences);
        let drafts = frame_gaps(&frames);
        assert!(!drafts.iter().any(|d| d.category_label == "rationale"));
    }

    #[test]
    fn single_source_entities_surface_as_bus_factor() {
        let docs = vec![
            (
                "d1".to_string(),
                "Runbook".to_string(),
                split_sentences(
                    "Flumio handles the nightly export. Flumio retries twice on failure. \
                     Restart Flumio from the ops box when it sticks.",
                ),
            ),
            (
                "d2".to_string(),
                "Readme".to_string(),
                split_sentences("The exporter writes to the Warehouse every night."),
            ),
        ];
        let graph = build_entity_graph(&docs);
        let drafts = entity_gaps(&graph);

        assert!(drafts.iter().any(|d| d.title.contains("Flumio")));
        // Warehouse appears once only; not flagged.
        assert!(!drafts.iter().any(|d| d.title.contains("Warehouse")));
    }

    #[test]
    fn cross_document_polarity_mismatch_is_flagged() {
        let docs = vec![
            (
                "d1".to_string(),
                "Old guide".to_string(),
                split_sentences("Deploys always go through Jenkins for every service"),
            ),
            (
                "d2".to_string(),
                "New guide".to_string(),
                split_sentences("We don't use Jenkins anymore for the deploy pipeline"),
            ),
        ];
        let drafts = contradiction_gaps(&docs);
        assert!(drafts.iter().any(|d| d.title.contains("Jenkins")));

        // Same doc disagreeing with itself is not a cross-document finding.
        let single = vec![(
            "d1".to_string(),
            "Guide".to_string(),
            split_sentences(
                "Deploys go through Jenkins for every service. We don't use Jenkins on weekends",
            ),
        )];
        assert!(contradiction_gaps(&single).is_empty());
    }

    #[tokio::test]
    async fn end_to_end_persists_grounded_gaps_without_an_llm() {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("intelligent_ns", &database)
            .await
            .expect("in-memory surrealdb");
        db.ensure_initialized().await.expect("schema");

        Document::upsert(
            &db,
            DocumentDraft {
                tenant_id: "t1".to_string(),
                project_id: None,
                source_type: SourceType::EmailSource,
                external_id: "m1".to_string(),
                title: "Arch thread".to_string(),
                content: "After the review we decided to use Kafka for the event backbone. \
                          The steps to replay events are known to the platform team only."
                    .to_string(),
                doc_type: "email".to_string(),
                sender: Some("lead@example.com".to_string()),
                source_created_at: Some(chrono::Utc::now()),
                source_updated_at: None,
                metadata: serde_json::json!({}),
            },
        )
        .await
        .expect("seed");

        let ctx = AnalysisContext {
            tenant_id: "t1".to_string(),
            project_id: None,
            include_pending: true,
            max_documents: 100,
        };
        let result = analyze(&db, &ctx).await.expect("analyze");
        assert!(!result.gaps.is_empty());

        let (stored, _) = KnowledgeGap::list(&db, "t1", &GapFilter::default())
            .await
            .expect("list");
        // Every persisted gap is grounded: it cites a pattern and a source doc.
        for gap in &stored {
            assert!(gap.context.get("pattern").is_some(), "gap {} lacks pattern", gap.title);
            assert_eq!(
                gap.context.get("analysis_type").and_then(|v| v.as_str()),
                Some("intelligent")
            );
        }
    }
}
