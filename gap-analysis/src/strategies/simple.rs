use serde::Deserialize;
use serde_json::json;
use tracing::info;

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::document::Document},
    utils::llm::{parse_json_payload, LlmClient},
};

use crate::prep::{prepare_documents, MAX_ANALYSIS_CHARS};
use crate::{AnalysisContext, AnalysisResult};

use super::{persist_gaps, GapDraft};

const SYSTEM_MESSAGE: &str = "You are a knowledge management expert. Analyze documents to identify gaps in organizational knowledge. Always respond with valid JSON.";

const GAP_ANALYSIS_PROMPT: &str = r#"Analyze the following documents and identify knowledge gaps - information that is missing, unclear, or needs documentation.

DOCUMENTS:
{documents}

For each gap you identify, provide:
1. A clear title describing the missing knowledge
2. A description of why this information is important
3. A category (decision, technical, process, context, relationship, timeline, outcome, rationale)
4. A priority (1-5, 5 being highest)
5. 3-5 specific questions that would help fill this gap

Focus on:
- Decisions mentioned but not explained
- Technical details that are assumed but not documented
- Processes that are referenced but not described
- Context that would help understand the situation
- Relationships between people/teams that are unclear
- Timelines and deadlines that aren't specified
- Outcomes of projects/decisions that aren't recorded
- Rationale behind important choices

Respond in JSON format:
{
    "gaps": [
        {
            "title": "...",
            "description": "...",
            "category": "decision|technical|process|context|relationship|timeline|outcome|rationale",
            "priority": 1-5,
            "questions": ["question1", "question2"],
            "related_topics": ["topic1", "topic2"]
        }
    ]
}"#;

#[derive(Debug, Deserialize)]
struct GapResponse {
    #[serde(default)]
    gaps: Vec<RawGap>,
}

#[derive(Debug, Deserialize)]
struct RawGap {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    category: String,
    #[serde(default = "default_priority")]
    priority: i64,
    #[serde(default)]
    questions: Vec<String>,
    #[serde(default)]
    related_topics: Vec<String>,
}

fn default_priority() -> i64 {
    3
}

/// Single LLM pass over the budgeted corpus view.
pub async fn analyze(
    db: &SurrealDbClient,
    llm: &dyn LlmClient,
    ctx: &AnalysisContext,
) -> Result<AnalysisResult, AppError> {
    let documents = Document::list_for_analysis(db, &ctx.tenant_id, &ctx.filter()).await?;
    if documents.is_empty() {
        return Ok(AnalysisResult::default());
    }
    info!(tenant_id = %ctx.tenant_id, documents = documents.len(), "simple gap analysis starting");

    let (corpus, prep) = prepare_documents(&documents, MAX_ANALYSIS_CHARS);
    let prompt = GAP_ANALYSIS_PROMPT.replace("{documents}", &corpus);

    let raw = llm.chat_json(SYSTEM_MESSAGE, &prompt, 0.3, 4_000).await?;
    let parsed: GapResponse = match parse_json_payload(&raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            // Malformed output is an empty result, never a crash.
            tracing::warn!(error = %err, "simple analysis produced unparseable JSON");
            GapResponse { gaps: Vec::new() }
        }
    };

    let analyzed_ids: Vec<&str> = documents.iter().take(10).map(|d| d.id.as_str()).collect();
    let drafts: Vec<GapDraft> = parsed
        .gaps
        .into_iter()
        .filter(|gap| !gap.title.trim().is_empty())
        .map(|gap| GapDraft {
            title: if gap.title.is_empty() { "Unknown Gap".into() } else { gap.title },
            description: gap.description,
            category_label: gap.category,
            priority: gap.priority,
            questions: gap.questions,
            context: json!({
                "related_topics": gap.related_topics,
                "analyzed_documents": analyzed_ids.clone(),
            }),
        })
        .collect();

    persist_gaps(db, ctx, "simple", drafts, documents.len(), prep).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::testing::ScriptedLlm;
    use common::storage::types::document::{DocumentDraft, DocumentStatus};
    use common::storage::types::knowledge_gap::{GapCategory, GapFilter, KnowledgeGap};
    use common::storage::types::source_connector::SourceType;
    use uuid::Uuid;

    async fn seeded_db(tenant: &str, docs: usize) -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("simple_ns", &database)
            .await
            .expect("in-memory surrealdb");
        db.ensure_initialized().await.expect("schema");

        for i in 0..docs {
            let (doc, _) = Document::upsert(
                &db,
                DocumentDraft {
                    tenant_id: tenant.to_string(),
                    project_id: None,
                    source_type: SourceType::EmailSource,
                    external_id: format!("m{i}"),
                    title: format!("Thread {i}"),
                    content: format!("We decided to migrate service {i} next sprint."),
                    doc_type: "email".to_string(),
                    sender: Some("lead@example.com".to_string()),
                    source_created_at: Some(chrono::Utc::now()),
                    source_updated_at: None,
                    metadata: serde_json::json!({}),
                },
            )
            .await
            .expect("seed doc");
            Document::set_status(&db, &doc.id, DocumentStatus::Pending)
                .await
                .expect("status");
        }

        db
    }

    fn ctx(tenant: &str) -> AnalysisContext {
        AnalysisContext {
            tenant_id: tenant.to_string(),
            project_id: None,
            include_pending: true,
            max_documents: 200,
        }
    }

    #[tokio::test]
    async fn gaps_from_the_llm_are_persisted_with_categories() {
        let db = seeded_db("t1", 3).await;
        let llm = ScriptedLlm::new(vec![
            r#"{"gaps": [
                {"title": "Migration rationale undocumented", "description": "Nobody wrote down why", "category": "rationale", "priority": 4, "questions": ["Why migrate now?", "What were the alternatives?"], "related_topics": ["migration"]},
                {"title": "Unclear rollout order", "description": "", "category": "made-up-category", "priority": 9, "questions": ["Which service goes first?"]}
            ]}"#,
        ]);

        let result = analyze(&db, &llm, &ctx("t1")).await.expect("analyze");

        assert_eq!(result.gaps.len(), 2);
        assert_eq!(result.total_documents_analyzed, 3);
        assert_eq!(result.prep.documents_included, 3);

        // Closed category mapping and priority clamping applied.
        let (stored, _) = KnowledgeGap::list(&db, "t1", &GapFilter::default())
            .await
            .expect("list");
        assert_eq!(stored.len(), 2);
        let unclear = stored
            .iter()
            .find(|g| g.title.contains("rollout"))
            .expect("gap");
        assert_eq!(unclear.category, GapCategory::Context);
        assert_eq!(unclear.priority, 5);
        assert!(unclear.questions.iter().all(|q| !q.answered));
        assert_eq!(
            unclear.context.get("analysis_type").and_then(|v| v.as_str()),
            Some("simple")
        );

        // The prompt actually carried the corpus.
        let prompts = llm.prompts.lock().expect("prompts");
        assert!(prompts[0].contains("Thread 0"));
    }

    #[tokio::test]
    async fn invalid_llm_json_yields_an_empty_result_not_an_error() {
        let db = seeded_db("t1", 1).await;
        let llm = ScriptedLlm::new(vec!["this is not json"]);

        let result = analyze(&db, &llm, &ctx("t1")).await.expect("analyze");
        assert!(result.gaps.is_empty());
        assert_eq!(result.total_documents_analyzed, 1);
    }

    #[tokio::test]
    async fn no_documents_short_circuits_without_llm_calls() {
        let db = seeded_db("t1", 0).await;
        let llm = ScriptedLlm::new(vec![]);

        let result = analyze(&db, &llm, &ctx("t1")).await.expect("analyze");
        assert!(result.gaps.is_empty());
        assert_eq!(result.total_documents_analyzed, 0);
        assert!(llm.prompts.lock().expect("prompts").is_empty());
    }
}
