use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::document::Document},
    utils::llm::{parse_json_payload, LlmClient},
};

use crate::prep::{prepare_documents, MAX_ANALYSIS_CHARS};
use crate::{AnalysisContext, AnalysisResult};

use super::{persist_gaps, GapDraft};

const TEMPERATURE: f32 = 0.3;
const STAGE_MAX_TOKENS: u32 = 3_000;

const SYSTEM_MESSAGE: &str = "You are a senior engineer reconstructing the technical reasoning behind a codebase and its infrastructure. You only care about technical choices. Always respond with valid JSON.";

const STAGE_1_CONTEXT: &str = r#"Read these documents and describe the TECHNICAL context only: the systems, languages, frameworks, data stores, and infrastructure in use, and what they are used for.

Ignore business goals, strategy, staffing and schedules entirely.

DOCUMENTS:
{documents}

Respond in JSON:
{
  "systems": [{"name": "...", "purpose": "..."}],
  "stack": ["..."],
  "integrations": ["..."]
}"#;

const STAGE_2_DECISIONS: &str = r#"Given this technical context:
{context}

List the TECHNICAL decisions visible or implied in the documents: choices of technology, architecture, data modeling, protocols, libraries, deployment topology.

Skip every business, strategy, budget or timeline decision.

DOCUMENTS:
{documents}

Respond in JSON:
{
  "decisions": [{"what": "...", "where_seen": "..."}]
}"#;

const STAGE_3_ALTERNATIVES: &str = r#"For each technical decision below, infer the plausible alternatives the team would have weighed. Name concrete competing technologies or designs.

DECISIONS:
{decisions}

Respond in JSON:
{
  "alternatives": [{"decision": "...", "alternatives": ["..."]}]
}"#;

const STAGE_4_QUESTIONS: &str = r#"Generate knowledge-transfer questions of the form "why X over Y" for these technical decisions and their inferred alternatives.

STRICT RULES:
- Technical questions only. Do NOT ask about business value, strategy, staffing, budget or timelines.
- Every question must name the chosen option and at least one alternative.
- 2-4 questions per decision, prioritized 1-5 (5 = the choice constrains everything else).

DECISIONS AND ALTERNATIVES:
{alternatives}

Respond in JSON:
{
  "gaps": [
    {
      "title": "...",
      "description": "...",
      "category": "technical|decision|rationale",
      "priority": 1-5,
      "questions": ["Why X over Y?"]
    }
  ]
}"#;

#[derive(Debug, Default, Deserialize)]
struct DecisionsResponse {
    #[serde(default)]
    decisions: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct AlternativesResponse {
    #[serde(default)]
    alternatives: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct QuestionsResponse {
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
}

fn default_priority() -> i64 {
    3
}

/// 4-stage backward technical reasoning: context, decisions, inferred
/// alternatives, then "why X over Y" questions. Business, strategy and
/// timeline questions are excluded by construction.
pub async fn analyze(
    db: &SurrealDbClient,
    llm: &dyn LlmClient,
    ctx: &AnalysisContext,
) -> Result<AnalysisResult, AppError> {
    let documents = Document::list_for_analysis(db, &ctx.tenant_id, &ctx.filter()).await?;
    if documents.is_empty() {
        return Ok(AnalysisResult::default());
    }
    info!(
        tenant_id = %ctx.tenant_id,
        documents = documents.len(),
        "goal-first gap analysis starting"
    );

    let (corpus, prep) = prepare_documents(&documents, MAX_ANALYSIS_CHARS);

    let context_raw = llm
        .chat_json(
            SYSTEM_MESSAGE,
            &STAGE_1_CONTEXT.replace("{documents}", &corpus),
            TEMPERATURE,
            STAGE_MAX_TOKENS,
        )
        .await?;

    let decisions_raw = llm
        .chat_json(
            SYSTEM_MESSAGE,
            &STAGE_2_DECISIONS
                .replace("{context}", &context_raw)
                .replace("{documents}", &corpus),
            TEMPERATURE,
            STAGE_MAX_TOKENS,
        )
        .await?;
    let decisions: DecisionsResponse = parse_json_payload(&decisions_raw).unwrap_or_else(|err| {
        warn!(error = %err, "decision stage unparseable; continuing with none");
        DecisionsResponse::default()
    });

    if decisions.decisions.is_empty() {
        // No technical decisions surfaced; nothing to ask about.
        return persist_gaps(db, ctx, "goal-first", Vec::new(), documents.len(), prep).await;
    }

    let alternatives_raw = llm
        .chat_json(
            SYSTEM_MESSAGE,
            &STAGE_3_ALTERNATIVES.replace(
                "{decisions}",
                &serde_json::to_string(&decisions.decisions).unwrap_or_default(),
            ),
            TEMPERATURE,
            STAGE_MAX_TOKENS,
        )
        .await?;
    let alternatives: AlternativesResponse =
        parse_json_payload(&alternatives_raw).unwrap_or_else(|err| {
            warn!(error = %err, "alternatives stage unparseable; continuing with none");
            AlternativesResponse::default()
        });

    let questions_raw = llm
        .chat_json(
            SYSTEM_MESSAGE,
            &STAGE_4_QUESTIONS.replace(
                "{alternatives}",
                &serde_json::to_string(&alternatives.alternatives).unwrap_or_default(),
            ),
            TEMPERATURE,
            STAGE_MAX_TOKENS,
        )
        .await?;
    let questions: QuestionsResponse = parse_json_payload(&questions_raw).unwrap_or_else(|err| {
        warn!(error = %err, "question stage unparseable; no gaps produced");
        QuestionsResponse::default()
    });

    let drafts: Vec<GapDraft> = questions
        .gaps
        .into_iter()
        .filter(|gap| !gap.title.trim().is_empty())
        .map(|gap| GapDraft {
            title: gap.title,
            description: gap.description,
            category_label: gap.category,
            priority: gap.priority,
            questions: gap.questions,
            context: json!({
                "decisions_considered": decisions.decisions.len(),
                "alternatives_inferred": alternatives.alternatives.len(),
            }),
        })
        .collect();

    persist_gaps(db, ctx, "goal-first", drafts, documents.len(), prep).await
}
