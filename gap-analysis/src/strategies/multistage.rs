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

const TEMPERATURE: f32 = 0.4;
const STAGE_MAX_TOKENS: u32 = 3_000;

const SYSTEM_MESSAGE: &str = "You are an organizational knowledge analyst running a staged reasoning process. Always respond with valid JSON.";

const STAGE_1_CORPUS: &str = r#"You are a knowledge analyst examining a corpus of organizational documents.

Build a mental model of this organization. Identify:
- the key entities (people, systems, teams) and their roles
- the projects in flight and their apparent state
- the timeline of major events you can reconstruct
- the relationships between people and teams

DOCUMENTS:
{documents}

Respond in JSON:
{
  "entities": [{"name": "...", "kind": "person|system|team", "role": "..."}],
  "projects": [{"name": "...", "state": "..."}],
  "timeline": [{"when": "...", "event": "..."}],
  "relationships": [{"from": "...", "to": "...", "nature": "..."}]
}"#;

const STAGE_2_EXPERT: &str = r#"You are simulating the mind of a departing employee who has been doing this work for years.

Given this understanding of the organization:
{understanding}

What does this person know that is written down nowhere? Identify:
- tacit knowledge: judgment calls, heuristics, things done "by feel"
- tribal rules: unwritten conventions everyone follows
- implicit decisions: choices that were made without ever being recorded

Respond in JSON:
{
  "tacit_knowledge": ["..."],
  "tribal_rules": ["..."],
  "implicit_decisions": ["..."]
}"#;

const STAGE_3_NEW_HIRE: &str = r#"You are a new employee on your first week at this organization.

Given this understanding of the organization:
{understanding}

What blocks you? Identify:
- blockers: tasks you could not complete with the documentation that exists
- undefined_vocabulary: terms, acronyms and codenames used without definition
- process_gaps: workflows referenced but never described end to end

Respond in JSON:
{
  "blockers": ["..."],
  "undefined_vocabulary": ["..."],
  "process_gaps": ["..."]
}"#;

const STAGE_4_FAILURE: &str = r#"You are a systems reliability engineer analyzing this organization's documentation for failure handling gaps.

Given this understanding of the organization:
{understanding}

Identify operational knowledge that exists only in people's heads:
- undocumented_recoveries: incidents that were clearly fixed but whose fix is unrecorded
- edge_cases: conditions the documents hint at but never spell out
- workarounds: manual steps people perform that no runbook mentions

Respond in JSON:
{
  "undocumented_recoveries": ["..."],
  "edge_cases": ["..."],
  "workarounds": ["..."]
}"#;

const STAGE_5_SYNTHESIS: &str = r#"You are preparing knowledge transfer questions for a departing employee. Your goal is to extract TACIT KNOWLEDGE that would be LOST if they leave without documenting it.

Findings from the earlier analysis stages:

Expert-mind findings:
{expert}

New-hire findings:
{new_hire}

Failure-mode findings:
{failure}

Synthesize the most valuable knowledge gaps. For each gap, write 2-5 concrete questions a colleague could actually answer. Group by category and prioritize 1-5 (5 = work halts without this, 4 = significant delay, 3 = prevents mistakes, 2 = efficiency, 1 = background).

Respond in JSON:
{
  "gaps": [
    {
      "title": "...",
      "description": "...",
      "category": "decision|technical|process|context|relationship|timeline|outcome|rationale",
      "priority": 1-5,
      "questions": ["..."]
    }
  ]
}"#;

#[derive(Debug, Default, Deserialize)]
struct ExpertFindings {
    #[serde(default)]
    tacit_knowledge: Vec<String>,
    #[serde(default)]
    tribal_rules: Vec<String>,
    #[serde(default)]
    implicit_decisions: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NewHireFindings {
    #[serde(default)]
    blockers: Vec<String>,
    #[serde(default)]
    undefined_vocabulary: Vec<String>,
    #[serde(default)]
    process_gaps: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FailureFindings {
    #[serde(default)]
    undocumented_recoveries: Vec<String>,
    #[serde(default)]
    edge_cases: Vec<String>,
    #[serde(default)]
    workarounds: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SynthesisResponse {
    #[serde(default)]
    gaps: Vec<SynthesizedGap>,
}

#[derive(Debug, Deserialize)]
struct SynthesizedGap {
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

/// A stage whose JSON fails to parse contributes nothing instead of aborting
/// the run.
async fn run_stage<T: Default + for<'de> Deserialize<'de>>(
    llm: &dyn LlmClient,
    stage: &str,
    prompt: String,
) -> Result<T, AppError> {
    let raw = llm
        .chat_json(SYSTEM_MESSAGE, &prompt, TEMPERATURE, STAGE_MAX_TOKENS)
        .await?;
    match parse_json_payload::<T>(&raw) {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!(stage, error = %err, "stage output unparseable; continuing without it");
            Ok(T::default())
        }
    }
}

/// 5-stage reasoning: corpus understanding, expert-mind simulation, new-hire
/// simulation, failure-mode analysis, question synthesis.
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
        "multi-stage gap analysis starting"
    );

    let (corpus, prep) = prepare_documents(&documents, MAX_ANALYSIS_CHARS);

    // Stage 1: corpus understanding. Kept as raw JSON text; the later stages
    // consume it verbatim.
    let understanding_raw = llm
        .chat_json(
            SYSTEM_MESSAGE,
            &STAGE_1_CORPUS.replace("{documents}", &corpus),
            TEMPERATURE,
            STAGE_MAX_TOKENS,
        )
        .await?;

    // Stages 2-4 each look at the same understanding from a different angle.
    let expert: ExpertFindings = run_stage(
        llm,
        "expert-mind",
        STAGE_2_EXPERT.replace("{understanding}", &understanding_raw),
    )
    .await?;
    let new_hire: NewHireFindings = run_stage(
        llm,
        "new-hire",
        STAGE_3_NEW_HIRE.replace("{understanding}", &understanding_raw),
    )
    .await?;
    let failure: FailureFindings = run_stage(
        llm,
        "failure-mode",
        STAGE_4_FAILURE.replace("{understanding}", &understanding_raw),
    )
    .await?;

    // Stage 5: synthesis.
    let synthesis_prompt = STAGE_5_SYNTHESIS
        .replace(
            "{expert}",
            &serde_json::to_string(&json!({
                "tacit_knowledge": expert.tacit_knowledge,
                "tribal_rules": expert.tribal_rules,
                "implicit_decisions": expert.implicit_decisions,
            }))
            .unwrap_or_default(),
        )
        .replace(
            "{new_hire}",
            &serde_json::to_string(&json!({
                "blockers": new_hire.blockers,
                "undefined_vocabulary": new_hire.undefined_vocabulary,
                "process_gaps": new_hire.process_gaps,
            }))
            .unwrap_or_default(),
        )
        .replace(
            "{failure}",
            &serde_json::to_string(&json!({
                "undocumented_recoveries": failure.undocumented_recoveries,
                "edge_cases": failure.edge_cases,
                "workarounds": failure.workarounds,
            }))
            .unwrap_or_default(),
        );

    let synthesis: SynthesisResponse = run_stage(llm, "synthesis", synthesis_prompt).await?;

    let drafts: Vec<GapDraft> = synthesis
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
                "stages": {
                    "tacit_knowledge": expert.tacit_knowledge.len(),
                    "tribal_rules": expert.tribal_rules.len(),
                    "blockers": new_hire.blockers.len(),
                    "undefined_vocabulary": new_hire.undefined_vocabulary.len(),
                    "workarounds": failure.workarounds.len(),
                },
            }),
        })
        .collect();

    persist_gaps(db, ctx, "multistage", drafts, documents.len(), prep).await
}
