pub mod goal_first;
pub mod intelligent;
pub mod multistage;
pub mod simple;
pub mod v3;

use std::collections::HashMap;

use tracing::info;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::knowledge_gap::{GapCategory, GapQuestion, KnowledgeGap},
    },
};

use crate::{prep::PrepStats, AnalysisContext, AnalysisResult, GapSummary};

/// Strategy-agnostic gap candidate before persistence.
#[derive(Debug, Clone)]
pub(crate) struct GapDraft {
    pub title: String,
    pub description: String,
    pub category_label: String,
    pub priority: i64,
    pub questions: Vec<String>,
    pub context: serde_json::Value,
}

/// Persist drafts as OPEN gaps and assemble the shared result shape.
///
/// Category mapping is closed (unknown labels land on CONTEXT), priority is
/// clamped into 1..=5, and every gap's context records the analysis type and
/// the prep stats that produced it.
pub(crate) async fn persist_gaps(
    db: &SurrealDbClient,
    ctx: &AnalysisContext,
    analysis_type: &str,
    drafts: Vec<GapDraft>,
    total_documents: usize,
    prep: PrepStats,
) -> Result<AnalysisResult, AppError> {
    let mut categories_found: HashMap<String, usize> = HashMap::new();
    let mut summaries = Vec::with_capacity(drafts.len());

    for draft in drafts {
        let category = GapCategory::from_label(&draft.category_label);
        let count = categories_found
            .entry(category.as_str().to_string())
            .or_default();
        *count = count.saturating_add(1);

        let priority = u8::try_from(draft.priority.clamp(1, 5)).unwrap_or(3);
        let mut context = draft.context;
        if let Some(object) = context.as_object_mut() {
            object.insert(
                "analysis_type".to_string(),
                serde_json::Value::String(analysis_type.to_string()),
            );
            object.insert(
                "stats".to_string(),
                serde_json::to_value(&prep).unwrap_or_default(),
            );
        }

        let gap = KnowledgeGap::new(
            ctx.tenant_id.clone(),
            ctx.project_id.clone(),
            truncate(&draft.title, 200),
            truncate(&draft.description, 1_000),
            category,
            priority,
            draft
                .questions
                .into_iter()
                .filter(|q| !q.trim().is_empty())
                .map(GapQuestion::new)
                .collect(),
            context,
        );
        gap.record(db).await?;

        summaries.push(GapSummary {
            id: gap.id.clone(),
            title: gap.title.clone(),
            category,
            priority: gap.priority,
            questions_count: gap.questions.len(),
        });
    }

    info!(
        tenant_id = %ctx.tenant_id,
        analysis_type,
        gaps = summaries.len(),
        documents = total_documents,
        "gap analysis persisted"
    );

    Ok(AnalysisResult {
        gaps: summaries,
        total_documents_analyzed: total_documents,
        categories_found,
        prep,
    })
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
