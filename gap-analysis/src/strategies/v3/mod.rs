//! Orchestrated gap detection: deep extraction, knowledge-graph assembly,
//! eight specialized analyzers, LLM question generation, multi-factor
//! prioritization, and a feedback hook for tenant tuning. Falls back to the
//! pattern-based strategy when the pipeline cannot produce anything.

pub mod analyzers;
pub mod extraction;
pub mod graph;
pub mod prioritize;
pub mod questions;

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::document::Document},
    utils::llm::LlmClient,
};

use crate::prep::{PrepStats, MAX_ANALYSIS_CHARS};
use crate::strategies::{intelligent, persist_gaps, GapDraft};
use crate::{AnalysisContext, AnalysisResult};

use self::prioritize::{FeedbackHooks, NeutralFeedback};

const TOP_N_QUESTIONS: usize = 30;

pub async fn analyze(
    db: &SurrealDbClient,
    llm: Arc<dyn LlmClient>,
    ctx: &AnalysisContext,
) -> Result<AnalysisResult, AppError> {
    analyze_with_feedback(db, llm, ctx, &NeutralFeedback).await
}

pub async fn analyze_with_feedback(
    db: &SurrealDbClient,
    llm: Arc<dyn LlmClient>,
    ctx: &AnalysisContext,
    feedback: &dyn FeedbackHooks,
) -> Result<AnalysisResult, AppError> {
    let documents = Document::list_for_analysis(db, &ctx.tenant_id, &ctx.filter()).await?;
    if documents.is_empty() {
        return Ok(AnalysisResult::default());
    }
    info!(
        tenant_id = %ctx.tenant_id,
        documents = documents.len(),
        "v3 gap analysis starting"
    );

    // Stage 1: deep extraction under the corpus budget. Documents beyond the
    // budget are skipped, recent first.
    let mut extractions = Vec::new();
    let mut stats = PrepStats {
        total_documents: documents.len(),
        ..Default::default()
    };
    let mut budget_chars = 0_usize;
    for doc in &documents {
        let body_chars = doc
            .structured_summary
            .as_ref()
            .map_or_else(|| doc.content.chars().count(), |s| s.summary.chars().count());
        if body_chars < 50 {
            continue;
        }
        if budget_chars.saturating_add(body_chars.min(8_000)) > MAX_ANALYSIS_CHARS {
            break;
        }
        budget_chars = budget_chars.saturating_add(body_chars.min(8_000));

        if doc.structured_summary.is_some() {
            stats.documents_with_summary = stats.documents_with_summary.saturating_add(1);
        } else {
            stats.documents_with_fallback = stats.documents_with_fallback.saturating_add(1);
        }
        stats.documents_included = stats.documents_included.saturating_add(1);
        extractions.push(extraction::extract(llm.as_ref(), doc).await);
    }
    stats.documents_skipped = stats.total_documents.saturating_sub(stats.documents_included);
    stats.total_chars = budget_chars;
    stats.estimated_tokens = budget_chars / 4;

    if extractions.is_empty() {
        warn!("v3 pipeline found no extractable documents; falling back to intelligent analysis");
        return intelligent::analyze(db, ctx).await;
    }
    let llm_extractions = extractions.iter().filter(|e| e.from_llm).count();
    info!(
        extractions = extractions.len(),
        llm_extractions,
        "deep extraction complete"
    );

    // Stage 2: knowledge-graph assembly.
    let graph = graph::assemble(&extractions);

    // Stage 3: the eight analyzers.
    let detected = analyzers::run_all(&graph);
    info!(
        entities = graph.entities.len(),
        gaps = detected.len(),
        "analyzer sweep complete"
    );

    if detected.is_empty() {
        warn!("v3 analyzers found nothing; falling back to intelligent analysis");
        return intelligent::analyze(db, ctx).await;
    }

    // Stage 5 before 4: prioritization decides which gaps are worth the
    // question-generation call.
    let prioritized = prioritize::prioritize(detected, feedback, TOP_N_QUESTIONS);

    // Stage 4: question generation for the survivors.
    let gaps_only: Vec<analyzers::DetectedGap> =
        prioritized.iter().map(|p| p.gap.clone()).collect();
    let question_sets = questions::generate(llm.as_ref(), &gaps_only).await;

    let drafts: Vec<GapDraft> = prioritized
        .into_iter()
        .zip(question_sets)
        .map(|(prioritized_gap, questions)| {
            let priority = prioritized_gap.priority();
            GapDraft {
                title: prioritized_gap.gap.title.clone(),
                description: prioritized_gap.gap.description.clone(),
                category_label: prioritized_gap.gap.category_label.to_string(),
                priority,
                questions,
                context: json!({
                    "gap_type": prioritized_gap.gap.gap_type,
                    "severity": format!("{:?}", prioritized_gap.gap.severity).to_lowercase(),
                    "score": prioritized_gap.final_score,
                    "score_breakdown": prioritized_gap.breakdown,
                    "source_docs": prioritized_gap.gap.evidence_docs,
                }),
            }
        })
        .collect();

    persist_gaps(db, ctx, "v3", drafts, documents.len(), stats).await
}
