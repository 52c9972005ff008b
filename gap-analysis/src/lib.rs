#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod prep;
pub mod strategies;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{document::AnalysisFilter, knowledge_gap::GapCategory},
    },
    utils::llm::LlmClient,
};

pub use prep::PrepStats;

/// Which analysis pipeline to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    Simple,
    MultiStage,
    GoalFirst,
    Intelligent,
    #[default]
    V3,
}

impl FromStr for Strategy {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "simple" => Ok(Strategy::Simple),
            "multistage" | "multi-stage" => Ok(Strategy::MultiStage),
            "goalfirst" | "goal-first" => Ok(Strategy::GoalFirst),
            "intelligent" => Ok(Strategy::Intelligent),
            "v3" | "" => Ok(Strategy::V3),
            other => Err(AppError::Validation(format!(
                "unknown analysis strategy: {other:?}"
            ))),
        }
    }
}

/// Inputs shared by every strategy.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub tenant_id: String,
    pub project_id: Option<String>,
    pub include_pending: bool,
    pub max_documents: usize,
}

impl AnalysisContext {
    pub fn filter(&self) -> AnalysisFilter {
        AnalysisFilter {
            project_id: self.project_id.clone(),
            include_pending: self.include_pending,
            max_documents: self.max_documents,
        }
    }
}

/// Lightweight view of a persisted gap, returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct GapSummary {
    pub id: String,
    pub title: String,
    pub category: GapCategory,
    pub priority: u8,
    pub questions_count: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct AnalysisResult {
    pub gaps: Vec<GapSummary>,
    pub total_documents_analyzed: usize,
    pub categories_found: HashMap<String, usize>,
    pub prep: PrepStats,
}

/// Run the selected strategy against the tenant's analysis snapshot and
/// persist the resulting gaps.
pub async fn analyze(
    db: &SurrealDbClient,
    llm: Arc<dyn LlmClient>,
    strategy: Strategy,
    ctx: &AnalysisContext,
) -> Result<AnalysisResult, AppError> {
    match strategy {
        Strategy::Simple => strategies::simple::analyze(db, llm.as_ref(), ctx).await,
        Strategy::MultiStage => strategies::multistage::analyze(db, llm.as_ref(), ctx).await,
        Strategy::GoalFirst => strategies::goal_first::analyze(db, llm.as_ref(), ctx).await,
        Strategy::Intelligent => strategies::intelligent::analyze(db, ctx).await,
        Strategy::V3 => strategies::v3::analyze(db, llm, ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_labels_parse_with_v3_default() {
        assert_eq!("simple".parse::<Strategy>().expect("simple"), Strategy::Simple);
        assert_eq!(
            "multi-stage".parse::<Strategy>().expect("multistage"),
            Strategy::MultiStage
        );
        assert_eq!("v3".parse::<Strategy>().expect("v3"), Strategy::V3);
        assert_eq!(Strategy::default(), Strategy::V3);
        assert!("nope".parse::<Strategy>().is_err());
    }
}
