use serde::Deserialize;
use tracing::debug;

use common::{
    error::AppError,
    utils::llm::{parse_json_payload, LlmClient},
};

use super::analyzers::DetectedGap;

const SYSTEM_MESSAGE: &str = "You turn detected knowledge gaps into natural, specific questions a departing colleague could answer in a few minutes. Always respond with valid JSON.";

const QUESTION_PROMPT: &str = r#"For each detected gap below, write 1 primary question plus up to 3 sub-questions. Questions must be concrete, reference the subject by name, and be answerable by one person from memory.

GAPS:
{gaps}

Respond in JSON:
{
  "questions": [
    {
      "gap_index": 0,
      "primary_question": "...",
      "sub_questions": ["..."]
    }
  ]
}"#;

#[derive(Debug, Default, Deserialize)]
struct QuestionResponse {
    #[serde(default)]
    questions: Vec<GeneratedQuestion>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeneratedQuestion {
    #[serde(default)]
    pub gap_index: usize,
    #[serde(default)]
    pub primary_question: String,
    #[serde(default)]
    pub sub_questions: Vec<String>,
}

/// One batched LLM call for all gaps; template questions when the call or its
/// JSON fails, so question generation can never sink the pipeline.
pub async fn generate(llm: &dyn LlmClient, gaps: &[DetectedGap]) -> Vec<Vec<String>> {
    if gaps.is_empty() {
        return Vec::new();
    }

    let listing: Vec<serde_json::Value> = gaps
        .iter()
        .enumerate()
        .map(|(i, gap)| {
            serde_json::json!({
                "index": i,
                "type": gap.gap_type,
                "title": gap.title.clone(),
                "description": gap.description.clone(),
            })
        })
        .collect();
    let prompt = QUESTION_PROMPT.replace(
        "{gaps}",
        &serde_json::to_string_pretty(&listing).unwrap_or_default(),
    );

    let generated = match llm.chat_json(SYSTEM_MESSAGE, &prompt, 0.5, 3_000).await {
        Ok(raw) => match parse_json_payload::<QuestionResponse>(&raw) {
            Ok(parsed) => parsed.questions,
            Err(err) => {
                debug!(error = %err, "question JSON invalid; falling back to templates");
                Vec::new()
            }
        },
        Err(err) => {
            debug!(error = %err, "question call failed; falling back to templates");
            Vec::new()
        }
    };

    gaps.iter()
        .enumerate()
        .map(|(i, gap)| {
            let llm_questions = generated
                .iter()
                .find(|q| q.gap_index == i && !q.primary_question.trim().is_empty());
            match llm_questions {
                Some(q) => {
                    let mut questions = vec![q.primary_question.clone()];
                    questions.extend(q.sub_questions.iter().take(3).cloned());
                    questions
                }
                None => template_questions(gap),
            }
        })
        .collect()
}

/// Deterministic questions per gap type.
pub fn template_questions(gap: &DetectedGap) -> Vec<String> {
    let subject = &gap.subject;
    match gap.gap_type {
        "bus_factor" => vec![
            format!("Can you walk through everything someone would need to know to take over \"{subject}\"?"),
            format!("What breaks first if \"{subject}\" misbehaves, and what do you check?"),
        ],
        "decision_archaeology" => vec![
            format!("What was the reasoning behind this decision: {subject}?"),
            "Which alternatives were on the table and why were they rejected?".to_string(),
        ],
        "process_completeness" => vec![
            format!("What are the exact steps, start to finish, of: {subject}?"),
            "Who owns this process and what goes wrong most often?".to_string(),
        ],
        "tribal_knowledge" => vec![
            format!("What does \"{subject}\" mean, and where did the name come from?"),
        ],
        "dependency_risk" => vec![
            format!("What does \"{subject}\" do for us, and what happens when it is down?"),
            format!("Who operates \"{subject}\" and how do we reach them?"),
        ],
        "temporal_staleness" => vec![
            format!("Is the written material about \"{subject}\" still accurate? What changed since?"),
        ],
        "contradiction" => vec![
            format!("Documents disagree about \"{subject}\"; which statement is current, and since when?"),
        ],
        "onboarding_barrier" => vec![
            "Could you record a quick glossary for the recurring internal terms a new hire meets in week one?".to_string(),
        ],
        _ => vec![format!("What should be written down about \"{subject}\"?")],
    }
}
