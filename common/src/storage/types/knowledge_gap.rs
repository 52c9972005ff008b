use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::gap_answer::GapAnswer;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum GapCategory {
    Decision,
    Technical,
    Process,
    Context,
    Relationship,
    Timeline,
    Outcome,
    Rationale,
}

impl GapCategory {
    /// Closed mapping from analyzer output labels; anything unknown lands on CONTEXT.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "decision" | "strategic" | "competition" => GapCategory::Decision,
            "technical" => GapCategory::Technical,
            "process" => GapCategory::Process,
            "relationship" => GapCategory::Relationship,
            "timeline" => GapCategory::Timeline,
            "outcome" => GapCategory::Outcome,
            "rationale" | "financial" => GapCategory::Rationale,
            _ => GapCategory::Context,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GapCategory::Decision => "DECISION",
            GapCategory::Technical => "TECHNICAL",
            GapCategory::Process => "PROCESS",
            GapCategory::Context => "CONTEXT",
            GapCategory::Relationship => "RELATIONSHIP",
            GapCategory::Timeline => "TIMELINE",
            GapCategory::Outcome => "OUTCOME",
            GapCategory::Rationale => "RATIONALE",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GapStatus {
    Open,
    InProgress,
    Answered,
    Verified,
}

/// One question slot inside a gap. The shape is uniform across analyzers;
/// strategy-specific detail lives in the gap's `context` blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GapQuestion {
    pub text: String,
    #[serde(default)]
    pub answered: bool,
    #[serde(default)]
    pub answer_id: Option<String>,
}

impl GapQuestion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            answered: false,
            answer_id: None,
        }
    }
}

/// Payload for `record_answer`.
#[derive(Debug, Clone)]
pub struct AnswerPayload {
    pub user_id: String,
    pub answer_text: String,
    pub is_voice: bool,
    pub transcription_confidence: Option<f32>,
}

/// Listing filter; `limit`/`offset` page the result.
#[derive(Debug, Clone, Default)]
pub struct GapFilter {
    pub project_id: Option<String>,
    pub status: Option<GapStatus>,
    pub category: Option<GapCategory>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Default, PartialEq)]
pub struct GapStats {
    pub total_gaps: usize,
    pub by_status: HashMap<String, usize>,
    pub by_category: HashMap<String, usize>,
    pub total_answers: usize,
    pub voice_answers: usize,
}

stored_object!(KnowledgeGap, "knowledge_gap", {
    tenant_id: String,
    project_id: Option<String>,
    title: String,
    description: String,
    category: GapCategory,
    priority: u8,
    status: GapStatus,
    questions: Vec<GapQuestion>,
    context: serde_json::Value
});

impl KnowledgeGap {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: String,
        project_id: Option<String>,
        title: String,
        description: String,
        category: GapCategory,
        priority: u8,
        questions: Vec<GapQuestion>,
        context: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id,
            project_id,
            title,
            description,
            category,
            priority: priority.clamp(1, 5),
            status: GapStatus::Open,
            questions,
            context,
        }
    }

    pub async fn record(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.store_item(self.clone()).await?;
        Ok(())
    }

    pub async fn list(
        db: &SurrealDbClient,
        tenant_id: &str,
        filter: &GapFilter,
    ) -> Result<(Vec<Self>, usize), AppError> {
        let mut sql =
            String::from("SELECT * FROM type::table($table) WHERE tenant_id = $tenant_id");
        if filter.project_id.is_some() {
            sql.push_str(" AND project_id = $project_id");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = $status");
        }
        if filter.category.is_some() {
            sql.push_str(" AND category = $category");
        }
        sql.push_str(" ORDER BY priority DESC, created_at DESC");

        let mut query = db
            .client
            .query(sql)
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_owned()));
        if let Some(project_id) = filter.project_id.clone() {
            query = query.bind(("project_id", project_id));
        }
        if let Some(status) = filter.status {
            query = query.bind(("status", status));
        }
        if let Some(category) = filter.category {
            query = query.bind(("category", category));
        }

        let all: Vec<Self> = query.await?.take(0)?;
        let total = all.len();

        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        let page = all
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .collect();

        Ok((page, total))
    }

    /// Append an answer and flip the question slot in one transaction.
    ///
    /// Parent status recomputes from the slots: every slot answered means
    /// ANSWERED, some answered means IN_PROGRESS.
    pub async fn record_answer(
        db: &SurrealDbClient,
        gap_id: &str,
        tenant_id: &str,
        question_index: usize,
        payload: AnswerPayload,
    ) -> Result<GapAnswer, AppError> {
        let gap: Option<Self> = db.get_item(gap_id).await?;
        let mut gap = gap.ok_or_else(|| AppError::NotFound(format!("gap {gap_id} not found")))?;
        if gap.tenant_id != tenant_id {
            return Err(AppError::TenantIsolation(format!(
                "gap {gap_id} does not belong to tenant {tenant_id}"
            )));
        }

        let question = gap.questions.get_mut(question_index).ok_or_else(|| {
            AppError::Validation(format!(
                "question index {question_index} out of range for gap {gap_id}"
            ))
        })?;

        let index = u32::try_from(question_index)
            .map_err(|_| AppError::Validation("question index too large".into()))?;
        let answer = GapAnswer::new(
            gap_id.to_string(),
            tenant_id.to_string(),
            payload.user_id,
            index,
            question.text.clone(),
            payload.answer_text,
            payload.is_voice,
            payload.transcription_confidence,
        );

        question.answered = true;
        question.answer_id = Some(answer.id.clone());

        gap.status = if gap.questions.iter().all(|q| q.answered) {
            GapStatus::Answered
        } else {
            GapStatus::InProgress
        };
        gap.updated_at = Utc::now();

        // Answer row and question flip land together or not at all.
        let response = db
            .client
            .query("BEGIN TRANSACTION;")
            .query("CREATE type::thing($answer_table, $answer_id) CONTENT $answer;")
            .query("UPDATE type::thing($gap_table, $gap_record) CONTENT $gap;")
            .query("COMMIT TRANSACTION;")
            .bind(("answer_table", GapAnswer::table_name()))
            .bind(("answer_id", answer.id.clone()))
            .bind(("answer", answer.clone()))
            .bind(("gap_table", Self::table_name()))
            .bind(("gap_record", gap.id.clone()))
            .bind(("gap", gap))
            .await?;
        response.check()?;

        Ok(answer)
    }

    /// Flip every gap that has at least one answer to VERIFIED; used when the
    /// knowledge-transfer process completes. Returns the number flipped.
    pub async fn verify_answered(db: &SurrealDbClient, tenant_id: &str) -> Result<usize, AppError> {
        let answers = GapAnswer::list_for_tenant(db, tenant_id).await?;
        let answered_gaps: HashSet<&str> = answers.iter().map(|a| a.gap_id.as_str()).collect();

        let (gaps, _) = Self::list(db, tenant_id, &GapFilter {
            limit: usize::MAX,
            ..Default::default()
        })
        .await?;

        let mut verified = 0_usize;
        for gap in gaps {
            if gap.status == GapStatus::Verified || !answered_gaps.contains(gap.id.as_str()) {
                continue;
            }
            db.client
                .query("UPDATE type::thing($table, $id) SET status = $status, updated_at = time::now()")
                .bind(("table", Self::table_name()))
                .bind(("id", gap.id.clone()))
                .bind(("status", GapStatus::Verified))
                .await?
                .check()?;
            verified = verified.saturating_add(1);
        }

        Ok(verified)
    }

    pub async fn stats(db: &SurrealDbClient, tenant_id: &str) -> Result<GapStats, AppError> {
        let (gaps, total) = Self::list(db, tenant_id, &GapFilter {
            limit: usize::MAX,
            ..Default::default()
        })
        .await?;
        let answers = GapAnswer::list_for_tenant(db, tenant_id).await?;

        let mut stats = GapStats {
            total_gaps: total,
            total_answers: answers.len(),
            voice_answers: answers.iter().filter(|a| a.is_voice).count(),
            ..Default::default()
        };
        for gap in &gaps {
            let by_status = stats.by_status.entry(format!("{:?}", gap.status)).or_default();
            *by_status = by_status.saturating_add(1);
            let by_category = stats
                .by_category
                .entry(gap.category.as_str().to_string())
                .or_default();
            *by_category = by_category.saturating_add(1);
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_db() -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("gap_ns", &database)
            .await
            .expect("in-memory surrealdb");
        db.ensure_initialized().await.expect("schema");
        db
    }

    fn sample_gap(tenant: &str, questions: usize) -> KnowledgeGap {
        KnowledgeGap::new(
            tenant.to_string(),
            None,
            "Undocumented deploy process".to_string(),
            "The release runbook references a script nobody has described".to_string(),
            GapCategory::Process,
            4,
            (0..questions)
                .map(|i| GapQuestion::new(format!("Question {i}")))
                .collect(),
            json!({"analysis_type": "simple"}),
        )
    }

    fn payload(text: &str) -> AnswerPayload {
        AnswerPayload {
            user_id: "user-1".to_string(),
            answer_text: text.to_string(),
            is_voice: false,
            transcription_confidence: None,
        }
    }

    #[test]
    fn unknown_category_labels_fall_back_to_context() {
        assert_eq!(GapCategory::from_label("decision"), GapCategory::Decision);
        assert_eq!(GapCategory::from_label("Timeline"), GapCategory::Timeline);
        assert_eq!(GapCategory::from_label("galaxy-brain"), GapCategory::Context);
        assert_eq!(GapCategory::from_label(""), GapCategory::Context);
    }

    #[test]
    fn priority_is_clamped_to_range() {
        let gap = KnowledgeGap::new(
            "t".into(),
            None,
            "x".into(),
            String::new(),
            GapCategory::Context,
            9,
            vec![],
            json!({}),
        );
        assert_eq!(gap.priority, 5);
    }

    #[tokio::test]
    async fn answer_flips_slot_and_status_follows_all_answered_rule() {
        let db = test_db().await;
        let gap = sample_gap("t1", 2);
        gap.record(&db).await.expect("record gap");

        // First of two answers: gap is in progress, not answered.
        let first = KnowledgeGap::record_answer(&db, &gap.id, "t1", 0, payload("we use blue/green"))
            .await
            .expect("first answer");

        let stored: KnowledgeGap = db.get_item(&gap.id).await.expect("get").expect("present");
        assert!(stored.questions[0].answered);
        assert_eq!(stored.questions[0].answer_id, Some(first.id.clone()));
        assert!(!stored.questions[1].answered);
        assert_eq!(stored.status, GapStatus::InProgress);

        // Second answer completes the gap.
        KnowledgeGap::record_answer(&db, &gap.id, "t1", 1, payload("rollbacks are manual"))
            .await
            .expect("second answer");

        let stored: KnowledgeGap = db.get_item(&gap.id).await.expect("get").expect("present");
        assert!(stored.questions.iter().all(|q| q.answered));
        assert_eq!(stored.status, GapStatus::Answered);

        let answers = GapAnswer::list_for_gap(&db, &gap.id, "t1")
            .await
            .expect("answers");
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].question_text, "Question 0");
    }

    #[tokio::test]
    async fn answer_rejects_wrong_tenant_and_bad_index() {
        let db = test_db().await;
        let gap = sample_gap("t1", 1);
        gap.record(&db).await.expect("record gap");

        let cross_tenant =
            KnowledgeGap::record_answer(&db, &gap.id, "t2", 0, payload("stolen")).await;
        assert!(matches!(cross_tenant, Err(AppError::TenantIsolation(_))));

        let out_of_range =
            KnowledgeGap::record_answer(&db, &gap.id, "t1", 5, payload("nope")).await;
        assert!(matches!(out_of_range, Err(AppError::Validation(_))));

        // Neither failure leaked an answer row.
        let answers = GapAnswer::list_for_gap(&db, &gap.id, "t1")
            .await
            .expect("answers");
        assert!(answers.is_empty());
    }

    #[tokio::test]
    async fn list_filters_and_pages() {
        let db = test_db().await;

        for (i, category) in [GapCategory::Process, GapCategory::Technical, GapCategory::Process]
            .iter()
            .enumerate()
        {
            let mut gap = sample_gap("t1", 1);
            gap.title = format!("gap {i}");
            gap.category = *category;
            gap.record(&db).await.expect("record");
        }
        sample_gap("t2", 1).record(&db).await.expect("other tenant");

        let (all, total) = KnowledgeGap::list(&db, "t1", &GapFilter::default())
            .await
            .expect("list");
        assert_eq!(total, 3);
        assert_eq!(all.len(), 3);

        let (process_only, process_total) = KnowledgeGap::list(
            &db,
            "t1",
            &GapFilter {
                category: Some(GapCategory::Process),
                ..Default::default()
            },
        )
        .await
        .expect("filtered list");
        assert_eq!(process_total, 2);
        assert!(process_only.iter().all(|g| g.category == GapCategory::Process));

        let (page, _) = KnowledgeGap::list(
            &db,
            "t1",
            &GapFilter {
                limit: 2,
                offset: 2,
                ..Default::default()
            },
        )
        .await
        .expect("paged list");
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn verify_answered_only_touches_gaps_with_answers() {
        let db = test_db().await;

        let answered = sample_gap("t1", 1);
        answered.record(&db).await.expect("record answered");
        KnowledgeGap::record_answer(&db, &answered.id, "t1", 0, payload("done"))
            .await
            .expect("answer");

        let untouched = sample_gap("t1", 1);
        untouched.record(&db).await.expect("record untouched");

        let verified = KnowledgeGap::verify_answered(&db, "t1").await.expect("verify");
        assert_eq!(verified, 1);

        let gap: KnowledgeGap = db.get_item(&answered.id).await.expect("get").expect("row");
        assert_eq!(gap.status, GapStatus::Verified);
        let gap: KnowledgeGap = db.get_item(&untouched.id).await.expect("get").expect("row");
        assert_eq!(gap.status, GapStatus::Open);
    }

    #[tokio::test]
    async fn stats_fold_status_category_and_answers() {
        let db = test_db().await;

        let gap = sample_gap("t1", 1);
        gap.record(&db).await.expect("record");
        KnowledgeGap::record_answer(
            &db,
            &gap.id,
            "t1",
            0,
            AnswerPayload {
                user_id: "u".into(),
                answer_text: "spoken".into(),
                is_voice: true,
                transcription_confidence: Some(0.93),
            },
        )
        .await
        .expect("answer");

        let stats = KnowledgeGap::stats(&db, "t1").await.expect("stats");
        assert_eq!(stats.total_gaps, 1);
        assert_eq!(stats.total_answers, 1);
        assert_eq!(stats.voice_answers, 1);
        assert_eq!(stats.by_category.get("PROCESS"), Some(&1));
    }
}
