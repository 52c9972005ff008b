use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(GapAnswer, "gap_answer", {
    gap_id: String,
    /// Redundant copy of the parent gap's tenant for direct isolation checks.
    tenant_id: String,
    user_id: String,
    question_index: u32,
    question_text: String,
    answer_text: String,
    is_voice: bool,
    transcription_confidence: Option<f32>
});

impl GapAnswer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gap_id: String,
        tenant_id: String,
        user_id: String,
        question_index: u32,
        question_text: String,
        answer_text: String,
        is_voice: bool,
        transcription_confidence: Option<f32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            gap_id,
            tenant_id,
            user_id,
            question_index,
            question_text,
            answer_text,
            is_voice,
            transcription_confidence,
        }
    }

    pub async fn list_for_gap(
        db: &SurrealDbClient,
        gap_id: &str,
        tenant_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE gap_id = $gap_id AND tenant_id = $tenant_id \
                 ORDER BY question_index ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("gap_id", gap_id.to_owned()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }

    pub async fn list_for_tenant(
        db: &SurrealDbClient,
        tenant_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .client
            .query("SELECT * FROM type::table($table) WHERE tenant_id = $tenant_id ORDER BY created_at ASC")
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }

    /// Edit an existing answer's text; tenant checked against the stored row.
    pub async fn update_text(
        db: &SurrealDbClient,
        answer_id: &str,
        tenant_id: &str,
        answer_text: &str,
    ) -> Result<(), AppError> {
        let existing: Option<Self> = db.get_item(answer_id).await?;
        let existing = existing
            .ok_or_else(|| AppError::NotFound(format!("answer {answer_id} not found")))?;
        if existing.tenant_id != tenant_id {
            return Err(AppError::TenantIsolation(format!(
                "answer {answer_id} does not belong to tenant {tenant_id}"
            )));
        }

        db.client
            .query(
                "UPDATE type::thing($table, $id) SET answer_text = $text, updated_at = time::now()",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", answer_id.to_owned()))
            .bind(("text", answer_text.to_owned()))
            .await?
            .check()?;

        Ok(())
    }

    /// Searchable chunk body for answer integration into the vector index.
    pub fn as_search_text(&self) -> String {
        format!("Q: {}\nA: {}", self.question_text, self.answer_text)
    }
}
