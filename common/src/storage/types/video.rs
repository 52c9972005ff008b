use uuid::Uuid;

use crate::stored_object;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum VideoStatus {
    Queued,
    Rendering,
    Ready,
    Failed,
}

// Registry row only; rendering is a downstream consumer of answered gaps.
stored_object!(Video, "video", {
    tenant_id: String,
    title: String,
    gap_ids: Vec<String>,
    status: VideoStatus,
    output_path: Option<String>
});

impl Video {
    pub fn new(tenant_id: String, title: String, gap_ids: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id,
            title,
            gap_ids,
            status: VideoStatus::Queued,
            output_path: None,
        }
    }
}
