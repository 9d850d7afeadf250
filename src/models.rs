use chrono::{NaiveDate, NaiveDateTime};
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = documents)]
pub struct Document {
    pub id: Uuid,
    pub org_id: i64,
    pub filename: String,
    pub file_type: String,
    pub size_bytes: i64,
    pub storage_key: String,
    pub uploaded_by: i64,
    pub uploaded_at: NaiveDateTime,
    pub status: String,
    pub metadata: serde_json::Value,
    pub is_deleted: bool,
    pub deleted_at: Option<NaiveDateTime>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = documents)]
pub struct NewDocument {
    pub id: Uuid,
    pub org_id: i64,
    pub filename: String,
    pub file_type: String,
    pub size_bytes: i64,
    pub storage_key: String,
    pub uploaded_by: i64,
    pub status: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = document_chunks)]
#[diesel(belongs_to(Document))]
pub struct DocumentChunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i32,
    pub chunk_text: String,
    pub token_count: i32,
    pub embedding_key: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_chunks)]
pub struct NewDocumentChunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i32,
    pub chunk_text: String,
    pub token_count: i32,
    pub embedding_key: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Associations)]
#[diesel(table_name = document_classifications)]
#[diesel(primary_key(document_id))]
#[diesel(belongs_to(Document))]
pub struct Classification {
    pub document_id: Uuid,
    pub org_id: i64,
    pub team: Option<String>,
    pub project: Option<String>,
    pub doc_type: String,
    pub time_period: Option<String>,
    pub confidentiality: String,
    pub people: Vec<String>,
    pub tags: Vec<String>,
    pub summary: String,
    pub confidence: serde_json::Value,
    pub classified_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = document_classifications)]
pub struct NewClassification {
    pub document_id: Uuid,
    pub org_id: i64,
    pub team: Option<String>,
    pub project: Option<String>,
    pub doc_type: String,
    pub time_period: Option<String>,
    pub confidentiality: String,
    pub people: Vec<String>,
    pub tags: Vec<String>,
    pub summary: String,
    pub confidence: serde_json::Value,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = employee_embeddings)]
pub struct EmployeeEmbedding {
    pub user_id: i64,
    pub org_id: i64,
    pub vector_id: String,
    pub profile_snapshot: serde_json::Value,
    pub last_updated: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = employee_embeddings)]
pub struct NewEmployeeEmbedding {
    pub user_id: i64,
    pub org_id: i64,
    pub vector_id: String,
    pub profile_snapshot: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = conversations)]
pub struct Conversation {
    pub id: Uuid,
    pub org_id: i64,
    pub user_id: i64,
    pub title: String,
    pub created_at: NaiveDateTime,
    pub last_message_at: NaiveDateTime,
    pub archived: bool,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = conversations)]
pub struct NewConversation {
    pub id: Uuid,
    pub org_id: i64,
    pub user_id: i64,
    pub title: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = messages)]
#[diesel(belongs_to(Conversation))]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: String,
    pub content: String,
    pub reasoning: Option<serde_json::Value>,
    pub sources: Option<serde_json::Value>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = messages)]
pub struct NewMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: String,
    pub content: String,
    pub reasoning: Option<serde_json::Value>,
    pub sources: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = jobs)]
pub struct Job {
    pub id: Uuid,
    pub org_id: i64,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub progress: i32,
    pub attempts: i32,
    pub run_after: NaiveDateTime,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJob {
    pub id: Uuid,
    pub org_id: i64,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub run_after: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = usage_counters)]
pub struct UsageCounter {
    pub org_id: i64,
    pub date: NaiveDate,
    pub tokens: i64,
    pub api_calls: i64,
    pub estimated_cost: f64,
}
