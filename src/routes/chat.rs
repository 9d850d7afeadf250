use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::agents;
use crate::auth::Identity;
use crate::conversations::{
    append_message, create_conversation as create_conversation_row, get_owned_conversation,
    list_conversations as list_conversation_rows, list_messages as list_message_rows,
    set_archived, ROLE_ASSISTANT, ROLE_USER,
};
use crate::error::{AppError, AppResult};
use crate::llm::TokenUsage;
use crate::rag::{self, RagRequest};
use crate::routes::documents::{to_iso, OrgQuery};
use crate::state::AppState;

#[derive(Serialize)]
pub struct ConversationResponse {
    pub id: Uuid,
    pub title: String,
    pub created_at: String,
    pub last_message_at: String,
    pub archived: bool,
}

#[derive(Deserialize)]
pub struct CreateConversationRequest {
    pub org_id: i64,
    pub title: Option<String>,
}

#[derive(Serialize)]
pub struct CreateConversationResponse {
    pub conversation_id: Uuid,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Value>,
    pub ts: String,
}

#[derive(Deserialize)]
pub struct PostMessageRequest {
    pub message: String,
    #[serde(default)]
    pub use_rag: Option<bool>,
}

#[derive(Serialize)]
pub struct PostMessageResponse {
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_steps: Option<Vec<String>>,
    pub sources: Value,
    pub usage: TokenUsage,
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Query(params): Query<OrgQuery>,
    identity: Identity,
) -> AppResult<Json<Vec<ConversationResponse>>> {
    identity.require_org(params.org_id)?;
    let mut conn = state.db()?;
    let rows = list_conversation_rows(&mut conn, params.org_id, identity.user_id)?;
    Ok(Json(
        rows.into_iter()
            .map(|row| ConversationResponse {
                id: row.id,
                title: row.title,
                created_at: to_iso(row.created_at),
                last_message_at: to_iso(row.last_message_at),
                archived: row.archived,
            })
            .collect(),
    ))
}

pub async fn create_conversation(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<CreateConversationRequest>,
) -> AppResult<(StatusCode, Json<CreateConversationResponse>)> {
    identity.require_org(request.org_id)?;
    let mut conn = state.db()?;
    let conversation =
        create_conversation_row(&mut conn, request.org_id, identity.user_id, request.title)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateConversationResponse {
            conversation_id: conversation.id,
        }),
    ))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    identity: Identity,
) -> AppResult<Json<Vec<MessageResponse>>> {
    let mut conn = state.db()?;
    let conversation =
        get_owned_conversation(&mut conn, conversation_id, identity.org_id, identity.user_id)?;
    let rows = list_message_rows(&mut conn, conversation.id)?;
    Ok(Json(
        rows.into_iter()
            .map(|row| MessageResponse {
                id: row.id,
                role: row.role,
                content: row.content,
                reasoning: row.reasoning,
                sources: row.sources,
                ts: to_iso(row.created_at),
            })
            .collect(),
    ))
}

pub async fn post_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    identity: Identity,
    Json(request): Json<PostMessageRequest>,
) -> AppResult<Json<PostMessageResponse>> {
    if request.message.trim().is_empty() {
        return Err(AppError::bad_request("message must not be empty"));
    }

    let mut conn = state.db()?;
    let conversation =
        get_owned_conversation(&mut conn, conversation_id, identity.org_id, identity.user_id)?;

    append_message(
        &mut conn,
        &conversation,
        ROLE_USER,
        &request.message,
        None,
        None,
    )?;
    drop(conn);

    // Default path is single-shot RAG; the multi-agent orchestration is
    // opt-in via use_rag=false.
    let use_rag = request.use_rag.unwrap_or(true);

    let (answer, reasoning_steps, sources, usage, reasoning_json) = if use_rag {
        let rag_answer = rag::answer(
            &state,
            identity.org_id,
            RagRequest::new(&state, request.message.clone()),
        )
        .await?;
        let sources = json!({
            "documents": rag_answer.sources,
            "employees": [],
            "external": [],
        });
        (rag_answer.answer, None, sources, rag_answer.usage, None)
    } else {
        let outcome = agents::process_query(&state, identity.org_id, &request.message).await?;
        let sources = agents::sources_json(&outcome.sources);
        let reasoning = agents::reasoning_json(&outcome);
        (
            outcome.answer,
            Some(outcome.reasoning_steps),
            sources,
            outcome.usage,
            Some(reasoning),
        )
    };

    let mut conn = state.db()?;
    // Conversation row is re-read so the title/auto-title update above is
    // not overwritten by a stale copy.
    let conversation =
        get_owned_conversation(&mut conn, conversation_id, identity.org_id, identity.user_id)?;
    append_message(
        &mut conn,
        &conversation,
        ROLE_ASSISTANT,
        &answer,
        reasoning_json,
        Some(sources.clone()),
    )?;

    Ok(Json(PostMessageResponse {
        answer,
        reasoning_steps,
        sources,
        usage,
    }))
}

pub async fn archive_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    identity: Identity,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;
    get_owned_conversation(&mut conn, conversation_id, identity.org_id, identity.user_id)?;
    set_archived(&mut conn, conversation_id, true)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unarchive_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    identity: Identity,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;
    get_owned_conversation(&mut conn, conversation_id, identity.org_id, identity.user_id)?;
    set_archived(&mut conn, conversation_id, false)?;
    Ok(StatusCode::NO_CONTENT)
}
