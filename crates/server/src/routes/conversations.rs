use axum::extract::{
    Path,
    Query,
    State,
};
use axum::Json;
use model::messages::SanitizedMessage;
use model::store;
use model::types::Conversation;
use serde::Deserialize;

use crate::auth::UserContext;
use crate::http_error::HttpResult;
use crate::AppState;

#[derive(Deserialize)]
pub struct CreateConversationRequest {
    pub project_id: String,
}

pub async fn create_conversation(
    State(state): State<AppState>,
    user: UserContext,
    Json(body): Json<CreateConversationRequest>,
) -> HttpResult<Json<Conversation>> {
    let conn = state.deps.app_pool.acquire("create_conversation").await?;
    let conversation = store::create_conversation(&conn, &body.project_id, user.user_id).await?;
    Ok(Json(conversation))
}

#[derive(Deserialize)]
pub struct ListConversationsQuery {
    pub project_id: String,
}

pub async fn list_conversations(
    State(state): State<AppState>,
    user: UserContext,
    Query(query): Query<ListConversationsQuery>,
) -> HttpResult<Json<Vec<Conversation>>> {
    let conn = state.deps.app_pool.acquire("list_conversations").await?;
    let conversations = store::list_conversations(&conn, &query.project_id, user.user_id).await?;
    Ok(Json(conversations))
}

/// The sanitized message history of a conversation; system messages are
/// filtered out.
pub async fn conversation_messages(
    State(state): State<AppState>,
    user: UserContext,
    Path(conversation_id): Path<i32>,
) -> HttpResult<Json<Vec<SanitizedMessage>>> {
    let conn = state.deps.app_pool.acquire("conversation_messages").await?;
    let messages = store::conversation_messages(&conn, conversation_id, user.user_id).await?;
    let sanitized = messages
        .iter()
        .filter_map(|message| message.sanitize())
        .collect();
    Ok(Json(sanitized))
}
