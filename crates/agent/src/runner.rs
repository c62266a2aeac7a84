//! The agentic loop: bounded iteration of LLM call -> persist assistant ->
//! run tools -> persist tool results, under the conversation lock.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use errors::ErrorMetadata;
use model::map_state::SelectedFeature;
use model::messages::{
    ChatMessage,
    SanitizedMessage,
};
use model::store;
use model::types::Conversation;
use notifications::{
    notify_error,
    EphemeralAction,
};
use uuid::Uuid;

use crate::describe;
use crate::handlers;
use crate::llm::LlmError;
use crate::osm;
use crate::qgis;
use crate::system_prompt::SYSTEM_PROMPT;
use crate::tools;
use crate::AgentDeps;

/// Upper bound on LLM round trips for one user turn.
pub const MAX_ITERATIONS: usize = 25;

const MAX_CONTEXT_MESSAGE: &str = "Maximum context length for LLM has been reached. Please create \
                                   a new chat to continue using the chat feature.";
const LLM_ERROR_MESSAGE: &str = "Error connecting to LLM. If trying again doesn't work, create a \
                                 new chat in the top right to reset the chat history.";

pub struct SendOutcome {
    pub conversation: Conversation,
    pub sent_message: SanitizedMessage,
    pub message_id: i64,
}

/// Entry point for one user turn. Locks the conversation, persists the
/// system context and the user message, and spawns the background loop.
/// Returns as soon as the loop is launched.
pub async fn send_message(
    deps: &Arc<AgentDeps>,
    user_id: Uuid,
    conversation_ref: &str,
    map_id: &str,
    message_text: String,
    selected_feature: Option<SelectedFeature>,
) -> anyhow::Result<SendOutcome> {
    let conn = deps.app_pool.acquire("send_map_message").await?;
    let conversation =
        store::get_or_create_conversation(&conn, conversation_ref, map_id, user_id).await?;

    if !deps.redis.try_lock_conversation(conversation.id).await? {
        anyhow::bail!(ErrorMetadata::conflict(
            "ConversationLocked",
            "Conversation is currently being processed by another request",
        ));
    }

    // From here the lock is held; release it if the turn can't launch
    // instead of waiting out the 30 s expiry.
    let prepared = prepare_turn(
        deps,
        &conn,
        user_id,
        map_id,
        &conversation,
        message_text,
        selected_feature,
    )
    .await;
    let stored = match prepared {
        Ok(stored) => stored,
        Err(e) => {
            _ = deps.redis.unlock_conversation(conversation.id).await;
            return Err(e);
        },
    };
    let sent_message = stored
        .sanitize()
        .context("user messages always sanitize")?;
    drop(conn);

    let task_deps = deps.clone();
    let task_map_id = map_id.to_string();
    let task_conversation = conversation.clone();
    tokio::spawn(async move {
        process_chat_interaction(task_deps, user_id, task_map_id, task_conversation).await;
    });

    Ok(SendOutcome {
        conversation,
        sent_message,
        message_id: stored.id,
    })
}

/// Persists the system context and the user message for one turn, returning
/// the stored user message.
async fn prepare_turn(
    deps: &Arc<AgentDeps>,
    conn: &pg::PgConnection,
    user_id: Uuid,
    map_id: &str,
    conversation: &Conversation,
    message_text: String,
    selected_feature: Option<SelectedFeature>,
) -> anyhow::Result<model::messages::StoredMessage> {
    let map = store::get_map(conn, map_id)
        .await?
        .filter(|m| m.owner_uuid == user_id)
        .with_context(|| {
            ErrorMetadata::not_found("MapNotFound", format!("Map {map_id} not found"))
        })?;

    let description = describe::map_description(deps, conn, &map).await?;
    let system_messages = deps
        .map_state
        .system_messages(&description, selected_feature.as_ref())
        .await?;
    for system_message in &system_messages {
        store::insert_message(conn, map_id, conversation.id, user_id, system_message).await?;
    }

    let user_message = ChatMessage::User {
        content: message_text,
    };
    store::insert_message(conn, map_id, conversation.id, user_id, &user_message).await
}

/// Background task for one turn. Owns the conversation lock; releases it on
/// every exit path.
async fn process_chat_interaction(
    deps: Arc<AgentDeps>,
    user_id: Uuid,
    map_id: String,
    conversation: Conversation,
) {
    // Detach from the event-loop burst of the /send handler.
    tokio::time::sleep(Duration::from_millis(100)).await;

    if let Err(e) = run_loop(&deps, user_id, &map_id, &conversation).await {
        tracing::error!("chat interaction for conversation {} failed: {e:#}", conversation.id);
        notify_error(&deps.bus, conversation.id, errors::INTERNAL_SERVER_ERROR_MSG);
    }

    if let Err(e) = deps.redis.unlock_conversation(conversation.id).await {
        tracing::error!("failed to release conversation lock {}: {e:#}", conversation.id);
    }
}

async fn run_loop(
    deps: &Arc<AgentDeps>,
    user_id: Uuid,
    map_id: &str,
    conversation: &Conversation,
) -> anyhow::Result<()> {
    for _ in 0..MAX_ITERATIONS {
        // Cancellation is consumed, so a stale flag can't kill the next turn.
        if deps.redis.take_cancelled(map_id).await? {
            tracing::info!("conversation {} cancelled", conversation.id);
            break;
        }

        // Fetch state in its own acquisition scope: the LLM call below is
        // the longest suspension in the system and must not hold a pooled
        // connection.
        let (transcript, unattached) = {
            let conn = deps.app_pool.acquire("loop_fetch_state").await?;
            let transcript =
                store::conversation_messages(&conn, conversation.id, user_id).await?;
            let unattached = store::unattached_layers(&conn, user_id).await?;
            (transcript, unattached)
        };

        let mut tool_schemas = tools::builtin_tool_schemas(&unattached, osm::has_api_key());
        tool_schemas.extend(qgis::tool_schemas());

        let mut messages = vec![ChatMessage::System {
            content: SYSTEM_PROMPT.to_string(),
        }];
        messages.extend(transcript.into_iter().map(|stored| stored.message));

        let reply = {
            let _thinking =
                EphemeralAction::begin(&deps.bus, conversation.id, "Kue is thinking...").await;
            deps.llm.chat(&messages, &tool_schemas, None).await
        };
        let reply = match reply {
            Ok(reply) => reply,
            Err(LlmError::ContextLengthExceeded) => {
                notify_error(&deps.bus, conversation.id, MAX_CONTEXT_MESSAGE);
                break;
            },
            Err(LlmError::Other(e)) => {
                tracing::error!("LLM call failed: {e:#}");
                notify_error(&deps.bus, conversation.id, LLM_ERROR_MESSAGE);
                break;
            },
        };

        let assistant_message = reply.into_message();
        {
            let conn = deps.app_pool.acquire("persist_assistant").await?;
            store::insert_message(&conn, map_id, conversation.id, user_id, &assistant_message)
                .await?;
        }

        let calls = assistant_message.tool_calls().to_vec();
        if calls.is_empty() {
            break;
        }

        for call in &calls {
            let result =
                handlers::dispatch_tool_call(deps, user_id, map_id, conversation.id, call).await?;
            let tool_message = ChatMessage::tool_result(&call.id, &result);
            let conn = deps.app_pool.acquire("persist_tool_result").await?;
            store::insert_message(&conn, map_id, conversation.id, user_id, &tool_message).await?;
        }
    }

    if conversation.title == "pending" {
        if let Err(e) = label_conversation(deps, user_id, conversation.id).await {
            tracing::warn!("failed to label conversation {}: {e:#}", conversation.id);
        }
    }
    Ok(())
}

/// Asks the LLM for a 3-6 word title over the first exchanges and stores it.
async fn label_conversation(
    deps: &Arc<AgentDeps>,
    user_id: Uuid,
    conversation_id: i32,
) -> anyhow::Result<()> {
    let conn = deps.app_pool.acquire("label_conversation").await?;
    let transcript = store::conversation_messages(&conn, conversation_id, user_id).await?;

    let mut content_summary = String::new();
    for stored in transcript.iter().take(5) {
        let role = stored.message.role();
        if role != "user" && role != "assistant" {
            continue;
        }
        if let Some(content) = stored.message.content() {
            let truncated: String = content.chars().take(200).collect();
            content_summary.push_str(&format!("{role}: {truncated}\n"));
        }
    }
    if content_summary.is_empty() {
        return Ok(());
    }

    let messages = vec![
        ChatMessage::System {
            content: "Generate a short, descriptive title (3-6 words) for this conversation. The \
                      title should capture the main topic or request. Only return the title, \
                      nothing else."
                .to_string(),
        },
        ChatMessage::User {
            content: format!("Conversation:\n{content_summary}"),
        },
    ];
    let reply = deps
        .llm
        .chat(&messages, &[], Some(20))
        .await
        .map_err(|e| anyhow::anyhow!("title generation failed: {e}"))?;
    let title = reply.content.unwrap_or_default().trim().to_string();
    if !title.is_empty() {
        store::update_conversation_title(&conn, conversation_id, &title).await?;
        tracing::info!("labeled conversation {conversation_id}: {title}");
    }
    Ok(())
}

/// Sets the cancellation flag for a map's in-flight turn. The loop observes
/// it between iterations; the current tool completes naturally.
pub async fn cancel_map_messages(
    deps: &AgentDeps,
    user_id: Uuid,
    map_id: &str,
) -> anyhow::Result<()> {
    let conn = deps.app_pool.acquire("cancel_map_message").await?;
    let map = store::get_map(&conn, map_id).await?.with_context(|| {
        ErrorMetadata::not_found("MapNotFound", "Map not found")
    })?;
    if map.owner_uuid != user_id {
        anyhow::bail!(ErrorMetadata::unauthenticated(
            "NotMapOwner",
            "Authentication required",
        ));
    }
    deps.redis.set_cancelled(map_id).await
}
