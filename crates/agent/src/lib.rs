//! The agentic loop and everything it drives: the tool registry and
//! dispatcher, per-tool handlers, the LLM client, the QGIS worker client,
//! the DuckDB query engine with its pinned file cache, and the Redis-backed
//! conversation lock and cancellation flags.

use std::sync::Arc;

use model::map_state::MapStateProvider;
use notifications::NotificationBus;
use pg::{
    MundiPgPool,
    PostgresConnectionManager,
};
use storage::ObjectStore;

pub mod cache;
pub mod describe;
pub mod duck;
pub mod guard;
pub mod handlers;
pub mod llm;
pub mod locks;
pub mod osm;
pub mod qgis;
pub mod runner;
pub mod style;
pub mod system_prompt;
pub mod tools;

pub use runner::{
    cancel_map_messages,
    send_message,
    SendOutcome,
};

/// Shared handles threaded through the loop and every tool handler.
pub struct AgentDeps {
    pub app_pool: Arc<MundiPgPool>,
    pub bus: Arc<NotificationBus>,
    pub manager: Arc<PostgresConnectionManager>,
    pub store: ObjectStore,
    pub redis: locks::RedisHandles,
    pub llm: llm::LlmClient,
    pub layer_cache: Arc<cache::LayerCache>,
    pub map_state: Arc<dyn MapStateProvider>,
}
