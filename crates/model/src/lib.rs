//! The Mundi data model: identifiers, entities, chat message wire types,
//! message sanitization, the map snapshot DAG, default symbology, and the
//! queries that read and write all of it.

pub mod dag;
pub mod ids;
pub mod map_state;
pub mod messages;
pub mod mvt;
pub mod store;
pub mod symbology;
pub mod types;

pub use ids::{
    generate_id,
    is_layer_id,
    IdPrefix,
};
pub use messages::{
    ChatMessage,
    FunctionCall,
    SanitizedMessage,
    SanitizedToolCall,
    StoredMessage,
    ToolCall,
};
pub use types::{
    Conversation,
    ForkReason,
    LayerKind,
    MapLayer,
    MundiMap,
};
