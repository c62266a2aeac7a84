//! Assembly of the system-message block the agentic loop feeds the LLM:
//! the current map description plus the user's selected feature, if any.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::messages::ChatMessage;

/// The feature the user has selected on the map, forwarded with their
/// message so the LLM can answer "what is this?".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedFeature {
    pub layer_id: String,
    pub attributes: HashMap<String, JsonValue>,
}

/// Produces the system messages prepended to a turn. Swappable so tests can
/// pin the map state without a database.
#[async_trait]
pub trait MapStateProvider: Send + Sync {
    async fn system_messages(
        &self,
        current_map_description: &str,
        selected_feature: Option<&SelectedFeature>,
    ) -> anyhow::Result<Vec<ChatMessage>>;
}

pub struct DefaultMapStateProvider;

#[async_trait]
impl MapStateProvider for DefaultMapStateProvider {
    async fn system_messages(
        &self,
        current_map_description: &str,
        selected_feature: Option<&SelectedFeature>,
    ) -> anyhow::Result<Vec<ChatMessage>> {
        let mut tagged = format!("<MapState>\n{current_map_description}\n</MapState>");
        match selected_feature {
            Some(feature) => {
                tagged.push_str(&format!(
                    "\n<SelectedFeature>\n{}\n</SelectedFeature>",
                    serde_json::to_string(feature)?
                ));
            },
            None => tagged.push_str("\n<NoSelectedFeature />"),
        }
        Ok(vec![ChatMessage::System { content: tagged }])
    }
}

#[cfg(test)]
mod tests {
    use maplit::hashmap;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_map_state_block_without_selection() {
        let messages = DefaultMapStateProvider
            .system_messages("2 layers: beaches, roads", None)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        let content = messages[0].content().unwrap();
        assert!(content.starts_with("<MapState>\n2 layers: beaches, roads\n</MapState>"));
        assert!(content.ends_with("<NoSelectedFeature />"));
    }

    #[tokio::test]
    async fn test_map_state_block_with_selection() {
        let feature = SelectedFeature {
            layer_id: "L12345678901".to_string(),
            attributes: hashmap! {"name".to_string() => json!("Ocean Beach")},
        };
        let messages = DefaultMapStateProvider
            .system_messages("1 layer", Some(&feature))
            .await
            .unwrap();
        let content = messages[0].content().unwrap();
        assert!(content.contains("<SelectedFeature>"));
        assert!(content.contains("Ocean Beach"));
        assert!(!content.contains("<NoSelectedFeature />"));
    }
}
