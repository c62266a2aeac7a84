//! Bootstrap DDL for the application database.
//!
//! Applied idempotently at startup. The AFTER INSERT trigger on
//! `chat_completion_messages` is what drives the notification fabric: every
//! insert, from any process, NOTIFYs the chat channel with a reference
//! payload.

use crate::pool::PgConnection;

pub const CHAT_NOTIFY_CHANNEL: &str = "chat_completion_messages_notify";

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS user_mundiai_projects (
    id CHAR(12) PRIMARY KEY,
    owner_uuid UUID NOT NULL,
    title TEXT,
    maps TEXT[],
    map_diff_messages TEXT[],
    created_on TIMESTAMPTZ NOT NULL DEFAULT now(),
    soft_deleted_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS user_mundiai_maps (
    id CHAR(12) PRIMARY KEY,
    project_id CHAR(12) NOT NULL,
    owner_uuid UUID NOT NULL,
    title TEXT,
    description TEXT,
    layers TEXT[],
    parent_map_id CHAR(12),
    fork_reason TEXT,
    display_as_diff BOOLEAN NOT NULL DEFAULT FALSE,
    created_on TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_edited TIMESTAMPTZ NOT NULL DEFAULT now(),
    soft_deleted_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS map_layers (
    layer_id CHAR(12) PRIMARY KEY,
    owner_uuid UUID NOT NULL,
    name TEXT,
    type TEXT NOT NULL,
    s3_key TEXT,
    raster_cog_url TEXT,
    postgis_connection_id CHAR(12),
    postgis_query TEXT,
    postgis_attribute_column_list TEXT[],
    metadata JSONB,
    bounds DOUBLE PRECISION[],
    geometry_type TEXT,
    feature_count INTEGER,
    size_bytes BIGINT,
    source_map_id CHAR(12),
    created_on TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_edited TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS layer_styles (
    style_id CHAR(12) PRIMARY KEY,
    layer_id CHAR(12) NOT NULL REFERENCES map_layers(layer_id),
    style_json JSONB NOT NULL,
    parent_style_id CHAR(12),
    created_by UUID NOT NULL,
    created_on TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS map_layer_styles (
    map_id CHAR(12) NOT NULL,
    layer_id CHAR(12) NOT NULL,
    style_id CHAR(12) NOT NULL REFERENCES layer_styles(style_id),
    PRIMARY KEY (map_id, layer_id)
);

CREATE TABLE IF NOT EXISTS conversations (
    id SERIAL PRIMARY KEY,
    project_id CHAR(12) NOT NULL,
    owner_uuid UUID NOT NULL,
    title TEXT NOT NULL DEFAULT 'pending',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    soft_deleted_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS chat_completion_messages (
    id BIGSERIAL PRIMARY KEY,
    map_id CHAR(12) NOT NULL,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id),
    sender_id UUID NOT NULL,
    message_json TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS chat_completion_messages_conversation_created
    ON chat_completion_messages (conversation_id, created_at);

CREATE TABLE IF NOT EXISTS project_postgres_connections (
    id CHAR(12) PRIMARY KEY,
    project_id CHAR(12) NOT NULL,
    user_id TEXT NOT NULL,
    connection_uri TEXT NOT NULL,
    connection_name TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_error_text TEXT,
    last_error_timestamp TIMESTAMPTZ,
    soft_deleted_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS project_postgres_summary (
    connection_id CHAR(12) PRIMARY KEY
        REFERENCES project_postgres_connections(id),
    friendly_name TEXT,
    summary_md TEXT,
    table_count INTEGER,
    generated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

const CREATE_NOTIFY_TRIGGER: &str = r#"
CREATE OR REPLACE FUNCTION notify_chat_message() RETURNS trigger AS $$
DECLARE
  payload JSON;
BEGIN
  payload := json_build_object('id', NEW.id, 'map_id', NEW.map_id);
  PERFORM pg_notify('chat_completion_messages_notify', payload::text);
  RETURN NEW;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS chat_message_notify ON chat_completion_messages;
CREATE TRIGGER chat_message_notify
  AFTER INSERT ON chat_completion_messages
  FOR EACH ROW EXECUTE PROCEDURE notify_chat_message();
"#;

pub async fn initialize(conn: &PgConnection) -> anyhow::Result<()> {
    conn.batch_execute(CREATE_TABLES).await?;
    conn.batch_execute(CREATE_NOTIFY_TRIGGER).await?;
    Ok(())
}
