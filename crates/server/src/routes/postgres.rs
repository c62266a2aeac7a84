use anyhow::Context as _;
use axum::extract::{
    Path,
    State,
};
use axum::Json;
use errors::ErrorMetadata;
use model::ids::{
    generate_id,
    IdPrefix,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::auth::UserContext;
use crate::http_error::HttpResult;
use crate::AppState;

#[derive(Deserialize)]
pub struct AddConnectionRequest {
    pub connection_uri: String,
    #[serde(default)]
    pub connection_name: Option<String>,
}

#[derive(Serialize)]
pub struct ConnectionResponse {
    pub id: String,
    pub project_id: String,
    pub connection_name: Option<String>,
    pub was_rewritten: bool,
    pub last_error_text: Option<String>,
    pub last_error_timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

async fn assert_project_owner(
    conn: &pg::PgConnection,
    project_id: &str,
    user: &UserContext,
) -> anyhow::Result<()> {
    conn.query_opt(
        "SELECT id FROM user_mundiai_projects
         WHERE id = $1 AND owner_uuid = $2 AND soft_deleted_at IS NULL",
        &[&project_id, &user.user_id],
    )
    .await?
    .with_context(|| {
        ErrorMetadata::not_found("ProjectNotFound", format!("Project {project_id} not found"))
    })?;
    Ok(())
}

/// Registers a user database with a project. The URI is validated and the
/// loopback policy applied before anything is stored; with
/// `docker_rewrite` the stored URI points at `host.docker.internal`.
pub async fn add_connection(
    State(state): State<AppState>,
    user: UserContext,
    Path(project_id): Path<String>,
    Json(body): Json<AddConnectionRequest>,
) -> HttpResult<Json<ConnectionResponse>> {
    let (stored_uri, was_rewritten) = state
        .deps
        .manager
        .verify_postgresql_uri(&body.connection_uri)?;

    let conn = state.deps.app_pool.acquire("add_postgres_connection").await?;
    assert_project_owner(&conn, &project_id, &user).await?;

    let connection_id = generate_id(IdPrefix::PostgresConnection);
    conn.execute(
        "INSERT INTO project_postgres_connections
         (id, project_id, user_id, connection_uri, connection_name)
         VALUES ($1, $2, $3, $4, $5)",
        &[
            &connection_id,
            &project_id,
            &user.user_id.to_string(),
            &stored_uri,
            &body.connection_name,
        ],
    )
    .await?;

    Ok(Json(ConnectionResponse {
        id: connection_id,
        project_id,
        connection_name: body.connection_name,
        was_rewritten,
        last_error_text: None,
        last_error_timestamp: None,
    }))
}

pub async fn list_connections(
    State(state): State<AppState>,
    user: UserContext,
    Path(project_id): Path<String>,
) -> HttpResult<Json<Vec<ConnectionResponse>>> {
    let conn = state.deps.app_pool.acquire("list_postgres_connections").await?;
    assert_project_owner(&conn, &project_id, &user).await?;

    let rows = conn
        .query(
            "SELECT id, project_id, connection_name, last_error_text, last_error_timestamp
             FROM project_postgres_connections
             WHERE project_id = $1 AND user_id = $2 AND soft_deleted_at IS NULL
             ORDER BY created_at ASC",
            &[&project_id, &user.user_id.to_string()],
        )
        .await?;
    let connections = rows
        .iter()
        .map(|row| ConnectionResponse {
            id: row.get("id"),
            project_id: row.get("project_id"),
            connection_name: row.get("connection_name"),
            was_rewritten: false,
            last_error_text: row.get("last_error_text"),
            last_error_timestamp: row.get("last_error_timestamp"),
        })
        .collect();
    Ok(Json(connections))
}

/// Soft delete: the row survives for audit but stops resolving.
pub async fn delete_connection(
    State(state): State<AppState>,
    user: UserContext,
    Path((project_id, connection_id)): Path<(String, String)>,
) -> HttpResult<Json<serde_json::Value>> {
    let conn = state.deps.app_pool.acquire("delete_postgres_connection").await?;
    assert_project_owner(&conn, &project_id, &user).await?;

    let updated = conn
        .execute(
            "UPDATE project_postgres_connections
             SET soft_deleted_at = now()
             WHERE id = $1 AND project_id = $2 AND user_id = $3 AND soft_deleted_at IS NULL",
            &[&connection_id, &project_id, &user.user_id.to_string()],
        )
        .await?;
    if updated == 0 {
        return Err(anyhow::anyhow!(ErrorMetadata::not_found(
            "PostgresConnectionNotFound",
            format!("Postgres connection {connection_id} not found"),
        ))
        .into());
    }
    Ok(Json(serde_json::json!({"status": "deleted"})))
}
