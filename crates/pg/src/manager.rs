//! Access to user-supplied PostGIS databases.
//!
//! Every session opened here is hardened to read-only at the session level,
//! and every connection attempt updates the stored `last_error_*` columns so
//! the UI can show why a database stopped responding.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{
    Arc,
    LazyLock,
};
use std::time::Duration;

use anyhow::Context as _;
use chrono::{
    DateTime,
    Utc,
};
use errors::ErrorMetadata;
use parking_lot::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{
    Row,
    Statement,
};
use url::Url;

use crate::pool::MundiPgPool;
use crate::{
    env_config,
    permissive_tls,
};

static POSTGIS_CONNECT_TIMEOUT_SEC: LazyLock<f64> =
    LazyLock::new(|| env_config("MUNDI_POSTGIS_TIMEOUT_SEC", 10.0));

/// How loopback hosts in user-supplied URIs are treated, from the
/// `POSTGIS_LOCALHOST_POLICY` environment variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalhostPolicy {
    Disallow,
    DockerRewrite,
    Allow,
}

impl LocalhostPolicy {
    fn from_env() -> anyhow::Result<Self> {
        match std::env::var("POSTGIS_LOCALHOST_POLICY") {
            Ok(v) if v == "disallow" => Ok(Self::Disallow),
            Ok(v) if v == "docker_rewrite" => Ok(Self::DockerRewrite),
            Ok(v) if v == "allow" => Ok(Self::Allow),
            Ok(v) => {
                tracing::error!("Unknown POSTGIS_LOCALHOST_POLICY: {v}");
                anyhow::bail!("Unknown POSTGIS_LOCALHOST_POLICY: {v}")
            },
            Err(_) => anyhow::bail!("POSTGIS_LOCALHOST_POLICY is not configured"),
        }
    }
}

/// A stored `project_postgres_connections` row.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub connection_uri: String,
    pub connection_name: Option<String>,
    pub last_error_text: Option<String>,
    pub last_error_timestamp: Option<DateTime<Utc>>,
    pub soft_deleted_at: Option<DateTime<Utc>>,
}

impl ConnectionRecord {
    fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            project_id: row.get("project_id"),
            user_id: row.get("user_id"),
            connection_uri: row.get("connection_uri"),
            connection_name: row.get("connection_name"),
            last_error_text: row.get("last_error_text"),
            last_error_timestamp: row.get("last_error_timestamp"),
            soft_deleted_at: row.get("soft_deleted_at"),
        }
    }
}

/// A dedicated read-only session on a user database. Single-use: tool
/// handlers open one, run their statements, and drop it.
pub struct UserPgSession {
    client: tokio_postgres::Client,
}

impl UserPgSession {
    pub async fn query(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Vec<Row>> {
        Ok(self.client.query(query, params).await?)
    }

    pub async fn query_opt(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Option<Row>> {
        Ok(self.client.query_opt(query, params).await?)
    }

    pub async fn query_one(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> anyhow::Result<Row> {
        Ok(self.client.query_one(query, params).await?)
    }

    /// Prepares without executing; used to introspect the column list of a
    /// user-provided query.
    pub async fn prepare(&self, query: &str) -> anyhow::Result<Statement> {
        Ok(self.client.prepare(query).await?)
    }
}

/// Encapsulates all access to user-supplied PostgreSQL databases.
pub struct PostgresConnectionManager {
    app_pool: Arc<MundiPgPool>,
    /// Pools for tile-serving workloads, memoized by connection URI.
    user_pools: Mutex<HashMap<String, Arc<MundiPgPool>>>,
}

impl PostgresConnectionManager {
    pub fn new(app_pool: Arc<MundiPgPool>) -> Self {
        Self {
            app_pool,
            user_pools: Mutex::new(HashMap::new()),
        }
    }

    /// Validates a user-supplied PostgreSQL URI and applies the loopback
    /// policy. Returns the URI to store plus whether it was rewritten.
    pub fn verify_postgresql_uri(&self, connection_uri: &str) -> anyhow::Result<(String, bool)> {
        verify_uri(connection_uri, LocalhostPolicy::from_env)
    }

    pub async fn get_connection(&self, connection_id: &str) -> anyhow::Result<ConnectionRecord> {
        let conn = self.app_pool.acquire("get_postgres_connection").await?;
        let row = conn
            .query_opt(
                "SELECT id, project_id, user_id, connection_uri, connection_name,
                        last_error_text, last_error_timestamp, soft_deleted_at
                 FROM project_postgres_connections
                 WHERE id = $1",
                &[&connection_id],
            )
            .await?
            .with_context(|| {
                ErrorMetadata::not_found(
                    "PostgresConnectionNotFound",
                    format!("Postgres connection {connection_id} not found"),
                )
            })?;
        Ok(ConnectionRecord::from_row(&row))
    }

    pub async fn update_error_status(
        &self,
        connection_id: &str,
        error_text: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.app_pool.acquire("update_connection_error").await?;
        match error_text {
            Some(error_text) => {
                conn.execute(
                    "UPDATE project_postgres_connections
                     SET last_error_text = $1, last_error_timestamp = $2
                     WHERE id = $3",
                    &[&error_text, &Utc::now(), &connection_id],
                )
                .await?;
            },
            None => {
                conn.execute(
                    "UPDATE project_postgres_connections
                     SET last_error_text = NULL, last_error_timestamp = NULL
                     WHERE id = $1",
                    &[&connection_id],
                )
                .await?;
            },
        }
        Ok(())
    }

    /// Opens a read-only session on the user database behind `connection_id`,
    /// bounded by `MUNDI_POSTGIS_TIMEOUT_SEC`.
    pub async fn connect(&self, connection_id: &str) -> anyhow::Result<UserPgSession> {
        let timeout = Duration::from_secs_f64(*POSTGIS_CONNECT_TIMEOUT_SEC);
        let record = self.get_connection(connection_id).await?;

        let config: tokio_postgres::Config = match record.connection_uri.parse() {
            Ok(config) => config,
            Err(e) => {
                let error_msg = format!("Unexpected error: {e}");
                self.update_error_status(connection_id, Some(&error_msg))
                    .await?;
                return Err(anyhow::Error::from(e)
                    .context(ErrorMetadata::operational_internal_server_error()));
            },
        };

        let connect = async {
            let (client, connection) = config.connect(permissive_tls()).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!("user postgres connection error: {e}");
                }
            });
            // Every query issued on a user DB must be read-only at the
            // session level.
            client
                .batch_execute("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY")
                .await?;
            Ok::<_, tokio_postgres::Error>(client)
        };

        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(client)) => {
                self.update_error_status(connection_id, None).await?;
                Ok(UserPgSession { client })
            },
            Ok(Err(e)) => {
                let error_msg = format!("Postgres error: {e}");
                self.update_error_status(connection_id, Some(&error_msg))
                    .await?;
                Err(anyhow::Error::from(e).context(ErrorMetadata::unprocessable_entity(
                    "PostgresConnectFailed",
                    format!("Failed to connect to postgres: {error_msg}"),
                )))
            },
            Err(_) => {
                let error_msg = format!("Connection timeout after {}s", timeout.as_secs_f64());
                self.update_error_status(connection_id, Some(&error_msg))
                    .await?;
                Err(anyhow::anyhow!(ErrorMetadata::request_timeout(
                    "PostgresConnectTimeout",
                    format!("Failed to connect to postgres: {error_msg}"),
                )))
            },
        }
    }

    /// Pooled access for workloads issuing many short-lived reads, e.g. the
    /// vector tile endpoint. Pools are keyed by connection URI and reused.
    pub async fn pooled(&self, connection_id: &str) -> anyhow::Result<Arc<MundiPgPool>> {
        let record = self.get_connection(connection_id).await?;
        let config: tokio_postgres::Config = record
            .connection_uri
            .parse()
            .context("stored connection URI no longer parses")?;
        let mut pools = self.user_pools.lock();
        let pool = pools
            .entry(record.connection_uri.clone())
            .or_insert_with(|| MundiPgPool::new(config, permissive_tls()));
        Ok(pool.clone())
    }
}

fn is_loopback_host(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    bare.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

fn verify_uri(
    connection_uri: &str,
    policy: impl FnOnce() -> anyhow::Result<LocalhostPolicy>,
) -> anyhow::Result<(String, bool)> {
    let connection_uri = connection_uri.trim();

    if !connection_uri.starts_with("postgresql://") {
        anyhow::bail!(ErrorMetadata::bad_request(
            "InvalidPostgresUri",
            "Invalid PostgreSQL connection URI format. Must start with 'postgresql://'",
        ));
    }

    let mut parsed = Url::parse(connection_uri).map_err(|_| {
        ErrorMetadata::bad_request(
            "InvalidPostgresUri",
            "Invalid PostgreSQL connection URI format. Please check your connection string.",
        )
    })?;

    let Some(host) = parsed.host_str().map(str::to_ascii_lowercase) else {
        anyhow::bail!(ErrorMetadata::bad_request(
            "InvalidPostgresUri",
            "PostgreSQL connection URI must include a hostname.",
        ));
    };

    if !is_loopback_host(&host) {
        return Ok((connection_uri.to_string(), false));
    }

    match policy()? {
        LocalhostPolicy::Disallow => {
            anyhow::bail!(ErrorMetadata::bad_request(
                "LocalhostPostgresDisallowed",
                format!("Detected a localhost database address ({host}) that Mundi cannot connect to."),
            ))
        },
        LocalhostPolicy::DockerRewrite => {
            parsed
                .set_host(Some("host.docker.internal"))
                .context("failed to rewrite loopback host")?;
            Ok((parsed.to_string(), true))
        },
        LocalhostPolicy::Allow => Ok((connection_uri.to_string(), false)),
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;

    use super::*;

    fn allow() -> anyhow::Result<LocalhostPolicy> {
        Ok(LocalhostPolicy::Allow)
    }

    fn disallow() -> anyhow::Result<LocalhostPolicy> {
        Ok(LocalhostPolicy::Disallow)
    }

    fn docker_rewrite() -> anyhow::Result<LocalhostPolicy> {
        Ok(LocalhostPolicy::DockerRewrite)
    }

    fn unconfigured() -> anyhow::Result<LocalhostPolicy> {
        anyhow::bail!("POSTGIS_LOCALHOST_POLICY is not configured")
    }

    #[test]
    fn test_rejects_non_postgresql_scheme() {
        let err = verify_uri("mysql://u:p@db.example.com/app", allow).unwrap_err();
        assert!(err.is_bad_request());
        assert!(err.msg().contains("postgresql://"));
    }

    #[test]
    fn test_requires_hostname() {
        let err = verify_uri("postgresql:///dbname", allow).unwrap_err();
        assert!(err.is_bad_request());
    }

    #[test]
    fn test_remote_host_passes_through_untouched() {
        let uri = "postgresql://u:p@db.example.com:5432/gis";
        let (stored, rewritten) = verify_uri(uri, disallow).unwrap();
        assert_eq!(stored, uri);
        assert!(!rewritten);
    }

    #[test]
    fn test_disallow_rejects_localhost_and_loopback_ips() {
        for uri in [
            "postgresql://u:p@localhost:5432/db",
            "postgresql://u:p@127.0.0.1:5432/db",
            "postgresql://u:p@127.8.4.2:5432/db",
            "postgresql://u:p@[::1]:5432/db",
        ] {
            let err = verify_uri(uri, disallow).unwrap_err();
            assert!(err.is_bad_request(), "{uri} should be rejected");
            assert!(err.msg().contains("localhost database address"));
        }
    }

    #[test]
    fn test_docker_rewrite_substitutes_host() {
        let (stored, rewritten) =
            verify_uri("postgresql://u:p@localhost:5432/db", docker_rewrite).unwrap();
        assert!(rewritten);
        assert!(stored.contains("host.docker.internal"));
        assert!(!stored.contains("localhost"));
        // Credentials, port and database survive the rewrite.
        assert!(stored.starts_with("postgresql://u:p@"));
        assert!(stored.contains(":5432/db"));
    }

    #[test]
    fn test_allow_passes_localhost_verbatim() {
        let uri = "postgresql://u:p@localhost:5432/db";
        let (stored, rewritten) = verify_uri(uri, allow).unwrap();
        assert_eq!(stored, uri);
        assert!(!rewritten);
    }

    #[test]
    fn test_unconfigured_policy_is_configuration_error() {
        let err = verify_uri("postgresql://u:p@localhost/db", unconfigured).unwrap_err();
        // No ErrorMetadata tag: classifies as a 500-class configuration
        // error, not a client mistake.
        assert!(!err.is_bad_request());
    }

    #[test]
    fn test_policy_only_consulted_for_loopback() {
        let uri = "postgresql://u:p@db.internal.corp/db";
        let (stored, rewritten) = verify_uri(uri, unconfigured).unwrap();
        assert_eq!(stored, uri);
        assert!(!rewritten);
    }
}
