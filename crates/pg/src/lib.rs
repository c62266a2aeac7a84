//! Postgres plumbing: the application-database connection pool, the manager
//! for user-supplied PostGIS databases, and the bootstrap DDL.

use std::str::FromStr;
use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid,
    ServerCertVerified,
    ServerCertVerifier,
};
use rustls::DigitallySignedStruct;
use rustls_pki_types::{
    CertificateDer,
    ServerName,
    UnixTime,
};
use tokio_postgres_rustls::MakeRustlsConnect;

pub mod bootstrap;
pub mod manager;
pub mod pool;

pub use manager::{
    PostgresConnectionManager,
    UserPgSession,
};
pub use pool::{
    MundiPgPool,
    PgConnection,
};

/// Reads an environment knob, falling back to `default` when unset or
/// unparseable.
pub fn env_config<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring unparseable value for {name}");
            default
        }),
        Err(_) => default,
    }
}

/// Application database config assembled from the `POSTGRES_*` environment
/// components.
pub fn app_db_config() -> anyhow::Result<tokio_postgres::Config> {
    let user = std::env::var("POSTGRES_USER")?;
    let password = std::env::var("POSTGRES_PASSWORD")?;
    let host = std::env::var("POSTGRES_HOST")?;
    let port = std::env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
    let db = std::env::var("POSTGRES_DB")?;
    let url = format!("postgresql://{user}:{password}@{host}:{port}/{db}");
    Ok(url.parse()?)
}

/// Certificate verifier that accepts any chain. User databases frequently
/// present self-signed certificates, so hostname and chain checks are
/// disabled for every outbound Postgres session (documented policy).
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS connector for Postgres sessions; see [`AcceptAnyServerCert`].
pub fn permissive_tls() -> MakeRustlsConnect {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    MakeRustlsConnect::new(config)
}
