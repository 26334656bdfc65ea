//! Secured HTTP transport for registry traffic.
//!
//! One [`Transport`] is built per provider and shared by every fetch. It
//! bounds resource usage against the registry and pins an explicit TLS
//! floor instead of relying on ambient defaults:
//!
//! | Setting                      | Value        |
//! |------------------------------|--------------|
//! | Connect timeout              | 30s          |
//! | TCP keep-alive interval      | 30s          |
//! | Idle connections kept        | 10           |
//! | Connections per host         | 3            |
//! | Idle connection timeout      | 90s          |
//! | Minimum TLS version          | 1.2          |
//!
//! reqwest exposes neither the IPv6 fallback delay (600ms) nor a separate
//! TLS handshake timeout (10s). Both happen inside the connect phase, so
//! the 30s connect timeout and the per-fetch deadline bound them instead.
//!
//! Trust roots come from the configured CA bundle, or the bundled web PKI
//! roots when none is configured. A client certificate is only presented
//! when both certificate and key are configured.

use reqwest::Client;
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::{Error, Result};

/// TCP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between TCP keep-alive packets.
pub const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Idle connections kept in the pool.
pub const MAX_IDLE_CONNECTIONS: usize = 10;

/// Concurrent connections per host.
pub const MAX_CONNECTIONS_PER_HOST: usize = 3;

/// Idle connections are closed after this long.
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(90);

const USER_AGENT: &str = concat!("seeder-oras/", env!("CARGO_PKG_VERSION"));

/// TLS material for the transport.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// PEM bundle of trusted CA certificates.
    pub server_ca_path: Option<PathBuf>,
    /// PEM client certificate chain.
    pub client_cert_path: Option<PathBuf>,
    /// PEM client private key.
    pub client_key_path: Option<PathBuf>,
}

/// HTTP client plus a per-host connection limiter.
#[derive(Debug)]
pub struct Transport {
    client: Client,
    limiter: ConnectionLimiter,
}

impl Transport {
    /// Build the transport.
    ///
    /// # Errors
    ///
    /// Fails if the CA bundle or client identity cannot be loaded, or if
    /// the HTTP client cannot be constructed.
    pub fn new(tls: &TlsSettings) -> Result<Self> {
        let tls_config = client_tls_config(tls)?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(TCP_KEEPALIVE)
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
            .pool_idle_timeout(IDLE_CONNECTION_TIMEOUT)
            .use_preconfigured_tls(tls_config)
            .build()?;

        Ok(Self {
            client,
            limiter: ConnectionLimiter::new(MAX_CONNECTIONS_PER_HOST),
        })
    }

    /// The underlying HTTP client.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Wait for a connection slot on `host`.
    ///
    /// The slot is released when the returned permit is dropped.
    pub async fn acquire(&self, host: &str) -> Result<OwnedSemaphorePermit> {
        self.limiter.acquire(host).await
    }
}

/// Caps concurrent requests per host.
#[derive(Debug)]
struct ConnectionLimiter {
    per_host: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ConnectionLimiter {
    fn new(per_host: usize) -> Self {
        Self {
            per_host,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, host: &str) -> Result<OwnedSemaphorePermit> {
        let semaphore = {
            let mut hosts = self.hosts.lock().await;
            Arc::clone(
                hosts
                    .entry(host.to_string())
                    .or_insert_with(|| Arc::new(Semaphore::new(self.per_host))),
            )
        };
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::Io(std::io::Error::other("connection limiter closed")))
    }
}

/// Assemble the rustls client configuration.
fn client_tls_config(tls: &TlsSettings) -> Result<rustls::ClientConfig> {
    let roots = root_store(tls.server_ca_path.as_deref())?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| Error::tls("<protocol versions>", e.to_string()))?
        .with_root_certificates(roots);

    let mut config = match (&tls.client_cert_path, &tls.client_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let chain = load_certificates(cert_path)?;
            let key = load_private_key(key_path)?;
            debug!(cert = %cert_path.display(), "Presenting client certificate to registry");
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| Error::tls(cert_path, e.to_string()))?
        }
        (None, None) => builder.with_no_client_auth(),
        (cert, key) => {
            warn!(
                cert = ?cert,
                key = ?key,
                "Client certificate and key must both be configured, ignoring client identity"
            );
            builder.with_no_client_auth()
        }
    };

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Trust roots: every certificate in the CA bundle, or the bundled roots.
fn root_store(server_ca_path: Option<&Path>) -> Result<RootCertStore> {
    let Some(path) = server_ca_path else {
        return Ok(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        });
    };

    let mut roots = RootCertStore::empty();
    let certificates = load_certificates(path)?;
    let (added, ignored) = roots.add_parsable_certificates(certificates);
    if added == 0 {
        return Err(Error::tls(path, "no usable CA certificates found"));
    }
    if ignored > 0 {
        warn!(path = %path.display(), ignored, "Ignored unparsable CA certificates");
    }
    debug!(path = %path.display(), added, "Loaded registry CA bundle");
    Ok(roots)
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| Error::tls(path, e.to_string()))?;
    let certificates = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::tls(path, e.to_string()))?;
    if certificates.is_empty() {
        return Err(Error::tls(path, "no certificates found"));
    }
    Ok(certificates)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| Error::tls(path, e.to_string()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::tls(path, e.to_string()))?
        .ok_or_else(|| Error::tls(path, "no private key found"))
}
