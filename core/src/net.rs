/*
 * net.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Pollhttp, an asynchronous HTTP client with certificate capture.
 *
 * Pollhttp is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Pollhttp is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Pollhttp.  If not, see <http://www.gnu.org/licenses/>.
 */

//! TLS helpers: crypto provider, root store, client configs, TCP connect with timeout.
//!
//! The ring provider is selected explicitly so config builders never depend on a
//! process-wide default provider being installed.

use std::io;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::client::ClientConfig;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::RootCertStore;
use tracing::{debug, warn};

use crate::error::RequestError;

/// Shared ring crypto provider.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    static PROVIDER: OnceLock<Arc<CryptoProvider>> = OnceLock::new();
    PROVIDER
        .get_or_init(|| Arc::new(tokio_rustls::rustls::crypto::ring::default_provider()))
        .clone()
}

/// Platform native certs first, then webpki-roots as fallback.
fn native_roots() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            debug!(added, ignored, "loaded native root certificates");
        }
        Err(e) => {
            debug!(error = %e, "native root certificates unavailable");
        }
    }
    if root_store.is_empty() {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    root_store
}

/// Root store: native/Mozilla roots plus `extra` (certificates installed in the local trust store).
pub fn build_root_store(extra: &[CertificateDer<'static>]) -> RootCertStore {
    let mut root_store = native_roots();
    for cert in extra {
        if let Err(e) = root_store.add(cert.clone()) {
            warn!(error = %e, "ignoring unusable trust-store certificate");
        }
    }
    root_store
}

/// TLS client config for HTTP/1.1 (ALPN `http/1.1`), trusting `extra` in addition to the system roots.
pub fn http_client_config(extra: &[CertificateDer<'static>]) -> Result<Arc<ClientConfig>, RequestError> {
    let mut config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| RequestError::Tls(e.to_string()))?
        .with_root_certificates(build_root_store(extra))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Default HTTP client config (system roots only), built once.
pub fn default_http_client_config() -> Result<Arc<ClientConfig>, RequestError> {
    static DEFAULT: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    if let Some(config) = DEFAULT.get() {
        return Ok(config.clone());
    }
    let config = http_client_config(&[])?;
    Ok(DEFAULT.get_or_init(|| config).clone())
}

/// Server name for SNI / verification. Accepts DNS names and IP literals.
pub fn server_name(host: &str) -> io::Result<ServerName<'static>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host)
        .map(|name| name.to_owned())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid host name"))
}

/// TCP connect bounded by `limit`.
pub async fn connect_tcp(host: &str, port: u16, limit: Duration) -> Result<TcpStream, RequestError> {
    let addr = format!("{}:{}", host, port);
    let tcp = timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| RequestError::ConnectTimeout {
            host: host.to_string(),
            port,
            timeout: limit,
        })??;
    tcp.set_nodelay(true)?;
    Ok(tcp)
}
