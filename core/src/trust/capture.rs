/*
 * capture.rs
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

//! Trust capture: handshake with a host, record its chain, install one certificate.
//!
//! `ChainProbe` is the network seam: `TlsProbe` performs a real handshake through a
//! `CapturingVerifier`; tests substitute probes that return canned chains.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::TrustConfig;
use crate::error::{RequestError, TrustStoreError};
use crate::net::{connect_tcp, crypto_provider, server_name};
use crate::trust::store::{lock_store_files, TrustStore};
use crate::trust::verifier::{CapturingVerifier, CertificateChain, TrustPolicy};

/// Obtains the chain a server presents.
pub trait ChainProbe: Send + Sync + 'static {
    /// Handshake with `host:port` within `limit`. `None` if no chain was presented.
    fn capture(
        &self,
        host: &str,
        port: u16,
        limit: Duration,
    ) -> impl Future<Output = Option<CertificateChain>> + Send;
}

/// Real TLS handshake through a capturing verifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsProbe {
    policy: TrustPolicy,
}

impl TlsProbe {
    pub fn new(policy: TrustPolicy) -> Self {
        Self { policy }
    }

    async fn handshake(
        &self,
        verifier: Arc<CapturingVerifier>,
        host: &str,
        port: u16,
        limit: Duration,
    ) -> Result<(), RequestError> {
        let config = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| RequestError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let tcp = connect_tcp(host, port, limit).await?;
        let name = server_name(host)?;
        let mut tls = timeout(limit, connector.connect(name, tcp))
            .await
            .map_err(|_| RequestError::ConnectTimeout {
                host: host.to_string(),
                port,
                timeout: limit,
            })??;
        let _ = tls.shutdown().await;
        Ok(())
    }
}

impl ChainProbe for TlsProbe {
    async fn capture(&self, host: &str, port: u16, limit: Duration) -> Option<CertificateChain> {
        let verifier = match CapturingVerifier::new(&[], self.policy) {
            Ok(v) => Arc::new(v),
            Err(e) => {
                warn!(error = %e, "cannot build capturing verifier");
                return None;
            }
        };
        debug!(host, port, policy = ?self.policy, "opening capture handshake");
        if let Err(e) = self.handshake(verifier.clone(), host, port, limit).await {
            // The chain is recorded before validation, so it may be present anyway.
            debug!(host, port, error = %e, "capture handshake did not complete");
        }
        verifier.captured_chain()
    }
}

/// Capture-and-install state for one host.
pub struct TrustCapture<P: ChainProbe = TlsProbe> {
    host: String,
    port: u16,
    config: TrustConfig,
    probe: Arc<P>,
    chain: Mutex<Option<CertificateChain>>,
}

impl TrustCapture<TlsProbe> {
    pub fn new(host: impl Into<String>, port: u16, config: TrustConfig) -> Self {
        let probe = Arc::new(TlsProbe::new(config.policy));
        Self::with_probe(host, port, config, probe)
    }
}

impl<P: ChainProbe> TrustCapture<P> {
    pub fn with_probe(host: impl Into<String>, port: u16, config: TrustConfig, probe: Arc<P>) -> Self {
        Self {
            host: host.into(),
            port,
            config,
            probe,
            chain: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Handshake with the host and keep the presented chain. Handshake errors are not reported;
    /// the result is whatever chain was seen, if any.
    pub async fn capture_chain(&self) -> Option<CertificateChain> {
        let chain = self
            .probe
            .capture(&self.host, self.port, self.config.handshake_timeout)
            .await;
        match &chain {
            Some(c) => debug!(host = %self.host, length = c.len(), "captured certificate chain"),
            None => debug!(host = %self.host, "no certificate chain captured"),
        }
        if let Ok(mut slot) = self.chain.lock() {
            *slot = chain.clone();
        }
        chain
    }

    /// Chain from the most recent `capture_chain`.
    pub fn certificates_chain(&self) -> Option<CertificateChain> {
        self.chain.lock().ok().and_then(|c| c.clone())
    }

    /// Store certificate `chain_index` (0 = leaf) of the last captured chain under the host alias.
    /// Returns false if there is no such certificate or the store cannot be read or written.
    pub fn install_chain_entry(&self, chain_index: usize) -> bool {
        let Some(chain) = self.certificates_chain() else {
            warn!(host = %self.host, "nothing to install: no chain captured");
            return false;
        };
        let Some(certificate) = chain.get(chain_index).cloned() else {
            warn!(host = %self.host, chain_index, length = chain.len(), "chain index out of range");
            return false;
        };
        match self.store_certificate(certificate) {
            Ok(()) => {
                info!(
                    host = %self.host,
                    chain_index,
                    store = %self.config.store_path.display(),
                    "installed certificate"
                );
                true
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "cannot install certificate");
                false
            }
        }
    }

    /// `capture_chain` then `install_chain_entry`.
    pub async fn install_certificate(&self, chain_index: usize) -> bool {
        self.capture_chain().await;
        self.install_chain_entry(chain_index)
    }

    fn store_certificate(&self, certificate: CertificateDer<'static>) -> Result<(), TrustStoreError> {
        let _guard = lock_store_files();
        let mut store = TrustStore::load(&self.config.store_path, &self.config.passphrase)?;
        store.set_certificate_entry(&self.host, certificate);
        store.save(&self.config.store_path, &self.config.passphrase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(Option<CertificateChain>);

    impl ChainProbe for FixedProbe {
        async fn capture(&self, _host: &str, _port: u16, _limit: Duration) -> Option<CertificateChain> {
            self.0.clone()
        }
    }

    fn cert(name: &str) -> CertificateDer<'static> {
        rcgen::generate_simple_self_signed(vec![name.to_string()])
            .unwrap()
            .cert
            .der()
            .clone()
    }

    fn capture_with(
        chain: Option<CertificateChain>,
        dir: &tempfile::TempDir,
    ) -> TrustCapture<FixedProbe> {
        let config = TrustConfig::default().with_store_path(dir.path().join("trustcerts"));
        TrustCapture::with_probe("secure.example", 443, config, Arc::new(FixedProbe(chain)))
    }

    #[tokio::test]
    async fn installs_selected_certificate_under_host_alias() {
        let dir = tempfile::tempdir().unwrap();
        let leaf = cert("secure.example");
        let issuer = cert("issuer.example");
        let capture = capture_with(Some(vec![leaf, issuer.clone()]), &dir);

        assert!(capture.install_certificate(1).await);
        let store = TrustStore::load(&dir.path().join("trustcerts"), "changeit").unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.certificate("secure.example"), Some(&issuer));
    }

    #[tokio::test]
    async fn out_of_range_index_is_not_installed() {
        let dir = tempfile::tempdir().unwrap();
        let capture = capture_with(Some(vec![cert("secure.example")]), &dir);
        assert_eq!(capture.capture_chain().await.map(|c| c.len()), Some(1));
        assert!(!capture.install_chain_entry(3));
        assert!(!dir.path().join("trustcerts").exists());
    }

    #[tokio::test]
    async fn nothing_captured_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let capture = capture_with(None, &dir);
        assert!(!capture.install_chain_entry(0));
        assert!(!capture.install_certificate(0).await);
        assert!(capture.certificates_chain().is_none());
    }

    #[tokio::test]
    async fn unreadable_store_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trustcerts");
        TrustStore::new().save(&path, "another-passphrase").unwrap();
        let capture = capture_with(Some(vec![cert("secure.example")]), &dir);
        assert!(!capture.install_certificate(0).await);
    }

    #[tokio::test]
    async fn unreachable_host_captures_nothing() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let probe = TlsProbe::new(TrustPolicy::Validate);
        let chain = probe
            .capture("127.0.0.1", port, Duration::from_millis(500))
            .await;
        assert!(chain.is_none());
    }
}
