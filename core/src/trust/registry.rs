/*
 * registry.rs
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

//! Per-host certificate registry: capture and install at most once per host.
//!
//! Each host gets its own `OnceCell`. The map lock is only held to find or create the
//! cell, so installs for different hosts run in parallel while concurrent callers for
//! the same host wait on one attempt. The outcome (installed or not) is kept for the
//! life of the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::ClientConfig;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{TrustConfig, HTTPS_PORT};
use crate::error::RequestError;
use crate::net::http_client_config;
use crate::trust::capture::{ChainProbe, TlsProbe, TrustCapture};
use crate::trust::store::{lock_store_files, TrustStore};
use crate::trust::verifier::CertificateChain;

/// Outcome of the capture and install attempt for one host.
#[derive(Debug)]
pub struct RegistryEntry {
    pub host: String,
    pub port: u16,
    /// Chain presented during capture, if any.
    pub chain: Option<CertificateChain>,
    /// Whether the selected certificate was written to the trust store.
    pub installed: bool,
    /// Client config over the system roots plus the trust store as it was after the attempt.
    pub tls_config: Arc<ClientConfig>,
}

type EntryCell = Arc<OnceCell<Arc<RegistryEntry>>>;

pub struct CertificateRegistry<P: ChainProbe = TlsProbe> {
    config: TrustConfig,
    probe: Arc<P>,
    entries: Mutex<HashMap<String, EntryCell>>,
}

impl CertificateRegistry<TlsProbe> {
    pub fn new(config: TrustConfig) -> Self {
        let probe = TlsProbe::new(config.policy);
        Self::with_probe(config, probe)
    }
}

impl<P: ChainProbe> CertificateRegistry<P> {
    pub fn with_probe(config: TrustConfig, probe: P) -> Self {
        Self {
            config,
            probe: Arc::new(probe),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    /// Capture and install for the URL's host unless already done; returns the host's entry.
    pub async fn ensure_installed(&self, url: &Url) -> Result<Arc<RegistryEntry>, RequestError> {
        let (host, port) = target_identity(url)?;
        let cell = self.cell(&host);
        let entry = cell
            .get_or_try_init(|| self.install(host.clone(), port))
            .await?;
        Ok(entry.clone())
    }

    /// Cached entry for the URL's host, without any network or file work.
    pub fn entry_for(&self, url: &Url) -> Option<Arc<RegistryEntry>> {
        let (host, _) = target_identity(url).ok()?;
        let entries = self.entries.lock().ok()?;
        entries.get(&host).and_then(|cell| cell.get().cloned())
    }

    /// Number of hosts with a completed attempt.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|e| e.values().filter(|c| c.initialized()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell(&self, host: &str) -> EntryCell {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.entry(host.to_string()).or_default().clone()
    }

    async fn install(&self, host: String, port: u16) -> Result<Arc<RegistryEntry>, RequestError> {
        debug!(host = %host, port, "no registry entry, capturing certificate");
        let capture =
            TrustCapture::with_probe(host.clone(), port, self.config.clone(), self.probe.clone());
        let installed = capture.install_certificate(self.config.chain_index).await;
        if installed {
            info!(host = %host, "certificate installed for host");
        } else {
            warn!(host = %host, "certificate capture or install failed; outcome cached");
        }
        let tls_config = http_client_config(&self.trusted_certificates())?;
        Ok(Arc::new(RegistryEntry {
            host,
            port,
            chain: capture.certificates_chain(),
            installed,
            tls_config,
        }))
    }

    fn trusted_certificates(&self) -> Vec<CertificateDer<'static>> {
        let _guard = lock_store_files();
        match TrustStore::load(&self.config.store_path, &self.config.passphrase) {
            Ok(store) => store.certificates(),
            Err(e) => {
                warn!(error = %e, "cannot read trust store; using system roots only");
                Vec::new()
            }
        }
    }
}

/// Host identity (lowercased host) and handshake port (URL port, else 443).
pub fn target_identity(url: &Url) -> Result<(String, u16), RequestError> {
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| RequestError::MissingHost(url.to_string()))?
        .to_ascii_lowercase();
    // The capture is always a TLS handshake, whatever the scheme.
    let port = url.port().unwrap_or(HTTPS_PORT);
    Ok((host, port))
}
