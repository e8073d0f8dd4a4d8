/*
 * verifier.rs
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

//! Certificate verifier that records the chain a server presents.
//!
//! The chain is stored before the wrapped webpki verifier runs, so it is available
//! whether validation succeeds or fails. `TrustPolicy` decides what the handshake sees:
//! the real validation result, or an unconditional accept (insecure capture mode).

use std::sync::{Arc, Mutex};

use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use tokio_rustls::rustls::{DigitallySignedStruct, DistinguishedName, Error, SignatureScheme};
use tracing::debug;

use crate::net::{build_root_store, crypto_provider};

/// What the capture handshake does with an untrusted chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustPolicy {
    /// Report the wrapped verifier's result. An untrusted chain aborts the handshake,
    /// but it has already been recorded.
    #[default]
    Validate,
    /// Insecure capture mode: accept any chain once it has been recorded.
    AcceptAfterCapture,
}

/// Leaf-first chain presented by a server.
pub type CertificateChain = Vec<CertificateDer<'static>>;

/// Wraps the default webpki verifier and keeps the most recent presented chain.
#[derive(Debug)]
pub struct CapturingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    policy: TrustPolicy,
    chain: Mutex<Option<CertificateChain>>,
}

impl CapturingVerifier {
    /// Wrap a webpki verifier over the system roots plus `extra`.
    pub fn new(extra: &[CertificateDer<'static>], policy: TrustPolicy) -> Result<Self, Error> {
        let roots = Arc::new(build_root_store(extra));
        let inner = WebPkiServerVerifier::builder_with_provider(roots, crypto_provider())
            .build()
            .map_err(|e| Error::General(e.to_string()))?;
        Ok(Self::wrap(inner, policy))
    }

    pub fn wrap(inner: Arc<WebPkiServerVerifier>, policy: TrustPolicy) -> Self {
        Self {
            inner,
            policy,
            chain: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> TrustPolicy {
        self.policy
    }

    /// Chain recorded by the last server-certificate check, if any.
    pub fn captured_chain(&self) -> Option<CertificateChain> {
        self.chain.lock().ok().and_then(|c| c.clone())
    }

    fn record(&self, end_entity: &CertificateDer<'_>, intermediates: &[CertificateDer<'_>]) {
        let mut chain = Vec::with_capacity(1 + intermediates.len());
        chain.push(end_entity.clone().into_owned());
        chain.extend(intermediates.iter().map(|c| c.clone().into_owned()));
        debug!(length = chain.len(), "recorded presented certificate chain");
        if let Ok(mut slot) = self.chain.lock() {
            *slot = Some(chain);
        }
    }
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        self.record(end_entity, intermediates);
        let result =
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now);
        match (result, self.policy) {
            (Ok(verified), _) => Ok(verified),
            (Err(e), TrustPolicy::AcceptAfterCapture) => {
                debug!(error = %e, "accepting untrusted chain in capture mode");
                Ok(ServerCertVerified::assertion())
            }
            (Err(e), TrustPolicy::Validate) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Capture never presents or checks client certificates; reaching this is a usage error.
impl ClientCertVerifier for CapturingVerifier {
    fn offer_client_auth(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, Error> {
        Err(Error::General(
            "client certificate verification is not supported by the capturing verifier".into(),
        ))
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        Err(Error::General(
            "client signature verification is not supported by the capturing verifier".into(),
        ))
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        Err(Error::General(
            "client signature verification is not supported by the capturing verifier".into(),
        ))
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
