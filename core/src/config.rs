/*
 * config.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Pollhttp.
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

//! Configuration for certificate capture and asynchronous requests.
//!
//! `TrustConfig` locates the local trust-store file and controls the capture handshake.
//! `RequestOptions` holds the caller-supplied timeouts for background request tasks.
//! Both have defaults; `TrustConfig::from_env` lets deployments move the store file or
//! change its passphrase without code changes.

use std::path::PathBuf;
use std::time::Duration;

use crate::trust::TrustPolicy;

/// Trust-store file name, relative to the working directory unless overridden.
pub const DEFAULT_TRUST_STORE_FILE: &str = "trustcerts";

/// Passphrase protecting the trust-store file unless overridden.
pub const DEFAULT_PASSPHRASE: &str = "changeit";

/// Port used for the capture handshake when the URL does not name one.
pub const HTTPS_PORT: u16 = 443;

/// Socket timeout for the capture handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(10_000);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment variable overriding the trust-store path.
pub const ENV_TRUST_STORE: &str = "POLLHTTP_TRUST_STORE";
/// Environment variable overriding the trust-store passphrase.
pub const ENV_TRUST_PASSPHRASE: &str = "POLLHTTP_TRUST_PASSPHRASE";

/// Where captured certificates are persisted and how the capture handshake behaves.
#[derive(Debug, Clone)]
pub struct TrustConfig {
    /// Trust-store file.
    pub store_path: PathBuf,
    /// Passphrase the store file is encrypted with.
    pub passphrase: String,
    /// Timeout for TCP connect + TLS handshake during capture.
    pub handshake_timeout: Duration,
    /// Which certificate of the presented chain to install (0 = leaf).
    pub chain_index: usize,
    /// Whether the capture handshake may complete for untrusted chains.
    pub policy: TrustPolicy,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(DEFAULT_TRUST_STORE_FILE),
            passphrase: DEFAULT_PASSPHRASE.to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            chain_index: 0,
            policy: TrustPolicy::default(),
        }
    }
}

impl TrustConfig {
    /// Defaults, with `POLLHTTP_TRUST_STORE` and `POLLHTTP_TRUST_PASSPHRASE` applied when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = std::env::var_os(ENV_TRUST_STORE) {
            if !path.is_empty() {
                config.store_path = PathBuf::from(path);
            }
        }
        if let Ok(passphrase) = std::env::var(ENV_TRUST_PASSPHRASE) {
            if !passphrase.is_empty() {
                config.passphrase = passphrase;
            }
        }
        config
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = path.into();
        self
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = passphrase.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_policy(mut self, policy: TrustPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_chain_index(mut self, index: usize) -> Self {
        self.chain_index = index;
        self
    }
}

/// Timeouts for one asynchronous request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// TCP connect (and TLS handshake) deadline.
    pub connect_timeout: Duration,
    /// Maximum wait for the next chunk. `None` waits indefinitely (streaming responses).
    pub read_timeout: Option<Duration>,
    /// How long to wait for the transport to shut down. Exceeding it is not an error.
    pub shutdown_timeout: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = TrustConfig::default();
        assert_eq!(c.passphrase, "changeit");
        assert_eq!(c.handshake_timeout, Duration::from_millis(10_000));
        assert_eq!(c.chain_index, 0);
        assert_eq!(c.policy, TrustPolicy::Validate);
        assert_eq!(c.store_path, PathBuf::from(DEFAULT_TRUST_STORE_FILE));
    }

    #[test]
    fn builders_override_fields() {
        let c = TrustConfig::default()
            .with_store_path("/tmp/store")
            .with_passphrase("secret")
            .with_policy(TrustPolicy::AcceptAfterCapture)
            .with_chain_index(1);
        assert_eq!(c.chain_index, 1);
        assert_eq!(c.store_path, PathBuf::from("/tmp/store"));
        assert_eq!(c.passphrase, "secret");
        assert_eq!(c.policy, TrustPolicy::AcceptAfterCapture);
    }
}
