/*
 * mod.rs
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

//! TLS trust capture: record a server's chain, persist a certificate, cache per host.

pub mod capture;
pub mod registry;
pub mod store;
pub mod verifier;

pub use capture::{ChainProbe, TlsProbe, TrustCapture};
pub use registry::{target_identity, CertificateRegistry, RegistryEntry};
pub use store::{TrustEntry, TrustStore};
pub use verifier::{CapturingVerifier, CertificateChain, TrustPolicy};
