/*
 * lib.rs
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

//! Pollhttp core: pollable asynchronous HTTP requests with sliding-window throughput,
//! and TLS certificate capture into a local trust store.
//!
//! Start a request with `AsyncClient::send_async`, then poll the returned `AsyncRequest`
//! (status, body, failure, rates) from any thread. Attach a `CertificateRegistry` to
//! capture and trust each `https` host's certificate on first contact.

pub mod assembler;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod meter;
pub mod net;
pub mod trust;

pub use assembler::{ResponseAccumulator, ResponseAssembler};
pub use client::AsyncClient;
pub use config::{RequestOptions, TrustConfig};
pub use error::{RequestError, TrustStoreError};
pub use executor::{AsyncRequest, RequestState};
pub use http::{Method, Request, ResponseHead, Transport};
pub use meter::{RateWindow, ThroughputMeter};
pub use trust::{CertificateRegistry, TrustCapture, TrustPolicy, TrustStore};
