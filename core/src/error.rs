/*
 * error.rs
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

//! Request and trust-store errors.

use std::io;
use std::time::Duration;

/// Errors from an asynchronous request: URL, connect, TLS, read, lifecycle.
///
/// Errors raised on the background task are never returned to the submitting
/// thread; they are stored on the request and read with `AsyncRequest::failure`.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("URL has no host: {0}")]
    MissingHost(String),

    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("connect to {host}:{port} timed out after {timeout:?}")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout: Duration,
    },

    #[error("no data received for {0:?}")]
    ReadTimeout(Duration),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("transport not open")]
    NotOpen,

    #[error("request already started")]
    AlreadyStarted,

    #[error("request was cancelled before it started")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors reading or writing the local trust-store file.
///
/// `TrustCapture::install_chain_entry` turns these into a `false` return; they are
/// only surfaced directly by `TrustStore::load` / `TrustStore::save`.
#[derive(Debug, thiserror::Error)]
pub enum TrustStoreError {
    #[error("trust store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("trust store decryption failed (wrong passphrase or tampered file)")]
    Decrypt,

    #[error("trust store encryption failed")]
    Encrypt,

    #[error("invalid trust store: {0}")]
    Format(String),

    #[error("trust store XML error: {0}")]
    Xml(String),

    #[error("random source unavailable: {0}")]
    Random(String),
}
