/*
 * client.rs
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

//! Asynchronous HTTP client: submit a built request, get back a pollable `AsyncRequest`.

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::config::RequestOptions;
use crate::error::RequestError;
use crate::executor::AsyncRequest;
use crate::http::connection::HttpTransport;
use crate::http::request::Request;
use crate::trust::CertificateRegistry;

/// Client bound to a runtime. Create with `AsyncClient::new(handle)`, optionally attach a
/// certificate registry so `https` hosts are captured and trusted on first use.
#[derive(Clone)]
pub struct AsyncClient {
    runtime: Handle,
    options: RequestOptions,
    registry: Option<Arc<CertificateRegistry>>,
}

impl AsyncClient {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            options: RequestOptions::default(),
            registry: None,
        }
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_registry(mut self, registry: Arc<CertificateRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn registry(&self) -> Option<&Arc<CertificateRegistry>> {
        self.registry.as_ref()
    }

    /// Start `request` on a background task and return its handle immediately.
    pub fn send_async(&self, request: Request) -> Result<AsyncRequest, RequestError> {
        let transport = HttpTransport::new(self.options.clone(), self.registry.clone());
        let handle =
            AsyncRequest::new(request).with_shutdown_timeout(self.options.shutdown_timeout);
        handle.start(&self.runtime, transport)?;
        Ok(handle)
    }
}
