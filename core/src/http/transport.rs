/*
 * transport.rs
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

//! Transport seam between the request task and the network.
//!
//! A transport sends one request and yields the raw response (status line, headers,
//! boundary, body) as a sequence of byte chunks. The background task owns it
//! exclusively and calls `close` exactly once, whatever way the request ends.

use std::future::Future;

use bytes::Bytes;

use crate::error::RequestError;
use crate::http::request::Request;

pub trait Transport: Send + 'static {
    /// Connect and write the request.
    fn open(&mut self, request: &Request) -> impl Future<Output = Result<(), RequestError>> + Send;

    /// Next piece of the response, in arrival order. `Ok(None)` at end of stream.
    fn next_chunk(&mut self) -> impl Future<Output = Result<Option<Bytes>, RequestError>> + Send;

    /// Release the connection. Called once; must tolerate a transport that never opened.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}
