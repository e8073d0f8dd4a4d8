/*
 * assembler.rs
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

//! Response assembly: find the header/body boundary in a chunked byte stream and
//! accumulate the body into a buffer that other threads poll and drain.
//!
//! Bytes before the boundary are held in a pending buffer and searched as a whole, so a
//! `CR LF CR LF` split across any number of chunks is still found. Once the boundary is
//! seen, body bytes are decoded as UTF-8 (a character split across chunks is carried over)
//! and appended to the shared `ResponseAccumulator`; each decoded character count is
//! recorded on the `ThroughputMeter`.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::error::RequestError;
use crate::http::head::{Headers, ResponseHead};
use crate::meter::ThroughputMeter;

/// Separates the header block from the body.
pub const BOUNDARY: &[u8; 4] = b"\r\n\r\n";

/// Returned by status queries before a status line has been seen.
pub const NO_STATUS: i32 = -1;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Default)]
struct BodyBuffer {
    text: String,
    chars: usize,
}

/// State shared between the assembling task and pollers.
///
/// The body, the head and the failure each have their own lock; the throughput samples
/// live in the `ThroughputMeter` under yet another.
#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    body: Mutex<BodyBuffer>,
    head: Mutex<Option<ResponseHead>>,
    complete: AtomicBool,
    failure: Mutex<Option<Arc<RequestError>>>,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current body. With `truncate`, the returned text is removed from the buffer in the
    /// same critical section as the read, so no text is ever handed out twice.
    pub fn poll_buffer(&self, truncate: bool) -> String {
        let mut body = lock(&self.body);
        if truncate {
            body.chars = 0;
            mem::take(&mut body.text)
        } else {
            body.text.clone()
        }
    }

    /// Buffered body length in characters.
    pub fn buffer_len(&self) -> usize {
        lock(&self.body).chars
    }

    pub fn status(&self) -> Option<u16> {
        lock(&self.head).as_ref().map(|h| h.status)
    }

    /// Status code, or `NO_STATUS` before the head has been recorded.
    pub fn poll_status_code(&self) -> i32 {
        self.status().map(i32::from).unwrap_or(NO_STATUS)
    }

    pub fn head(&self) -> Option<ResponseHead> {
        lock(&self.head).clone()
    }

    pub fn headers(&self) -> Option<Headers> {
        lock(&self.head).as_ref().map(|h| h.headers.clone())
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn failure(&self) -> Option<Arc<RequestError>> {
        lock(&self.failure).clone()
    }

    /// Keep the first failure; later ones are dropped.
    pub(crate) fn set_failure(&self, error: RequestError) {
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            *failure = Some(Arc::new(error));
        }
    }

    fn record_head(&self, head: ResponseHead) -> bool {
        let mut slot = lock(&self.head);
        if slot.is_some() {
            return false;
        }
        *slot = Some(head);
        true
    }

    fn append(&self, text: &str, chars: usize) {
        let mut body = lock(&self.body);
        body.text.push_str(text);
        body.chars += chars;
    }

    fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }
}

enum ScanState {
    AwaitingBoundary {
        pending: BytesMut,
        /// Bytes of `pending` already searched.
        scanned: usize,
    },
    StreamingBody,
}

/// Incremental UTF-8 decoding; an incomplete trailing sequence waits for the next chunk.
#[derive(Debug, Default)]
struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, input: &[u8]) -> String {
        let mut bytes = mem::take(&mut self.carry);
        bytes.extend_from_slice(input);
        let mut out = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + bad..];
                        }
                        None => {
                            self.carry = rest[valid..].to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Whatever is still carried is a truncated sequence.
    fn finish(&mut self) -> String {
        if self.carry.is_empty() {
            return String::new();
        }
        let carry = mem::take(&mut self.carry);
        String::from_utf8_lossy(&carry).into_owned()
    }
}

/// Drives one response into a `ResponseAccumulator`. Owned by a single task; `on_chunk` is
/// never called concurrently with itself.
pub struct ResponseAssembler {
    accumulator: Arc<ResponseAccumulator>,
    meter: Arc<ThroughputMeter>,
    state: ScanState,
    decoder: Utf8Decoder,
    expected_len: Option<u64>,
    received_len: u64,
}

impl ResponseAssembler {
    pub fn new(accumulator: Arc<ResponseAccumulator>, meter: Arc<ThroughputMeter>) -> Self {
        Self {
            accumulator,
            meter,
            state: ScanState::AwaitingBoundary {
                pending: BytesMut::new(),
                scanned: 0,
            },
            decoder: Utf8Decoder::default(),
            expected_len: None,
            received_len: 0,
        }
    }

    pub fn accumulator(&self) -> &Arc<ResponseAccumulator> {
        &self.accumulator
    }

    /// Record status and headers. Only the first call has any effect.
    pub fn start(&mut self, head: ResponseHead) {
        let expected = head.content_length();
        let status = head.status;
        if self.accumulator.record_head(head) {
            debug!(status, content_length = ?expected, "response head received");
            self.expected_len = expected;
        }
    }

    /// Feed the next piece of the response. `is_final` marks the end of the stream.
    pub fn on_chunk(&mut self, data: &[u8], is_final: bool) {
        match &mut self.state {
            ScanState::StreamingBody => self.push_body(data),
            ScanState::AwaitingBoundary { pending, scanned } => {
                pending.extend_from_slice(data);
                // A boundary may begin up to three bytes before the unsearched tail.
                let from = scanned.saturating_sub(BOUNDARY.len() - 1);
                match find_boundary(&pending[from..]) {
                    Some(offset) => {
                        let at = from + offset;
                        let mut preamble = mem::take(pending);
                        let body = preamble.split_off(at + BOUNDARY.len());
                        preamble.truncate(at);
                        self.state = ScanState::StreamingBody;
                        self.on_boundary(&preamble);
                        self.push_body(&body);
                    }
                    None => *scanned = pending.len(),
                }
            }
        }
        if is_final {
            self.finish();
        }
    }

    /// The recorded head, if any. May be called any number of times.
    pub fn build_result(&self) -> Option<ResponseHead> {
        self.accumulator.head()
    }

    /// True once the stream ended or a declared Content-Length has been received in full.
    pub fn is_complete(&self) -> bool {
        self.accumulator.is_complete()
    }

    pub fn is_streaming_body(&self) -> bool {
        matches!(self.state, ScanState::StreamingBody)
    }

    fn on_boundary(&mut self, preamble: &[u8]) {
        match ResponseHead::parse(preamble) {
            Some(head) => self.start(head),
            None => debug!(length = preamble.len(), "unparseable response head"),
        }
    }

    fn push_body(&mut self, data: &[u8]) {
        if self.accumulator.is_complete() {
            return;
        }
        // Bytes past a declared Content-Length are not part of this response.
        let data = match self.expected_len {
            Some(expected) => {
                let remaining = expected.saturating_sub(self.received_len);
                let keep = usize::try_from(remaining).unwrap_or(usize::MAX);
                &data[..data.len().min(keep)]
            }
            None => data,
        };
        if !data.is_empty() {
            self.received_len += data.len() as u64;
            let text = self.decoder.decode(data);
            self.emit(&text);
        }
        if let Some(expected) = self.expected_len {
            if self.received_len >= expected {
                self.finish();
            }
        }
    }

    fn emit(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let chars = text.chars().count();
        trace!(chars, "body text");
        self.accumulator.append(text, chars);
        self.meter.record(chars as u64);
    }

    fn finish(&mut self) {
        if self.accumulator.is_complete() {
            return;
        }
        if let ScanState::AwaitingBoundary { pending, .. } =
            mem::replace(&mut self.state, ScanState::StreamingBody)
        {
            debug!(pending = pending.len(), "stream ended before header/body boundary");
            // Headers never terminated: keep the status if there is one, body stays empty.
            if let Some(head) = ResponseHead::parse(&pending) {
                self.start(head);
            }
        }
        let tail = self.decoder.finish();
        self.emit(&tail);
        self.accumulator.mark_complete();
    }
}

fn find_boundary(haystack: &[u8]) -> Option<usize> {
    haystack.windows(BOUNDARY.len()).position(|w| w == BOUNDARY)
}
