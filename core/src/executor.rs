/*
 * executor.rs
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

//! Asynchronous request execution with a polling surface.
//!
//! `AsyncRequest::start` spawns one task that opens the transport, feeds every chunk to a
//! `ResponseAssembler` and records the outcome. The caller polls status, body, failure and
//! throughput from any thread; nothing raised on the task reaches the caller except through
//! `failure()`. Cancellation is cooperative: it wakes the task at its next await point.
//! The transport is closed exactly once on every path, bounded by the shutdown timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use crate::assembler::{ResponseAccumulator, ResponseAssembler};
use crate::error::RequestError;
use crate::http::head::{Headers, ResponseHead};
use crate::http::request::Request;
use crate::http::transport::Transport;
use crate::meter::{RateWindow, ThroughputMeter};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of an asynchronous request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }
}

struct Shared {
    accumulator: Arc<ResponseAccumulator>,
    meter: Arc<ThroughputMeter>,
    state: watch::Sender<RequestState>,
    cancelled: AtomicBool,
    cancel: Notify,
}

enum Finish {
    Completed,
    Cancelled,
}

/// One outstanding request and the state its background task publishes.
pub struct AsyncRequest {
    url: Url,
    request: Mutex<Option<Request>>,
    shutdown_timeout: Duration,
    shared: Arc<Shared>,
}

impl AsyncRequest {
    pub fn new(request: Request) -> Self {
        let (state, _) = watch::channel(RequestState::Created);
        Self {
            url: request.url.clone(),
            request: Mutex::new(Some(request)),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            shared: Arc::new(Shared {
                accumulator: Arc::new(ResponseAccumulator::new()),
                meter: Arc::new(ThroughputMeter::new()),
                state,
                cancelled: AtomicBool::new(false),
                cancel: Notify::new(),
            }),
        }
    }

    /// How long the task waits for the transport to close. Running out is not a failure.
    pub fn with_shutdown_timeout(mut self, limit: Duration) -> Self {
        self.shutdown_timeout = limit;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Spawn the background task on `runtime`. Errors only for a second start or a request
    /// cancelled before it started; everything after that is reported through polling.
    pub fn start<T: Transport>(&self, runtime: &Handle, transport: T) -> Result<(), RequestError> {
        let request = match self.request.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
        .ok_or(RequestError::AlreadyStarted)?;
        if self.shared.cancelled.load(Ordering::Acquire) {
            self.shared.state.send_replace(RequestState::Cancelled);
            return Err(RequestError::Cancelled);
        }
        self.shared.state.send_replace(RequestState::Running);
        info!(method = request.method.as_str(), url = %self.url, "request started");
        runtime.spawn(run(
            self.shared.clone(),
            request,
            transport,
            self.shutdown_timeout,
        ));
        Ok(())
    }

    /// Ask the task to stop and release the transport. Has no effect once finished.
    pub fn cancel(&self) {
        if self.shared.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(url = %self.url, "cancel requested");
        self.shared.cancel.notify_one();
        self.shared.state.send_if_modified(|state| {
            if *state == RequestState::Created {
                *state = RequestState::Cancelled;
                true
            } else {
                false
            }
        });
    }

    pub fn shutdown(&self) {
        self.cancel();
    }

    pub fn state(&self) -> RequestState {
        *self.shared.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RequestState::Running
    }

    pub fn is_failed(&self) -> bool {
        self.state() == RequestState::Failed
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == RequestState::Cancelled
    }

    pub fn failure(&self) -> Option<Arc<RequestError>> {
        self.shared.accumulator.failure()
    }

    /// Status code, or -1 before the head has arrived.
    pub fn poll_status_code(&self) -> i32 {
        self.shared.accumulator.poll_status_code()
    }

    pub fn status(&self) -> Option<u16> {
        self.shared.accumulator.status()
    }

    pub fn response_head(&self) -> Option<ResponseHead> {
        self.shared.accumulator.head()
    }

    pub fn headers(&self) -> Option<Headers> {
        self.shared.accumulator.headers()
    }

    /// Body received so far; `truncate` drains it.
    pub fn poll_buffer(&self, truncate: bool) -> String {
        self.shared.accumulator.poll_buffer(truncate)
    }

    /// Buffered body length in characters.
    pub fn buffer_len(&self) -> usize {
        self.shared.accumulator.buffer_len()
    }

    pub fn rate(&self, window: RateWindow) -> u64 {
        self.shared.meter.rate(window)
    }

    pub fn rate_1_second(&self) -> u64 {
        self.rate(RateWindow::OneSecond)
    }

    pub fn rate_5_seconds(&self) -> u64 {
        self.rate(RateWindow::FiveSeconds)
    }

    pub fn rate_30_seconds(&self) -> u64 {
        self.rate(RateWindow::ThirtySeconds)
    }

    pub fn rate_1_minute(&self) -> u64 {
        self.rate(RateWindow::OneMinute)
    }

    /// Wait for a terminal state. Never resolves for a request that is never started.
    pub async fn finished(&self) -> RequestState {
        let mut rx = self.shared.state.subscribe();
        let result = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        match result {
            Ok(state) => state,
            Err(_) => self.state(),
        }
    }
}

impl Drop for AsyncRequest {
    fn drop(&mut self) {
        if self.is_running() {
            self.cancel();
        }
    }
}

async fn run<T: Transport>(
    shared: Arc<Shared>,
    request: Request,
    mut transport: T,
    shutdown_timeout: Duration,
) {
    let mut assembler = ResponseAssembler::new(shared.accumulator.clone(), shared.meter.clone());
    let outcome = drive(&shared, &request, &mut transport, &mut assembler).await;

    if timeout(shutdown_timeout, transport.close()).await.is_err() {
        warn!(url = %request.url, ?shutdown_timeout, "transport did not close in time; abandoning it");
    }

    let state = match outcome {
        Ok(Finish::Completed) => {
            debug!(url = %request.url, status = shared.accumulator.poll_status_code(), "request completed");
            RequestState::Completed
        }
        Ok(Finish::Cancelled) => {
            debug!(url = %request.url, "request cancelled");
            RequestState::Cancelled
        }
        Err(e) => {
            warn!(url = %request.url, error = %e, "request failed");
            shared.accumulator.set_failure(e);
            RequestState::Failed
        }
    };
    shared.state.send_replace(state);
}

async fn drive<T: Transport>(
    shared: &Shared,
    request: &Request,
    transport: &mut T,
    assembler: &mut ResponseAssembler,
) -> Result<Finish, RequestError> {
    tokio::select! {
        biased;
        _ = shared.cancel.notified() => return Ok(Finish::Cancelled),
        opened = transport.open(request) => opened?,
    }
    loop {
        if shared.cancelled.load(Ordering::Acquire) {
            return Ok(Finish::Cancelled);
        }
        let chunk = tokio::select! {
            biased;
            _ = shared.cancel.notified() => return Ok(Finish::Cancelled),
            chunk = transport.next_chunk() => chunk?,
        };
        match chunk {
            Some(data) => {
                assembler.on_chunk(&data, false);
                if assembler.is_complete() {
                    return Ok(Finish::Completed);
                }
            }
            None => {
                assembler.on_chunk(&[], true);
                return Ok(Finish::Completed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    type Script = mpsc::UnboundedSender<Result<Bytes, RequestError>>;

    struct ScriptedTransport {
        chunks: mpsc::UnboundedReceiver<Result<Bytes, RequestError>>,
        fail_open: bool,
        hang_on_close: bool,
        closes: Arc<AtomicUsize>,
    }

    impl Transport for ScriptedTransport {
        async fn open(&mut self, _request: &Request) -> Result<(), RequestError> {
            if self.fail_open {
                return Err(RequestError::Tls("handshake refused".into()));
            }
            Ok(())
        }

        async fn next_chunk(&mut self) -> Result<Option<Bytes>, RequestError> {
            match self.chunks.recv().await {
                Some(Ok(data)) => Ok(Some(data)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        }

        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.hang_on_close {
                std::future::pending::<()>().await;
            }
        }
    }

    fn scripted() -> (ScriptedTransport, Script, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let transport = ScriptedTransport {
            chunks: rx,
            fail_open: false,
            hang_on_close: false,
            closes: closes.clone(),
        };
        (transport, tx, closes)
    }

    fn send(script: &Script, data: &'static str) {
        script.send(Ok(Bytes::from_static(data.as_bytes()))).unwrap();
    }

    fn request() -> AsyncRequest {
        AsyncRequest::new(Request::get("http://example.test/stream").unwrap())
    }

    async fn finished_within(request: &AsyncRequest, limit: Duration) -> RequestState {
        timeout(limit, request.finished())
            .await
            .expect("request did not finish in time")
    }

    #[tokio::test]
    async fn completes_at_end_of_stream() {
        let (transport, script, closes) = scripted();
        let request = request();
        assert_eq!(request.poll_status_code(), -1);
        request.start(&Handle::current(), transport).unwrap();
        send(&script, "HTTP/1.1 200 OK\r\nX-Test: yes\r");
        send(&script, "\n\r\nbody");
        drop(script);

        assert_eq!(
            finished_within(&request, Duration::from_secs(5)).await,
            RequestState::Completed
        );
        assert_eq!(request.poll_status_code(), 200);
        assert_eq!(request.poll_buffer(false), "body");
        assert_eq!(request.buffer_len(), 4);
        assert_eq!(request.headers().unwrap().get("x-test"), Some("yes"));
        assert!(!request.is_running());
        assert!(!request.is_failed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_stops_idle_request() {
        let (transport, script, closes) = scripted();
        let request = request();
        request.start(&Handle::current(), transport).unwrap();
        send(&script, "HTTP/1.1 200 OK\r\n\r\npartial");
        while request.buffer_len() < 7 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(request.is_running());

        request.cancel();
        assert_eq!(
            finished_within(&request, Duration::from_secs(1)).await,
            RequestState::Cancelled
        );
        assert!(!request.is_running());
        assert!(request.failure().is_none());
        assert_eq!(request.poll_buffer(true), "partial");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        drop(script);
    }

    #[tokio::test]
    async fn transport_error_is_captured_not_raised() {
        let (transport, script, closes) = scripted();
        let request = request();
        request.start(&Handle::current(), transport).unwrap();
        send(&script, "HTTP/1.1 200 OK\r\n\r\nsome");
        script
            .send(Err(RequestError::ReadTimeout(Duration::from_secs(1))))
            .unwrap();

        assert_eq!(
            finished_within(&request, Duration::from_secs(5)).await,
            RequestState::Failed
        );
        assert!(request.is_failed());
        assert!(matches!(
            request.failure().as_deref(),
            Some(RequestError::ReadTimeout(_))
        ));
        assert_eq!(request.poll_buffer(false), "some");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn open_failure_still_closes_transport() {
        let (mut transport, _script, closes) = scripted();
        transport.fail_open = true;
        let request = request();
        request.start(&Handle::current(), transport).unwrap();
        assert_eq!(
            finished_within(&request, Duration::from_secs(5)).await,
            RequestState::Failed
        );
        assert!(matches!(request.failure().as_deref(), Some(RequestError::Tls(_))));
        assert_eq!(request.poll_status_code(), -1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hung_close_is_abandoned_after_shutdown_timeout() {
        let (mut transport, script, closes) = scripted();
        transport.hang_on_close = true;
        let request = request().with_shutdown_timeout(Duration::from_millis(50));
        request.start(&Handle::current(), transport).unwrap();
        send(&script, "HTTP/1.1 204 No Content\r\n\r\n");
        drop(script);
        assert_eq!(
            finished_within(&request, Duration::from_secs(5)).await,
            RequestState::Completed
        );
        assert!(request.failure().is_none());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn content_length_completes_while_connection_stays_open() {
        let (transport, script, _closes) = scripted();
        let request = request();
        request.start(&Handle::current(), transport).unwrap();
        send(&script, "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
        assert_eq!(
            finished_within(&request, Duration::from_secs(5)).await,
            RequestState::Completed
        );
        assert_eq!(request.poll_buffer(false), "ok");
        drop(script);
    }

    #[tokio::test]
    async fn zero_content_length_completes_while_connection_stays_open() {
        let (transport, script, closes) = scripted();
        let request = request();
        request.start(&Handle::current(), transport).unwrap();
        send(&script, "HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(
            finished_within(&request, Duration::from_secs(2)).await,
            RequestState::Completed
        );
        assert_eq!(request.poll_status_code(), 204);
        assert_eq!(request.buffer_len(), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        drop(script);
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (first, _a, _) = scripted();
        let (second, _b, closes) = scripted();
        let request = request();
        request.start(&Handle::current(), first).unwrap();
        let err = request.start(&Handle::current(), second).unwrap_err();
        assert!(matches!(err, RequestError::AlreadyStarted));
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        request.cancel();
    }

    #[tokio::test]
    async fn cancel_before_start() {
        let (transport, _script, closes) = scripted();
        let request = request();
        request.cancel();
        assert_eq!(request.state(), RequestState::Cancelled);
        let err = request.start(&Handle::current(), transport).unwrap_err();
        assert!(matches!(err, RequestError::Cancelled));
        assert!(!request.is_running());
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rates_reflect_body_characters() {
        let (transport, script, _) = scripted();
        let request = request();
        request.start(&Handle::current(), transport).unwrap();
        send(&script, "HTTP/1.1 200 OK\r\n\r\n0123456789");
        drop(script);
        finished_within(&request, Duration::from_secs(5)).await;
        assert_eq!(request.rate_1_second(), 10);
        assert_eq!(request.rate_5_seconds(), 2);
        assert_eq!(request.rate_30_seconds(), 0);
        assert_eq!(request.rate_1_minute(), 0);
    }
}
