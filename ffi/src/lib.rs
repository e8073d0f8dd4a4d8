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

//! C FFI for pollhttp core. Requests are identified by a non-zero u64 handle returned by
//! pollhttp_request_start and released with pollhttp_request_free.
//! Returned strings are newly allocated (free with pollhttp_free_string).
//! All string parameters are UTF-8 NUL-terminated.

use libc::{c_char, c_int, size_t};
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use pollhttp_core::config::TrustConfig;
use pollhttp_core::{
    AsyncClient, AsyncRequest, CertificateRegistry, Method, RateWindow, Request, RequestError,
    RequestOptions,
};
use url::Url;

/// Registry of outstanding requests keyed by handle, plus the shared certificate registry.
/// Hosts the shared tokio runtime for all request tasks.
struct Registry {
    runtime: tokio::runtime::Runtime,
    requests: RwLock<HashMap<u64, Arc<AsyncRequest>>>,
    certificates: RwLock<Arc<CertificateRegistry>>,
    options: RwLock<RequestOptions>,
    next_id: AtomicU64,
}

fn registry() -> &'static Registry {
    static REGISTRY: once_cell::sync::OnceCell<Registry> = once_cell::sync::OnceCell::new();
    REGISTRY.get_or_init(|| {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("failed to create tokio runtime");
        Registry {
            runtime,
            requests: RwLock::new(HashMap::new()),
            certificates: RwLock::new(Arc::new(CertificateRegistry::new(TrustConfig::from_env()))),
            options: RwLock::new(RequestOptions::default()),
            next_id: AtomicU64::new(1),
        }
    })
}

fn certificate_registry() -> Arc<CertificateRegistry> {
    match registry().certificates.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn request_options() -> RequestOptions {
    match registry().options.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Apply millisecond timeouts to `options`. Negative keeps the current value; a read
/// timeout of 0 waits indefinitely.
fn apply_timeouts(options: &mut RequestOptions, connect_ms: i64, read_ms: i64, shutdown_ms: i64) {
    if let Ok(ms) = u64::try_from(connect_ms) {
        options.connect_timeout = Duration::from_millis(ms);
    }
    if let Ok(ms) = u64::try_from(read_ms) {
        options.read_timeout = (ms > 0).then(|| Duration::from_millis(ms));
    }
    if let Ok(ms) = u64::try_from(shutdown_ms) {
        options.shutdown_timeout = Duration::from_millis(ms);
    }
}

fn lookup(id: u64) -> Option<Arc<AsyncRequest>> {
    registry().requests.read().ok()?.get(&id).cloned()
}

fn ptr_to_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string()) }
}

/// Newly allocated C string; interior NULs are dropped.
fn to_c_string(s: &str) -> *mut c_char {
    CString::new(s.replace('\0', ""))
        .unwrap_or_default()
        .into_raw()
}

thread_local! {
    static LAST_ERROR: std::cell::RefCell<Option<CString>> = const { std::cell::RefCell::new(None) };
}

fn set_last_error(message: &str) {
    let msg = CString::new(message.replace('\0', "")).unwrap_or_default();
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg));
}

fn set_request_error(err: &RequestError) {
    set_last_error(&err.to_string());
}

fn clear_last_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

/// Parse "Name: value" lines (CRLF or LF separated). Lines without a colon are skipped.
fn parse_header_block(block: &str) -> Vec<(String, String)> {
    block
        .lines()
        .filter_map(|line| {
            let colon = line.find(':')?;
            let name = line[..colon].trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), line[colon + 1..].trim().to_string()))
        })
        .collect()
}

/// Version string (static, do not free).
#[no_mangle]
pub extern "C" fn pollhttp_version() -> *const c_char {
    b"0.1.0\0".as_ptr() as *const c_char
}

/// Last error message from a failed call on this thread. Valid until next FFI call. Do not free.
#[no_mangle]
pub extern "C" fn pollhttp_last_error() -> *const c_char {
    LAST_ERROR.with(|e| {
        e.borrow()
            .as_ref()
            .map(|s| s.as_ptr())
            .unwrap_or(ptr::null())
    })
}

/// Free a string returned by pollhttp_request_poll_buffer or pollhttp_request_failure. No-op if ptr is NULL.
#[no_mangle]
pub unsafe extern "C" fn pollhttp_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        let _ = CString::from_raw(ptr);
    }
}

// ---------- Certificates ----------

/// Use a different trust-store file and/or passphrase (NULL keeps the default for that field).
/// Replaces the certificate registry, so hosts are captured again on next use. Returns 0 on success, -1 on error.
#[no_mangle]
pub extern "C" fn pollhttp_configure_trust_store(path: *const c_char, passphrase: *const c_char) -> c_int {
    clear_last_error();
    let mut config = TrustConfig::from_env();
    if let Some(p) = ptr_to_str(path) {
        config = config.with_store_path(p);
    }
    if let Some(p) = ptr_to_str(passphrase) {
        config = config.with_passphrase(p);
    }
    match registry().certificates.write() {
        Ok(mut guard) => {
            *guard = Arc::new(CertificateRegistry::new(config));
            0
        }
        Err(_) => {
            set_last_error("certificate registry lock poisoned");
            -1
        }
    }
}

/// Capture and install the certificate of the host in url, once per host. Blocks until done.
/// Returns 1 if the certificate is installed, 0 if the attempt failed (cached; not retried), -1 on error.
#[no_mangle]
pub extern "C" fn pollhttp_install_certificate(url: *const c_char) -> c_int {
    clear_last_error();
    let Some(url) = ptr_to_str(url) else {
        set_last_error("url is NULL or not UTF-8");
        return -1;
    };
    let url = match Url::parse(&url) {
        Ok(u) => u,
        Err(e) => {
            set_request_error(&RequestError::InvalidUrl(e));
            return -1;
        }
    };
    let certificates = certificate_registry();
    match registry().runtime.block_on(certificates.ensure_installed(&url)) {
        Ok(entry) if entry.installed => 1,
        Ok(_) => {
            set_last_error("certificate could not be captured or installed");
            0
        }
        Err(e) => {
            set_request_error(&e);
            -1
        }
    }
}

/// 1 if a capture attempt for the host in url has completed and installed a certificate, 0 if
/// it completed without installing, -1 if no attempt has been made (or url is invalid).
#[no_mangle]
pub extern "C" fn pollhttp_certificate_installed(url: *const c_char) -> c_int {
    let Some(url) = ptr_to_str(url).and_then(|u| Url::parse(&u).ok()) else {
        return -1;
    };
    match certificate_registry().entry_for(&url) {
        Some(entry) if entry.installed => 1,
        Some(_) => 0,
        None => -1,
    }
}

// ---------- Requests ----------

/// Timeouts for requests started after this call, in milliseconds. Negative keeps the current
/// value; read_ms 0 waits for the next chunk indefinitely. Returns 0 on success, -1 on error.
#[no_mangle]
pub extern "C" fn pollhttp_configure_timeouts(connect_ms: i64, read_ms: i64, shutdown_ms: i64) -> c_int {
    clear_last_error();
    match registry().options.write() {
        Ok(mut options) => {
            apply_timeouts(&mut options, connect_ms, read_ms, shutdown_ms);
            0
        }
        Err(_) => {
            set_last_error("request options lock poisoned");
            -1
        }
    }
}

/// Start an asynchronous request. method: e.g. "GET" (NULL = GET). headers: "Name: value" lines
/// (NULL = none). body/body_len: request body (NULL = none). capture_certificates: non-zero to
/// capture and trust https hosts on first use. Returns a request handle, or 0 on error.
#[no_mangle]
pub unsafe extern "C" fn pollhttp_request_start(
    method: *const c_char,
    url: *const c_char,
    headers: *const c_char,
    body: *const u8,
    body_len: size_t,
    capture_certificates: c_int,
) -> u64 {
    clear_last_error();
    let method = match ptr_to_str(method) {
        None => Method::Get,
        Some(m) => match Method::parse(&m) {
            Some(m) => m,
            None => {
                set_last_error(&format!("unsupported method: {}", m));
                return 0;
            }
        },
    };
    let Some(url) = ptr_to_str(url) else {
        set_last_error("url is NULL or not UTF-8");
        return 0;
    };
    let mut request = match Request::parse(method, &url) {
        Ok(r) => r,
        Err(e) => {
            set_request_error(&e);
            return 0;
        }
    };
    if let Some(block) = ptr_to_str(headers) {
        for (name, value) in parse_header_block(&block) {
            request.header(name, value);
        }
    }
    if !body.is_null() {
        let data = std::slice::from_raw_parts(body, body_len).to_vec();
        request.body(data);
    }

    let reg = registry();
    let mut client = AsyncClient::new(reg.runtime.handle().clone()).with_options(request_options());
    if capture_certificates != 0 {
        client = client.with_registry(certificate_registry());
    }
    match client.send_async(request) {
        Ok(handle) => {
            let id = reg.next_id.fetch_add(1, Ordering::Relaxed);
            match reg.requests.write() {
                Ok(mut requests) => {
                    requests.insert(id, Arc::new(handle));
                    id
                }
                Err(_) => {
                    handle.cancel();
                    set_last_error("request registry lock poisoned");
                    0
                }
            }
        }
        Err(e) => {
            set_request_error(&e);
            0
        }
    }
}

/// Response status code, or -1 if no response head has arrived yet (or unknown handle).
#[no_mangle]
pub extern "C" fn pollhttp_request_status_code(id: u64) -> c_int {
    lookup(id).map(|r| r.poll_status_code()).unwrap_or(-1)
}

/// Body received so far (caller frees with pollhttp_free_string). truncate: non-zero to also
/// clear the buffer. Returns NULL for an unknown handle.
#[no_mangle]
pub extern "C" fn pollhttp_request_poll_buffer(id: u64, truncate: c_int) -> *mut c_char {
    match lookup(id) {
        Some(r) => to_c_string(&r.poll_buffer(truncate != 0)),
        None => ptr::null_mut(),
    }
}

/// Buffered body length in characters, or -1 for an unknown handle.
#[no_mangle]
pub extern "C" fn pollhttp_request_buffer_length(id: u64) -> i64 {
    lookup(id)
        .map(|r| i64::try_from(r.buffer_len()).unwrap_or(i64::MAX))
        .unwrap_or(-1)
}

/// 1 while the background task is running, else 0.
#[no_mangle]
pub extern "C" fn pollhttp_request_is_running(id: u64) -> c_int {
    lookup(id).map(|r| r.is_running() as c_int).unwrap_or(0)
}

/// 1 if the request ended with a failure, else 0.
#[no_mangle]
pub extern "C" fn pollhttp_request_is_failed(id: u64) -> c_int {
    lookup(id).map(|r| r.is_failed() as c_int).unwrap_or(0)
}

/// Failure message (caller frees with pollhttp_free_string), or NULL if the request has not failed.
#[no_mangle]
pub extern "C" fn pollhttp_request_failure(id: u64) -> *mut c_char {
    lookup(id)
        .and_then(|r| r.failure())
        .map(|e| to_c_string(&e.to_string()))
        .unwrap_or(ptr::null_mut())
}

/// Characters per second averaged over window_seconds (1, 5, 30 or 60). -1 for an unknown
/// handle or window.
#[no_mangle]
pub extern "C" fn pollhttp_request_rate(id: u64, window_seconds: c_int) -> i64 {
    let Some(window) = u64::try_from(window_seconds).ok().and_then(RateWindow::from_seconds) else {
        return -1;
    };
    lookup(id)
        .map(|r| i64::try_from(r.rate(window)).unwrap_or(i64::MAX))
        .unwrap_or(-1)
}

/// Cancel the request. The handle stays valid until pollhttp_request_free.
#[no_mangle]
pub extern "C" fn pollhttp_request_cancel(id: u64) {
    if let Some(r) = lookup(id) {
        r.cancel();
    }
}

/// Release the handle, cancelling the request if it is still running.
#[no_mangle]
pub extern "C" fn pollhttp_request_free(id: u64) {
    let removed = registry().requests.write().ok().and_then(|mut r| r.remove(&id));
    if let Some(r) = removed {
        r.cancel();
    }
}
