/*
 * async_integration.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * Integration tests for asynchronous requests against a local plain-HTTP server.
 * The server writes responses in deliberately awkward pieces (boundary split across
 * writes, idle connections) and the tests poll the request the way a caller would.
 *
 * Run with:
 *   cargo test -p pollhttp_core --test async_integration -- --nocapture
 */

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::time::{sleep, timeout};

use pollhttp_core::{AsyncClient, AsyncRequest, Request, RequestError, RequestOptions, RequestState};

/// Read until the end of the request head.
async fn read_request_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
    head
}

async fn write_pause(stream: &mut TcpStream, data: &[u8]) {
    stream.write_all(data).await.unwrap();
    stream.flush().await.unwrap();
    sleep(Duration::from_millis(30)).await;
}

/// Accept one connection and hand it to `respond`.
async fn serve_once<F, Fut>(respond: F) -> String
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        respond(stream).await;
    });
    format!("http://127.0.0.1:{}/stream", port)
}

async fn finished(request: &AsyncRequest) -> RequestState {
    timeout(Duration::from_secs(5), request.finished())
        .await
        .expect("request did not finish")
}

#[tokio::test]
async fn boundary_split_across_writes_yields_body() {
    let url = serve_once(|mut stream| async move {
        let head = read_request_head(&mut stream).await;
        assert!(head.starts_with(b"GET /stream HTTP/1.1\r\n"));
        write_pause(&mut stream, b"HTTP/1.1 200 OK\r\nContent-Type: text/plain").await;
        write_pause(&mut stream, b"\r\n\r").await;
        write_pause(&mut stream, b"\nHELLO").await;
        let _ = stream.shutdown().await;
    })
    .await;

    let client = AsyncClient::new(Handle::current());
    let request = client.send_async(Request::get(&url).unwrap()).unwrap();
    assert_eq!(finished(&request).await, RequestState::Completed);
    assert_eq!(request.poll_status_code(), 200);
    assert_eq!(request.poll_buffer(false), "HELLO");
    assert_eq!(
        request.headers().unwrap().get("content-type"),
        Some("text/plain")
    );
    assert!(!request.is_failed());
}

#[tokio::test]
async fn draining_polls_see_each_piece_once() {
    let url = serve_once(|mut stream| async move {
        read_request_head(&mut stream).await;
        write_pause(&mut stream, b"HTTP/1.1 200 OK\r\n\r\n").await;
        for piece in ["alpha ", "beta ", "gamma"] {
            write_pause(&mut stream, piece.as_bytes()).await;
        }
        let _ = stream.shutdown().await;
    })
    .await;

    let client = AsyncClient::new(Handle::current());
    let request = client.send_async(Request::get(&url).unwrap()).unwrap();
    let mut collected = String::new();
    while request.is_running() {
        collected.push_str(&request.poll_buffer(true));
        sleep(Duration::from_millis(5)).await;
    }
    collected.push_str(&request.poll_buffer(true));
    assert_eq!(collected, "alpha beta gamma");
    assert_eq!(request.buffer_len(), 0);
    assert_eq!(request.rate_5_seconds(), 16 / 5);
}

#[tokio::test]
async fn cancel_releases_idle_connection() {
    let url = serve_once(|mut stream| async move {
        read_request_head(&mut stream).await;
        write_pause(&mut stream, b"HTTP/1.1 200 OK\r\n\r\nstarted").await;
        // Hold the connection open until the client goes away.
        let mut buf = [0u8; 16];
        let _ = stream.read(&mut buf).await;
    })
    .await;

    let client = AsyncClient::new(Handle::current());
    let request = client.send_async(Request::get(&url).unwrap()).unwrap();
    while request.buffer_len() < "started".len() {
        sleep(Duration::from_millis(5)).await;
    }
    request.cancel();
    assert_eq!(finished(&request).await, RequestState::Cancelled);
    assert!(!request.is_running());
    assert_eq!(request.poll_buffer(false), "started");
}

#[tokio::test]
async fn read_timeout_is_reported_as_failure() {
    let url = serve_once(|mut stream| async move {
        read_request_head(&mut stream).await;
        write_pause(&mut stream, b"HTTP/1.1 200 OK\r\n").await;
        sleep(Duration::from_secs(3)).await;
    })
    .await;

    let options = RequestOptions {
        read_timeout: Some(Duration::from_millis(200)),
        ..RequestOptions::default()
    };
    let client = AsyncClient::new(Handle::current()).with_options(options);
    let request = client.send_async(Request::get(&url).unwrap()).unwrap();
    assert_eq!(finished(&request).await, RequestState::Failed);
    assert!(matches!(
        request.failure().as_deref(),
        Some(RequestError::ReadTimeout(_))
    ));
    assert_eq!(request.poll_status_code(), -1);
}

#[tokio::test]
async fn refused_connection_is_reported_as_failure() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = AsyncClient::new(Handle::current());
    let request = client
        .send_async(Request::get(&format!("http://127.0.0.1:{}/", port)).unwrap())
        .unwrap();
    assert_eq!(finished(&request).await, RequestState::Failed);
    assert!(matches!(
        request.failure().as_deref(),
        Some(RequestError::Io(_))
    ));
}

#[tokio::test]
async fn post_body_is_sent_with_length() {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let url = serve_once(|mut stream| async move {
        let mut received = read_request_head(&mut stream).await;
        while !received.ends_with(b"payload") {
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        let _ = tx.send(received);
        write_pause(&mut stream, b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok").await;
    })
    .await;

    let client = AsyncClient::new(Handle::current());
    let request = client
        .send_async(Request::post(&url, "payload").unwrap())
        .unwrap();
    assert_eq!(finished(&request).await, RequestState::Completed);
    assert_eq!(request.poll_status_code(), 201);
    assert_eq!(request.poll_buffer(false), "ok");

    let received = String::from_utf8(rx.await.unwrap()).unwrap();
    assert!(received.starts_with("POST /stream HTTP/1.1\r\n"));
    assert!(received.contains("Content-Length: 7\r\n"));
    assert!(received.contains("Connection: close\r\n"));
}
