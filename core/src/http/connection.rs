/*
 * connection.rs
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

//! HTTP/1.1 transport over one TCP or TLS stream.
//!
//! Writes the request with `Connection: close` and hands back the raw response bytes
//! as they arrive; separating head from body is the assembler's job.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream as TokioTlsStream;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use crate::config::RequestOptions;
use crate::error::RequestError;
use crate::http::request::Request;
use crate::http::transport::Transport;
use crate::net::{connect_tcp, default_http_client_config, server_name};
use crate::trust::CertificateRegistry;

const READ_CHUNK: usize = 8192;

/// Plain TCP or TLS. Implements AsyncRead + AsyncWrite.
pub enum HttpStream {
    Plain(TcpStream),
    Tls(Box<TokioTlsStream<TcpStream>>),
}

impl AsyncRead for HttpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HttpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_flush(cx),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Network transport for `http` and `https` URLs.
///
/// With a registry, `https` targets go through `ensure_installed` first and connect with the
/// host's cached client config; without one, the system roots are used.
pub struct HttpTransport {
    options: RequestOptions,
    registry: Option<Arc<CertificateRegistry>>,
    stream: Option<HttpStream>,
    read_buf: BytesMut,
}

impl HttpTransport {
    pub fn new(options: RequestOptions, registry: Option<Arc<CertificateRegistry>>) -> Self {
        Self {
            options,
            registry,
            stream: None,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    async fn tls_config(&self, url: &Url) -> Result<Arc<ClientConfig>, RequestError> {
        match &self.registry {
            Some(registry) => Ok(registry.ensure_installed(url).await?.tls_config.clone()),
            None => default_http_client_config(),
        }
    }
}

impl Transport for HttpTransport {
    async fn open(&mut self, request: &Request) -> Result<(), RequestError> {
        let url = &request.url;
        let secure = match url.scheme() {
            "https" => true,
            "http" => false,
            other => return Err(RequestError::UnsupportedScheme(other.to_string())),
        };
        let host = url
            .host_str()
            .ok_or_else(|| RequestError::MissingHost(url.to_string()))?;
        let port = url
            .port_or_known_default()
            .unwrap_or(if secure { 443 } else { 80 });
        let limit = self.options.connect_timeout;

        // Certificate capture (if any) happens before our own connection is opened.
        let config = if secure {
            Some(self.tls_config(url).await?)
        } else {
            None
        };
        let tcp = connect_tcp(host, port, limit).await?;
        let mut stream = match config {
            Some(config) => {
                let connector = TlsConnector::from(config);
                let tls = timeout(limit, connector.connect(server_name(host)?, tcp))
                    .await
                    .map_err(|_| RequestError::ConnectTimeout {
                        host: host.to_string(),
                        port,
                        timeout: limit,
                    })?
                    .map_err(|e| RequestError::Tls(e.to_string()))?;
                HttpStream::Tls(Box::new(tls))
            }
            None => HttpStream::Plain(tcp),
        };
        debug!(host, port, secure, method = request.method.as_str(), "connected");

        let head = encode_request_head(request, host, port, secure);
        stream.write_all(&head).await?;
        if let Some(body) = &request.body {
            stream.write_all(body).await?;
        }
        stream.flush().await?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, RequestError> {
        let stream = self.stream.as_mut().ok_or(RequestError::NotOpen)?;
        self.read_buf.reserve(READ_CHUNK);
        let n = match self.options.read_timeout {
            Some(limit) => timeout(limit, stream.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| RequestError::ReadTimeout(limit))??,
            None => stream.read_buf(&mut self.read_buf).await?,
        };
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.read_buf.split().freeze()))
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "error shutting down connection");
            }
        }
    }
}

/// Request line and headers, ending with the blank line. Adds `Host`, `Connection: close`
/// and `Content-Length` unless the request already carries them.
pub fn encode_request_head(request: &Request, host: &str, port: u16, secure: bool) -> Vec<u8> {
    let default_port = if secure { 443 } else { 80 };
    let mut head = format!("{} {} HTTP/1.1\r\n", request.method.as_str(), request.target());
    if !request.has_header("Host") {
        if port == default_port {
            head.push_str(&format!("Host: {}\r\n", host));
        } else {
            head.push_str(&format!("Host: {}:{}\r\n", host, port));
        }
    }
    for (k, v) in &request.headers {
        head.push_str(k);
        head.push_str(": ");
        head.push_str(v);
        head.push_str("\r\n");
    }
    if !request.has_header("Connection") {
        head.push_str("Connection: close\r\n");
    }
    if let Some(body) = &request.body {
        if !request.has_header("Content-Length") {
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
    }
    head.push_str("\r\n");
    head.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_for_get_closes_connection() {
        let mut request = Request::get("http://example.com/a?b=1").unwrap();
        request.header("Accept", "text/plain");
        let head = String::from_utf8(encode_request_head(&request, "example.com", 80, false)).unwrap();
        assert_eq!(
            head,
            "GET /a?b=1 HTTP/1.1\r\nHost: example.com\r\nAccept: text/plain\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn head_for_post_has_length_and_port() {
        let request = Request::post("https://example.com:8443/submit", "abc").unwrap();
        let head = String::from_utf8(encode_request_head(&request, "example.com", 8443, true)).unwrap();
        assert!(head.starts_with("POST /submit HTTP/1.1\r\nHost: example.com:8443\r\n"));
        assert!(head.contains("Content-Length: 3\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let request = Request::get("ftp://example.com/file").unwrap();
        let mut transport = HttpTransport::new(RequestOptions::default(), None);
        let err = transport.open(&request).await.unwrap_err();
        assert!(matches!(err, RequestError::UnsupportedScheme(s) if s == "ftp"));
        assert!(matches!(
            transport.next_chunk().await,
            Err(RequestError::NotOpen)
        ));
        transport.close().await;
    }
}
