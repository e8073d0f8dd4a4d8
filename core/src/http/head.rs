/*
 * head.rs
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

//! Response head: status line and header block preceding the body.

/// Ordered header list. Names are compared case-insensitively; duplicates are separate entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Status and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: Option<String>,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: None,
            headers: Headers::new(),
        }
    }

    /// Parse the bytes before the header/body boundary: `HTTP/1.1 200 OK` then `Name: value` lines.
    /// Returns `None` if there is no parseable status line.
    pub fn parse(preamble: &[u8]) -> Option<ResponseHead> {
        let text = String::from_utf8_lossy(preamble);
        let mut lines = text.split("\r\n").skip_while(|l| l.is_empty());
        let status_line = lines.next()?;
        let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
        if !parts.first().is_some_and(|v| v.starts_with("HTTP/")) {
            return None;
        }
        let status = parts.get(1).and_then(|s| s.trim().parse::<u16>().ok())?;
        let reason = parts
            .get(2)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        let mut headers = Headers::new();
        for line in lines {
            if let Some(colon) = line.find(':') {
                let name = line[..colon].trim();
                let value = line[colon + 1..].trim();
                if !name.is_empty() {
                    headers.push(name, value);
                }
            }
        }
        Some(ResponseHead {
            status,
            reason,
            headers,
        })
    }

    /// Declared body length, unless the body is chunked.
    pub fn content_length(&self) -> Option<u64> {
        let chunked = self
            .headers
            .get_all("transfer-encoding")
            .any(|v| v.to_ascii_lowercase().contains("chunked"));
        if chunked {
            return None;
        }
        self.headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
