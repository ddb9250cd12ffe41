//! The fixed HTTP/1.1 request and a view over the raw response.
//!
//! # Design
//! The pipeline sends exactly one request per connection: `GET`, a fixed path,
//! a `Host` header and `Connection: close`, so the end of the response is the
//! peer closing the channel. Nothing about the request is templated at run
//! time beyond what the configuration fixes up front.
//!
//! The response is never interpreted by the pipeline itself. `HttpResponse`
//! is a convenience for consumers: it splits the raw bytes at the first blank
//! line and parses the status line and header lines. The body is returned
//! verbatim; chunked transfer-encoding is not decoded.

use std::fmt;

use crate::error::ResponseError;

/// The single request the pipeline sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub host: String,
    pub path: String,
}

impl HttpRequest {
    pub fn fixed(host: &str, path: &str) -> Self {
        Self {
            host: host.to_string(),
            path: path.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.path, self.host
        )
    }
}

/// A raw response split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

const SEPARATOR: &[u8] = b"\r\n\r\n";

/// Offset of the first body byte, i.e. just past the first blank line.
pub fn body_offset(raw: &[u8]) -> Option<usize> {
    raw.windows(SEPARATOR.len())
        .position(|window| window == SEPARATOR)
        .map(|pos| pos + SEPARATOR.len())
}

impl HttpResponse {
    pub fn parse(raw: &[u8]) -> Result<Self, ResponseError> {
        let body_start = body_offset(raw).ok_or(ResponseError::MissingSeparator)?;
        let head = &raw[..body_start - SEPARATOR.len()];
        let head = String::from_utf8_lossy(head);
        let mut lines = head.split("\r\n");

        let status_line = lines.next().ok_or(ResponseError::StatusLine)?;
        let (status, reason) = parse_status_line(status_line)?;

        let headers = lines
            .filter(|line| !line.is_empty())
            .map(|line| {
                let (name, value) = line.split_once(':').ok_or(ResponseError::HeaderLine)?;
                Ok((name.trim().to_string(), value.trim().to_string()))
            })
            .collect::<Result<Vec<_>, ResponseError>>()?;

        Ok(Self {
            status,
            reason,
            headers,
            body: raw[body_start..].to_vec(),
        })
    }

    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn parse_status_line(line: &str) -> Result<(u16, String), ResponseError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().ok_or(ResponseError::StatusLine)?;
    if !version.starts_with("HTTP/1.") {
        return Err(ResponseError::StatusLine);
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or(ResponseError::StatusLine)?;
    let reason = parts.next().unwrap_or("").to_string();
    Ok((status, reason))
}
