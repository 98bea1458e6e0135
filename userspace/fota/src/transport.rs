// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0

//! Minimal blocking HTTP/1.1 transport.
//!
//! Plain GET over `TcpStream` with explicit timeouts, bounded header and
//! body sizes, and Content-Length framing. Chunked encoding and TLS are
//! not handled here; `UpdateTransport` is the seam where a richer client
//! plugs in.

use std::fs::File;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use bootstate::Slot;

use crate::engine::UpdateTransport;
use crate::error::UpdateError;
use crate::manifest::MAX_MANIFEST_BYTES;

/// Manifest and signature fetch timeout.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Artifact download timeout.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_SIGNATURE_BYTES: u64 = 256;
const BODY_CHUNK: usize = 8192;

/// HTTP transport bound to one device's manifest endpoint.
pub struct HttpTransport {
    manifest_url: String,
    check_timeout: Duration,
    download_timeout: Duration,
}

impl HttpTransport {
    pub fn new(manifest_url: String, check_timeout: Duration, download_timeout: Duration) -> Self {
        Self { manifest_url, check_timeout, download_timeout }
    }

    /// Endpoint layout used by the update server.
    pub fn manifest_url(server_url: &str, device_id: &str) -> String {
        format!("{}/api/v1/devices/{}/update", server_url.trim_end_matches('/'), device_id)
    }
}

impl UpdateTransport for HttpTransport {
    fn fetch_manifest(
        &self,
        current_version: &str,
        active_slot: Slot,
    ) -> Result<Vec<u8>, UpdateError> {
        let headers = [
            ("X-Current-Version", current_version.to_string()),
            ("X-Current-Slot", active_slot.letter().to_string()),
        ];
        let mut body = Vec::new();
        http_get(
            &self.manifest_url,
            &headers,
            self.check_timeout,
            &mut body,
            MAX_MANIFEST_BYTES as u64,
        )?;
        Ok(body)
    }

    fn fetch_signature(&self) -> Result<Vec<u8>, UpdateError> {
        let url = format!("{}.sig", self.manifest_url);
        let mut body = Vec::new();
        http_get(&url, &[], self.check_timeout, &mut body, MAX_SIGNATURE_BYTES)?;
        Ok(body)
    }

    fn download(&self, url: &str, dest: &Path, expected_size: u64) -> Result<(), UpdateError> {
        let mut file = File::create(dest)
            .map_err(|err| UpdateError::Storage(format!("create {}: {err}", dest.display())))?;
        http_get(url, &[], self.download_timeout, &mut file, expected_size)?;
        file.flush()
            .map_err(|err| UpdateError::Storage(format!("flush {}: {err}", dest.display())))?;
        Ok(())
    }
}

struct UrlParts {
    host: String,
    port: u16,
    path: String,
}

impl UrlParts {
    fn parse(url: &str) -> Result<Self, UpdateError> {
        if url.starts_with("https://") {
            return Err(UpdateError::Transport(
                "https not supported by the built-in transport".into(),
            ));
        }
        let rest = url
            .strip_prefix("http://")
            .ok_or_else(|| UpdateError::Transport(format!("unsupported url: {url}")))?;
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_text)) => {
                let port = port_text
                    .parse::<u16>()
                    .map_err(|_| UpdateError::Transport(format!("bad port in url: {url}")))?;
                (host, port)
            }
            None => (authority, 80),
        };
        if host.is_empty() {
            return Err(UpdateError::Transport(format!("missing host in url: {url}")));
        }
        Ok(Self { host: host.to_string(), port, path: path.to_string() })
    }

    fn host_header(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn transport_err(context: &str, err: std::io::Error) -> UpdateError {
    UpdateError::Transport(format!("{context}: {err}"))
}

/// Issues a GET and streams the body into `sink`, enforcing `max_bytes`.
fn http_get(
    url: &str,
    headers: &[(&str, String)],
    timeout: Duration,
    sink: &mut dyn Write,
    max_bytes: u64,
) -> Result<u64, UpdateError> {
    let target = UrlParts::parse(url)?;
    let addr = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|err| transport_err("resolve", err))?
        .next()
        .ok_or_else(|| UpdateError::Transport(format!("no address for {}", target.host)))?;

    let mut stream =
        TcpStream::connect_timeout(&addr, timeout).map_err(|err| transport_err("connect", err))?;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|err| transport_err("socket", err))?;
    stream
        .set_write_timeout(Some(timeout))
        .map_err(|err| transport_err("socket", err))?;

    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: fotad/{}\r\nAccept: */*\r\nConnection: close\r\n",
        target.path,
        target.host_header(),
        env!("CARGO_PKG_VERSION"),
    );
    for (name, value) in headers {
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    stream
        .write_all(request.as_bytes())
        .map_err(|err| transport_err("send request", err))?;

    let (status, content_length) = read_response_head(&mut stream)?;
    if status != 200 {
        return Err(UpdateError::Transport(format!("http status {status} from {url}")));
    }
    if let Some(length) = content_length {
        if length > max_bytes {
            return Err(UpdateError::Transport(format!(
                "body too large: {length} bytes (max {max_bytes})"
            )));
        }
    }

    let mut total = 0u64;
    let mut buf = [0u8; BODY_CHUNK];
    let limit = content_length.unwrap_or(max_bytes);
    while total < limit {
        let want = (limit - total).min(buf.len() as u64) as usize;
        let read = stream
            .read(&mut buf[..want])
            .map_err(|err| transport_err("read body", err))?;
        if read == 0 {
            if content_length.is_some() {
                return Err(UpdateError::Transport(format!(
                    "truncated body: {total} of {limit} bytes"
                )));
            }
            break;
        }
        sink.write_all(&buf[..read])
            .map_err(|err| UpdateError::Storage(format!("write body: {err}")))?;
        total += read as u64;
    }
    if content_length.is_none() {
        // Without framing, anything past the cap means an oversized body.
        let mut probe = [0u8; 1];
        if matches!(stream.read(&mut probe), Ok(read) if read > 0) {
            return Err(UpdateError::Transport(format!(
                "body exceeds {max_bytes} bytes"
            )));
        }
    }
    Ok(total)
}

/// Reads the status line and headers, returning (status, content-length).
fn read_response_head(stream: &mut TcpStream) -> Result<(u16, Option<u64>), UpdateError> {
    let mut head = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEADER_BYTES {
            return Err(UpdateError::Transport("response headers too large".into()));
        }
        let read = stream.read(&mut byte).map_err(|err| transport_err("read headers", err))?;
        if read == 0 {
            return Err(UpdateError::Transport("connection closed during headers".into()));
        }
        head.push(byte[0]);
    }

    let text = String::from_utf8_lossy(&head);
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or("");
    let status = parse_status_line(status_line)?;

    let mut content_length = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse::<u64>().ok();
            } else if name.eq_ignore_ascii_case("transfer-encoding")
                && value.trim().eq_ignore_ascii_case("chunked")
            {
                return Err(UpdateError::Transport("chunked encoding not supported".into()));
            }
        }
    }
    Ok((status, content_length))
}

fn parse_status_line(line: &str) -> Result<u16, UpdateError> {
    let mut parts = line.split_ascii_whitespace();
    let proto = parts.next().unwrap_or("");
    if !proto.starts_with("HTTP/1.") {
        return Err(UpdateError::Transport(format!("bad status line: {line}")));
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| UpdateError::Transport(format!("bad status line: {line}")))
}
