//! Raw HTTP packet helpers.
//!
//! Intercepted traffic is handled as raw HTTP/1.1 text (start line, header
//! lines, blank line, body) so that rules, plugins and controllers all see
//! and edit the same representation regardless of the wire protocol.

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::io::Read;

/// Splits a packet into its header section (blank line included) and body.
pub fn split_header_body(raw: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find(raw, b"\r\n\r\n") {
        return raw.split_at(pos + 4);
    }
    if let Some(pos) = find(raw, b"\n\n") {
        return raw.split_at(pos + 2);
    }
    (raw, &[])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// First line of the packet without its terminator.
pub fn start_line(raw: &[u8]) -> Cow<'_, str> {
    let end = raw.iter().position(|b| *b == b'\n').unwrap_or(raw.len());
    let line = &raw[..end];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line)
}

/// Byte range of the request-target inside the start line.
pub fn request_uri_range(raw: &[u8]) -> Option<std::ops::Range<usize>> {
    let end = raw.iter().position(|b| *b == b'\n').unwrap_or(raw.len());
    let line = &raw[..end];
    let first_space = line.iter().position(|b| *b == b' ')?;
    let rest = &line[first_space + 1..];
    let len = rest
        .iter()
        .position(|b| *b == b' ' || *b == b'\r')
        .unwrap_or(rest.len());
    if len == 0 {
        return None;
    }
    Some(first_space + 1..first_space + 1 + len)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub uri: String,
    pub version: String,
}

pub fn parse_request_line(raw: &[u8]) -> Option<RequestLine> {
    let line = start_line(raw);
    let mut parts = line.split(' ').filter(|p| !p.is_empty());
    let method = parts.next()?.to_string();
    let uri = parts.next()?.to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();
    Some(RequestLine { method, uri, version })
}

/// Status code and reason phrase of a response packet.
pub fn parse_status_line(raw: &[u8]) -> Option<(u16, String)> {
    let line = start_line(raw);
    let mut parts = line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    let code = parts.next()?.trim().parse().ok()?;
    let reason = parts.next().unwrap_or("").trim().to_string();
    Some((code, reason))
}

/// Header lines in order of appearance.
pub fn headers(raw: &[u8]) -> Vec<(String, String)> {
    let (header, _) = split_header_body(raw);
    String::from_utf8_lossy(header)
        .split('\n')
        .skip(1)
        .map(|line| line.trim_end_matches('\r'))
        .take_while(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

pub fn header_value(raw: &[u8], name: &str) -> Option<String> {
    headers(raw)
        .into_iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

/// Rebuilds a packet from a start line, header list and body with CRLF line endings.
pub fn assemble(start: &str, headers: &[(String, String)], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(start.len() + body.len() + headers.len() * 32 + 4);
    out.extend_from_slice(start.as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// Replaces the first header called `name` or appends it.
pub fn set_header(raw: &[u8], name: &str, value: &str) -> Vec<u8> {
    let (_, body) = split_header_body(raw);
    let mut list = headers(raw);
    match list.iter_mut().find(|(key, _)| key.eq_ignore_ascii_case(name)) {
        Some(entry) => entry.1 = value.to_string(),
        None => list.push((name.to_string(), value.to_string())),
    }
    assemble(&start_line(raw), &list, body)
}

pub fn remove_header(raw: &[u8], name: &str) -> Vec<u8> {
    let (_, body) = split_header_body(raw);
    let list: Vec<_> = headers(raw)
        .into_iter()
        .filter(|(key, _)| !key.eq_ignore_ascii_case(name))
        .collect();
    assemble(&start_line(raw), &list, body)
}

/// Decodes a chunked transfer-encoded body. `None` when the framing is broken.
pub fn decode_chunked(body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let mut rest = body;
    loop {
        let line_end = find(rest, b"\r\n")?;
        let size_line = std::str::from_utf8(&rest[..line_end]).ok()?;
        let size_hex = size_line.split(';').next()?.trim();
        let size = usize::from_str_radix(size_hex, 16).ok()?;
        rest = &rest[line_end + 2..];
        if size == 0 {
            return Some(out);
        }
        if rest.len() < size {
            return None;
        }
        out.extend_from_slice(&rest[..size]);
        rest = &rest[size..];
        rest = rest.strip_prefix(b"\r\n").unwrap_or(rest);
    }
}

fn decompress(encoding: &str, body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    match encoding {
        "gzip" | "x-gzip" => GzDecoder::new(body).read_to_end(&mut out).ok()?,
        "deflate" => {
            if ZlibDecoder::new(body).read_to_end(&mut out).is_err() {
                out.clear();
                DeflateDecoder::new(body).read_to_end(&mut out).ok()?;
            }
            out.len()
        }
        _ => return None,
    };
    Some(out)
}

/// Returns the packet with chunked framing and gzip/deflate encoding removed.
///
/// Packets that need no decoding (or cannot be decoded) come back unchanged.
pub fn make_plain(raw: &[u8]) -> Vec<u8> {
    let (_, body) = split_header_body(raw);
    let mut list = headers(raw);
    let mut plain_body = Cow::Borrowed(body);
    let mut rewritten = false;

    let chunked = list.iter().any(|(k, v)| {
        k.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked")
    });
    if chunked {
        if let Some(decoded) = decode_chunked(body) {
            plain_body = Cow::Owned(decoded);
            list.retain(|(k, _)| !k.eq_ignore_ascii_case("transfer-encoding"));
            rewritten = true;
        }
    }

    let encoding = list
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-encoding"))
        .map(|(_, v)| v.trim().to_ascii_lowercase());
    if let Some(encoding) = encoding {
        if let Some(decoded) = decompress(&encoding, &plain_body) {
            plain_body = Cow::Owned(decoded);
            list.retain(|(k, _)| !k.eq_ignore_ascii_case("content-encoding"));
            rewritten = true;
        }
    }

    if !rewritten {
        return raw.to_vec();
    }
    match list
        .iter_mut()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
    {
        Some(entry) => entry.1 = plain_body.len().to_string(),
        None => list.push(("Content-Length".to_string(), plain_body.len().to_string())),
    }
    assemble(&start_line(raw), &list, &plain_body)
}

/// Absolute URL of a request packet.
pub fn request_url(raw: &[u8], is_https: bool) -> Option<String> {
    let line = parse_request_line(raw)?;
    let lower = line.uri.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Some(line.uri);
    }
    let scheme = if is_https { "https" } else { "http" };
    if line.method.eq_ignore_ascii_case("CONNECT") {
        return Some(format!("{}://{}", scheme, line.uri));
    }
    let host = header_value(raw, "host")?;
    Some(format!("{}://{}{}", scheme, host, line.uri))
}

/// `host[:port]` part of a URL.
pub fn url_host(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            _ => String::new(),
        },
        Err(_) => String::new(),
    }
}

/// Path of a URL without query or fragment.
pub fn url_path(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    }
}

/// Extension of the last path segment with a leading dot, or empty.
pub fn url_extension(url: &str) -> String {
    let path = url_path(url);
    let segment = path.rsplit('/').next().unwrap_or_default();
    match segment.rfind('.') {
        Some(idx) if idx + 1 < segment.len() => segment[idx..].to_string(),
        _ => String::new(),
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Serde adapter for packets: UTF-8 text stays readable, anything else is
/// carried as `base64:<data>`.
pub mod serde_packet {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    const PREFIX: &str = "base64:";

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(data) {
            Ok(text) if !text.starts_with(PREFIX) => serializer.serialize_str(text),
            _ => serializer.serialize_str(&format!("{}{}", PREFIX, STANDARD.encode(data))),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        match text.strip_prefix(PREFIX) {
            Some(encoded) => STANDARD.decode(encoded).map_err(serde::de::Error::custom),
            None => Ok(text.into_bytes()),
        }
    }
}
