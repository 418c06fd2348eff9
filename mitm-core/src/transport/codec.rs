//! Conversion between hyper messages and raw HTTP/1.x packets.
//!
//! Bodies are read whole. Transfer framing is dropped when reading and a
//! fresh `Content-Length` is written when a packet goes back on the wire.

use crate::error::{MitmError, PacketError};
use crate::packet;
use crate::Result;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use hyper::http::request;
use hyper::{Body, HeaderMap, Request, Response, StatusCode, Uri, Version};

/// Whether a message is too large, or unbounded, to buffer for interception.
pub fn should_bypass(headers: &HeaderMap, packet_limit: usize) -> bool {
    let too_large = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
        .map_or(false, |len| len > packet_limit);
    let streaming = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.to_ascii_lowercase().starts_with("text/event-stream"));
    too_large || streaming
}

fn version_text(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

fn write_headers(out: &mut Vec<u8>, headers: &HeaderMap, body_len: usize) {
    for (name, value) in headers {
        if name == TRANSFER_ENCODING || (name == CONTENT_LENGTH && body_len > 0) {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if body_len > 0 {
        out.extend_from_slice(format!("content-length: {}\r\n", body_len).as_bytes());
    }
}

/// Reads a request into raw bytes. Returns the parts needed to rebuild it.
pub async fn request_to_raw(req: Request<Body>) -> Result<(Vec<u8>, request::Parts)> {
    let (parts, body) = req.into_parts();
    let body = hyper::body::to_bytes(body)
        .await
        .map_err(|e| MitmError::Http(format!("Failed to read request body: {}", e)))?;

    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let mut raw = Vec::with_capacity(body.len() + 512);
    raw.extend_from_slice(format!("{} {} {}\r\n", parts.method, target, version_text(parts.version)).as_bytes());
    if !parts.headers.contains_key(HOST) {
        if let Some(authority) = parts.uri.authority() {
            raw.extend_from_slice(format!("host: {}\r\n", authority).as_bytes());
        }
    }
    write_headers(&mut raw, &parts.headers, body.len());
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(&body);
    Ok((raw, parts))
}

fn parse_headers(raw: &[u8]) -> std::result::Result<HeaderMap, PacketError> {
    let mut map = HeaderMap::new();
    for (name, value) in packet::headers(raw) {
        let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| PacketError::Header(name.clone()))?;
        if name == TRANSFER_ENCODING || name == CONTENT_LENGTH {
            continue;
        }
        let value = HeaderValue::from_str(value.trim()).map_err(|_| PacketError::Header(name.to_string()))?;
        map.append(name, value);
    }
    Ok(map)
}

/// Content-Length for a rebuilt packet: the body size, or the declared
/// value when the body is empty (HEAD responses).
fn content_length(raw: &[u8], body: &[u8]) -> Option<HeaderValue> {
    if !body.is_empty() {
        return Some(HeaderValue::from(body.len()));
    }
    packet::header_value(raw, "content-length").and_then(|v| HeaderValue::from_str(v.trim()).ok())
}

/// Rebuilds a request from raw bytes, resolving an origin-form target
/// against `scheme` and the `Host` header.
pub fn raw_to_request(raw: &[u8], original: &request::Parts) -> std::result::Result<Request<Body>, PacketError> {
    let line = packet::parse_request_line(raw).ok_or(PacketError::StartLine)?;
    let (_, body) = packet::split_header_body(raw);
    let mut headers = parse_headers(raw)?;

    let uri: Uri = if line.uri.starts_with('/') || line.uri == "*" {
        let scheme = original.uri.scheme_str().unwrap_or("http");
        let authority = headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| original.uri.authority().map(|a| a.to_string()))
            .ok_or_else(|| PacketError::Uri(line.uri.clone()))?;
        format!("{}://{}{}", scheme, authority, line.uri)
            .parse()
            .map_err(|_| PacketError::Uri(line.uri.clone()))?
    } else {
        line.uri.parse().map_err(|_| PacketError::Uri(line.uri.clone()))?
    };
    if original.version == Version::HTTP_2 {
        headers.remove(HOST);
    }
    if let Some(len) = content_length(raw, body) {
        headers.insert(CONTENT_LENGTH, len);
    }

    let method = line
        .method
        .parse::<hyper::Method>()
        .map_err(|_| PacketError::StartLine)?;
    let mut req = Request::new(Body::from(body.to_vec()));
    *req.method_mut() = method;
    *req.uri_mut() = uri;
    *req.version_mut() = original.version;
    *req.headers_mut() = headers;
    Ok(req)
}

pub async fn response_to_raw(res: Response<Body>) -> Result<(Vec<u8>, Version)> {
    let (parts, body) = res.into_parts();
    let body = hyper::body::to_bytes(body)
        .await
        .map_err(|e| MitmError::Http(format!("Failed to read response body: {}", e)))?;

    let reason = parts.status.canonical_reason().unwrap_or("");
    let mut raw = Vec::with_capacity(body.len() + 512);
    raw.extend_from_slice(
        format!("{} {} {}\r\n", version_text(parts.version), parts.status.as_u16(), reason).as_bytes(),
    );
    write_headers(&mut raw, &parts.headers, body.len());
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(&body);
    Ok((raw, parts.version))
}

pub fn raw_to_response(raw: &[u8], version: Version) -> std::result::Result<Response<Body>, PacketError> {
    let (code, _) = packet::parse_status_line(raw).ok_or(PacketError::StartLine)?;
    let status = StatusCode::from_u16(code).map_err(|_| PacketError::StartLine)?;
    let (_, body) = packet::split_header_body(raw);
    let mut headers = parse_headers(raw)?;
    if let Some(len) = content_length(raw, body) {
        headers.insert(CONTENT_LENGTH, len);
    }
    let mut res = Response::new(Body::from(body.to_vec()));
    *res.status_mut() = status;
    *res.version_mut() = version;
    *res.headers_mut() = headers;
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(body: Body) -> Vec<u8> {
        hyper::body::to_bytes(body).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_request_round_trip_keeps_target() {
        let req = Request::builder()
            .method("POST")
            .uri("https://example.com:8443/login?next=1")
            .header("host", "example.com:8443")
            .header("transfer-encoding", "chunked")
            .body(Body::from("a=1"))
            .unwrap();
        let (raw, parts) = request_to_raw(req).await.unwrap();
        let text = String::from_utf8(raw.clone()).unwrap();
        assert!(text.starts_with("POST /login?next=1 HTTP/1.1\r\n"));
        assert!(!text.contains("transfer-encoding"));
        assert!(text.contains("content-length: 3\r\n"));
        assert_eq!(packet::request_url(&raw, true).unwrap(), "https://example.com:8443/login?next=1");

        let edited = String::from_utf8(raw).unwrap().replace("a=1", "a=1234");
        let rebuilt = raw_to_request(edited.as_bytes(), &parts).unwrap();
        assert_eq!(rebuilt.uri().to_string(), "https://example.com:8443/login?next=1");
        assert_eq!(rebuilt.headers()[CONTENT_LENGTH], "6");
        assert_eq!(body_of(rebuilt.into_body()).await, b"a=1234");
    }

    #[tokio::test]
    async fn test_head_response_keeps_declared_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n";
        let res = raw_to_response(raw, Version::HTTP_11).unwrap();
        assert_eq!(res.headers()[CONTENT_LENGTH], "42");
        assert!(body_of(res.into_body()).await.is_empty());
    }

    #[tokio::test]
    async fn test_response_to_raw() {
        let res = Response::builder()
            .status(404)
            .header("content-type", "text/plain")
            .body(Body::from("missing"))
            .unwrap();
        let (raw, version) = response_to_raw(res).await.unwrap();
        assert_eq!(version, Version::HTTP_11);
        assert_eq!(packet::parse_status_line(&raw).unwrap().0, 404);
        assert!(raw.ends_with(b"\r\n\r\nmissing"));
    }

    #[test]
    fn test_bypass_rules() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(100usize));
        assert!(!should_bypass(&headers, 100));
        assert!(should_bypass(&headers, 99));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        assert!(should_bypass(&headers, 1000));
    }

    #[test]
    fn test_malformed_packets_are_errors() {
        let parts = Request::new(()).into_parts().0;
        assert_eq!(raw_to_request(b"garbage", &parts).err(), Some(PacketError::StartLine));
        assert!(raw_to_response(b"HTTP/1.1 abc\r\n\r\n", Version::HTTP_11).is_err());
    }
}
