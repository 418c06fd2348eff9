//! Intercepted traffic units and the per-exchange working copy.

use crate::hijack::HijackTask;
use crate::packet;
use crate::replacer::ReplaceRule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Request,
    Response,
    WebsocketOutbound,
    WebsocketInbound,
}

/// One traffic event as it arrived. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct InterceptedUnit {
    pub direction: Direction,
    pub is_https: bool,
    pub raw: Vec<u8>,
    pub url: String,
    pub remote_addr: Option<SocketAddr>,
    pub timestamp: DateTime<Utc>,
}

impl InterceptedUnit {
    pub fn request(raw: Vec<u8>, is_https: bool, remote_addr: Option<SocketAddr>) -> Self {
        let url = packet::request_url(&raw, is_https).unwrap_or_default();
        Self {
            direction: Direction::Request,
            is_https,
            raw,
            url,
            remote_addr,
            timestamp: Utc::now(),
        }
    }

    pub fn response(raw: Vec<u8>, request: &InterceptedUnit) -> Self {
        Self {
            direction: Direction::Response,
            is_https: request.is_https,
            raw,
            url: request.url.clone(),
            remote_addr: request.remote_addr,
            timestamp: Utc::now(),
        }
    }
}

/// Who produced the bytes that replaced the original packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    Plugin,
    Rule,
    User,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeFlags {
    /// Request was out of filter scope; nothing is hijacked or stored
    pub request_filtered: bool,
    /// Response MIME type was out of scope
    pub response_filtered: bool,
    /// A controller looked at the request
    pub request_viewed: bool,
    pub response_viewed: bool,
    pub request_dropped: bool,
    pub response_dropped: bool,
    /// Controller asked to pause the response as well
    pub hijack_response: bool,
    pub websocket: bool,
    /// Request was answered by a mock hook
    pub mocked: bool,
}

/// Working copy of one request/response exchange.
///
/// Owned by the task processing the exchange and moved along the pipeline.
#[derive(Debug)]
pub struct Exchange {
    pub request: InterceptedUnit,
    pub plain_request: Vec<u8>,
    pub hijacked_request: Option<Vec<u8>>,
    pub request_modified_by: Option<Modifier>,
    pub response: Option<InterceptedUnit>,
    pub plain_response: Vec<u8>,
    pub hijacked_response: Option<Vec<u8>>,
    pub response_modified_by: Option<Modifier>,
    pub matched_rules: Vec<ReplaceRule>,
    pub flags: ExchangeFlags,
    pub tags: Vec<String>,
    /// Live hijack task carried from the request to the response phase
    pub task: Option<HijackTask>,
}

impl Exchange {
    pub fn new(request: InterceptedUnit) -> Self {
        let plain_request = packet::make_plain(&request.raw);
        Self {
            request,
            plain_request,
            hijacked_request: None,
            request_modified_by: None,
            response: None,
            plain_response: Vec::new(),
            hijacked_response: None,
            response_modified_by: None,
            matched_rules: Vec::new(),
            flags: ExchangeFlags::default(),
            tags: Vec::new(),
            task: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.request.url
    }

    pub fn is_https(&self) -> bool {
        self.request.is_https
    }

    /// Bytes the request currently carries.
    pub fn current_request(&self) -> &[u8] {
        self.hijacked_request
            .as_deref()
            .unwrap_or(&self.plain_request)
    }

    pub fn current_response(&self) -> &[u8] {
        self.hijacked_response
            .as_deref()
            .unwrap_or(&self.plain_response)
    }

    /// Replaces the request bytes when they differ from the current ones.
    pub fn set_request(&mut self, data: Vec<u8>, by: Modifier) -> bool {
        if packet::sha256_hex(&data) == packet::sha256_hex(self.current_request()) {
            return false;
        }
        self.hijacked_request = Some(data);
        self.request_modified_by = Some(by);
        true
    }

    pub fn set_response(&mut self, data: Vec<u8>, by: Modifier) -> bool {
        if packet::sha256_hex(&data) == packet::sha256_hex(self.current_response()) {
            return false;
        }
        self.hijacked_response = Some(data);
        self.response_modified_by = Some(by);
        true
    }

    /// Bytes to put on the wire: the original packet unless something changed it.
    pub fn outgoing_request(&self) -> Vec<u8> {
        self.hijacked_request
            .clone()
            .unwrap_or_else(|| self.request.raw.clone())
    }

    pub fn outgoing_response(&self) -> Vec<u8> {
        match (&self.hijacked_response, &self.response) {
            (Some(data), _) => data.clone(),
            (None, Some(unit)) => unit.raw.clone(),
            (None, None) => Vec::new(),
        }
    }

    pub fn method(&self) -> String {
        packet::parse_request_line(self.current_request())
            .map(|line| line.method)
            .unwrap_or_else(|| "GET".to_string())
    }

    pub fn attach_response(&mut self, raw: Vec<u8>) {
        let unit = InterceptedUnit::response(raw, &self.request);
        self.plain_response = packet::make_plain(&unit.raw);
        self.response = Some(unit);
    }

    pub fn request_modified(&self) -> bool {
        self.request_modified_by.is_some()
    }

    pub fn response_modified(&self) -> bool {
        self.response_modified_by.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_bytes_are_not_a_modification() {
        let unit = InterceptedUnit::request(
            b"GET /a HTTP/1.1\r\nHost: x.com\r\n\r\n".to_vec(),
            false,
            None,
        );
        let mut exchange = Exchange::new(unit);
        assert_eq!(exchange.url(), "http://x.com/a");
        let same = exchange.current_request().to_vec();
        assert!(!exchange.set_request(same, Modifier::Rule));
        assert!(!exchange.request_modified());

        assert!(exchange.set_request(b"GET /b HTTP/1.1\r\nHost: x.com\r\n\r\n".to_vec(), Modifier::User));
        assert_eq!(exchange.request_modified_by, Some(Modifier::User));
    }

    #[test]
    fn test_same_length_rewrite_is_detected() {
        let unit = InterceptedUnit::request(b"GET /aaa HTTP/1.1\r\nHost: x\r\n\r\n".to_vec(), false, None);
        let mut exchange = Exchange::new(unit);
        assert!(exchange.set_request(b"GET /bbb HTTP/1.1\r\nHost: x\r\n\r\n".to_vec(), Modifier::Rule));
    }
}
