use super::codec;
use super::connector::ConnectError;
use crate::admin::ActiveGuard;
use crate::events::NotificationKind;
use crate::packet;
use crate::pipeline::{InterceptEngine, RequestOutcome, WebsocketSession};
use crate::unit::{Exchange, InterceptedUnit};
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use hudsucker::{
    hyper::{
        header::{HeaderValue, CONNECTION, CONTENT_LENGTH, UPGRADE},
        http::request,
        Body, Request, Response, StatusCode, Uri, Version,
    },
    tokio_tungstenite::tungstenite::{self, Message},
    HttpContext, HttpHandler, RequestOrResponse, WebSocketContext, WebSocketHandler,
};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exchange waiting for its response on this handler instance.
struct InFlight {
    exchange: Exchange,
    parts: request::Parts,
    cancel: CancellationToken,
    _active: ActiveGuard,
}

/// Bridges hudsucker callbacks to the interception engine.
///
/// hudsucker clones the handler per request, so the request and response
/// callbacks of one exchange share a single instance.
pub struct InterceptHandler {
    engine: Arc<InterceptEngine>,
    packet_limit: usize,
    in_flight: Option<InFlight>,
}

impl Clone for InterceptHandler {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            packet_limit: self.packet_limit,
            in_flight: None,
        }
    }
}

/// Connection identity of a websocket, shared by both directions.
pub fn websocket_hash(client_addr: SocketAddr, uri: &Uri) -> String {
    let authority = uri.authority().map(|a| a.as_str()).unwrap_or_default();
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    packet::sha256_hex(format!("{}|{}{}", client_addr, authority, path).as_bytes())
}

/// Local answer for a dropped request or response.
pub fn dropped_response() -> Response<Body> {
    let mut res = Response::new(Body::empty());
    res.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
    res.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    res
}

/// 502 carrying the failure in a `Warning` header.
pub fn bad_gateway(diagnostic: &str) -> Response<Body> {
    let clean: String = diagnostic
        .chars()
        .map(|c| if c == '"' || c == '\\' || !(' '..='~').contains(&c) { ' ' } else { c })
        .collect();
    let mut res = Response::new(Body::from(format!("mitm: {}\n", clean)));
    *res.status_mut() = StatusCode::BAD_GATEWAY;
    let warning = HeaderValue::from_str(&format!("199 mitm \"{}\"", clean))
        .unwrap_or_else(|_| HeaderValue::from_static("199 mitm \"upstream failure\""));
    res.headers_mut().insert("warning", warning);
    res
}

fn find_connect_error<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a ConnectError> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<ConnectError>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}

fn websocket_endpoints(ctx: &WebSocketContext) -> (SocketAddr, &Uri, bool) {
    match ctx {
        WebSocketContext::ClientToServer { src, dst, .. } => (*src, dst, false),
        WebSocketContext::ServerToClient { src, dst, .. } => (*dst, src, true),
    }
}

fn is_upgrade(req: &Request<Body>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.eq_ignore_ascii_case("websocket"))
}

impl InterceptHandler {
    pub fn new(engine: Arc<InterceptEngine>, packet_limit: usize) -> Self {
        Self {
            engine,
            packet_limit,
            in_flight: None,
        }
    }

    fn respond_with(&self, raw: &[u8], version: Version) -> Response<Body> {
        codec::raw_to_response(raw, version).unwrap_or_else(|e| {
            warn!("Unusable response packet: {}", e);
            bad_gateway(&format!("unusable response packet: {}", e))
        })
    }
}

#[async_trait]
impl HttpHandler for InterceptHandler {
    async fn handle_request(&mut self, ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        let mut req = req;
        // Compressed frames would be opaque to the frame hooks
        req.headers_mut().remove("sec-websocket-extensions");

        if req.method() == hudsucker::hyper::Method::CONNECT {
            return RequestOrResponse::Request(req);
        }
        if codec::should_bypass(req.headers(), self.packet_limit) {
            debug!(uri = %req.uri(), "Request bypasses interception");
            return RequestOrResponse::Request(req);
        }

        let active = self.engine.metrics().track_active();
        let websocket = is_upgrade(&req);
        let ws_hash = websocket.then(|| websocket_hash(ctx.client_addr, req.uri()));
        let is_https = matches!(req.uri().scheme_str(), Some("https") | Some("wss"));

        let (raw, parts) = match codec::request_to_raw(req).await {
            Ok(read) => read,
            Err(e) => {
                warn!(client = %ctx.client_addr, "{}", e);
                return RequestOrResponse::Response(bad_gateway(&e.to_string()));
            }
        };
        let mut exchange = Exchange::new(InterceptedUnit::request(raw, is_https, Some(ctx.client_addr)));
        exchange.flags.websocket = websocket;
        let cancel = self.engine.cancel_token().child_token();

        match self.engine.handle_request(&mut exchange, &cancel).await {
            RequestOutcome::Forward(bytes) => {
                let rebuilt = codec::raw_to_request(&bytes, &parts).or_else(|e| {
                    warn!(url = %exchange.url(), "Edited request is unusable, sending original: {}", e);
                    codec::raw_to_request(&exchange.request.raw, &parts)
                });
                let req = match rebuilt {
                    Ok(req) => req,
                    Err(e) => {
                        self.engine.finish(exchange, ws_hash);
                        return RequestOrResponse::Response(bad_gateway(&format!("unusable request packet: {}", e)));
                    }
                };
                if websocket {
                    // hudsucker completes the upgrade itself; frames arrive through the websocket handler
                    self.engine.finish(exchange, ws_hash);
                } else {
                    self.in_flight = Some(InFlight {
                        exchange,
                        parts,
                        cancel,
                        _active: active,
                    });
                }
                RequestOrResponse::Request(req)
            }
            RequestOutcome::Respond(bytes) => {
                info!(url = %exchange.url(), "Answered by mock hook");
                let res = self.respond_with(&bytes, parts.version);
                exchange.attach_response(bytes);
                self.engine.finish(exchange, ws_hash);
                RequestOrResponse::Response(res)
            }
            RequestOutcome::Drop => {
                self.engine.finish(exchange, ws_hash);
                RequestOrResponse::Response(dropped_response())
            }
        }
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        let Some(InFlight {
            mut exchange,
            parts,
            cancel,
            _active,
        }) = self.in_flight.take()
        else {
            return res;
        };

        if codec::should_bypass(res.headers(), self.packet_limit) {
            debug!(url = %exchange.url(), "Response bypasses interception");
            self.engine.release_task(&mut exchange);
            self.engine.finish(exchange, None);
            return res;
        }

        let (raw, version) = match codec::response_to_raw(res).await {
            Ok(read) => read,
            Err(e) => {
                warn!(url = %exchange.url(), "{}", e);
                self.engine.metrics().upstream_errors.fetch_add(1, Ordering::Relaxed);
                self.engine.finish(exchange, None);
                return bad_gateway(&e.to_string());
            }
        };
        let version = if parts.version == Version::HTTP_2 { parts.version } else { version };

        let res = match self.engine.handle_response(&mut exchange, raw, &cancel).await {
            Some(bytes) => self.respond_with(&bytes, version),
            None => dropped_response(),
        };
        self.engine.finish(exchange, None);
        res
    }

    async fn handle_error(&mut self, ctx: &HttpContext, err: hudsucker::hyper::Error) -> Response<Body> {
        self.engine.metrics().upstream_errors.fetch_add(1, Ordering::Relaxed);
        let diagnostic = match find_connect_error(&err) {
            Some(connect) => {
                if connect.is_tls() {
                    self.engine
                        .events()
                        .notify(NotificationKind::TlsFailure, connect.diagnostic());
                }
                connect.diagnostic()
            }
            None => err.to_string(),
        };
        warn!(client = %ctx.client_addr, "Upstream request failed: {}", diagnostic);

        if let Some(InFlight { mut exchange, .. }) = self.in_flight.take() {
            self.engine.release_task(&mut exchange);
            self.engine.finish(exchange, None);
        }
        bad_gateway(&diagnostic)
    }
}

#[async_trait]
impl WebSocketHandler for InterceptHandler {
    async fn handle_websocket(
        mut self,
        ctx: WebSocketContext,
        mut stream: impl Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
        mut sink: impl Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
    ) {
        let (client, uri, _) = websocket_endpoints(&ctx);
        let _stream = self.engine.open_websocket_stream(&websocket_hash(client, uri));

        while let Some(message) = stream.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    debug!("Websocket stream error: {}", e);
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        debug!("Websocket close failed: {}", e);
                    }
                    break;
                }
            };
            let Some(message) = self.handle_message(&ctx, message).await else {
                continue;
            };
            match sink.send(message).await {
                Ok(()) | Err(tungstenite::Error::ConnectionClosed) => {}
                Err(e) => warn!("Websocket send failed: {}", e),
            }
        }
    }

    async fn handle_message(&mut self, ctx: &WebSocketContext, message: Message) -> Option<Message> {
        let (client, uri, from_server) = websocket_endpoints(ctx);
        let hash = websocket_hash(client, uri);

        let (payload, is_text) = match message {
            Message::Text(text) => (text.into_bytes(), true),
            Message::Binary(data) => (data, false),
            other => return Some(other),
        };

        let session = WebsocketSession {
            url: uri.to_string(),
            is_https: matches!(uri.scheme_str(), Some("wss") | Some("https")),
            websocket_hash: hash,
            remote_addr: Some(client.to_string()),
        };
        let cancel = self.engine.cancel_token().child_token();
        let payload = self
            .engine
            .handle_websocket_frame(&session, payload, is_text, from_server, &cancel)
            .await?;
        if is_text {
            match String::from_utf8(payload) {
                Ok(text) => Some(Message::Text(text)),
                Err(e) => Some(Message::Binary(e.into_bytes())),
            }
        } else {
            Some(Message::Binary(payload))
        }
    }
}
