//! Upstream connector used by the proxy's HTTP client.
//!
//! Resolves host mapping, tunnels through the selected downstream proxy and
//! performs the upstream TLS handshake (standard or GM) with the logical
//! domain as SNI.

use super::route::{DownstreamProxy, DownstreamRouter, ProxyScheme};
use crate::config::{ClientCertificate, SessionConfig, TlsMode};
use crate::error::MitmError;
use crate::Result;
use async_trait::async_trait;
use hyper::client::connect::{Connected, Connection};
use hyper::Uri;
use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerName};
use std::collections::HashMap;
use std::future::Future;
use std::io::{self, BufReader, Cursor};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use wildmatch::WildMatch;

/// Byte stream the connector hands to hyper.
pub trait UpstreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> UpstreamIo for T {}

pub type BoxedIo = Box<dyn UpstreamIo>;

/// GM-TLS handshake provider.
#[async_trait]
pub trait GmTlsConnector: Send + Sync {
    async fn connect(&self, server_name: &str, stream: BoxedIo) -> io::Result<BoxedIo>;
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid upstream uri {0}")]
    InvalidUri(String),

    #[error("failed to connect to {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to {0}")]
    Timeout(String),

    #[error("downstream proxy {proxy} refused CONNECT to {target}: {status}")]
    ProxyRefused {
        proxy: String,
        target: String,
        status: String,
    },

    #[error("downstream proxy {proxy} failed: {source}")]
    Proxy {
        proxy: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        client_cert: bool,
        #[source]
        source: io::Error,
    },

    #[error("GM TLS handshake with {host} failed: {reason}")]
    Gm { host: String, reason: String },
}

impl ConnectError {
    /// Text placed in the `Warning` header of the synthesized 502.
    pub fn diagnostic(&self) -> String {
        match self {
            ConnectError::Tls {
                client_cert: true, ..
            } => format!("{} (client certificate presented)", self),
            _ => self.to_string(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, ConnectError::Tls { .. } | ConnectError::Gm { .. })
    }
}

/// Established upstream connection.
pub struct UpstreamStream {
    io: BoxedIo,
    h2: bool,
}

impl AsyncRead for UpstreamStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl Connection for UpstreamStream {
    fn connected(&self) -> Connected {
        let connected = Connected::new();
        if self.h2 {
            connected.negotiated_h2()
        } else {
            connected
        }
    }
}

struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn load_certificates(pem: &str) -> Result<Vec<Certificate>> {
    let mut reader = BufReader::new(Cursor::new(pem.as_bytes()));
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| MitmError::Certificate(format!("Failed to read certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(MitmError::Certificate("no certificate in PEM".to_string()));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(pem: &str) -> Result<PrivateKey> {
    let mut reader = BufReader::new(Cursor::new(pem.as_bytes()));
    let items = rustls_pemfile::read_all(&mut reader)
        .map_err(|e| MitmError::Certificate(format!("Failed to read key PEM: {}", e)))?;
    items
        .into_iter()
        .find_map(|item| match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| MitmError::Certificate("no private key in PEM".to_string()))
}

fn alpn(enable_http2: bool) -> Vec<Vec<u8>> {
    if enable_http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    }
}

fn client_config(cert: Option<&ClientCertificate>, enable_http2: bool) -> Result<Arc<ClientConfig>> {
    let builder = ClientConfig::builder().with_safe_defaults();
    let ca_pems: &[String] = cert.map_or(&[], |c| c.ca_pems.as_slice());

    let builder = if ca_pems.is_empty() {
        builder.with_custom_certificate_verifier(Arc::new(NoVerifier))
    } else {
        let mut roots = RootCertStore::empty();
        for pem in ca_pems {
            for ca in load_certificates(pem)? {
                roots
                    .add(&ca)
                    .map_err(|e| MitmError::Certificate(format!("Invalid CA certificate: {}", e)))?;
            }
        }
        builder.with_custom_certificate_verifier(Arc::new(WebPkiVerifier::new(roots, None)))
    };

    let mut config = match cert {
        Some(cert) => builder
            .with_client_auth_cert(load_certificates(&cert.cert_pem)?, load_private_key(&cert.key_pem)?)
            .map_err(|e| MitmError::Certificate(format!("Invalid client certificate: {}", e)))?,
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = alpn(enable_http2);
    Ok(Arc::new(config))
}

struct ConnectorInner {
    router: Arc<DownstreamRouter>,
    host_mapping: HashMap<String, String>,
    default_tls: Arc<ClientConfig>,
    client_tls: Vec<(WildMatch, Arc<ClientConfig>)>,
    proxy_tls: Arc<ClientConfig>,
    tls_mode: TlsMode,
    gm: Option<Arc<dyn GmTlsConnector>>,
    connect_timeout: Duration,
}

/// `tower::Service<Uri>` connector for the proxy's upstream client.
#[derive(Clone)]
pub struct UpstreamConnector {
    inner: Arc<ConnectorInner>,
}

impl UpstreamConnector {
    pub fn new(config: &SessionConfig, router: Arc<DownstreamRouter>) -> Result<Self> {
        let mut client_tls = Vec::with_capacity(config.tls.client_certificates.len());
        for cert in &config.tls.client_certificates {
            let pattern = if cert.host_pattern.trim().is_empty() {
                "*"
            } else {
                cert.host_pattern.trim()
            };
            client_tls.push((WildMatch::new(pattern), client_config(Some(cert), config.enable_http2)?));
        }
        let mut proxy_tls = client_config(None, false)?;
        Arc::make_mut(&mut proxy_tls).alpn_protocols.clear();

        Ok(Self {
            inner: Arc::new(ConnectorInner {
                router,
                host_mapping: config.host_mapping.clone(),
                default_tls: client_config(None, config.enable_http2)?,
                client_tls,
                proxy_tls,
                tls_mode: config.tls.mode.clone(),
                gm: None,
                connect_timeout: config.engine.connect_timeout(),
            }),
        })
    }

    /// Installs the GM-TLS provider. Must be called before the connector is cloned.
    pub fn with_gm(mut self, gm: Arc<dyn GmTlsConnector>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.gm = Some(gm);
        } else {
            warn!("GM connector installed after the connector was shared; ignored");
        }
        self
    }

    pub fn router(&self) -> &Arc<DownstreamRouter> {
        &self.inner.router
    }

    pub async fn connect(&self, uri: Uri) -> std::result::Result<UpstreamStream, ConnectError> {
        let inner = &self.inner;
        let host = uri
            .host()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or_else(|| ConnectError::InvalidUri(uri.to_string()))?;
        let is_tls = matches!(uri.scheme_str(), Some("https") | Some("wss"));
        let port = uri.port_u16().unwrap_or(if is_tls { 443 } else { 80 });
        let target = inner.dial_target(&host, port);

        let io = tokio::time::timeout(inner.connect_timeout, inner.open(&host, &target))
            .await
            .map_err(|_| ConnectError::Timeout(target.clone()))??;

        if !is_tls {
            return Ok(UpstreamStream { io, h2: false });
        }

        match &inner.tls_mode {
            TlsMode::Gm { prefer, only } if *prefer || *only => {
                let Some(gm) = inner.gm.clone() else {
                    if *only {
                        return Err(ConnectError::Gm {
                            host,
                            reason: "no GM connector installed".to_string(),
                        });
                    }
                    return inner.standard_tls(&host, io).await;
                };
                match gm.connect(&host, io).await {
                    Ok(io) => Ok(UpstreamStream { io, h2: false }),
                    Err(e) if *only => Err(ConnectError::Gm {
                        host,
                        reason: e.to_string(),
                    }),
                    Err(e) => {
                        debug!(%host, "GM handshake failed, retrying with standard TLS: {}", e);
                        let io = tokio::time::timeout(inner.connect_timeout, inner.open(&host, &target))
                            .await
                            .map_err(|_| ConnectError::Timeout(target.clone()))??;
                        inner.standard_tls(&host, io).await
                    }
                }
            }
            _ => inner.standard_tls(&host, io).await,
        }
    }
}

impl ConnectorInner {
    /// Address actually dialled, after host mapping.
    fn dial_target(&self, host: &str, port: u16) -> String {
        match self.host_mapping.get(host) {
            Some(mapped) if mapped.contains(':') && !mapped.starts_with('[') && mapped.matches(':').count() == 1 => {
                mapped.clone()
            }
            Some(mapped) if mapped.starts_with('[') && mapped.contains("]:") => mapped.clone(),
            Some(mapped) if mapped.contains(':') => format!("[{}]:{}", mapped, port),
            Some(mapped) => format!("{}:{}", mapped, port),
            None if host.contains(':') => format!("[{}]:{}", host, port),
            None => format!("{}:{}", host, port),
        }
    }

    async fn open(&self, host: &str, target: &str) -> std::result::Result<BoxedIo, ConnectError> {
        match self.router.select(host) {
            Some(proxy) => self.tunnel(&proxy, target).await,
            None => {
                let tcp = TcpStream::connect(target).await.map_err(|source| ConnectError::Dial {
                    target: target.to_string(),
                    source,
                })?;
                let _ = tcp.set_nodelay(true);
                Ok(Box::new(tcp))
            }
        }
    }

    /// Opens a CONNECT tunnel to `target` through `proxy`.
    async fn tunnel(&self, proxy: &DownstreamProxy, target: &str) -> std::result::Result<BoxedIo, ConnectError> {
        let proxy_name = proxy.to_string();
        let proxy_err = |source: io::Error| ConnectError::Proxy {
            proxy: proxy_name.clone(),
            source,
        };
        let tcp = TcpStream::connect(proxy.authority()).await.map_err(proxy_err)?;
        let _ = tcp.set_nodelay(true);
        let mut io: BoxedIo = match proxy.scheme {
            ProxyScheme::Http => Box::new(tcp),
            ProxyScheme::Https => {
                let name = ServerName::try_from(proxy.host.as_str())
                    .map_err(|e| proxy_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
                let tls = TlsConnector::from(self.proxy_tls.clone())
                    .connect(name, tcp)
                    .await
                    .map_err(proxy_err)?;
                Box::new(tls)
            }
        };

        let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if let Some(auth) = proxy.basic_auth() {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
        request.push_str("Proxy-Connection: Keep-Alive\r\n\r\n");
        io.write_all(request.as_bytes()).await.map_err(proxy_err)?;

        let head = read_response_head(&mut io).await.map_err(proxy_err)?;
        let status = crate::packet::parse_status_line(&head);
        match status {
            Some((200, _)) => {
                debug!(proxy = %proxy_name, %target, "CONNECT tunnel established");
                Ok(io)
            }
            _ => Err(ConnectError::ProxyRefused {
                proxy: proxy_name.clone(),
                target: target.to_string(),
                status: crate::packet::start_line(&head).into_owned(),
            }),
        }
    }

    fn tls_config_for(&self, host: &str) -> (Arc<ClientConfig>, bool) {
        self.client_tls
            .iter()
            .find(|(pattern, _)| pattern.matches(host))
            .map(|(_, config)| (config.clone(), true))
            .unwrap_or_else(|| (self.default_tls.clone(), false))
    }

    async fn standard_tls(&self, host: &str, io: BoxedIo) -> std::result::Result<UpstreamStream, ConnectError> {
        let (config, client_cert) = self.tls_config_for(host);
        let tls_err = |source: io::Error| ConnectError::Tls {
            host: host.to_string(),
            client_cert,
            source,
        };
        let name = ServerName::try_from(host).map_err(|e| tls_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let tls = TlsConnector::from(config).connect(name, io).await.map_err(tls_err)?;
        let h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
        Ok(UpstreamStream {
            io: Box::new(tls),
            h2,
        })
    }
}

/// Reads up to the blank line ending a response head, one byte at a time so
/// nothing past the head is consumed.
async fn read_response_head(io: &mut BoxedIo) -> io::Result<Vec<u8>> {
    const MAX_HEAD: usize = 16 * 1024;
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") && !head.ends_with(b"\n\n") {
        if head.len() >= MAX_HEAD {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "proxy response head too large"));
        }
        if io.read(&mut byte).await? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "proxy closed the connection"));
        }
        head.push(byte[0]);
    }
    Ok(head)
}

impl tower::Service<Uri> for UpstreamConnector {
    type Response = UpstreamStream;
    type Error = ConnectError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<UpstreamStream, ConnectError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(async move { connector.connect(uri).await })
    }
}
