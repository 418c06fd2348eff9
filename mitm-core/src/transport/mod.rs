//! TLS-terminating listener, upstream connector and message codec.

pub mod codec;
pub mod connector;
pub mod handler;
pub mod route;
pub mod server;

pub use connector::{BoxedIo, ConnectError, GmTlsConnector, UpstreamConnector, UpstreamStream};
pub use handler::InterceptHandler;
pub use route::{DownstreamProxy, DownstreamRouter, ProxyRoute};
pub use server::ProxyServer;
