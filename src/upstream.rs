//! Connections to the loopback backend

use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpStream;

/// Errors talking to the backend
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("failed to connect to backend at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP handshake with backend failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("backend request failed: {0}")]
    Request(#[source] hyper::Error),

    #[error("invalid request target: {0}")]
    InvalidUri(#[from] hyper::http::uri::InvalidUri),

    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend closed the connection before responding")]
    ClosedEarly,

    #[error("malformed response from backend")]
    MalformedResponse,

    #[error("backend response exceeds {0} bytes")]
    ResponseTooLarge(usize),

    #[error("failed to read request body from client: {0}")]
    ClientBody(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Address of the single backend. Always a loopback address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upstream {
    addr: SocketAddr,
}

impl Upstream {
    /// Backend on `127.0.0.1:<port>`
    pub fn loopback(port: u16) -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Open a fresh connection. Connections are never pooled or reused.
    pub async fn connect(&self) -> Result<TcpStream, UpstreamError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|source| UpstreamError::Connect {
                addr: self.addr,
                source,
            })?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
