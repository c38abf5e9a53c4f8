use crate::error::{text_error_response, ProxyBody, ProxyErrorCode};
use crate::forward::forward_request;
use crate::health::probe_response;
use crate::readiness::SharedGate;
use crate::tunnel::{handle_upgrade, is_upgrade_request};
use crate::upstream::Upstream;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Default readiness probe path
pub const DEFAULT_PROBE_PATH: &str = "/healthz";

/// Routes each inbound request to the probe, the tunnel upgrader or the forwarder
#[derive(Debug)]
pub struct Dispatcher {
    gate: SharedGate,
    upstream: Upstream,
    probe_path: String,
}

impl Dispatcher {
    pub fn new(gate: SharedGate, upstream: Upstream, probe_path: impl Into<String>) -> Self {
        Self {
            gate,
            upstream,
            probe_path: probe_path.into(),
        }
    }

    pub fn probe_path(&self) -> &str {
        &self.probe_path
    }

    /// Handle one request. Never fails: every error becomes a response.
    pub async fn dispatch(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        // The probe wins over everything, whatever the method
        if req.uri().path() == self.probe_path {
            return probe_response(&self.gate);
        }

        if is_upgrade_request(&req) {
            return handle_upgrade(req, &self.gate, &self.upstream, peer).await;
        }

        let method = req.method().clone();
        let uri = req.uri().clone();
        debug!(%peer, %method, %uri, "Forwarding request");

        match forward_request(req, &self.upstream).await {
            Ok(response) => response,
            Err(e) => {
                // Log detailed error internally, return generic message externally
                error!(%peer, %method, %uri, error = %e, "Failed to forward request");
                text_error_response(ProxyErrorCode::ConnectionFailed, "Bad Gateway")
            }
        }
    }
}

/// The public listener in front of the backend
pub struct ProxyServer {
    bind_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        gate: SharedGate,
        upstream: Upstream,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            dispatcher: Arc::new(Dispatcher::new(gate, upstream, DEFAULT_PROBE_PATH)),
            shutdown_rx,
        }
    }

    pub fn with_probe_path(mut self, probe_path: impl Into<String>) -> Self {
        let gate = Arc::clone(&self.dispatcher.gate);
        let upstream = self.dispatcher.upstream;
        self.dispatcher = Arc::new(Dispatcher::new(gate, upstream, probe_path));
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            backend = %self.dispatcher.upstream.addr(),
            probe_path = %self.dispatcher.probe_path,
            "Proxy server listening"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, dispatcher).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
) -> anyhow::Result<()> {
    let _ = stream.set_nodelay(true);
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move { Ok::<_, hyper::Error>(dispatcher.dispatch(req, addr).await) }
    });

    // HTTP/1.1 only: upgrades are an HTTP/1.1 mechanism, and the tunnel recovers the
    // raw TcpStream from the upgraded connection
    http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
