//! Unary request forwarding
//!
//! Every request gets its own backend connection. Method, target, headers and body
//! go out untouched and the backend's status, headers and body stream straight back.

use crate::error::ProxyBody;
use crate::upstream::{Upstream, UpstreamError};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use tracing::debug;

/// Forward one request to the backend and return its response.
///
/// The backend connection lives until the response body has been fully streamed (or
/// dropped by the caller), then closes.
pub async fn forward_request(
    req: Request<Incoming>,
    upstream: &Upstream,
) -> Result<Response<ProxyBody>, UpstreamError> {
    let stream = upstream.connect().await?;

    let (mut sender, conn) = http1::Builder::new()
        .preserve_header_case(true)
        .handshake(TokioIo::new(stream))
        .await
        .map_err(UpstreamError::Handshake)?;

    let addr = upstream.addr();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(%addr, error = %e, "Backend connection closed with error");
        }
    });

    let (mut parts, body) = req.into_parts();
    parts.uri = origin_form(&parts.uri)?;

    let response = sender
        .send_request(Request::from_parts(parts, body))
        .await
        .map_err(UpstreamError::Request)?;

    Ok(response.map(|body| body.boxed()))
}

/// Reduce a request target to `path?query`, the form an origin server expects
fn origin_form(uri: &Uri) -> Result<Uri, UpstreamError> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Ok(path.parse::<Uri>()?)
}
