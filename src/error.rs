//! Error codes and plain-text error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use hyper::{Response, StatusCode};

/// Response body type shared by every handler
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Header carrying the machine-readable error code
pub const X_PROXY_ERROR: &str = "x-proxy-error";

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Backend has not printed a readiness marker yet
    NotReady,
    /// Failed to connect to, or talk to, the backend
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NotReady => "NOT_READY",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Plain-text error response for ordinary requests
pub fn text_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut body = message.into();
    body.push('\n');

    Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(X_PROXY_ERROR, code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Bare status response used to refuse a tunnel: no body, connection closed afterwards
pub fn status_line_response(code: ProxyErrorCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = code.status_code();
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}
