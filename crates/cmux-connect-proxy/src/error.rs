use hyper::header::{HeaderValue, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use hyper::{Body, Response, StatusCode};
use thiserror::Error;

use crate::authority::AddrError;

/// Terminal failures of a tunnel request, before any byte is relayed.
///
/// The `Display` text of each variant is the plain-text body sent back to the
/// client.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error(transparent)]
    InvalidAuthority(#[from] AddrError),
    #[error("Host and port don't match: {requested} != {configured}")]
    AuthorityMismatch {
        requested: String,
        configured: String,
    },
    #[error("{0}")]
    DialFailure(#[source] std::io::Error),
    #[error("Hijacking not supported")]
    HijackUnsupported,
}

impl TunnelError {
    pub fn status(&self) -> StatusCode {
        match self {
            TunnelError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            TunnelError::InvalidAuthority(_) | TunnelError::AuthorityMismatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            TunnelError::DialFailure(_) | TunnelError::HijackUnsupported => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn into_response(self) -> Response<Body> {
        text_response(self.status(), self.to_string())
    }
}

pub(crate) fn text_response(status: StatusCode, msg: impl Into<String>) -> Response<Body> {
    let mut resp = Response::new(Body::from(msg.into()));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    resp
}
