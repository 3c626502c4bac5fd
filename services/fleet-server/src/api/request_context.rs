//! Request-scoped context extracted from HTTP requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request};
use fleet_id::RequestId;
use tower_http::request_id::{MakeRequestId, RequestId as HeaderRequestId};

use crate::api::error::ApiError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn request_id_header() -> HeaderName {
    HeaderName::from_static(REQUEST_ID_HEADER)
}

/// Assigns `req_<ulid>` ids to requests that arrive without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeFleetRequestId;

impl MakeRequestId for MakeFleetRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<HeaderRequestId> {
        HeaderValue::from_str(&RequestId::new().to_string())
            .ok()
            .map(HeaderRequestId::new)
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .unwrap_or_else(|| RequestId::new().to_string());
        Ok(Self { request_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_request_ids_are_prefixed() {
        let request = Request::builder().body(()).unwrap();
        let id = MakeFleetRequestId.make_request_id(&request).unwrap();
        assert!(id.header_value().to_str().unwrap().starts_with("req_"));
    }
}
