//! Request authentication.
//!
//! Two credential schemes are accepted:
//!
//! - `Authorization: token <secret>` (or `token=<secret>`) carrying the
//!   operator token. Valid on every protected route.
//! - HTTP Basic whose password is the per-build bootstrap secret. Valid only
//!   on `/init-scripts/{build_id}` and `/instance-builds/{build_id}` for the
//!   build named in the path.
//!
//! A missing `Authorization` header yields 401 with a `WWW-Authenticate`
//! challenge; a header that does not check out yields 403. Successful
//! requests carry an [`Authenticated`] extension stamped with a per-process
//! marker, and handlers take [`Authenticated`] as an extractor so a route
//! mounted without the middleware cannot be reached.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use fleet_id::InstanceBuildId;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::api::error::ApiError;
use crate::api::request_context::{RequestContext, REQUEST_ID_HEADER};
use crate::db::{generate_secret, BootstrapStore, StoreError};
use crate::state::AppState;

/// Challenge sent with 401 responses.
pub const AUTH_CHALLENGE: &str = "Basic realm=\"fleetd\", token";

const BUILD_PATH_PREFIXES: [&str; 2] = ["/init-scripts/", "/instance-builds/"];

/// Credentials parsed from an `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Token(String),
    Basic { user: String, password: String },
}

/// Parses an `Authorization` header value. `None` means the value is not
/// in any supported form.
pub fn parse_authorization(value: &str) -> Option<Credential> {
    let value = value.trim();
    let (scheme, rest) = match value.find([' ', '=']) {
        Some(idx) => (&value[..idx], value[idx + 1..].trim()),
        None => return None,
    };

    if scheme.eq_ignore_ascii_case("token") {
        let token = rest.trim_matches('"');
        return (!token.is_empty()).then(|| Credential::Token(token.to_string()));
    }

    if scheme.eq_ignore_ascii_case("basic") {
        let decoded = STANDARD.decode(rest).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        return Some(Credential::Basic {
            user: user.to_string(),
            password: password.to_string(),
        });
    }

    None
}

/// The build id segment following `/init-scripts/` or `/instance-builds/`.
pub fn build_id_from_path(path: &str) -> Option<&str> {
    BUILD_PATH_PREFIXES.iter().find_map(|prefix| {
        let start = path.find(prefix)? + prefix.len();
        let segment = path[start..].split('/').next()?;
        (!segment.is_empty()).then_some(segment)
    })
}

fn digest_eq(a: &str, b: &str) -> bool {
    Sha256::digest(a.as_bytes()) == Sha256::digest(b.as_bytes())
}

/// Who a request was authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Operator,
    Bootstrap(InstanceBuildId),
}

/// Why a request was turned away.
#[derive(Debug)]
pub enum AuthFailure {
    Missing,
    Invalid,
    Unavailable(StoreError),
}

/// Marker inserted into request extensions once authentication succeeds.
#[derive(Debug, Clone)]
pub struct Authenticated {
    marker: Arc<str>,
    pub principal: Principal,
}

/// Holds the operator token and the per-process marker.
#[derive(Clone)]
pub struct AuthGate {
    operator_token: Arc<str>,
    marker: Arc<str>,
}

impl AuthGate {
    pub fn new(operator_token: impl Into<String>) -> Self {
        Self {
            operator_token: Arc::from(operator_token.into()),
            marker: Arc::from(generate_secret()),
        }
    }

    fn stamp(&self, principal: Principal) -> Authenticated {
        Authenticated {
            marker: self.marker.clone(),
            principal,
        }
    }

    fn is_stamped(&self, auth: &Authenticated) -> bool {
        auth.marker == self.marker
    }

    /// Accepts only the operator token.
    pub fn check_operator(&self, header: Option<&str>) -> Result<Authenticated, AuthFailure> {
        let header = header.ok_or(AuthFailure::Missing)?;
        match parse_authorization(header) {
            Some(Credential::Token(token)) if digest_eq(&token, &self.operator_token) => {
                Ok(self.stamp(Principal::Operator))
            }
            _ => Err(AuthFailure::Invalid),
        }
    }

    /// Accepts the operator token, or Basic credentials whose password is
    /// the bootstrap secret of the build named in `path`.
    pub async fn check_bootstrap(
        &self,
        header: Option<&str>,
        path: &str,
        bootstrap: &BootstrapStore,
    ) -> Result<Authenticated, AuthFailure> {
        let header = header.ok_or(AuthFailure::Missing)?;
        match parse_authorization(header) {
            Some(Credential::Token(token)) if digest_eq(&token, &self.operator_token) => {
                Ok(self.stamp(Principal::Operator))
            }
            Some(Credential::Basic { password, .. }) => {
                let build_id = build_id_from_path(path)
                    .and_then(|id| InstanceBuildId::parse(id).ok())
                    .ok_or(AuthFailure::Invalid)?;
                let secret = bootstrap
                    .secret(&build_id)
                    .await
                    .map_err(AuthFailure::Unavailable)?
                    .ok_or(AuthFailure::Invalid)?;
                if digest_eq(&password, &secret) {
                    Ok(self.stamp(Principal::Bootstrap(build_id)))
                } else {
                    Err(AuthFailure::Invalid)
                }
            }
            _ => Err(AuthFailure::Invalid),
        }
    }
}

fn rejection(failure: AuthFailure, request_id: &str) -> Response {
    match failure {
        AuthFailure::Missing => {
            let mut response = ApiError::unauthorized("unauthorized", "Authorization required")
                .with_request_id(request_id.to_string())
                .into_response();
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static(AUTH_CHALLENGE),
            );
            response
        }
        AuthFailure::Invalid => ApiError::forbidden("forbidden", "Invalid credentials")
            .with_request_id(request_id.to_string())
            .into_response(),
        AuthFailure::Unavailable(e) => ApiError::store(e, request_id).into_response(),
    }
}

fn request_parts(request: &Request) -> (Option<String>, String) {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    (authorization, request_id)
}

/// Middleware for operator-only routes.
pub async fn require_operator(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let (authorization, request_id) = request_parts(&request);
    match state.auth().check_operator(authorization.as_deref()) {
        Ok(auth) => {
            request.extensions_mut().insert(auth);
            next.run(request).await
        }
        Err(failure) => {
            debug!(path = %request.uri().path(), "Operator authentication failed");
            rejection(failure, &request_id)
        }
    }
}

/// Middleware for routes instances reach during bootstrap.
pub async fn require_bootstrap(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let (authorization, request_id) = request_parts(&request);
    let path = request.uri().path().to_string();
    let bootstrap = state.db().bootstrap();

    match state
        .auth()
        .check_bootstrap(authorization.as_deref(), &path, &bootstrap)
        .await
    {
        Ok(auth) => {
            request.extensions_mut().insert(auth);
            next.run(request).await
        }
        Err(failure) => {
            if matches!(failure, AuthFailure::Invalid) {
                warn!(path = %path, "Rejected bootstrap credentials");
            }
            rejection(failure, &request_id)
        }
    }
}

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let ctx = RequestContext::from_request_parts(parts, state).await?;
        match parts.extensions.get::<Authenticated>() {
            Some(auth) if state.auth().is_stamped(auth) => Ok(auth.clone()),
            _ => Err(ApiError::unauthorized("unauthorized", "Authorization required")
                .with_request_id(ctx.request_id)),
        }
    }
}
