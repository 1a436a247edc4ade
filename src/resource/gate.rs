//! Request gate middleware
//!
//! Admits a request to its handler only after the bearer token validates and
//! the authorization policy admits the principal. Public paths bypass the gate.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use super::policy::{AuthorizationPolicy, PolicyDecision};
use super::validator::{TokenValidator, ValidatedPrincipal};

/// Why the gate refused a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRejection {
    /// No usable bearer token was presented
    MissingToken,
    /// A token was presented but did not validate
    InvalidToken,
    /// The policy denied the principal
    Forbidden,
}

impl IntoResponse for GateRejection {
    fn into_response(self) -> Response {
        match self {
            Self::MissingToken => unauthorized_response("Bearer"),
            Self::InvalidToken => unauthorized_response(r#"Bearer error="invalid_token""#),
            Self::Forbidden => (
                StatusCode::FORBIDDEN,
                [(header::WWW_AUTHENTICATE, r#"Bearer error="insufficient_scope""#)],
                Json(json!({ "error": "forbidden" })),
            )
                .into_response(),
        }
    }
}

/// Token validator, policy and public paths for the resource server
pub struct RequestGate {
    validator: Arc<TokenValidator>,
    policy: Arc<dyn AuthorizationPolicy>,
    public_paths: Vec<String>,
}

impl RequestGate {
    /// Create a gate
    pub fn new(
        validator: Arc<TokenValidator>,
        policy: Arc<dyn AuthorizationPolicy>,
        public_paths: Vec<String>,
    ) -> Self {
        Self {
            validator,
            policy,
            public_paths,
        }
    }

    /// Check if a path is public (bypasses the gate)
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| {
            path == p
                || path
                    .strip_prefix(p.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Validate the request's bearer token and apply the policy
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<ValidatedPrincipal, GateRejection> {
        let token = bearer_token(headers).ok_or(GateRejection::MissingToken)?;

        let principal = self
            .validator
            .validate(token)
            .await
            .map_err(|_| GateRejection::InvalidToken)?;

        match self.policy.evaluate(&principal) {
            PolicyDecision::Admit => Ok(principal),
            PolicyDecision::Deny(reason) => {
                warn!(
                    subject = %principal.subject,
                    policy = self.policy.name(),
                    reason = %reason,
                    "Policy denied request"
                );
                Err(GateRejection::Forbidden)
            }
        }
    }
}

/// Extract the token from `Authorization: Bearer <token>`.
///
/// The scheme is case-insensitive; an empty token or one containing
/// whitespace is treated as absent.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() || token.contains(char::is_whitespace) {
        return None;
    }
    Some(token)
}

/// Gate middleware
pub async fn gate_middleware(
    State(gate): State<Arc<RequestGate>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    if gate.is_public_path(&path) {
        debug!(path = %path, "Public path, skipping gate");
        return next.run(request).await;
    }

    match gate.authenticate(request.headers()).await {
        Ok(principal) => {
            debug!(subject = %principal.subject, path = %path, "Authenticated request");
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(rejection) => {
            if rejection == GateRejection::MissingToken {
                warn!(path = %path, "Missing or malformed Authorization header");
            }
            rejection.into_response()
        }
    }
}

/// Create a 401 Unauthorized response
fn unauthorized_response(challenge: &'static str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, challenge)],
        Json(json!({ "error": "unauthorized" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::{Extension, Router, middleware, routing::get};
    use tower::ServiceExt;

    use crate::resource::{AlwaysAdmitIfValid, KeySource, SigningKeyCache};
    use crate::testutil::{ISSUER, KEY_1_PEM, StaticKeySource, claims, jwks_json, mint};

    struct DenyAll;

    impl AuthorizationPolicy for DenyAll {
        fn evaluate(&self, _principal: &ValidatedPrincipal) -> PolicyDecision {
            PolicyDecision::Deny("no one gets in".to_string())
        }

        fn name(&self) -> &'static str {
            "deny-all"
        }
    }

    fn gate(policy: Arc<dyn AuthorizationPolicy>) -> Arc<RequestGate> {
        let source: Arc<dyn KeySource> = Arc::new(StaticKeySource::new(jwks_json(&["kid-1"])));
        let keys = Arc::new(SigningKeyCache::new(source, Duration::from_secs(300)));
        let validator = Arc::new(TokenValidator::new(keys, ISSUER));
        Arc::new(RequestGate::new(validator, policy, vec!["/health".to_string()]))
    }

    /// Router whose protected handler counts its invocations
    fn app(gate: Arc<RequestGate>, hits: Arc<AtomicUsize>) -> Router {
        Router::new()
            .route(
                "/data",
                get(move |Extension(principal): Extension<ValidatedPrincipal>| {
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        principal.subject
                    }
                }),
            )
            .route("/health", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(gate, gate_middleware))
    }

    fn request(path: &str, authorization: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(path);
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn missing_header_is_401_and_handler_not_run() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(gate(Arc::new(AlwaysAdmitIfValid)), Arc::clone(&hits));

        let response = app.oneshot(request("/data", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn valid_token_reaches_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(gate(Arc::new(AlwaysAdmitIfValid)), Arc::clone(&hits));
        let token = mint(KEY_1_PEM, Some("kid-1"), &claims(ISSUER));

        let response = app
            .oneshot(request("/data", Some(&format!("bearer {token}"))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tampered_token_is_401() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(gate(Arc::new(AlwaysAdmitIfValid)), Arc::clone(&hits));
        let mut token = mint(KEY_1_PEM, Some("kid-1"), &claims(ISSUER));
        let last = token.pop().unwrap();
        token.push(if last == 'A' { 'B' } else { 'A' });

        let response = app
            .oneshot(request("/data", Some(&format!("Bearer {token}"))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            r#"Bearer error="invalid_token""#
        );
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn policy_denial_is_403() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(gate(Arc::new(DenyAll)), Arc::clone(&hits));
        let token = mint(KEY_1_PEM, Some("kid-1"), &claims(ISSUER));

        let response = app
            .oneshot(request("/data", Some(&format!("Bearer {token}"))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn public_path_needs_no_token() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(gate(Arc::new(AlwaysAdmitIfValid)), hits);

        let response = app.oneshot(request("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn public_path_matches_whole_segments() {
        let gate = gate(Arc::new(AlwaysAdmitIfValid));
        assert!(gate.is_public_path("/health"));
        assert!(gate.is_public_path("/health/live"));
        assert!(!gate.is_public_path("/healthz"));
        assert!(!gate.is_public_path("/data"));
    }

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        for (value, expected) in [
            ("Bearer abc.def.ghi", Some("abc.def.ghi")),
            ("bEaReR abc", Some("abc")),
            ("Basic dXNlcjpwYXNz", None),
            ("Bearer", None),
            ("Bearer ", None),
            ("Bearer a b", None),
        ] {
            headers.insert(header::AUTHORIZATION, value.parse().unwrap());
            assert_eq!(bearer_token(&headers), expected, "header {value:?}");
        }
    }
}
