//! Bearer token validation: JWT signature and claim checks.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`;
//!    only asymmetric algorithms are accepted.
//! 2. Resolve the issuer's key for `kid` from the [`SigningKeyCache`].
//! 3. Verify the signature.
//! 4. Check `iss` against the expected issuer, then `exp` and `nbf` with the
//!    configured leeway.
//! 5. Return a [`ValidatedPrincipal`] built from the claims.
//!
//! Every failure is a rejection; nothing is retried.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use super::keys::{KeyDiscoveryError, SigningKeyCache};

/// Why a token was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Signature did not verify, or no published key matches
    BadSignature,
    /// `exp` has passed
    Expired,
    /// `nbf` is in the future
    NotYetValid,
    /// `iss` is not the expected issuer
    WrongIssuer,
    /// Not a well-formed JWT, or a required claim is missing
    Malformed,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BadSignature => "bad signature",
            Self::Expired => "expired",
            Self::NotYetValid => "not yet valid",
            Self::WrongIssuer => "wrong issuer",
            Self::Malformed => "malformed",
        };
        f.write_str(s)
    }
}

/// Token validation failure
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// The issuer's keys could not be fetched
    #[error("signing key discovery failed: {0}")]
    KeyDiscoveryFailure(#[from] KeyDiscoveryError),
    /// The token itself is not acceptable
    #[error("token rejected: {0}")]
    Rejected(RejectReason),
}

impl ValidationError {
    /// Rejection reason, if the token itself was at fault
    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected(reason) => Some(*reason),
            Self::KeyDiscoveryFailure(_) => None,
        }
    }
}

impl From<RejectReason> for ValidationError {
    fn from(reason: RejectReason) -> Self {
        Self::Rejected(reason)
    }
}

/// Progress of one validation, reported when a token is rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStage {
    /// Raw token received
    Received,
    /// Header decoded and algorithm accepted
    ParsedHeader,
    /// Signing key found
    KeysResolved,
    /// Signature verified
    SignatureVerified,
    /// Issuer and validity window checked
    ClaimsChecked,
    /// Principal produced
    Admitted,
}

/// Authenticated caller derived from a valid token
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedPrincipal {
    /// `sub`, falling back to `azp` or `client_id`
    pub subject: String,
    /// `iss`
    pub issuer: String,
    /// `exp`
    pub expires_at: DateTime<Utc>,
    /// Scopes from `scope` (space separated) or `scp` (array)
    pub scopes: BTreeSet<String>,
    /// All claims
    pub claims: Map<String, Value>,
}

impl ValidatedPrincipal {
    /// Look up a claim
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    /// Whether the token grants `scope`
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }
}

/// Validates bearer tokens issued by one issuer
pub struct TokenValidator {
    keys: Arc<SigningKeyCache>,
    expected_issuer: String,
    leeway: Duration,
}

impl TokenValidator {
    /// Create a validator with a 60 second clock-skew leeway
    pub fn new(keys: Arc<SigningKeyCache>, expected_issuer: impl Into<String>) -> Self {
        Self {
            keys,
            expected_issuer: expected_issuer.into(),
            leeway: Duration::from_secs(60),
        }
    }

    /// Set the clock-skew leeway for `exp` and `nbf`
    #[must_use]
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Validate a raw bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Rejected`] for any unacceptable token and
    /// [`ValidationError::KeyDiscoveryFailure`] if the issuer's keys could not
    /// be fetched.
    pub async fn validate(&self, raw: &str) -> Result<ValidatedPrincipal, ValidationError> {
        let mut stage = ValidationStage::Received;
        let result = self.run(raw, &mut stage).await;

        match &result {
            Ok(principal) => {
                debug!(subject = %principal.subject, "Token admitted");
            }
            Err(ValidationError::KeyDiscoveryFailure(e)) => {
                error!(stage = ?stage, error = %e, "Token rejected: signing keys unavailable");
            }
            Err(ValidationError::Rejected(reason)) => {
                warn!(stage = ?stage, reason = %reason, "Token rejected");
            }
        }
        result
    }

    async fn run(
        &self,
        raw: &str,
        stage: &mut ValidationStage,
    ) -> Result<ValidatedPrincipal, ValidationError> {
        let header = jsonwebtoken::decode_header(raw).map_err(|e| reject_reason(&e))?;
        if !is_asymmetric(header.alg) {
            debug!(alg = ?header.alg, "Refusing non-asymmetric algorithm");
            return Err(RejectReason::BadSignature.into());
        }
        let kid = header.kid.ok_or(RejectReason::Malformed)?;
        *stage = ValidationStage::ParsedHeader;

        let key = self.keys.get(&kid).await?.ok_or_else(|| {
            debug!(kid = %kid, "No published key for kid");
            RejectReason::BadSignature
        })?;
        *stage = ValidationStage::KeysResolved;

        let claims = jsonwebtoken::decode::<Map<String, Value>>(
            raw,
            &key,
            &signature_only(header.alg),
        )
        .map_err(|e| reject_reason(&e))?
        .claims;
        *stage = ValidationStage::SignatureVerified;

        let expires_at = self.check_claims(&claims, Utc::now().timestamp())?;
        *stage = ValidationStage::ClaimsChecked;

        let principal = build_principal(claims, expires_at)?;
        *stage = ValidationStage::Admitted;
        Ok(principal)
    }

    /// Check issuer and validity window; returns the expiry
    fn check_claims(
        &self,
        claims: &Map<String, Value>,
        now: i64,
    ) -> Result<DateTime<Utc>, RejectReason> {
        let issuer = claims.get("iss").and_then(Value::as_str);
        if issuer != Some(self.expected_issuer.as_str()) {
            debug!(issuer = ?issuer, expected = %self.expected_issuer, "Issuer mismatch");
            return Err(RejectReason::WrongIssuer);
        }

        let leeway = i64::try_from(self.leeway.as_secs()).unwrap_or(i64::MAX);

        let exp = numeric_claim(claims, "exp")?.ok_or(RejectReason::Malformed)?;
        if now >= exp.saturating_add(leeway) {
            return Err(RejectReason::Expired);
        }

        if let Some(nbf) = numeric_claim(claims, "nbf")? {
            if now.saturating_add(leeway) < nbf {
                return Err(RejectReason::NotYetValid);
            }
        }

        DateTime::from_timestamp(exp, 0).ok_or(RejectReason::Malformed)
    }
}

fn is_asymmetric(alg: Algorithm) -> bool {
    matches!(
        alg,
        Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512
            | Algorithm::ES256
            | Algorithm::ES384
            | Algorithm::EdDSA
    )
}

/// Validation that checks the signature and nothing else; claims are
/// checked separately so each failure maps to a precise reason.
fn signature_only(alg: Algorithm) -> Validation {
    let mut validation = Validation::new(alg);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    validation
}

fn reject_reason(err: &jsonwebtoken::errors::Error) -> RejectReason {
    match err.kind() {
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            RejectReason::Malformed
        }
        _ => RejectReason::BadSignature,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn numeric_claim(claims: &Map<String, Value>, name: &str) -> Result<Option<i64>, RejectReason> {
    match claims.get(name) {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or(RejectReason::Malformed),
        Some(_) => Err(RejectReason::Malformed),
    }
}

fn build_principal(
    claims: Map<String, Value>,
    expires_at: DateTime<Utc>,
) -> Result<ValidatedPrincipal, RejectReason> {
    let subject = ["sub", "azp", "client_id"]
        .iter()
        .find_map(|name| claims.get(*name).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .ok_or(RejectReason::Malformed)?
        .to_string();

    let issuer = claims
        .get("iss")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let scopes = match (claims.get("scope"), claims.get("scp")) {
        (Some(Value::String(s)), _) => s.split_whitespace().map(str::to_string).collect(),
        (_, Some(Value::Array(items))) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => BTreeSet::new(),
    };

    Ok(ValidatedPrincipal {
        subject,
        issuer,
        expires_at,
        scopes,
        claims,
    })
}
