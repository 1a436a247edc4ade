//! Authorization policy applied after a token has been validated.

use super::validator::ValidatedPrincipal;

/// Outcome of a policy evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Let the request through
    Admit,
    /// Refuse with 403; the reason is logged, never sent to the client
    Deny(String),
}

/// Decides whether an authenticated principal may proceed
pub trait AuthorizationPolicy: Send + Sync {
    /// Evaluate the policy for `principal`
    fn evaluate(&self, principal: &ValidatedPrincipal) -> PolicyDecision;

    /// Name used in logs
    fn name(&self) -> &'static str;
}

/// Admits every principal that passed validation
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAdmitIfValid;

impl AuthorizationPolicy for AlwaysAdmitIfValid {
    fn evaluate(&self, _principal: &ValidatedPrincipal) -> PolicyDecision {
        PolicyDecision::Admit
    }

    fn name(&self) -> &'static str {
        "always-admit-if-valid"
    }
}
