//! Resource server side: bearer token validation and the request gate.
//!
//! Inbound requests pass through [`gate_middleware`], which extracts the
//! bearer token, validates it with [`TokenValidator`] against the issuer's
//! published keys and applies an [`AuthorizationPolicy`] before the handler
//! runs.

mod gate;
mod keys;
mod policy;
mod server;
mod validator;

pub use gate::{GateRejection, RequestGate, bearer_token, gate_middleware};
pub use keys::{HttpKeySource, KeyDiscoveryError, KeySource, SigningKeyCache};
pub use policy::{AlwaysAdmitIfValid, AuthorizationPolicy, PolicyDecision};
pub use server::{ResourceServer, create_router, serve};
pub use validator::{
    RejectReason, TokenValidator, ValidatedPrincipal, ValidationError, ValidationStage,
};
