//! oauth-m2m Library
//!
//! Machine-to-machine authorization with the OAuth 2.0 client-credentials grant.
//!
//! # Features
//!
//! - **Client side**: client registry, token cache with refresh skew,
//!   single-flight token acquisition, retrying grant exchange
//! - **Resource side**: JWT validation against the issuer's JWKS, request
//!   gate middleware for axum, pluggable authorization policy
//! - **Discovery**: OpenID Connect provider metadata for token and JWKS endpoints

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod error;
pub mod oauth;
pub mod outbound;
pub mod resource;
pub mod retry;

#[cfg(test)]
mod testutil;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // stdout carries command output
    let installed = match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
