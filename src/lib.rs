//! Consent Gateway Library
//!
//! Trust-and-token orchestration for a data recipient: exchanges OAuth2
//! authorization codes and refresh tokens at data holders under mutual TLS
//! and `private_key_jwt` client authentication, and reconciles the result
//! into durable consent records.
//!
//! # Features
//!
//! - **Self-healing nodes**: cached, validated, single-flight values with retry
//! - **Token exchange**: authorization code and refresh grants, id token or userinfo claims
//! - **Consent stores**: version-fenced atomic updates, in memory or on disk
//! - **mTLS**: client certificate identity on every data holder call

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod consent;
pub mod error;
pub mod failsafe;
pub mod mtls;
pub mod neuron;
pub mod oauth;
pub mod pathways;

pub use error::{Error, ErrorKind, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns `Error::Config` if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}
