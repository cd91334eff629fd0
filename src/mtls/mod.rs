//! Mutual TLS towards data holders.
//!
//! Every call to a data holder (discovery, JWKS, token, user-info) goes out
//! through one `reqwest::Client` that carries the data recipient's client
//! certificate.
//!
//! - [`config`]: YAML configuration (`MtlsConfig`)
//! - [`identity`]: X.509 inspection of the configured certificate (`CertIdentity`)
//! - [`client`]: building the shared HTTP client

pub mod client;
pub mod config;
pub mod identity;

pub use client::build_http_client;
pub use config::MtlsConfig;
pub use identity::CertIdentity;
