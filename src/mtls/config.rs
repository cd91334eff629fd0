//! mTLS client configuration.
//!
//! # Example YAML
//!
//! ```yaml
//! mtls:
//!   enabled: true
//!   client_cert: "/etc/consent-gateway/tls/client.crt"
//!   client_key:  "/etc/consent-gateway/tls/client.key"
//!   ca_cert:     "/etc/consent-gateway/tls/holders-ca.crt"
//! ```

use serde::{Deserialize, Serialize};

/// Client certificate presented to data holder endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MtlsConfig {
    /// Attach a client certificate to outbound requests.
    ///
    /// Enabled unless switched off explicitly. When `false` requests go out
    /// with server-authenticated TLS only, which is only useful against
    /// local test servers.
    pub enabled: bool,

    /// Path to the PEM-encoded client certificate (chain).
    pub client_cert: String,

    /// Path to the PEM-encoded client private key.
    pub client_key: String,

    /// Optional PEM bundle of extra trust anchors for data holder servers.
    #[serde(default)]
    pub ca_cert: Option<String>,
}

impl Default for MtlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            client_cert: String::new(),
            client_key: String::new(),
            ca_cert: None,
        }
    }
}
