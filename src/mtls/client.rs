//! Outbound HTTP client carrying the data recipient's TLS identity.

use std::fs;

use chrono::Utc;
use reqwest::{Certificate, Client, Identity};
use tracing::{debug, info, warn};

use crate::config::HttpConfig;
use crate::mtls::{CertIdentity, MtlsConfig};
use crate::{Error, Result};

/// Build the shared HTTP client used for every data holder call.
///
/// The client certificate is read once; the resulting client is cheap to
/// clone and shares its connection pool.
///
/// # Errors
///
/// Returns `Error::Config` if certificate files cannot be read or parsed,
/// if the certificate is not currently valid, or if the client cannot be built.
pub fn build_http_client(mtls: &MtlsConfig, http: &HttpConfig) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(http.timeout)
        .connect_timeout(http.connect_timeout)
        .user_agent(concat!("consent-gateway/", env!("CARGO_PKG_VERSION")));

    if mtls.enabled {
        let cert_pem = read_file(&mtls.client_cert)?;
        let key_pem = read_file(&mtls.client_key)?;

        let identity = CertIdentity::from_pem(&cert_pem)?;
        identity.ensure_current(Utc::now())?;
        info!(
            subject = %identity.display_name,
            not_after = %identity.not_after,
            "Using mTLS client certificate"
        );

        let mut bundle = cert_pem;
        bundle.push(b'\n');
        bundle.extend_from_slice(&key_pem);
        let tls_identity = Identity::from_pem(&bundle)
            .map_err(|e| Error::Config(format!("Invalid client certificate/key pair: {e}")))?;
        builder = builder.identity(tls_identity);

        if let Some(ca_path) = &mtls.ca_cert {
            let ca_pem = read_file(ca_path)?;
            let roots = Certificate::from_pem_bundle(&ca_pem)
                .map_err(|e| Error::Config(format!("Invalid CA bundle '{ca_path}': {e}")))?;
            debug!(count = roots.len(), ca_cert = %ca_path, "Adding trust anchors");
            for root in roots {
                builder = builder.add_root_certificate(root);
            }
        }
    } else {
        warn!("mTLS disabled: data holder requests carry no client certificate");
    }

    builder
        .build()
        .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))
}

fn read_file(path: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Config(format!("Cannot read '{path}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> String {
        format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))
    }

    #[test]
    fn plain_client_when_mtls_switched_off() {
        let mtls = MtlsConfig {
            enabled: false,
            ..MtlsConfig::default()
        };
        assert!(build_http_client(&mtls, &HttpConfig::default()).is_ok());
    }

    #[test]
    fn default_config_requires_a_certificate() {
        let err = build_http_client(&MtlsConfig::default(), &HttpConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn client_with_certificate_identity() {
        let mtls = MtlsConfig {
            enabled: true,
            client_cert: fixture("client_cert.pem"),
            client_key: fixture("client_key.pem"),
            ca_cert: None,
        };
        assert!(build_http_client(&mtls, &HttpConfig::default()).is_ok());
    }

    #[test]
    fn missing_certificate_is_config_error() {
        let mtls = MtlsConfig {
            enabled: true,
            client_cert: "/nonexistent/client.crt".to_string(),
            client_key: "/nonexistent/client.key".to_string(),
            ca_cert: None,
        };
        let err = build_http_client(&mtls, &HttpConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
