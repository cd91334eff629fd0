//! Client certificate inspection.
//!
//! Parses the data recipient's own transport certificate so the gateway can
//! log which identity it presents to data holders and refuse to start with a
//! certificate that is not currently valid.

use chrono::{DateTime, Utc};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;

use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Certificate identity
// ─────────────────────────────────────────────────────────────────────────────

/// Identity fields of the client certificate presented in mutual TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertIdentity {
    /// Certificate Common Name (CN).
    pub common_name: Option<String>,

    /// First Organisational Unit (OU) in the subject.
    pub organizational_unit: Option<String>,

    /// Subject Alternative Name DNS entries.
    pub san_dns_names: Vec<String>,

    /// Start of the validity window.
    pub not_before: DateTime<Utc>,

    /// End of the validity window.
    pub not_after: DateTime<Utc>,

    /// Human-readable label for logs.
    pub display_name: String,
}

impl CertIdentity {
    /// Parse a PEM-encoded certificate (the first block is used).
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the PEM or the certificate cannot be parsed.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let (_, block) = parse_x509_pem(pem)
            .map_err(|e| Error::Config(format!("Failed to decode client certificate PEM: {e}")))?;
        Self::from_der(&block.contents)
    }

    /// Parse a DER-encoded certificate and extract its identity fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the certificate cannot be parsed.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Config(format!("Failed to parse client certificate: {e}")))?;

        let common_name = extract_cn(&cert);
        let organizational_unit = extract_ou(&cert);
        let san_dns_names = extract_dns_sans(&cert);
        let display_name = common_name
            .clone()
            .or_else(|| san_dns_names.first().cloned())
            .unwrap_or_else(|| "<unknown>".to_owned());

        let validity = cert.validity();
        Ok(Self {
            common_name,
            organizational_unit,
            san_dns_names,
            not_before: to_utc(validity.not_before.timestamp())?,
            not_after: to_utc(validity.not_after.timestamp())?,
            display_name,
        })
    }

    /// Reject a certificate outside its validity window.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the certificate and the violated bound.
    pub fn ensure_current(&self, now: DateTime<Utc>) -> Result<()> {
        if now < self.not_before {
            return Err(Error::Config(format!(
                "Client certificate {} is not valid before {}",
                self.display_name, self.not_before
            )));
        }
        if now >= self.not_after {
            return Err(Error::Config(format!(
                "Client certificate {} expired at {}",
                self.display_name, self.not_after
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extraction helpers
// ─────────────────────────────────────────────────────────────────────────────

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| Error::Config(format!("Certificate timestamp out of range: {timestamp}")))
}

/// Extract the CN attribute from the subject DN.
fn extract_cn(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

/// Extract the first OU attribute from the subject DN.
fn extract_ou(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_organizational_unit()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

fn extract_dns_sans(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut dns_names = Vec::new();
    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for name in &san_ext.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                dns_names.push((*dns).to_owned());
            }
        }
    }
    dns_names
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
