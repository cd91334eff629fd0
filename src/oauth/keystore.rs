//! Data recipient signing keys and client assertions (`private_key_jwt`)

use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SigningConfig;
use crate::{Error, Result};

/// Client assertion type for JWT bearer client authentication (RFC 7523)
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Lifetime of a client assertion in seconds
const ASSERTION_LIFETIME_SECS: i64 = 300;

/// Claims of a client assertion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionClaims {
    /// Issuer, the client id
    pub iss: String,
    /// Subject, the client id
    pub sub: String,
    /// Audience, the token endpoint
    pub aud: String,
    /// Unique assertion id
    pub jti: String,
    /// Issued at (Unix seconds)
    pub iat: i64,
    /// Expiry (Unix seconds)
    pub exp: i64,
}

/// The data recipient's private signing key
#[derive(Clone)]
pub struct SigningKeystore {
    key_id: String,
    algorithm: Algorithm,
    key: Arc<EncodingKey>,
}

impl SigningKeystore {
    /// Build from a PEM-encoded private key
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for symmetric algorithms or keys that do not
    /// match the algorithm family.
    pub fn from_pem(pem: &[u8], key_id: impl Into<String>, algorithm: Algorithm) -> Result<Self> {
        let key = match algorithm {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => EncodingKey::from_rsa_pem(pem),
            Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(pem),
            Algorithm::EdDSA => EncodingKey::from_ed_pem(pem),
            _ => {
                return Err(Error::Config(format!(
                    "{algorithm:?} cannot sign client assertions"
                )));
            }
        }
        .map_err(|e| Error::Config(format!("Invalid {algorithm:?} signing key: {e}")))?;

        Ok(Self {
            key_id: key_id.into(),
            algorithm,
            key: Arc::new(key),
        })
    }

    /// Load the key named by the signing configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file cannot be read or parsed.
    pub async fn load(config: &SigningConfig) -> Result<Self> {
        let pem = tokio::fs::read(&config.key_path).await.map_err(|e| {
            Error::Config(format!("Cannot read signing key '{}': {e}", config.key_path))
        })?;
        Self::from_pem(&pem, config.key_id.clone(), config.algorithm)
    }

    /// Key identifier placed in the JOSE header
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Signing algorithm
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Sign a fresh client assertion for `client_id`, audience `token_endpoint`
    ///
    /// # Errors
    ///
    /// Returns `Error::Jwt` if signing fails.
    pub fn client_assertion(&self, client_id: &str, token_endpoint: &str) -> Result<String> {
        let now = Utc::now();
        let claims = AssertionClaims {
            iss: client_id.to_string(),
            sub: client_id.to_string(),
            aud: token_endpoint.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(self.algorithm);
        header.kid = Some(self.key_id.clone());

        Ok(encode(&header, &claims, &self.key)?)
    }
}

impl std::fmt::Debug for SigningKeystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeystore")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}
