//! Data holder discovery documents
//!
//! Fetches OpenID Provider Metadata (OpenID Connect Discovery 1.0, a
//! superset of RFC 8414) and the JWKS it points at.

use std::time::{Duration, Instant};

use jsonwebtoken::jwk::JwkSet;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Authorization server metadata of one data holder brand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Authorization server issuer URL
    pub issuer: String,

    /// Authorization endpoint URL
    #[serde(default)]
    pub authorization_endpoint: Option<String>,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// JWKS used to verify id tokens
    #[serde(default)]
    pub jwks_uri: Option<String>,

    /// Userinfo endpoint
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,

    /// Token revocation endpoint
    #[serde(default)]
    pub revocation_endpoint: Option<String>,

    /// Supported grant types
    #[serde(default)]
    pub grant_types_supported: Vec<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,

    /// Supported token endpoint auth methods
    #[serde(default)]
    pub token_endpoint_auth_methods_supported: Vec<String>,

    /// Supported id token signing algorithms
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,

    /// When this document was fetched
    #[serde(skip, default = "Instant::now")]
    pub fetched_at: Instant,
}

/// Deserialize scopes that may be either a string or array
fn deserialize_scopes<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(s) => Ok(s.split_whitespace().map(String::from).collect()),
        StringOrVec::Vec(v) => Ok(v),
    }
}

impl AuthorizationServerMetadata {
    /// Discover metadata from `{issuer}/.well-known/openid-configuration`
    ///
    /// # Errors
    ///
    /// Returns `Error::Transient`/`Error::Timeout` if the server is unreachable
    /// or answers 5xx, `Error::Rejected` on 4xx and `Error::Protocol` if the
    /// document is malformed or names another issuer.
    pub async fn discover(client: &Client, issuer: &str) -> Result<Self> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        debug!(url = %url, "Discovering data holder metadata");

        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::from_transport("metadata discovery", &e))?;
        let metadata: Self = read_json(response, "metadata discovery").await?;

        if metadata.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
            return Err(Error::Protocol(format!(
                "Discovery document issuer {} does not match {issuer}",
                metadata.issuer
            )));
        }

        debug!(issuer = %metadata.issuer, "Discovered authorization server");
        Ok(metadata)
    }

    /// Whether the document is younger than `ttl`
    #[must_use]
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }

    /// The JWKS URI, required for id token verification
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the document has none.
    pub fn require_jwks_uri(&self) -> Result<&str> {
        self.jwks_uri
            .as_deref()
            .ok_or_else(|| Error::Protocol(format!("{} publishes no jwks_uri", self.issuer)))
    }

    /// The userinfo endpoint, required for refresh exchanges without id token
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the document has none.
    pub fn require_userinfo_endpoint(&self) -> Result<&str> {
        self.userinfo_endpoint.as_deref().ok_or_else(|| {
            Error::Protocol(format!("{} publishes no userinfo_endpoint", self.issuer))
        })
    }
}

/// Signing keys published by a data holder
#[derive(Debug, Clone)]
pub struct HolderJwks {
    /// Published keys
    pub keys: JwkSet,
    /// When the set was fetched
    pub fetched_at: Instant,
}

impl HolderJwks {
    /// Fetch the key set at `jwks_uri`
    ///
    /// # Errors
    ///
    /// Same classification as [`AuthorizationServerMetadata::discover`].
    pub async fn fetch(client: &Client, jwks_uri: &str) -> Result<Self> {
        debug!(url = %jwks_uri, "Fetching data holder JWKS");
        let response = client
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| Error::from_transport("JWKS fetch", &e))?;
        let keys: JwkSet = read_json(response, "JWKS fetch").await?;

        debug!(count = keys.keys.len(), "Fetched data holder keys");
        Ok(Self {
            keys,
            fetched_at: Instant::now(),
        })
    }

    /// Whether the set is younger than `ttl`
    #[must_use]
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// Classify a data holder response and decode its JSON body
pub(crate) async fn read_json<T: DeserializeOwned>(response: Response, context: &str) -> Result<T> {
    let status = response.status();
    if status.is_server_error() {
        return Err(Error::Transient(format!("{context}: HTTP {status}")));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| Error::from_transport(context, &e))?;
    serde_json::from_slice(&body)
        .map_err(|e| Error::Protocol(format!("{context}: malformed response: {e}")))
}
