//! Token exchange at a data holder's token endpoint
//!
//! One exchange turns an authorization code or the stored refresh token into
//! a new token set, derives the trust claims (sharing and refresh token
//! expiry) from the id token or the userinfo endpoint, and hands the result
//! to the consent store as a single fenced update.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::keystore::{CLIENT_ASSERTION_TYPE, SigningKeystore};
use super::metadata::{AuthorizationServerMetadata, read_json};
use super::registration::ClientRegistration;
use crate::consent::{ConsentRecord, ConsentStore, TokenFields, TokenUpdate};
use crate::{Error, Result};

/// The OAuth2 grant exercised by an exchange
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum GrantRequest {
    /// Redeem an authorization code
    AuthorizationCode {
        /// Code returned to the redirect URI
        code: String,
    },
    /// Redeem the refresh token stored on the consent
    RefreshToken,
}

impl GrantRequest {
    /// `grant_type` parameter value
    #[must_use]
    pub fn grant_type(&self) -> &'static str {
        match self {
            Self::AuthorizationCode { .. } => "authorization_code",
            Self::RefreshToken => "refresh_token",
        }
    }

    /// Check that this grant can start from `consent`, without any I/O
    ///
    /// # Errors
    ///
    /// Returns `Error::Precondition` for a revoked consent, an empty code or
    /// a refresh grant without a stored refresh token.
    pub fn check(&self, consent: &ConsentRecord) -> Result<()> {
        if consent.is_revoked() {
            return Err(Error::Precondition(format!("consent {} is revoked", consent.id)));
        }
        grant_params(self, consent).map(|_| ())
    }
}

impl std::fmt::Debug for GrantRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.grant_type())
    }
}

/// Token endpoint response
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    /// Access token
    pub access_token: String,
    /// Token type
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    /// Rotated refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scope
    #[serde(default)]
    pub scope: Option<String>,
    /// Identity token
    #[serde(default)]
    pub id_token: Option<String>,
}

impl TokenResponse {
    /// The id token, treating an empty string as absent
    #[must_use]
    pub fn id_token(&self) -> Option<&str> {
        self.id_token.as_deref().filter(|t| !t.is_empty())
    }

    /// The fields persisted on the consent
    #[must_use]
    pub fn token_fields(&self) -> TokenFields {
        TokenFields {
            access_token: self.access_token.clone(),
            token_type: self.token_type.clone(),
            expires_in: self.expires_in,
            refresh_token: self.refresh_token.clone().filter(|t| !t.is_empty()),
            scope: self.scope.clone(),
        }
    }
}

/// Claims establishing how long the data sharing arrangement lasts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustClaims {
    /// Subject (customer pseudonym)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// End of the sharing arrangement (Unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharing_expires_at: Option<i64>,
    /// Refresh token expiry (Unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token_expires_at: Option<i64>,
    /// Every other claim, kept verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TrustClaims {
    /// Sharing expiry as a timestamp
    #[must_use]
    pub fn sharing_expires(&self) -> Option<DateTime<Utc>> {
        self.sharing_expires_at
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }

    /// Refresh token expiry as a timestamp
    #[must_use]
    pub fn refresh_token_expires(&self) -> Option<DateTime<Utc>> {
        self.refresh_token_expires_at
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }
}

/// Verifies id tokens issued by a data holder
#[async_trait]
pub trait IdTokenVerifier: Send + Sync {
    /// Check signature and claims of `id_token` and extract the trust claims
    async fn verify(
        &self,
        software_product_id: &str,
        brand_id: &str,
        id_token: &str,
    ) -> Result<TrustClaims>;
}

/// Fetches trust claims from the data holder's userinfo endpoint
#[async_trait]
pub trait UserInfoSource: Send + Sync {
    /// Call userinfo for `consent` with the freshly issued `access_token`
    async fn fetch(&self, consent: &ConsentRecord, access_token: &str) -> Result<TrustClaims>;
}

/// Token request form fields, grant-specific fields first.
///
/// The match is exhaustive on the grant, so a request carries either
/// `code` and `redirect_uri` or `refresh_token`, never both.
///
/// # Errors
///
/// Returns `Error::Precondition` for an empty code or a consent without a
/// refresh token.
pub fn token_request_params(
    grant: &GrantRequest,
    consent: &ConsentRecord,
    client_id: &str,
    client_assertion: &str,
) -> Result<Vec<(&'static str, String)>> {
    let mut params = grant_params(grant, consent)?;
    params.extend([
        ("client_id", client_id.to_string()),
        ("client_assertion_type", CLIENT_ASSERTION_TYPE.to_string()),
        ("client_assertion", client_assertion.to_string()),
    ]);
    Ok(params)
}

fn grant_params(
    grant: &GrantRequest,
    consent: &ConsentRecord,
) -> Result<Vec<(&'static str, String)>> {
    let grant_type = ("grant_type", grant.grant_type().to_string());
    match grant {
        GrantRequest::AuthorizationCode { code } => {
            if code.is_empty() {
                return Err(Error::Precondition("authorization code is empty".into()));
            }
            Ok(vec![
                grant_type,
                ("code", code.clone()),
                ("redirect_uri", consent.redirect_uri.clone()),
            ])
        }
        GrantRequest::RefreshToken => {
            let refresh_token = consent.usable_refresh_token().ok_or_else(|| {
                Error::Precondition(format!("consent {} holds no refresh token", consent.id))
            })?;
            Ok(vec![grant_type, ("refresh_token", refresh_token.to_string())])
        }
    }
}

/// Performs token exchanges and reconciles them into the consent store
#[derive(Clone)]
pub struct TokenExchange {
    http: Client,
    id_tokens: Arc<dyn IdTokenVerifier>,
    user_info: Arc<dyn UserInfoSource>,
    store: Arc<dyn ConsentStore>,
}

impl TokenExchange {
    /// Create an exchange over the mTLS client and its collaborators
    pub fn new(
        http: Client,
        id_tokens: Arc<dyn IdTokenVerifier>,
        user_info: Arc<dyn UserInfoSource>,
        store: Arc<dyn ConsentStore>,
    ) -> Self {
        Self {
            http,
            id_tokens,
            user_info,
            store,
        }
    }

    /// Replace the id token verifier
    #[must_use]
    pub fn with_id_token_verifier(mut self, id_tokens: Arc<dyn IdTokenVerifier>) -> Self {
        self.id_tokens = id_tokens;
        self
    }

    /// Replace the userinfo source
    #[must_use]
    pub fn with_user_info(mut self, user_info: Arc<dyn UserInfoSource>) -> Self {
        self.user_info = user_info;
        self
    }

    /// Exchange `grant` for tokens and persist them on `consent`
    ///
    /// # Errors
    ///
    /// - `Error::Precondition` before any network call if the grant cannot
    ///   start from this consent
    /// - `Error::Transient`/`Error::Timeout` for network failures and 5xx
    /// - `Error::Rejected` if the token endpoint refuses the request
    /// - `Error::Protocol` for malformed responses or a missing id token on
    ///   an authorization code grant
    /// - `Error::Conflict` if the consent changed since it was loaded
    pub async fn exchange(
        &self,
        grant: &GrantRequest,
        consent: &ConsentRecord,
        keystore: &SigningKeystore,
        metadata: &AuthorizationServerMetadata,
        registration: &ClientRegistration,
    ) -> Result<ConsentRecord> {
        grant.check(consent)?;
        check_registration(consent, registration)?;
        let assertion =
            keystore.client_assertion(&registration.client_id, &metadata.token_endpoint)?;
        let params =
            token_request_params(grant, consent, &registration.client_id, &assertion)?;

        info!(
            consent_id = consent.id,
            brand_id = %consent.data_holder_brand_id,
            grant = grant.grant_type(),
            "Requesting tokens"
        );
        let requested_at = Utc::now();
        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::from_transport("token request", &e))?;
        let tokens: TokenResponse = read_json(response, "token request").await?;
        if tokens.access_token.is_empty() {
            return Err(Error::Protocol("token response carries an empty access_token".into()));
        }

        let claims = self.trust_claims(grant, consent, &tokens).await?;
        let update = TokenUpdate {
            consent_id: consent.id,
            expected_version: consent.version,
            tokens: tokens.token_fields(),
            requested_at,
            sharing_expires_at: claims.sharing_expires(),
            refresh_token_expires_at: claims.refresh_token_expires(),
            claims: serde_json::to_string(&claims)?,
        };

        let updated = self.store.update_tokens(update).await?;
        info!(
            consent_id = updated.id,
            version = updated.version,
            expires_at = ?updated.access_token_expires_at,
            "Consent tokens updated"
        );
        Ok(updated)
    }

    async fn trust_claims(
        &self,
        grant: &GrantRequest,
        consent: &ConsentRecord,
        tokens: &TokenResponse,
    ) -> Result<TrustClaims> {
        match (grant, tokens.id_token()) {
            (_, Some(id_token)) => {
                debug!(consent_id = consent.id, "Deriving claims from id token");
                self.id_tokens
                    .verify(
                        &consent.software_product_id,
                        &consent.data_holder_brand_id,
                        id_token,
                    )
                    .await
            }
            (GrantRequest::AuthorizationCode { .. }, None) => Err(Error::Protocol(
                "authorization code response carries no id_token".into(),
            )),
            (GrantRequest::RefreshToken, None) => {
                debug!(consent_id = consent.id, "Deriving claims from userinfo");
                self.user_info.fetch(consent, &tokens.access_token).await
            }
        }
    }
}

fn check_registration(consent: &ConsentRecord, registration: &ClientRegistration) -> Result<()> {
    if consent.software_product_id != registration.software_product_id
        || consent.data_holder_brand_id != registration.brand_id
    {
        return Err(Error::Precondition(format!(
            "consent {} belongs to {} at {}, registration is for {} at {}",
            consent.id,
            consent.software_product_id,
            consent.data_holder_brand_id,
            registration.software_product_id,
            registration.brand_id
        )));
    }
    Ok(())
}
