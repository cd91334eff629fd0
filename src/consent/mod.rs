//! Consent records and their store
//!
//! A consent record holds the tokens obtained for one authorization a
//! customer granted at a data holder. The record is owned by a
//! [`ConsentStore`]; token exchanges never mutate it directly but submit a
//! [`TokenUpdate`] fenced on the record version they started from.

mod file;
mod memory;

pub use file::FileConsentStore;
pub use memory::MemoryConsentStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::neuron::Neuron;
use crate::{Error, Result};

/// Identifier of a consent record
pub type ConsentId = u64;

/// Stored state of one consent
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsentRecord {
    /// Consent identifier
    pub id: ConsentId,
    /// Software product the consent was granted to
    pub software_product_id: String,
    /// Data holder brand holding the customer data
    pub data_holder_brand_id: String,
    /// Redirect URI used in the authorization request
    pub redirect_uri: String,

    /// Current access token
    #[serde(default)]
    pub access_token: Option<String>,
    /// Token type of the access token (usually "Bearer")
    #[serde(default)]
    pub token_type: Option<String>,
    /// When the access token expires
    #[serde(default)]
    pub access_token_expires_at: Option<DateTime<Utc>>,
    /// Current refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// When the refresh token expires
    #[serde(default)]
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    /// When the data sharing arrangement ends
    #[serde(default)]
    pub sharing_expires_at: Option<DateTime<Utc>>,
    /// Granted scope
    #[serde(default)]
    pub scope: Option<String>,
    /// Serialized claims of the most recent id token or user-info response
    #[serde(default)]
    pub id_token_claims: Option<String>,
    /// When the last token request was sent
    #[serde(default)]
    pub token_requested_at: Option<DateTime<Utc>>,
    /// Set once the consent is revoked
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,

    /// Incremented by every applied update
    #[serde(default)]
    pub version: u64,
}

impl ConsentRecord {
    /// Whether the record holds an access token usable at `now`
    #[must_use]
    pub fn has_current_access_token(&self, now: DateTime<Utc>) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        let has_token = self.access_token.as_deref().is_some_and(|t| !t.is_empty());
        has_token && self.access_token_expires_at.is_some_and(|exp| exp > now)
    }

    /// The stored refresh token, if any
    #[must_use]
    pub fn usable_refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|t| !t.is_empty())
    }

    /// Whether the consent has been revoked
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Apply a token update and bump the version.
    ///
    /// # Errors
    ///
    /// Returns `Error::Conflict` if the record moved past the version the
    /// update was computed from.
    pub fn apply(&mut self, update: &TokenUpdate) -> Result<()> {
        if self.version != update.expected_version {
            return Err(Error::Conflict(format!(
                "consent {} is at version {}, update expected {}",
                self.id, self.version, update.expected_version
            )));
        }

        let tokens = &update.tokens;
        let lifetime = i64::try_from(tokens.expires_in).unwrap_or(i64::MAX);
        self.access_token = Some(tokens.access_token.clone());
        self.token_type = Some(tokens.token_type.clone());
        self.access_token_expires_at = TimeDelta::try_seconds(lifetime)
            .and_then(|lifetime| update.requested_at.checked_add_signed(lifetime));
        if let Some(refresh_token) = &tokens.refresh_token {
            self.refresh_token = Some(refresh_token.clone());
        }
        if tokens.scope.is_some() {
            self.scope.clone_from(&tokens.scope);
        }
        self.token_requested_at = Some(update.requested_at);
        self.sharing_expires_at = update.sharing_expires_at;
        self.refresh_token_expires_at = update.refresh_token_expires_at;
        self.id_token_claims = Some(update.claims.clone());
        self.version += 1;
        Ok(())
    }
}

impl std::fmt::Debug for ConsentRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentRecord")
            .field("id", &self.id)
            .field("software_product_id", &self.software_product_id)
            .field("data_holder_brand_id", &self.data_holder_brand_id)
            .field("has_access_token", &self.access_token.is_some())
            .field("access_token_expires_at", &self.access_token_expires_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("sharing_expires_at", &self.sharing_expires_at)
            .field("revoked_at", &self.revoked_at)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Token fields taken from a token endpoint response
#[derive(Clone, PartialEq, Eq)]
pub struct TokenFields {
    /// New access token
    pub access_token: String,
    /// Token type
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    /// New refresh token, if rotated
    pub refresh_token: Option<String>,
    /// Granted scope
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenFields")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("refresh_token_rotated", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// One atomic token update, fenced on the record version
#[derive(Debug, Clone)]
pub struct TokenUpdate {
    /// Consent to update
    pub consent_id: ConsentId,
    /// Version the exchange started from
    pub expected_version: u64,
    /// Token fields from the response
    pub tokens: TokenFields,
    /// When the token request was dispatched
    pub requested_at: DateTime<Utc>,
    /// Sharing expiry derived from the trust claims
    pub sharing_expires_at: Option<DateTime<Utc>>,
    /// Refresh token expiry derived from the trust claims
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    /// Serialized trust claims
    pub claims: String,
}

/// Durable owner of consent records.
///
/// `update_tokens` must apply the whole update or nothing, and must reject
/// it with `Error::Conflict` when the stored version differs from
/// `expected_version`.
#[async_trait]
pub trait ConsentStore: Send + Sync {
    /// Load a consent record
    async fn load(&self, id: ConsentId) -> Result<ConsentRecord>;

    /// Apply a token update and return the new record
    async fn update_tokens(&self, update: TokenUpdate) -> Result<ConsentRecord>;
}

/// Whether a consent can be used as-is right now
#[must_use]
pub fn is_current(consent: &ConsentRecord) -> bool {
    consent.has_current_access_token(Utc::now())
}

/// Wrap a consent-producing node in the consent validator.
///
/// The returned node passes its input through unchanged and keeps it while
/// the access token is current; once it expires the source is resolved again.
pub fn validated_consent<I>(
    source: Arc<Neuron<I, ConsentRecord>>,
) -> Neuron<ConsentRecord, ConsentRecord>
where
    I: Send + 'static,
{
    let name = format!("valid-{}", source.name());
    Neuron::new(name, source, |consent: ConsentRecord| async move { Ok(consent) })
        .with_validator(is_current)
}
