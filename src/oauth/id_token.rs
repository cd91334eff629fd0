//! Id token verification against the data holder's published keys

use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use tracing::debug;

use super::exchange::{IdTokenVerifier, TrustClaims};
use super::metadata::{AuthorizationServerMetadata, HolderJwks};
use super::registration::ClientRegistration;
use crate::neuron::{Neuron, Resolver};
use crate::pathways::HolderNodes;
use crate::{Error, Result};

/// Key id named in the JOSE header of `id_token`
///
/// # Errors
///
/// Returns `Error::Protocol` if the header is unreadable or has no `kid`.
pub fn key_id(id_token: &str) -> Result<String> {
    decode_header(id_token)
        .map_err(|e| Error::Protocol(format!("unreadable id token header: {e}")))?
        .kid
        .ok_or_else(|| Error::Protocol("id token header has no kid".into()))
}

/// Verify signature, issuer, audience and expiry of `id_token` with `jwk`
///
/// # Errors
///
/// Returns `Error::Protocol` on any verification failure.
pub fn verify_with_key(
    id_token: &str,
    jwk: &Jwk,
    issuer: &str,
    client_id: &str,
) -> Result<TrustClaims> {
    let header = decode_header(id_token)
        .map_err(|e| Error::Protocol(format!("unreadable id token header: {e}")))?;
    if matches!(
        header.alg,
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
    ) {
        return Err(Error::Protocol(format!(
            "id token signed with symmetric {:?}",
            header.alg
        )));
    }

    let key = DecodingKey::from_jwk(jwk)
        .map_err(|e| Error::Protocol(format!("unusable data holder key: {e}")))?;

    let mut validation = Validation::new(header.alg);
    validation.set_issuer(&[issuer]);
    validation.set_audience(&[client_id]);
    validation.set_required_spec_claims(&["exp", "iss", "aud"]);

    decode::<TrustClaims>(id_token, &key, &validation)
        .map(|data| data.claims)
        .map_err(|e| Error::Protocol(format!("id token rejected: {e}")))
}

/// Verifies id tokens with the JWKS of the issuing data holder brand.
///
/// An unknown `kid` forces one refresh of the cached key set before the
/// token is rejected.
pub struct JwksIdTokenVerifier {
    nodes: Arc<HolderNodes>,
    resolver: Resolver,
}

impl JwksIdTokenVerifier {
    /// Create a verifier resolving keys through `nodes`
    pub fn new(nodes: Arc<HolderNodes>, resolver: Resolver) -> Self {
        Self { nodes, resolver }
    }

    fn node(
        &self,
        software_product_id: &str,
        brand_id: &str,
        id_token: &str,
    ) -> Result<Neuron<(AuthorizationServerMetadata, HolderJwks, ClientRegistration), TrustClaims>>
    {
        let jwks = self.nodes.jwks(brand_id)?;
        let dependencies = (
            self.nodes.metadata(brand_id)?,
            Arc::clone(&jwks),
            self.nodes.registration(software_product_id, brand_id)?,
        );
        let resolver = self.resolver.clone();
        let id_token = id_token.to_string();

        let node = Neuron::new(
            format!("id-token-{brand_id}"),
            dependencies,
            move |(metadata, keys, registration): (
                AuthorizationServerMetadata,
                HolderJwks,
                ClientRegistration,
            )| {
                let jwks = Arc::clone(&jwks);
                let resolver = resolver.clone();
                let id_token = id_token.clone();
                async move {
                    let kid = key_id(&id_token)?;
                    let keys = if keys.keys.find(&kid).is_some() {
                        keys
                    } else {
                        debug!(kid = %kid, issuer = %metadata.issuer, "Unknown key id, refreshing JWKS");
                        jwks.invalidate();
                        resolver.require(&jwks).await?
                    };
                    let jwk = keys.keys.find(&kid).ok_or_else(|| {
                        Error::Protocol(format!("{} publishes no key {kid}", metadata.issuer))
                    })?;
                    verify_with_key(&id_token, jwk, &metadata.issuer, &registration.client_id)
                }
            },
        );
        Ok(node.uncached())
    }
}

#[async_trait]
impl IdTokenVerifier for JwksIdTokenVerifier {
    async fn verify(
        &self,
        software_product_id: &str,
        brand_id: &str,
        id_token: &str,
    ) -> Result<TrustClaims> {
        let node = Arc::new(self.node(software_product_id, brand_id, id_token)?);
        self.resolver.require(&node).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Utc;
    use jsonwebtoken::jwk::JwkSet;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    use super::*;
    use crate::ErrorKind;

    const HOLDER_KEY: &[u8] = include_bytes!("../../tests/fixtures/holder_signing_key.pem");
    const OTHER_KEY: &[u8] = include_bytes!("../../tests/fixtures/recipient_signing_key.pem");
    const HOLDER_JWKS: &str = include_str!("../../tests/fixtures/holder_jwks.json");
    const ISSUER: &str = "https://auth.bank-a.example";

    pub(crate) fn sign(key: &[u8], kid: &str, claims: &serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(kid.to_string());
        encode(&header, claims, &EncodingKey::from_ec_pem(key).unwrap()).unwrap()
    }

    fn claims(aud: &str) -> serde_json::Value {
        json!({
            "iss": ISSUER,
            "aud": aud,
            "sub": "customer-7",
            "iat": Utc::now().timestamp(),
            "exp": Utc::now().timestamp() + 300,
            "sharing_expires_at": 1_900_000_000,
            "refresh_token_expires_at": 1_800_000_000
        })
    }

    fn holder_jwk() -> Jwk {
        let set: JwkSet = serde_json::from_str(HOLDER_JWKS).unwrap();
        set.find("holder-key-1").unwrap().clone()
    }

    #[test]
    fn valid_token_yields_trust_claims() {
        let token = sign(HOLDER_KEY, "holder-key-1", &claims("client-123"));
        let trust = verify_with_key(&token, &holder_jwk(), ISSUER, "client-123").unwrap();

        assert_eq!(trust.sub.as_deref(), Some("customer-7"));
        assert_eq!(trust.sharing_expires_at, Some(1_900_000_000));
        assert_eq!(trust.refresh_token_expires_at, Some(1_800_000_000));
    }

    #[test]
    fn wrong_audience_is_rejected() {
        let token = sign(HOLDER_KEY, "holder-key-1", &claims("someone-else"));
        let err = verify_with_key(&token, &holder_jwk(), ISSUER, "client-123").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let token = sign(HOLDER_KEY, "holder-key-1", &claims("client-123"));
        let err = verify_with_key(&token, &holder_jwk(), "https://evil.example", "client-123")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let token = sign(OTHER_KEY, "holder-key-1", &claims("client-123"));
        let err = verify_with_key(&token, &holder_jwk(), ISSUER, "client-123").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn expired_token_is_rejected() {
        let mut expired = claims("client-123");
        expired["exp"] = json!(Utc::now().timestamp() - 3600);
        let token = sign(HOLDER_KEY, "holder-key-1", &expired);
        assert!(verify_with_key(&token, &holder_jwk(), ISSUER, "client-123").is_err());
    }

    #[test]
    fn symmetric_token_is_rejected() {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("holder-key-1".into());
        let token = encode(
            &header,
            &claims("client-123"),
            &EncodingKey::from_secret(b"guessable"),
        )
        .unwrap();

        let err = verify_with_key(&token, &holder_jwk(), ISSUER, "client-123").unwrap_err();
        assert!(err.to_string().contains("symmetric"));
    }

    #[test]
    fn key_id_is_read_from_header() {
        let token = sign(HOLDER_KEY, "holder-key-1", &claims("client-123"));
        assert_eq!(key_id(&token).unwrap(), "holder-key-1");
        assert!(matches!(key_id("not-a-jwt"), Err(Error::Protocol(_))));
    }
}
