//! OAuth 2.0 / OpenID Connect client side of the data recipient
//!
//! - Discovery of data holder metadata and JWKS
//! - Client assertions signed with the recipient key (`private_key_jwt`)
//! - Authorization code and refresh token exchanges
//! - Id token verification and userinfo lookup

mod exchange;
mod id_token;
mod keystore;
mod metadata;
mod registration;
mod userinfo;

pub use exchange::{
    GrantRequest, IdTokenVerifier, TokenExchange, TokenResponse, TrustClaims, UserInfoSource,
    token_request_params,
};
pub use id_token::{JwksIdTokenVerifier, key_id, verify_with_key};
pub use keystore::{AssertionClaims, CLIENT_ASSERTION_TYPE, SigningKeystore};
pub use metadata::{AuthorizationServerMetadata, HolderJwks};
pub use registration::ClientRegistration;
pub use userinfo::{HttpUserInfo, fetch_user_info};
