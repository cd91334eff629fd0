//! Trust claims from the data holder's userinfo endpoint

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::ACCEPT;
use tracing::debug;

use super::exchange::{TrustClaims, UserInfoSource};
use super::metadata::{AuthorizationServerMetadata, read_json};
use crate::consent::ConsentRecord;
use crate::neuron::{Neuron, Resolver};
use crate::pathways::HolderNodes;
use crate::{Error, Result};

/// Call `endpoint` with `access_token` and decode the claims
///
/// # Errors
///
/// Transport failures and 5xx are transient, 4xx is `Error::Rejected`, a
/// malformed body is `Error::Protocol`.
pub async fn fetch_user_info(http: &Client, endpoint: &str, access_token: &str) -> Result<TrustClaims> {
    debug!(url = %endpoint, "Fetching userinfo");
    let response = http
        .get(endpoint)
        .bearer_auth(access_token)
        .header(ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| Error::from_transport("userinfo", &e))?;
    read_json(response, "userinfo").await
}

/// Userinfo source resolving the endpoint from the consent's data holder
pub struct HttpUserInfo {
    nodes: Arc<HolderNodes>,
    resolver: Resolver,
}

impl HttpUserInfo {
    /// Create a source resolving metadata through `nodes`
    pub fn new(nodes: Arc<HolderNodes>, resolver: Resolver) -> Self {
        Self { nodes, resolver }
    }
}

#[async_trait]
impl UserInfoSource for HttpUserInfo {
    async fn fetch(&self, consent: &ConsentRecord, access_token: &str) -> Result<TrustClaims> {
        let http = self.nodes.http().clone();
        let access_token = access_token.to_string();

        let node = Neuron::new(
            format!("userinfo-{}", consent.id),
            self.nodes.metadata(&consent.data_holder_brand_id)?,
            move |metadata: AuthorizationServerMetadata| {
                let http = http.clone();
                let access_token = access_token.clone();
                async move {
                    let endpoint = metadata.require_userinfo_endpoint()?;
                    fetch_user_info(&http, endpoint, &access_token).await
                }
            },
        )
        .uncached();

        self.resolver.require(&Arc::new(node)).await
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::ErrorKind;

    #[tokio::test]
    async fn sends_bearer_token_and_decodes_claims() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .and(header("authorization", "Bearer at-new"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sub": "customer-7",
                "sharing_expires_at": 1_900_000_000,
                "refresh_token_expires_at": 1_800_000_000
            })))
            .expect(1)
            .mount(&server)
            .await;

        let claims = fetch_user_info(&Client::new(), &format!("{}/userinfo", server.uri()), "at-new")
            .await
            .unwrap();
        assert_eq!(claims.sharing_expires_at, Some(1_900_000_000));
    }

    #[tokio::test]
    async fn unauthorized_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = fetch_user_info(&Client::new(), &format!("{}/userinfo", server.uri()), "at")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected { status: 401, .. }));
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = fetch_user_info(&Client::new(), &format!("{}/userinfo", server.uri()), "at")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
