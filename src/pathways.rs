//! Registry of the node graph behind token exchanges
//!
//! The graph is wired explicitly once at startup:
//!
//! ```text
//! keystore ─────────────┐
//! metadata(brand) ──────┼──► exchange(consent, grant) ──► valid-consent(consent)
//! registration(p, b) ───┤
//! consent(id) ──────────┘
//! metadata(brand) ──► jwks(brand) ──► id-token(brand)
//! metadata(brand) ──► userinfo(consent)
//! ```
//!
//! [`HolderNodes`] owns the long-lived nodes (keystore, discovery documents,
//! key sets, registrations). [`Pathways`] builds exchanges on top of them
//! and keeps one validated consent node per consent.

use std::sync::Arc;

use dashmap::DashMap;
use reqwest::Client;
use tracing::{debug, info};

use crate::config::Config;
use crate::consent::{self, ConsentId, ConsentRecord, ConsentStore};
use crate::mtls::build_http_client;
use crate::neuron::{Neuron, Resolver};
use crate::oauth::{
    AuthorizationServerMetadata, ClientRegistration, GrantRequest, HolderJwks, HttpUserInfo,
    IdTokenVerifier, JwksIdTokenVerifier, SigningKeystore, TokenExchange, UserInfoSource,
};
use crate::{Error, Result};

/// Recipient signing keys
pub type KeystoreNode = Neuron<(), SigningKeystore>;
/// Discovery document of one brand
pub type MetadataNode = Neuron<(), AuthorizationServerMetadata>;
/// Key set of one brand
pub type JwksNode = Neuron<AuthorizationServerMetadata, HolderJwks>;
/// Client registration of one product at one brand
pub type RegistrationNode = Neuron<(), ClientRegistration>;
/// Stored consent, loaded on every resolution
pub type ConsentNode = Neuron<(), ConsentRecord>;
/// One token exchange
pub type ExchangeNode = Neuron<
    (
        SigningKeystore,
        AuthorizationServerMetadata,
        ClientRegistration,
        ConsentRecord,
    ),
    ConsentRecord,
>;
/// Consent kept while its access token is current
pub type ValidConsentNode = Neuron<ConsentRecord, ConsentRecord>;

/// Long-lived nodes describing the recipient and the data holders
pub struct HolderNodes {
    config: Arc<Config>,
    http: Client,
    keystore: Arc<KeystoreNode>,
    metadata: DashMap<String, Arc<MetadataNode>>,
    jwks: DashMap<String, Arc<JwksNode>>,
    registrations: DashMap<(String, String), Arc<RegistrationNode>>,
}

impl HolderNodes {
    /// Create the registry; nodes are built on first use
    pub fn new(config: Arc<Config>, http: Client) -> Self {
        let signing = config.signing.clone();
        let keystore = Neuron::new("recipient-keystore", (), move |()| {
            let signing = signing.clone();
            async move { SigningKeystore::load(&signing).await }
        });

        Self {
            config,
            http,
            keystore: Arc::new(keystore),
            metadata: DashMap::new(),
            jwks: DashMap::new(),
            registrations: DashMap::new(),
        }
    }

    /// Shared mTLS client
    #[must_use]
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Recipient keystore node
    #[must_use]
    pub fn keystore(&self) -> Arc<KeystoreNode> {
        Arc::clone(&self.keystore)
    }

    /// Discovery document node of `brand_id`
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unconfigured brand.
    pub fn metadata(&self, brand_id: &str) -> Result<Arc<MetadataNode>> {
        if let Some(node) = self.metadata.get(brand_id) {
            return Ok(Arc::clone(&node));
        }

        let holder = self
            .config
            .data_holder(brand_id)
            .ok_or_else(|| Error::NotFound(format!("data holder brand {brand_id}")))?;
        let issuer = holder.issuer.clone();
        let http = self.http.clone();
        let ttl = self.config.cache.metadata_ttl;

        let node = self
            .metadata
            .entry(brand_id.to_string())
            .or_insert_with(|| {
                Arc::new(
                    Neuron::new(format!("metadata-{brand_id}"), (), move |()| {
                        let http = http.clone();
                        let issuer = issuer.clone();
                        async move { AuthorizationServerMetadata::discover(&http, &issuer).await }
                    })
                    .with_validator(move |metadata| metadata.is_fresh(ttl)),
                )
            });
        Ok(Arc::clone(&node))
    }

    /// Key set node of `brand_id`
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unconfigured brand.
    pub fn jwks(&self, brand_id: &str) -> Result<Arc<JwksNode>> {
        if let Some(node) = self.jwks.get(brand_id) {
            return Ok(Arc::clone(&node));
        }

        let metadata = self.metadata(brand_id)?;
        let http = self.http.clone();
        let ttl = self.config.cache.jwks_ttl;

        let node = self.jwks.entry(brand_id.to_string()).or_insert_with(|| {
            Arc::new(
                Neuron::new(
                    format!("jwks-{brand_id}"),
                    metadata,
                    move |metadata: AuthorizationServerMetadata| {
                        let http = http.clone();
                        async move {
                            let uri = metadata.require_jwks_uri()?;
                            HolderJwks::fetch(&http, uri).await
                        }
                    },
                )
                .with_validator(move |keys| keys.is_fresh(ttl)),
            )
        });
        Ok(Arc::clone(&node))
    }

    /// Registration node of `software_product_id` at `brand_id`
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the product is not registered there.
    pub fn registration(
        &self,
        software_product_id: &str,
        brand_id: &str,
    ) -> Result<Arc<RegistrationNode>> {
        let key = (software_product_id.to_string(), brand_id.to_string());
        if let Some(node) = self.registrations.get(&key) {
            return Ok(Arc::clone(&node));
        }

        let registration = ClientRegistration::lookup(&self.config, software_product_id, brand_id)?;
        let node = self.registrations.entry(key).or_insert_with(|| {
            Arc::new(Neuron::constant(
                format!("registration-{software_product_id}-{brand_id}"),
                registration,
            ))
        });
        Ok(Arc::clone(&node))
    }
}

/// Everything an exchange needs; cloned into consent nodes
#[derive(Clone)]
struct Exchanges {
    nodes: Arc<HolderNodes>,
    exchange: TokenExchange,
    store: Arc<dyn ConsentStore>,
    resolver: Resolver,
    in_flight: Arc<DashMap<(ConsentId, GrantRequest), Arc<ExchangeNode>>>,
}

impl Exchanges {
    fn consent_node(&self, id: ConsentId) -> Arc<ConsentNode> {
        let store = Arc::clone(&self.store);
        Arc::new(
            Neuron::new(format!("consent-{id}"), (), move |()| {
                let store = Arc::clone(&store);
                async move { store.load(id).await }
            })
            .uncached(),
        )
    }

    fn exchange_node(&self, consent: &ConsentRecord, grant: &GrantRequest) -> Result<Arc<ExchangeNode>> {
        let key = (consent.id, grant.clone());
        if let Some(node) = self.in_flight.get(&key) {
            return Ok(Arc::clone(&node));
        }

        let brand_id = &consent.data_holder_brand_id;
        let dependencies = (
            self.nodes.keystore(),
            self.nodes.metadata(brand_id)?,
            self.nodes.registration(&consent.software_product_id, brand_id)?,
            self.consent_node(consent.id),
        );
        let exchange = self.exchange.clone();
        let name = format!("exchange-{}-{}", consent.id, grant.grant_type());
        let grant = grant.clone();

        let node = Neuron::new(
            name,
            dependencies,
            move |(keystore, metadata, registration, consent): (
                SigningKeystore,
                AuthorizationServerMetadata,
                ClientRegistration,
                ConsentRecord,
            )| {
                let exchange = exchange.clone();
                let grant = grant.clone();
                async move {
                    exchange
                        .exchange(&grant, &consent, &keystore, &metadata, &registration)
                        .await
                }
            },
        )
        // Authorization codes are single use; the token POST and the claims
        // lookups are bounded by the HTTP client timeout instead
        .uncached()
        .without_attempt_timeout();

        Ok(Arc::clone(
            &self.in_flight.entry(key).or_insert_with(|| Arc::new(node)),
        ))
    }

    async fn run(&self, id: ConsentId, grant: &GrantRequest) -> Result<ConsentRecord> {
        let consent = self.store.load(id).await?;
        grant.check(&consent)?;
        let node = self.exchange_node(&consent, grant)?;

        let result = self.resolver.resolve(&node).await;
        self.in_flight
            .remove_if(&(id, grant.clone()), |_, current| Arc::ptr_eq(current, &node));
        result
    }

    /// Consent node that refreshes tokens when the stored ones are stale
    fn refreshing_consent_node(&self, id: ConsentId) -> Neuron<(), ConsentRecord> {
        let exchanges = self.clone();
        Neuron::new(format!("consent-{id}"), (), move |()| {
            let exchanges = exchanges.clone();
            async move {
                let stored = exchanges.store.load(id).await?;
                if consent::is_current(&stored) {
                    return Ok(stored);
                }
                debug!(consent_id = id, "Access token not current, refreshing");
                exchanges
                    .run(id, &GrantRequest::RefreshToken)
                    .await
                    .map_err(|e| Error::Dependency {
                        node: format!("exchange-{id}-refresh_token"),
                        cause: Arc::new(e),
                    })
            }
        })
        .uncached()
        .without_attempt_timeout()
    }
}

/// Explicitly constructed registry of every node used by the gateway
pub struct Pathways {
    exchanges: Exchanges,
    valid_consents: DashMap<ConsentId, Arc<ValidConsentNode>>,
}

impl Pathways {
    /// Build the registry with an mTLS client from configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the HTTP client cannot be built.
    pub fn new(config: Config, store: Arc<dyn ConsentStore>) -> Result<Self> {
        let http = build_http_client(&config.mtls, &config.http)?;
        Ok(Self::with_http_client(config, http, store))
    }

    /// Build the registry around an existing HTTP client
    pub fn with_http_client(config: Config, http: Client, store: Arc<dyn ConsentStore>) -> Self {
        let resolver = Resolver::from_config(&config.healing);
        let nodes = Arc::new(HolderNodes::new(Arc::new(config), http.clone()));

        let id_tokens = Arc::new(JwksIdTokenVerifier::new(Arc::clone(&nodes), resolver.clone()));
        let user_info = Arc::new(HttpUserInfo::new(Arc::clone(&nodes), resolver.clone()));
        let exchange = TokenExchange::new(http, id_tokens, user_info, Arc::clone(&store));

        Self {
            exchanges: Exchanges {
                nodes,
                exchange,
                store,
                resolver,
                in_flight: Arc::new(DashMap::new()),
            },
            valid_consents: DashMap::new(),
        }
    }

    /// Replace the id token verifier
    #[must_use]
    pub fn with_id_token_verifier(mut self, verifier: Arc<dyn IdTokenVerifier>) -> Self {
        self.exchanges.exchange = self.exchanges.exchange.with_id_token_verifier(verifier);
        self
    }

    /// Replace the userinfo source
    #[must_use]
    pub fn with_user_info(mut self, source: Arc<dyn UserInfoSource>) -> Self {
        self.exchanges.exchange = self.exchanges.exchange.with_user_info(source);
        self
    }

    /// Long-lived nodes
    #[must_use]
    pub fn nodes(&self) -> &Arc<HolderNodes> {
        &self.exchanges.nodes
    }

    /// Healing resolver shared by every node
    #[must_use]
    pub fn resolver(&self) -> &Resolver {
        &self.exchanges.resolver
    }

    /// Load a consent from the store
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown consent.
    pub async fn consent(&self, id: ConsentId) -> Result<ConsentRecord> {
        let node = self.exchanges.consent_node(id);
        self.exchanges.resolver.resolve(&node).await
    }

    /// Exchange `grant` for new tokens on consent `id`
    ///
    /// # Errors
    ///
    /// See [`TokenExchange::exchange`]; dependency failures surface as
    /// `Error::Dependency`.
    pub async fn consent_new_access_token(
        &self,
        id: ConsentId,
        grant: GrantRequest,
    ) -> Result<ConsentRecord> {
        let updated = self.exchanges.run(id, &grant).await?;
        // A validated node may still hold the pre-exchange record
        if let Some(node) = self.valid_consents.get(&id) {
            node.invalidate();
        }
        Ok(updated)
    }

    /// Redeem an authorization code for consent `id`
    ///
    /// # Errors
    ///
    /// See [`Pathways::consent_new_access_token`].
    pub async fn exchange_code(&self, id: ConsentId, code: impl Into<String>) -> Result<ConsentRecord> {
        self.consent_new_access_token(id, GrantRequest::AuthorizationCode { code: code.into() })
            .await
    }

    /// Redeem the stored refresh token of consent `id`
    ///
    /// # Errors
    ///
    /// See [`Pathways::consent_new_access_token`].
    pub async fn refresh(&self, id: ConsentId) -> Result<ConsentRecord> {
        self.consent_new_access_token(id, GrantRequest::RefreshToken)
            .await
    }

    /// A consent holding a current access token, refreshing it if needed
    ///
    /// # Errors
    ///
    /// Returns `Error::Precondition` if even a fresh exchange yields no
    /// current token, or the failure of the refresh.
    pub async fn current_consent(&self, id: ConsentId) -> Result<ConsentRecord> {
        let node = {
            let entry = self.valid_consents.entry(id).or_insert_with(|| {
                let source = Arc::new(self.exchanges.refreshing_consent_node(id));
                Arc::new(consent::validated_consent(source))
            });
            Arc::clone(&entry)
        };

        let consent = self.exchanges.resolver.resolve(&node).await?;
        if !consent::is_current(&consent) {
            node.invalidate();
            return Err(Error::Precondition(format!(
                "consent {id} has no current access token"
            )));
        }
        Ok(consent)
    }

    /// Resolve the keystore and every data holder's discovery document
    ///
    /// # Errors
    ///
    /// Returns the keystore failure; per-brand failures are reported in the
    /// returned list.
    pub async fn check(&self) -> Result<Vec<(String, Result<AuthorizationServerMetadata>)>> {
        let resolver = &self.exchanges.resolver;
        let keystore = resolver.resolve(&self.exchanges.nodes.keystore()).await?;
        info!(key_id = keystore.key_id(), algorithm = ?keystore.algorithm(), "Keystore ready");

        let brands: Vec<String> = self
            .exchanges
            .nodes
            .config
            .data_holders
            .iter()
            .map(|holder| holder.brand_id.clone())
            .collect();

        let mut report = Vec::with_capacity(brands.len());
        for brand_id in brands {
            let result = match self.exchanges.nodes.metadata(&brand_id) {
                Ok(node) => resolver.resolve(&node).await,
                Err(e) => Err(e),
            };
            report.push((brand_id, result));
        }
        Ok(report)
    }
}
