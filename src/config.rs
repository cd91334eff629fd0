//! Configuration management

use std::{collections::HashSet, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};

use crate::mtls::MtlsConfig;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving secrets.
    /// Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Client assertion signing key
    pub signing: SigningConfig,
    /// Mutual TLS client identity
    pub mtls: MtlsConfig,
    /// Outbound HTTP settings
    pub http: HttpConfig,
    /// Healing resolver settings
    pub healing: HealingConfig,
    /// Cache lifetimes for re-validated nodes
    pub cache: CacheConfig,
    /// Known authorization servers, one per data holder brand
    pub data_holders: Vec<DataHolderConfig>,
    /// Client registrations at data holder brands
    pub registrations: Vec<RegistrationConfig>,
    /// Consent store settings
    pub store: StoreConfig,
}

/// Client assertion signing key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Path to the PEM-encoded private key (PKCS#8 or PKCS#1)
    pub key_path: String,
    /// Key identifier published in the recipient JWKS
    pub key_id: String,
    /// JWS algorithm used for client assertions
    pub algorithm: Algorithm,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            key_path: "keys/signing.pem".to_string(),
            key_id: "signing-key-1".to_string(),
            algorithm: Algorithm::PS256,
        }
    }
}

/// Outbound HTTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Whole-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// TCP/TLS connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Healing resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    /// Maximum attempts per node, including the first one
    pub max_attempts: u32,
    /// Initial backoff duration
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
    /// Randomise backoff delays
    pub jitter: bool,
    /// Upper bound for one evaluation attempt
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Cache lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a discovery document stays valid
    #[serde(with = "humantime_serde")]
    pub metadata_ttl: Duration,
    /// How long a data holder JWKS stays valid
    #[serde(with = "humantime_serde")]
    pub jwks_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            metadata_ttl: Duration::from_secs(3600),
            jwks_ttl: Duration::from_secs(3600),
        }
    }
}

/// A data holder brand and its authorization server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataHolderConfig {
    /// Data holder brand identifier
    pub brand_id: String,
    /// OpenID issuer URL; discovery is fetched from `{issuer}/.well-known/openid-configuration`
    pub issuer: String,
}

/// Client registration of a software product at a data holder brand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Software product identifier
    pub software_product_id: String,
    /// Data holder brand identifier
    pub brand_id: String,
    /// Client identifier issued by the data holder
    pub client_id: String,
}

/// Consent store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one JSON file per consent
    pub directory: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: "consents".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Env files feed the environment overrides below
        let env_files: Vec<String> = figment.extract_inner("env_files").unwrap_or_default();
        load_env_files(&env_files);

        // Merge environment variables (CONSENT_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("CONSENT_GATEWAY_").split("__"));

        Self::from_figment(&figment)
    }

    /// Extract and validate a configuration from an assembled figment
    ///
    /// # Errors
    ///
    /// Returns an error if extraction or validation fails.
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.healing.max_attempts == 0 {
            return Err(Error::Config(
                "healing.max_attempts must be at least 1".to_string(),
            ));
        }

        let mut brands = HashSet::new();
        for holder in &self.data_holders {
            if holder.brand_id.is_empty() {
                return Err(Error::Config("data_holders entry without brand_id".to_string()));
            }
            if !brands.insert(holder.brand_id.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate data holder brand: {}",
                    holder.brand_id
                )));
            }
            if let Err(e) = url::Url::parse(&holder.issuer) {
                return Err(Error::Config(format!(
                    "Invalid issuer for brand {}: {e}",
                    holder.brand_id
                )));
            }
        }

        for reg in &self.registrations {
            if reg.software_product_id.is_empty() || reg.client_id.is_empty() {
                return Err(Error::Config(format!(
                    "Incomplete registration for brand {}",
                    reg.brand_id
                )));
            }
            if !brands.contains(reg.brand_id.as_str()) {
                return Err(Error::Config(format!(
                    "Registration references unknown brand: {}",
                    reg.brand_id
                )));
            }
        }

        Ok(())
    }

    /// Look up a data holder by brand
    #[must_use]
    pub fn data_holder(&self, brand_id: &str) -> Option<&DataHolderConfig> {
        self.data_holders.iter().find(|h| h.brand_id == brand_id)
    }

    /// Look up the registration of a software product at a brand
    #[must_use]
    pub fn registration(
        &self,
        software_product_id: &str,
        brand_id: &str,
    ) -> Option<&RegistrationConfig> {
        self.registrations
            .iter()
            .find(|r| r.software_product_id == software_product_id && r.brand_id == brand_id)
    }
}

/// Load environment files into the process environment.
/// Files that don't exist are silently skipped; variables already set win.
fn load_env_files(paths: &[String]) {
    for path_str in paths {
        let path = Path::new(path_str);
        if path.exists() {
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {path_str}"),
                Err(e) => tracing::warn!("Failed to load env file {path_str}: {e}"),
            }
        } else {
            tracing::debug!("Env file not found (skipped): {path_str}");
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "1h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "250ms", "30s", "5m", "1h" or a bare number of seconds
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
