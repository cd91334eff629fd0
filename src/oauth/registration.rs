//! Client registrations at data holder brands

use crate::config::{Config, RegistrationConfig};
use crate::{Error, Result};

/// The data recipient's client at one data holder brand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRegistration {
    /// Software product identifier
    pub software_product_id: String,
    /// Data holder brand identifier
    pub brand_id: String,
    /// Client identifier issued by the data holder
    pub client_id: String,
}

impl From<&RegistrationConfig> for ClientRegistration {
    fn from(config: &RegistrationConfig) -> Self {
        Self {
            software_product_id: config.software_product_id.clone(),
            brand_id: config.brand_id.clone(),
            client_id: config.client_id.clone(),
        }
    }
}

impl ClientRegistration {
    /// Find the registration of `software_product_id` at `brand_id`
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the product is not registered there.
    pub fn lookup(config: &Config, software_product_id: &str, brand_id: &str) -> Result<Self> {
        config
            .registration(software_product_id, brand_id)
            .map(Self::from)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no registration of {software_product_id} at {brand_id}"
                ))
            })
    }
}
