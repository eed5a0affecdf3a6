//! Public address and coarse geolocation over HTTP.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;

use crate::error::{CollaboratorError, EngineError};
use crate::types::{PublicGeo, UNKNOWN};

pub const DEFAULT_IP_URL: &str = "https://api.ipify.org?format=json";
pub const DEFAULT_GEO_URL: &str = "http://ip-api.com/json/";

pub trait GeoResolver: Send + Sync {
    fn resolve(&self) -> BoxFuture<'_, Result<PublicGeo, CollaboratorError>>;
}

#[derive(Debug, Deserialize)]
struct IpReply {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct GeoReply {
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    city: Option<String>,
}

/// ipify for the address, ip-api for country and city.
pub struct HttpGeoResolver {
    client: reqwest::Client,
    ip_url: String,
    geo_url: String,
}

impl HttpGeoResolver {
    pub fn new(timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            ip_url: DEFAULT_IP_URL.to_string(),
            geo_url: DEFAULT_GEO_URL.to_string(),
        })
    }

    async fn lookup(&self) -> Result<PublicGeo, CollaboratorError> {
        let ip: IpReply = self
            .client
            .get(&self.ip_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if ip.ip.trim().is_empty() {
            return Err(CollaboratorError::Malformed("empty address".into()));
        }
        let geo: GeoReply = self
            .client
            .get(format!("{}{}", self.geo_url, ip.ip))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(PublicGeo {
            public_address: ip.ip,
            country: geo.country.unwrap_or_else(|| UNKNOWN.to_string()),
            city: geo.city.unwrap_or_else(|| UNKNOWN.to_string()),
        })
    }
}

impl GeoResolver for HttpGeoResolver {
    fn resolve(&self) -> BoxFuture<'_, Result<PublicGeo, CollaboratorError>> {
        self.lookup().boxed()
    }
}
