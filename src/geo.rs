//! IP geolocation
//!
//! Lookups go through a table of free JSON APIs, tried in order until one of them knows something
//! about the address. Every result, including "nobody knows", is cached forever in the store so each
//! address costs at most one round of requests.

use std::{net::IpAddr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::store::{Store, StoreError};

/// A user agent representing our program. Some of the free geolocation APIs reject requests
/// without one.
const USER_AGENT: &str = concat!(
    env!("CARGO_PKG_NAME"),
    " (",
    env!("CARGO_PKG_REPOSITORY"),
    ", ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// Placeholder city and country for addresses on the local network.
const LAN: &str = "LAN";

/// Where an IP address is, as far as anyone could tell us.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct GeoLocation {
    pub city: Option<String>,
    pub country: Option<String>,
}

impl GeoLocation {
    /// The location reported for private and loopback addresses.
    pub fn lan() -> Self {
        GeoLocation {
            city: Some(LAN.to_owned()),
            country: Some(LAN.to_owned()),
        }
    }

    /// Whether neither field is known.
    pub fn is_unknown(&self) -> bool {
        self.city.is_none() && self.country.is_none()
    }
}

/// A geolocation API.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GeoProvider {
    /// Name used in logs
    pub name: String,
    /// Request URL, with `{ip}` where the address goes
    pub url: String,
    /// Response field holding the city. A value starting with `/` is a JSON pointer.
    pub city_field: String,
    /// Response field holding the country. A value starting with `/` is a JSON pointer.
    pub country_field: String,
}

/// Why a single provider couldn't answer
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider returned {0}")]
    Status(StatusCode),
}

impl GeoProvider {
    /// Shorthand for building the default table.
    fn new(name: &str, url: &str, city_field: &str, country_field: &str) -> Self {
        GeoProvider {
            name: name.to_owned(),
            url: url.to_owned(),
            city_field: city_field.to_owned(),
            country_field: country_field.to_owned(),
        }
    }

    /// Ask this provider about `ip`.
    async fn lookup(
        &self,
        client: &Client,
        ip: &str,
        timeout: Duration,
    ) -> Result<GeoLocation, LookupError> {
        let response = client
            .get(self.url.replace("{ip}", ip))
            .header(header::USER_AGENT, USER_AGENT)
            .timeout(timeout)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(LookupError::Status(response.status()));
        }
        let body = response.json::<Value>().await?;
        Ok(GeoLocation {
            city: extract_field(&body, &self.city_field),
            country: extract_field(&body, &self.country_field),
        })
    }
}

/// The providers used when the config file doesn't list any.
pub fn default_providers() -> Vec<GeoProvider> {
    vec![
        GeoProvider::new("ipapi.co", "https://ipapi.co/{ip}/json/", "city", "country_code"),
        GeoProvider::new(
            "geojs.io",
            "https://get.geojs.io/v1/ip/geo/{ip}.json",
            "city",
            "country_code",
        ),
        GeoProvider::new(
            "ip-api.com",
            "http://ip-api.com/json/{ip}?fields=city,country,countryCode",
            "city",
            "countryCode",
        ),
    ]
}

/// Pull a non-empty string out of a response body.
fn extract_field(body: &Value, field: &str) -> Option<String> {
    let value = if field.starts_with('/') {
        body.pointer(field)
    } else {
        body.get(field)
    };
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Whether `ip` is a private, loopback or link-local address.
///
/// Anything that isn't an IP address at all (a hostname, say) is not reserved.
fn is_reserved(ip: &str) -> bool {
    // Drop an IPv6 zone id like `%eth0`
    let ip = ip.split('%').next().unwrap_or(ip);
    match ip.parse::<IpAddr>().map(|addr| addr.to_canonical()) {
        Ok(IpAddr::V4(v4)) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        Ok(IpAddr::V6(v6)) => {
            v6.is_loopback() || v6.is_unique_local() || v6.is_unicast_link_local()
        }
        Err(_) => false,
    }
}

/// Resolves IP addresses to locations, caching everything it learns.
#[derive(Clone, Debug)]
pub struct GeoResolver {
    /// Where the cache lives
    store: Store,
    /// HTTP client used for all providers
    client: Client,
    /// Providers in the order they're tried
    providers: Arc<[GeoProvider]>,
    /// Upper bound on each provider request
    timeout: Duration,
}

impl GeoResolver {
    /// Create a resolver that caches into `store` and asks `providers` in order.
    pub fn new(store: Store, providers: Vec<GeoProvider>, timeout: Duration) -> Self {
        GeoResolver {
            store,
            client: Client::new(),
            providers: Arc::from(providers),
            timeout,
        }
    }

    /// Find the location of `ip`.
    ///
    /// Network failures are not errors; they just produce an unknown location, which is cached
    /// like any other answer. Only a broken cache is reported.
    pub async fn resolve(&self, ip: &str) -> Result<GeoLocation, StoreError> {
        self.resolve_impl(ip, Utc::now()).await
    }

    /// Implementation of [`GeoResolver::resolve`].
    ///
    /// Split apart to allow injecting the current time for testing purposes.
    #[instrument(name = "geo.resolve", skip(self, now))]
    async fn resolve_impl(&self, ip: &str, now: DateTime<Utc>) -> Result<GeoLocation, StoreError> {
        if is_reserved(ip) {
            return Ok(GeoLocation::lan());
        }

        if let Some(cached) = self.store.cached_location(ip).await? {
            debug!(?cached, "Geolocation cache hit");
            return Ok(cached);
        }

        let location = self.lookup(ip).await;
        self.store.cache_location(ip, &location, now).await?;
        Ok(location)
    }

    /// Ask each provider in turn, stopping at the first one that knows anything.
    async fn lookup(&self, ip: &str) -> GeoLocation {
        for provider in self.providers.iter() {
            match provider.lookup(&self.client, ip, self.timeout).await {
                Ok(location) if !location.is_unknown() => {
                    debug!(provider = %provider.name, ?location, "Geolocation found");
                    return location;
                }
                Ok(_) => debug!(provider = %provider.name, "Provider has no location"),
                Err(err) => debug!(provider = %provider.name, "Provider lookup failed: {err}"),
            }
        }
        debug!("No provider could locate the address");
        GeoLocation::default()
    }
}
