//! Network access for the fetch engine and the worker runtime.
//!
//! The engine only needs "send this GET, give me the response", so the
//! network is a single-method trait. [`HttpNetwork`] is the reqwest-backed
//! implementation; tests substitute scripted networks.

pub mod client;
pub mod error;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

pub use client::HttpNetwork;
pub use error::NetworkError;

/// What the requesting context intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Document,
    Script,
    Style,
    Image,
    Worker,
    /// `fetch()`/XHR style requests with no declared destination.
    #[default]
    Empty,
}

/// An outbound GET request for a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub url: Url,
    pub destination: Destination,
}

impl ResourceRequest {
    pub fn get(url: Url) -> Self {
        Self {
            url,
            destination: Destination::Empty,
        }
    }

    pub fn parse(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::get(Url::parse(url)?))
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Only GET requests are cached.
    pub fn method(&self) -> &'static str {
        "GET"
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache { cached_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceResponse {
    pub url: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub source: ResponseSource,
}

impl ResourceResponse {
    pub fn ok(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            url: url.into(),
            status: 200,
            headers: BTreeMap::new(),
            body: body.into(),
            source: ResponseSource::Network,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_from_cache(&self) -> bool {
        matches!(self.source, ResponseSource::Cache { .. })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &ResourceRequest) -> Result<ResourceResponse, NetworkError>;
}
