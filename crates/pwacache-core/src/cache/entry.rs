use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::network::{ResourceRequest, ResourceResponse, ResponseSource};

/// Normalized request identity: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn from_request(request: &ResourceRequest) -> Self {
        let mut url = request.url.clone();
        url.set_fragment(None);
        Self(format!("{} {}", request.method(), url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored response together with the time it was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub url: String,
    pub method: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
    pub fn new(request: &ResourceRequest, response: &ResourceResponse, now: DateTime<Utc>) -> Self {
        Self {
            url: response.url.clone(),
            method: request.method().to_string(),
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            cached_at: now,
        }
    }

    /// Age at `now`; clock skew (entry from the future) counts as zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.cached_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// An entry exactly `max_age` old is still fresh.
    pub fn is_fresh(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) <= max_age
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.cached_at).num_minutes()
    }

    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        let minutes = self.age_minutes(now);
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            let remaining_mins = minutes % 60;
            if remaining_mins >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            let remaining_hours = (minutes % 1440) / 60;
            if remaining_hours >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }

    pub fn into_response(self) -> ResourceResponse {
        ResourceResponse {
            url: self.url,
            status: self.status,
            headers: self.headers,
            body: self.body,
            source: ResponseSource::Cache {
                cached_at: self.cached_at,
            },
        }
    }
}
