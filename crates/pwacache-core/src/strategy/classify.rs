use std::fmt;

use serde::{Deserialize, Serialize};

use crate::network::{Destination, ResourceRequest};

const IMAGE_SUFFIXES: &[&str] = &["png", "jpg", "jpeg", "svg", "gif", "webp"];
const JSON_SUFFIXES: &[&str] = &["json"];

/// Category of requests sharing one fetch/cache policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum ResourceClass {
    /// Documents, scripts and styles. Also the class for anything unmatched.
    Document,
    Image,
    JsonData,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 3] = [
        ResourceClass::Document,
        ResourceClass::Image,
        ResourceClass::JsonData,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::Document => "document",
            ResourceClass::Image => "image",
            ResourceClass::JsonData => "json_data",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercased extension of the last path segment, ignoring query and fragment.
fn path_suffix(request: &ResourceRequest) -> Option<String> {
    let segment = request.url.path_segments()?.next_back()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_ascii_lowercase())
    }
}

/// Classify a request from its metadata alone.
///
/// A declared destination decides first; otherwise the path suffix does;
/// anything left over is [`ResourceClass::Document`].
pub fn classify(request: &ResourceRequest) -> ResourceClass {
    match request.destination {
        Destination::Document | Destination::Script | Destination::Style => ResourceClass::Document,
        Destination::Image => ResourceClass::Image,
        Destination::Worker | Destination::Empty => match path_suffix(request).as_deref() {
            Some(ext) if IMAGE_SUFFIXES.contains(&ext) => ResourceClass::Image,
            Some(ext) if JSON_SUFFIXES.contains(&ext) => ResourceClass::JsonData,
            _ => ResourceClass::Document,
        },
    }
}
