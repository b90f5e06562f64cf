use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::classify::ResourceClass;
use crate::cache::Expiration;

/// Documents and scripts are only trusted for 5 minutes.
const DOCUMENT_MAX_AGE_SECS: u64 = 60 * 5;
/// Images change rarely; a week, capped at 50 entries.
const IMAGE_MAX_AGE_SECS: u64 = 60 * 60 * 24 * 7;
const IMAGE_MAX_ENTRIES: usize = 50;
/// JSON data goes stale fast.
const JSON_MAX_AGE_SECS: u64 = 60 * 2;
const NETWORK_TIMEOUT_SECS: u64 = 3;

/// How a request is satisfied.
///
/// Network-first and stale-while-revalidate are alternatives for the same
/// class; the table holds exactly one strategy per class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "handler", rename_all = "snake_case")]
pub enum Strategy {
    CacheFirst,
    NetworkFirst { network_timeout_secs: u64 },
    StaleWhileRevalidate,
}

impl Strategy {
    pub fn network_first() -> Self {
        Strategy::NetworkFirst {
            network_timeout_secs: NETWORK_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassPolicy {
    pub partition: String,
    #[serde(flatten)]
    pub strategy: Strategy,
    pub expiration: Expiration,
}

impl ClassPolicy {
    pub fn max_age(&self) -> Duration {
        self.expiration.max_age()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Partition '{0}' is assigned to more than one resource class")]
    SharedPartition(String),

    #[error("Partition name for {0} is empty")]
    EmptyPartition(ResourceClass),

    #[error("Network timeout for {0} must be non-zero")]
    ZeroTimeout(ResourceClass),
}

/// One policy per resource class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyTable {
    pub document: ClassPolicy,
    pub image: ClassPolicy,
    pub json_data: ClassPolicy,
}

impl StrategyTable {
    pub fn policy(&self, class: ResourceClass) -> &ClassPolicy {
        match class {
            ResourceClass::Document => &self.document,
            ResourceClass::Image => &self.image,
            ResourceClass::JsonData => &self.json_data,
        }
    }

    /// Partitions owned by some resource class.
    pub fn partitions(&self) -> Vec<&str> {
        ResourceClass::ALL
            .iter()
            .map(|class| self.policy(*class).partition.as_str())
            .collect()
    }

    pub fn owns_partition(&self, name: &str) -> bool {
        self.partitions().contains(&name)
    }

    /// Each class must own exactly one partition of its own.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let mut seen = HashSet::new();
        for class in ResourceClass::ALL {
            let policy = self.policy(class);
            if policy.partition.trim().is_empty() {
                return Err(PolicyError::EmptyPartition(class));
            }
            if !seen.insert(policy.partition.as_str()) {
                return Err(PolicyError::SharedPartition(policy.partition.clone()));
            }
            if let Strategy::NetworkFirst {
                network_timeout_secs: 0,
            } = policy.strategy
            {
                return Err(PolicyError::ZeroTimeout(class));
            }
        }
        Ok(())
    }
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self {
            document: ClassPolicy {
                partition: "app-cache".to_string(),
                strategy: Strategy::network_first(),
                expiration: Expiration {
                    max_age_secs: DOCUMENT_MAX_AGE_SECS,
                    max_entries: None,
                },
            },
            image: ClassPolicy {
                partition: "images-cache".to_string(),
                strategy: Strategy::CacheFirst,
                expiration: Expiration {
                    max_age_secs: IMAGE_MAX_AGE_SECS,
                    max_entries: Some(IMAGE_MAX_ENTRIES),
                },
            },
            json_data: ClassPolicy {
                partition: "json-cache".to_string(),
                strategy: Strategy::network_first(),
                expiration: Expiration {
                    max_age_secs: JSON_MAX_AGE_SECS,
                    max_entries: None,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_is_valid() {
        let table = StrategyTable::default();
        table.validate().unwrap();
        assert_eq!(table.partitions(), vec!["app-cache", "images-cache", "json-cache"]);
        assert_eq!(table.policy(ResourceClass::Image).strategy, Strategy::CacheFirst);
        assert_eq!(table.policy(ResourceClass::JsonData).max_age(), Duration::from_secs(120));
    }

    #[test]
    fn test_shared_partition_is_rejected() {
        let mut table = StrategyTable::default();
        table.json_data.partition = "app-cache".to_string();
        assert_eq!(
            table.validate(),
            Err(PolicyError::SharedPartition("app-cache".to_string()))
        );
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let mut table = StrategyTable::default();
        table.document.strategy = Strategy::NetworkFirst {
            network_timeout_secs: 0,
        };
        assert_eq!(table.validate(), Err(PolicyError::ZeroTimeout(ResourceClass::Document)));
    }

    #[test]
    fn test_policy_serializes_like_a_runtime_caching_rule() {
        let json = serde_json::to_value(&StrategyTable::default().json_data).unwrap();
        assert_eq!(json["partition"], "json-cache");
        assert_eq!(json["handler"], "network_first");
        assert_eq!(json["network_timeout_secs"], 3);
        assert_eq!(json["expiration"]["max_age_secs"], 120);

        let back: ClassPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, StrategyTable::default().json_data);
    }
}
