//! Fetch strategy engine.
//!
//! Every request is classified into a [`ResourceClass`]; the class selects
//! one [`ClassPolicy`] (strategy, partition, expiration) from the
//! [`StrategyTable`], and the [`FetchEngine`] executes it against the cache
//! store and the network.

pub mod classify;
pub mod engine;
pub mod policy;

pub use classify::{classify, ResourceClass};
pub use engine::FetchEngine;
pub use policy::{ClassPolicy, PolicyError, Strategy, StrategyTable};
