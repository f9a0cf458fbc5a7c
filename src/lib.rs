//! Personalized product-feed ranking core.
//!
//! The binaries in `src/bin/` are thin wiring over this library: an HTTP
//! surface for the ranker, a queue-draining event consumer, and two batch
//! workers. Everything that matters lives here so it can be exercised
//! directly in tests without a network hop.

pub mod bandit;
pub mod cache;
pub mod cf;
pub mod config;
pub mod constants;
pub mod diversity;
pub mod error;
pub mod events;
pub mod models;
pub mod popularity;
pub mod ranker;
pub mod search;
pub mod store;
