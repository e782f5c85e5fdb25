//! Feed Pulse - A real-time feed aggregation and distribution engine
//!
//! This crate polls a fixed set of RSS/Atom sources under a shared request
//! budget, enriches each entry with sentiment, keywords and a priority score,
//! keeps a bounded snapshot of the freshest items, and pushes every new
//! snapshot to live subscribers.

pub mod analytics;
pub mod cache;
pub mod config;
pub mod engine;
pub mod enrich;
pub mod fetcher;
pub mod governor;
pub mod hub;
pub mod routes;
pub mod sources;
pub mod store;
