//! Library entrypoint: re‑export modules

pub mod client;
pub mod collector;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod records;
pub mod registry;
pub mod server;
pub mod snapshot;
pub mod sources;
pub mod store;
pub mod summary;
