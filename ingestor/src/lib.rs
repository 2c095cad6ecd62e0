//! IoT telemetry ingestion: device registry, sensor validation, the MQTT
//! ingestion pipeline and the HTTP query surface.

pub mod accounts;
pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod ingest;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod query;
pub mod registry;
pub mod rest;
pub mod store;
pub mod validate;
pub mod workers;

pub use errors::{Error, Result};
