//! Telemetry and control synchronization hub for an aeroponics grow system.
//!
//! Sensor readings and camera frames flow in through [`ingest`], land in the
//! [`store`], and fan out to observers through [`subscription`]. Operator
//! control changes go through [`commit`] and reach the field device via the
//! same store.

pub mod auth;
pub mod commit;
pub mod config;
pub mod db;
pub mod errors;
pub mod ingest;
pub mod liveness;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod rest;
pub mod store;
pub mod subscription;
pub mod validate;
