//! Vehicle photo intake pipeline.
//!
//! Uploaded photo batches fan out to object storage, become pending work
//! items, and are processed asynchronously: a fire-and-forget trigger (or a
//! scheduled/manual call) hits the processing endpoint, which claims each
//! item with a conditional update and runs plate/VIN recognition against an
//! external vision service.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod resilience;
pub mod routes;
pub mod services;
