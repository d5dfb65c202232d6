//! Infrastructure adapters and runtime bootstrap.

pub mod chrome;
pub mod db;
pub mod error;
pub mod http;
pub mod memory;
pub mod output;
pub mod telemetry;
pub mod templates;
