pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod host;
pub mod models;
pub mod records;
pub mod relay;
pub mod server;
pub mod telemetry;
pub mod trigger;
