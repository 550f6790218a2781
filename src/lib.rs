pub mod auth;
pub mod cache;
pub mod cli;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod routes;
pub mod services;
pub mod settings;
pub mod state;
pub mod telemetry;
pub mod tsdb;

#[cfg(test)]
pub mod test_support;
