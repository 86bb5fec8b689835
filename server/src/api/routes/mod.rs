//! HTTP route modules

pub mod health;
pub mod otlp_collector;
pub mod projects;
