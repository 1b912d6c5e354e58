//! Operator HTTP API and process wiring for the delivery engine.

pub mod app;
pub mod config;
pub mod context;
pub mod delivery;
pub mod middleware;
