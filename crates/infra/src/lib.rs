//! Infrastructure layer: durable storage for the outbox.
//!
//! `fieldops-outbox` defines the store traits and ships an in-memory
//! implementation; this crate provides the Postgres one.

pub mod postgres;

pub use postgres::{PostgresOutboxStore, apply_schema, enqueue_on};
