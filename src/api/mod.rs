//! HTTP API layer for Guideline Core.
//!
//! Provides REST endpoints for content checks, audit lookup and health.

pub mod handlers;
mod routes;
mod types;

pub use routes::build_router;
