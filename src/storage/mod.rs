//! Storage layer for Guideline Core.
//!
//! Provides database access via SQLx with SQLite.

mod models;
mod repository;

pub use repository::EngineRepository;
