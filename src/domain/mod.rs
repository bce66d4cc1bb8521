//! Domain types for Guideline Core.
//!
//! This module contains the core business entities and value objects.

mod audit;
mod content;
mod rule;
mod verdict;

pub use audit::*;
pub use content::*;
pub use rule::*;
pub use verdict::*;
