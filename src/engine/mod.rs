//! Decision engine for Guideline Core.
//!
//! This module contains the check pipeline:
//! - Content Normalizer: canonical form and fingerprint
//! - Rule Registry: versioned, atomically swapped rule sets
//! - Evaluator: concurrent rule execution and aggregation
//! - Verdict Cache: verdicts keyed by fingerprint and rule-set version
//! - Audit Recorder: append-only records with retried delivery
//! - Decision Service: the pipeline behind the HTTP API

pub mod audit;
pub mod cache;
pub mod checks;
pub mod evaluator;
mod llm_guard;
pub mod normalizer;
pub mod registry;
pub mod service;

pub use audit::{AuditRecorder, AuditStore};
pub use cache::{MokaVerdictCache, VerdictCache};
pub use checks::CheckFactory;
pub use evaluator::Evaluator;
pub use llm_guard::LlamaGuardClient;
pub use normalizer::ContentNormalizer;
pub use registry::{RegistryLoader, RuleRegistry, RuleSource};
pub use service::DecisionService;
