//! Utility functions for bundle workflows.
//!
//! Re-exports the logging setup from `medbundle-core` alongside the seeding
//! helpers used when workflows build their default components.

mod determinism;

pub use determinism::Determinism;
pub use medbundle_core::utils::init_tracing;
