//! The core module of the bundle toolkit.
//!
//! This module contains the fundamental components shared by every workflow:
//! - Batch sampling and collation
//! - Configuration validation
//! - Error handling
//! - Traits for transforms and volume I/O
//!
//! It also provides re-exports of commonly used types for convenience.

pub mod batch;
pub mod config;
pub mod errors;
pub mod traits;

pub use batch::{BatchSampler, Tensor4D, Tensor5D, TensorD, stack_volumes};
pub use config::{ConfigError, ConfigValidator};
pub use errors::{BundleError, BundleResult, ProcessingStage};
pub use traits::{Transform, VolumeReader, VolumeWriter};
