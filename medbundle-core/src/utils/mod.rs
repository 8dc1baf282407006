//! Utility functions shared by the bundle crates.
//!
//! This module provides the NIfTI codec used by the load/save transforms and
//! the logging setup.

pub mod nifti;

pub use nifti::{NiftiDataType, NiftiHeader, NiftiReader, NiftiWriter, read_nifti, write_nifti};

/// Initializes the tracing subscriber for logging.
///
/// This function sets up the tracing subscriber with environment filter and formatting layer.
/// It's typically called at the start of an application to enable logging.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}
