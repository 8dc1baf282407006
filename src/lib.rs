//! # medbundle
//!
//! Volumetric segmentation bundles in Rust. A bundle is a workflow that
//! exposes its components as named properties and runs through an
//! initialize / run / finalize lifecycle.
//!
//! ## Features
//!
//! - Property get/set by name, with required and optional declarations
//! - Lazily built defaults for any component the caller did not assign
//! - Residual 3D UNet with seeded weight initialization
//! - Sliding-window inference with constant or Gaussian blending
//! - Parallel data loading and per-voxel transforms via rayon
//! - NIfTI-1 input and output
//!
//! ## Modules
//!
//! * [`bundle`] - Workflow contract, property table and the scripted inference workflow
//! * [`data`] - Datasets and batched loading
//! * [`engines`] - The supervised evaluation loop
//! * [`inferers`] - Whole-volume and sliding-window inference
//! * [`networks`] - Devices, layers and the UNet
//! * [`utils`] - Seeding and logging setup
//!
//! Errors, volumes, samples and transforms live in `medbundle-core` and are
//! re-exported through the [`prelude`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use medbundle::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), BundleError> {
//! init_tracing();
//!
//! let mut workflow = ScriptedInferenceWorkflow::new("data/spleen_10.nii", "eval");
//!
//! // Swap the default inferer before the workflow builds its evaluator.
//! let inferer: SharedInferer = Arc::new(SlidingWindowInferer::new(
//!     SlidingWindowConfig::new([96, 96, 64]).with_mode(BlendMode::Gaussian),
//! )?);
//! workflow.set_property_by_name("inferer", inferer.into())?;
//!
//! workflow.initialize(&Determinism::seeded(0))?;
//! workflow.run()?;
//! workflow.finalize();
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod data;
pub mod engines;
pub mod inferers;
pub mod networks;
pub mod utils;

/// Prelude module for convenient imports.
///
/// ```rust
/// use medbundle::prelude::*;
/// ```
///
/// Included items cover running a workflow and replacing its components.
/// Layer-level building blocks stay in [`crate::networks::layers`].
pub mod prelude {
    // Workflows
    pub use crate::bundle::{
        BundleWorkflow, PropertyAssignment, PropertyLookup, PropertySpec, PropertyTable,
        PropertyValue, ScriptedInferenceWorkflow, WorkflowState, WorkflowType,
    };

    // Components
    pub use crate::data::{DataLoader, Dataset, LoaderConfig};
    pub use crate::engines::{EngineState, SupervisedEvaluator};
    pub use crate::inferers::{
        BlendMode, Inferer, SharedInferer, SimpleInferer, SlidingWindowConfig,
        SlidingWindowInferer,
    };
    pub use crate::networks::{Device, Network, SharedNetwork, UNet, UNetConfig};
    pub use crate::utils::{Determinism, init_tracing};

    // Core types
    pub use medbundle_core::prelude::*;
}
