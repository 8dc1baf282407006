//! # medbundle-core
//!
//! Building blocks for volumetric inference bundles: error handling,
//! configuration validation, volume and sample types, the NIfTI codec and
//! the dictionary transforms that prepare inputs and post-process predictions.
//!
//! ## Modules
//!
//! * [`core`] - Errors, configuration validation, batching and the core traits
//! * [`domain`] - Volumes, metadata and keyed samples
//! * [`processors`] - Dictionary transforms
//! * [`utils`] - NIfTI I/O and logging setup
//!
//! ## Example
//!
//! ```rust,no_run
//! use medbundle_core::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let preprocessing = Compose::default()
//!     .then(LoadImaged::new(["image"]))
//!     .then(EnsureChannelFirstd::new(["image"]))
//!     .then(ScaleIntensityd::new(["image"]));
//!
//! let sample = preprocessing.apply(Sample::new().with_path("image", "scan.nii"))?;
//! println!("{:?}", sample.volume("image")?.shape());
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod domain;
pub mod processors;
pub mod utils;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{
        BundleError, BundleResult, ConfigValidator, Tensor4D, Tensor5D,
        TensorD, Transform, VolumeReader, VolumeWriter,
    };
    pub use crate::domain::{ChannelDim, Field, Sample, Volume, VolumeMeta};
    pub use crate::processors::{
        Activationsd, AsDiscreted, Compose, EnsureChannelFirstd, LoadImaged, SaveImageConfig,
        SaveImaged, ScaleIntensityd,
    };
    pub use crate::utils::{NiftiReader, NiftiWriter, init_tracing, read_nifti, write_nifti};
}
