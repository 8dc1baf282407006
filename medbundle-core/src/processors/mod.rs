//! Dictionary transforms for volumetric inference pipelines.
//!
//! Every transform here operates on the keys it was configured with and
//! leaves the rest of the [`Sample`](crate::domain::Sample) untouched.
//!
//! # Modules
//!
//! * `compose` - Sequential chaining of transforms
//! * `io` - Loading volumes from disk and saving predictions
//! * `intensity` - Channel layout and intensity scaling
//! * `postprocess` - Activations and discretization of network outputs

mod compose;
mod intensity;
mod io;
mod postprocess;

pub use compose::Compose;
pub use intensity::{EnsureChannelFirstd, ScaleIntensityConfig, ScaleIntensityd};
pub use io::{LoadImaged, SaveImageConfig, SaveImaged};
pub use postprocess::{ActivationConfig, Activationsd, AsDiscreteConfig, AsDiscreted};

use crate::core::TensorD;
use rayon::prelude::*;

/// Arrays with at least this many voxels are mapped in parallel.
const PARALLEL_VOXEL_THRESHOLD: usize = 1 << 16;

/// Applies `f` to every voxel in place.
pub(crate) fn map_voxels<F>(data: &mut TensorD, f: F)
where
    F: Fn(f32) -> f32 + Send + Sync,
{
    let len = data.len();
    match data.as_slice_mut() {
        Some(slice) if len >= PARALLEL_VOXEL_THRESHOLD => {
            slice.par_iter_mut().for_each(|v| *v = f(*v));
        }
        _ => data.mapv_inplace(f),
    }
}
