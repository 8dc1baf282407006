//! Volumes and their spatial metadata.

use crate::core::{BundleError, BundleResult, Tensor4D, TensorD};
use ndarray::Ix4;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where the channel axis of a volume sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelDim {
    /// The volume has spatial axes only.
    NoChannel,
    /// The channel lives on the given axis.
    Axis(usize),
}

/// Metadata carried alongside a volume through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMeta {
    /// Source file the volume was read from.
    pub filename: Option<PathBuf>,
    /// Voxel-to-world affine (row-major 4x4).
    pub affine: [[f64; 4]; 4],
    /// Spatial shape as read from disk.
    pub spatial_shape: Vec<usize>,
    /// Position of the channel axis in the array.
    pub channel_dim: ChannelDim,
}

impl VolumeMeta {
    /// Metadata for an in-memory volume with an identity affine.
    pub fn new(spatial_shape: Vec<usize>, channel_dim: ChannelDim) -> Self {
        Self {
            filename: None,
            affine: identity_affine(),
            spatial_shape,
            channel_dim,
        }
    }

    /// Sets the source filename.
    pub fn with_filename(mut self, filename: impl Into<PathBuf>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Sets the affine.
    pub fn with_affine(mut self, affine: [[f64; 4]; 4]) -> Self {
        self.affine = affine;
        self
    }

    /// Base name of the source file with `.nii`/`.nii.gz`-style extensions removed.
    pub fn stem(&self) -> Option<String> {
        self.filename.as_deref().and_then(file_stem)
    }
}

/// Returns the 4x4 identity matrix.
pub fn identity_affine() -> [[f64; 4]; 4] {
    let mut affine = [[0.0; 4]; 4];
    for (i, row) in affine.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    affine
}

/// Strips every extension from a file name (`image.nii.gz` -> `image`).
pub fn file_stem(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let stem = name.split('.').next().unwrap_or(name);
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

/// A dense image volume together with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    /// Voxel data.
    pub data: TensorD,
    /// Spatial metadata.
    pub meta: VolumeMeta,
}

impl Volume {
    /// Creates a volume from data and metadata.
    pub fn new(data: TensorD, meta: VolumeMeta) -> Self {
        Self { data, meta }
    }

    /// Creates a channel-first volume `(channels, x, y, z)` with default metadata.
    pub fn from_channel_first(data: Tensor4D) -> Self {
        let spatial_shape = data.shape()[1..].to_vec();
        Self {
            data: data.into_dyn(),
            meta: VolumeMeta::new(spatial_shape, ChannelDim::Axis(0)),
        }
    }

    /// Shape of the data array.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Whether the channel axis has been moved to the front.
    pub fn is_channel_first(&self) -> bool {
        self.meta.channel_dim == ChannelDim::Axis(0)
    }

    /// Views the data as a channel-first 4D array.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the volume is not channel-first or not 4D.
    pub fn view4(&self) -> BundleResult<ndarray::ArrayView4<'_, f32>> {
        if !self.is_channel_first() {
            return Err(BundleError::invalid_input(format!(
                "expected a channel-first volume, channel dim is {:?}",
                self.meta.channel_dim
            )));
        }
        Ok(self.data.view().into_dimensionality::<Ix4>()?)
    }

    /// Consumes the volume and returns its channel-first 4D data.
    pub fn into_tensor4(self) -> BundleResult<Tensor4D> {
        if !self.is_channel_first() {
            return Err(BundleError::invalid_input(format!(
                "expected a channel-first volume, channel dim is {:?}",
                self.meta.channel_dim
            )));
        }
        Ok(self.data.into_dimensionality::<Ix4>()?)
    }
}
