//! Core traits for transforms and volume I/O.
//!
//! Transforms operate on keyed [`Sample`]s so that a pipeline can load an
//! image, normalize it, and later write a prediction derived from it while
//! keeping the source metadata attached. Readers and writers are the seams
//! where file formats plug in.

use crate::core::errors::BundleResult;
use crate::domain::{Sample, Volume};
use std::fmt::Debug;
use std::path::Path;

/// A deterministic operation applied to a sample.
pub trait Transform: Send + Sync + Debug {
    /// Short identifier of the transform, used in logs and errors.
    fn name(&self) -> &'static str;

    /// Applies the transform and returns the updated sample.
    fn apply(&self, sample: Sample) -> BundleResult<Sample>;
}

/// Trait for reading volumes from disk.
pub trait VolumeReader: Send + Sync + Debug {
    /// Whether this reader understands the file at `path`.
    fn supports(&self, path: &Path) -> bool;

    /// Reads the volume at `path`.
    ///
    /// The returned metadata records the source filename and where the
    /// channel axis sits, if the file carries one.
    fn read(&self, path: &Path) -> BundleResult<Volume>;
}

/// Trait for writing volumes to disk.
pub trait VolumeWriter: Send + Sync + Debug {
    /// File extension produced by this writer, including the leading dot.
    fn extension(&self) -> &'static str;

    /// Writes `volume` to `path`.
    fn write(&self, volume: &Volume, path: &Path) -> BundleResult<()>;
}
