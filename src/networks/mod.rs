//! Networks that map a batch of volumes to per-voxel logits.
//!
//! # Modules
//!
//! * `device` - Compute device selection
//! * `layers` - 3D convolution building blocks
//! * `unet` - Residual UNet for volumetric segmentation

mod device;
pub mod layers;
mod unet;

pub use device::Device;
pub use layers::{ActType, NormType};
pub use unet::{UNet, UNetConfig};

use medbundle_core::core::{BundleError, BundleResult, Tensor5D};
use std::fmt::Debug;
use std::sync::Arc;

/// A network shared between the workflow, its evaluator and callers.
pub type SharedNetwork = Arc<dyn Network>;

/// A feed-forward model over `(batch, channels, x, y, z)` tensors.
pub trait Network: Send + Sync + Debug {
    /// Short description of the model, used in logs.
    fn name(&self) -> &str;

    /// Number of channels the model expects.
    fn in_channels(&self) -> usize;

    /// Number of channels the model produces.
    fn out_channels(&self) -> usize;

    /// Runs the model on a batch.
    ///
    /// # Arguments
    ///
    /// * `input` - Batch of channel-first volumes
    ///
    /// # Returns
    ///
    /// Logits with `out_channels` channels and the input's spatial shape.
    fn forward(&self, input: &Tensor5D) -> BundleResult<Tensor5D>;

    /// Validates that the input is suitable for [`Network::forward`].
    fn validate_input(&self, input: &Tensor5D) -> BundleResult<()> {
        let channels = input.shape()[1];
        if channels != self.in_channels() {
            return Err(BundleError::invalid_input(format!(
                "{} expects {} input channels, got {}",
                self.name(),
                self.in_channels(),
                channels
            )));
        }
        Ok(())
    }

    /// Places the model on `device`.
    ///
    /// Weights live in host memory, so this only checks availability.
    fn to_device(&self, device: &Device) -> BundleResult<()> {
        device.ensure_available()
    }
}
