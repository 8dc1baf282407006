//! Strategies for running a network over whole volumes.
//!
//! # Modules
//!
//! * `sliding_window` - Patch-wise inference with blended overlaps

mod sliding_window;

pub use sliding_window::{BlendMode, SlidingWindowConfig, SlidingWindowInferer};

use crate::networks::Network;
use medbundle_core::core::{BundleResult, Tensor5D};
use std::fmt::Debug;
use std::sync::Arc;

/// An inferer shared between the workflow and its evaluator.
pub type SharedInferer = Arc<dyn Inferer>;

/// Produces predictions for a batch by driving a network.
pub trait Inferer: Send + Sync + Debug {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Runs `network` over `inputs` and returns its predictions.
    ///
    /// # Arguments
    ///
    /// * `inputs` - Batch of channel-first volumes `(batch, channels, x, y, z)`
    /// * `network` - The model to evaluate
    fn infer(&self, inputs: &Tensor5D, network: &dyn Network) -> BundleResult<Tensor5D>;
}

/// Runs the network once on the full input.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleInferer;

impl SimpleInferer {
    pub fn new() -> Self {
        Self
    }
}

impl Inferer for SimpleInferer {
    fn name(&self) -> &'static str {
        "SimpleInferer"
    }

    fn infer(&self, inputs: &Tensor5D, network: &dyn Network) -> BundleResult<Tensor5D> {
        network.forward(inputs)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::networks::Network;
    use medbundle_core::core::{BundleResult, Tensor5D};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Network that repeats its single input channel and counts forward calls.
    #[derive(Debug, Default)]
    pub struct EchoNetwork {
        pub out_channels: usize,
        pub calls: AtomicUsize,
        pub largest_batch: AtomicUsize,
    }

    impl EchoNetwork {
        pub fn new(out_channels: usize) -> Self {
            Self {
                out_channels,
                ..Self::default()
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Network for EchoNetwork {
        fn name(&self) -> &str {
            "EchoNetwork"
        }

        fn in_channels(&self) -> usize {
            1
        }

        fn out_channels(&self) -> usize {
            self.out_channels
        }

        fn forward(&self, input: &Tensor5D) -> BundleResult<Tensor5D> {
            self.validate_input(input)?;
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.largest_batch
                .fetch_max(input.shape()[0], Ordering::SeqCst);
            let views = vec![input.view(); self.out_channels];
            Ok(ndarray::concatenate(ndarray::Axis(1), &views)?)
        }
    }
}
