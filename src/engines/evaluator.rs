//! Supervised evaluation loop.

use crate::data::DataLoader;
use crate::inferers::SharedInferer;
use crate::networks::{Device, SharedNetwork};
use medbundle_core::core::{BundleError, BundleResult, Transform};
use medbundle_core::domain::{ChannelDim, Field, Sample, Volume};
use medbundle_core::processors::Compose;
use ndarray::Axis;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Default sample key holding network inputs.
pub const IMAGE_KEY: &str = "image";
/// Default sample key receiving predictions.
pub const PRED_KEY: &str = "pred";

/// Progress of an engine, readable after [`SupervisedEvaluator::run`].
#[derive(Debug, Clone, Default)]
pub struct EngineState {
    /// Epochs completed.
    pub epoch: usize,
    pub max_epochs: usize,
    /// Iterations completed across the run.
    pub iteration: usize,
    /// Iterations per epoch.
    pub epoch_length: usize,
    /// Post-processed samples of the most recent run.
    pub output: Vec<Sample>,
    /// Wall time of the most recent run in milliseconds.
    pub elapsed_ms: f64,
}

impl EngineState {
    /// Average time per iteration in milliseconds.
    pub fn ms_per_iteration(&self) -> f64 {
        if self.iteration == 0 {
            0.0
        } else {
            self.elapsed_ms / self.iteration as f64
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "epoch {}/{}, iteration {} ({} per epoch), {} outputs, {:.1} ms/iter",
            self.epoch,
            self.max_epochs,
            self.iteration,
            self.epoch_length,
            self.output.len(),
            self.ms_per_iteration()
        )
    }
}

/// Runs a network over every batch of a loader and post-processes the results.
///
/// For each batch, the inputs under the image key are stacked, passed
/// through the inferer, split back into one prediction per sample (carrying
/// the image metadata) and stored under the prediction key before the
/// post-processing pipeline runs.
#[derive(Debug)]
pub struct SupervisedEvaluator {
    device: Device,
    loader: DataLoader,
    network: SharedNetwork,
    inferer: SharedInferer,
    postprocessing: Option<Arc<Compose>>,
    amp: bool,
    image_key: String,
    pred_key: String,
    state: EngineState,
}

impl SupervisedEvaluator {
    /// Starts building an evaluator from its required parts.
    pub fn builder(
        device: Device,
        loader: DataLoader,
        network: SharedNetwork,
        inferer: SharedInferer,
    ) -> SupervisedEvaluatorBuilder {
        SupervisedEvaluatorBuilder {
            device,
            loader,
            network,
            inferer,
            postprocessing: None,
            amp: false,
            image_key: IMAGE_KEY.to_string(),
            pred_key: PRED_KEY.to_string(),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn network(&self) -> &SharedNetwork {
        &self.network
    }

    pub fn inferer(&self) -> &SharedInferer {
        &self.inferer
    }

    pub fn postprocessing(&self) -> Option<&Arc<Compose>> {
        self.postprocessing.as_ref()
    }

    pub fn amp(&self) -> bool {
        self.amp
    }

    pub fn loader(&self) -> &DataLoader {
        &self.loader
    }

    /// State of the most recent run.
    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Evaluates one epoch over the loader.
    ///
    /// # Errors
    ///
    /// Stops at the first failing batch and returns its error: loading,
    /// inference and post-processing failures propagate unchanged.
    pub fn run(&mut self) -> BundleResult<&EngineState> {
        let started = Instant::now();
        self.state = EngineState {
            epoch: 0,
            max_epochs: 1,
            iteration: 0,
            epoch_length: self.loader.len(),
            output: Vec::new(),
            elapsed_ms: 0.0,
        };
        info!(
            network = self.network.name(),
            inferer = self.inferer.name(),
            device = %self.device,
            batches = self.state.epoch_length,
            "evaluator run started"
        );

        for batch in self.loader.iter() {
            let batch = batch?;
            let inputs = batch.stack(&self.image_key)?;
            let predictions = self.inferer.infer(&inputs, self.network.as_ref())?;
            if predictions.len_of(Axis(0)) != batch.len() {
                return Err(BundleError::inference_error(BundleError::invalid_input(format!(
                    "inferer returned {} predictions for {} inputs",
                    predictions.len_of(Axis(0)),
                    batch.len()
                ))));
            }

            let rows = predictions.axis_iter(Axis(0));
            for (mut sample, prediction) in batch.samples.into_iter().zip(rows) {
                let mut meta = sample.volume(&self.image_key)?.meta.clone();
                meta.channel_dim = ChannelDim::Axis(0);
                let volume = Volume::new(prediction.to_owned().into_dyn(), meta);
                sample.insert(self.pred_key.clone(), Field::Volume(volume));

                let sample = match &self.postprocessing {
                    Some(postprocessing) => postprocessing.apply(sample)?,
                    None => sample,
                };
                self.state.output.push(sample);
            }
            self.state.iteration += 1;
            debug!(
                iteration = self.state.iteration,
                epoch_length = self.state.epoch_length,
                indexes = ?batch.indexes,
                "evaluator iteration"
            );
        }

        self.state.epoch = 1;
        self.state.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!(state = %self.state, "evaluator run finished");
        Ok(&self.state)
    }
}

/// Builder for [`SupervisedEvaluator`].
#[derive(Debug)]
pub struct SupervisedEvaluatorBuilder {
    device: Device,
    loader: DataLoader,
    network: SharedNetwork,
    inferer: SharedInferer,
    postprocessing: Option<Arc<Compose>>,
    amp: bool,
    image_key: String,
    pred_key: String,
}

impl SupervisedEvaluatorBuilder {
    /// Pipeline applied to each sample after its prediction is attached.
    pub fn postprocessing(mut self, postprocessing: Arc<Compose>) -> Self {
        self.postprocessing = Some(postprocessing);
        self
    }

    /// Requests mixed precision. CPU inference always runs in `f32`.
    pub fn amp(mut self, amp: bool) -> Self {
        self.amp = amp;
        self
    }

    /// Overrides the input and prediction keys.
    pub fn keys(mut self, image_key: impl Into<String>, pred_key: impl Into<String>) -> Self {
        self.image_key = image_key.into();
        self.pred_key = pred_key.into();
        self
    }

    /// Places the network on the device and assembles the evaluator.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` when the device cannot host the network.
    pub fn build(self) -> BundleResult<SupervisedEvaluator> {
        self.network.to_device(&self.device)?;
        if self.amp {
            warn!(device = %self.device, "mixed precision is not available, running in f32");
        }
        Ok(SupervisedEvaluator {
            device: self.device,
            loader: self.loader,
            network: self.network,
            inferer: self.inferer,
            postprocessing: self.postprocessing,
            amp: self.amp,
            image_key: self.image_key,
            pred_key: self.pred_key,
            state: EngineState::default(),
        })
    }
}
