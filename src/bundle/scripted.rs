//! A segmentation inference workflow assembled in code.

use super::properties::{
    PropertyAccessor, PropertyAssignment, PropertyLookup, PropertyName, PropertySpec, PropertyTable,
    PropertyValue, dispatch_get, dispatch_set,
};
use super::workflow::{BundleWorkflow, WorkflowState, WorkflowType};
use crate::data::{DataLoader, Dataset, LoaderConfig};
use crate::engines::{IMAGE_KEY, PRED_KEY, SupervisedEvaluator};
use crate::inferers::{SharedInferer, SlidingWindowConfig, SlidingWindowInferer};
use crate::networks::{Device, SharedNetwork, UNet, UNetConfig};
use crate::utils::Determinism;
use medbundle_core::core::{BundleError, BundleResult};
use medbundle_core::domain::Sample;
use medbundle_core::processors::{
    Activationsd, AsDiscreted, Compose, EnsureChannelFirstd, LoadImaged, SaveImageConfig,
    SaveImaged, ScaleIntensityd,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Postfix of the written segmentation files.
const OUTPUT_POSTFIX: &str = "seg";

const ACCESSORS: &[PropertyAccessor<ScriptedInferenceWorkflow>] = &[
    PropertyAccessor {
        name: PropertyName::BundleRoot,
        get: |w| Some(PropertyValue::Path(w.bundle_root.clone())),
        set: |w, v| {
            w.bundle_root = v.into_path("bundle_root")?;
            Ok(())
        },
    },
    PropertyAccessor {
        name: PropertyName::Device,
        get: |w| Some(PropertyValue::Device(w.device)),
        set: |w, v| {
            w.device = v.into_device("device")?;
            Ok(())
        },
    },
    PropertyAccessor {
        name: PropertyName::NetworkDef,
        get: |w| w.network_def.clone().map(PropertyValue::Network),
        set: |w, v| {
            w.network_def = Some(v.into_network("network_def")?);
            Ok(())
        },
    },
    PropertyAccessor {
        name: PropertyName::Inferer,
        get: |w| w.inferer.clone().map(PropertyValue::Inferer),
        set: |w, v| {
            w.inferer = Some(v.into_inferer("inferer")?);
            Ok(())
        },
    },
    PropertyAccessor {
        name: PropertyName::Preprocessing,
        get: |w| w.preprocessing.clone().map(PropertyValue::Transform),
        set: |w, v| {
            w.preprocessing = Some(v.into_transform("preprocessing")?);
            Ok(())
        },
    },
    PropertyAccessor {
        name: PropertyName::Postprocessing,
        get: |w| w.postprocessing.clone().map(PropertyValue::Transform),
        set: |w, v| {
            w.postprocessing = Some(v.into_transform("postprocessing")?);
            Ok(())
        },
    },
];

/// Segments one NIfTI volume with a UNet and writes the label map.
///
/// The workflow exposes `bundle_root`, `device`, `network_def`, `inferer`,
/// `preprocessing` and `postprocessing` as properties. Anything left unset
/// when [`BundleWorkflow::initialize`] runs is built with defaults; anything
/// assigned beforehand is used as is.
///
/// # Example
///
/// ```rust,no_run
/// use medbundle::prelude::*;
///
/// # fn main() -> Result<(), BundleError> {
/// let mut workflow = ScriptedInferenceWorkflow::new("data/case.nii", "out");
/// workflow.initialize(&Determinism::default())?;
/// workflow.run()?;
/// workflow.finalize();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ScriptedInferenceWorkflow {
    input_path: PathBuf,
    output_dir: PathBuf,
    properties: PropertyTable,
    state: WorkflowState,
    loader_config: LoaderConfig,
    bundle_root: PathBuf,
    device: Device,
    network_def: Option<SharedNetwork>,
    inferer: Option<SharedInferer>,
    preprocessing: Option<Arc<Compose>>,
    postprocessing: Option<Arc<Compose>>,
    evaluator: Option<SupervisedEvaluator>,
}

impl ScriptedInferenceWorkflow {
    /// Creates a workflow reading `input_path` and writing under `output_dir`.
    pub fn new(input_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            output_dir: output_dir.into(),
            properties: WorkflowType::Inference.default_properties(),
            state: WorkflowState::Uninitialized,
            loader_config: LoaderConfig::default().with_num_workers(4),
            bundle_root: PathBuf::from("."),
            device: Device::Cpu,
            network_def: None,
            inferer: None,
            preprocessing: None,
            postprocessing: None,
            evaluator: None,
        }
    }

    /// Replaces the loader settings used by the next `initialize`.
    pub fn with_loader_config(mut self, loader_config: LoaderConfig) -> Self {
        self.loader_config = loader_config;
        self
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// The evaluator assembled by the last `initialize`.
    pub fn evaluator(&self) -> Option<&SupervisedEvaluator> {
        self.evaluator.as_ref()
    }

    fn default_preprocessing() -> Compose {
        Compose::default()
            .then(LoadImaged::new([IMAGE_KEY]))
            .then(EnsureChannelFirstd::new([IMAGE_KEY]))
            .then(ScaleIntensityd::new([IMAGE_KEY]))
    }

    fn default_inferer() -> BundleResult<SlidingWindowInferer> {
        SlidingWindowInferer::new(
            SlidingWindowConfig::new([64, 64, 32])
                .with_sw_batch_size(4)
                .with_overlap(0.25),
        )
    }

    fn default_postprocessing(&self) -> BundleResult<Compose> {
        let save = SaveImaged::new(
            [PRED_KEY],
            SaveImageConfig::new(&self.output_dir).with_postfix(OUTPUT_POSTFIX),
        )?;
        Ok(Compose::default()
            .then(Activationsd::softmax([PRED_KEY]))
            .then(AsDiscreted::argmax([PRED_KEY]))
            .then(save))
    }
}

impl BundleWorkflow for ScriptedInferenceWorkflow {
    fn workflow_type(&self) -> WorkflowType {
        WorkflowType::Inference
    }

    fn properties(&self) -> &PropertyTable {
        &self.properties
    }

    fn properties_mut(&mut self) -> &mut PropertyTable {
        &mut self.properties
    }

    fn state(&self) -> WorkflowState {
        self.state
    }

    fn get_property(&self, name: &str, spec: &PropertySpec) -> BundleResult<PropertyLookup> {
        dispatch_get(ACCESSORS, self, name, spec)
    }

    fn set_property(
        &mut self,
        name: &str,
        spec: &PropertySpec,
        value: PropertyValue,
    ) -> BundleResult<PropertyAssignment> {
        let assignment = dispatch_set(ACCESSORS, self, name, spec, value)?;
        debug!(property = name, ?assignment, "set property");
        Ok(assignment)
    }

    /// Builds the loader and evaluator, constructing defaults for unset
    /// properties.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` after `finalize`, `DeviceUnavailable` when the
    /// device cannot host the network, or any construction error.
    fn initialize(&mut self, determinism: &Determinism) -> BundleResult<()> {
        if self.state == WorkflowState::Finalized {
            return Err(BundleError::InvalidState {
                state: self.state.to_string(),
                operation: "initialize",
            });
        }
        let mut rng = determinism.rng();

        let preprocessing = self
            .preprocessing
            .get_or_insert_with(|| Arc::new(Self::default_preprocessing()))
            .clone();
        let dataset = Dataset::new(vec![Sample::new().with_path(IMAGE_KEY, &self.input_path)])
            .with_transform(preprocessing);
        let loader = DataLoader::new(dataset, self.loader_config.clone())?;

        let network = match self.network_def.clone() {
            Some(network) => network,
            None => {
                let network: SharedNetwork = Arc::new(UNet::new(UNetConfig::default(), &mut rng)?);
                self.network_def.insert(network).clone()
            }
        };
        let inferer = match self.inferer.clone() {
            Some(inferer) => inferer,
            None => {
                let inferer: SharedInferer = Arc::new(Self::default_inferer()?);
                self.inferer.insert(inferer).clone()
            }
        };
        let postprocessing = match self.postprocessing.clone() {
            Some(postprocessing) => postprocessing,
            None => {
                let postprocessing = Arc::new(self.default_postprocessing()?);
                self.postprocessing.insert(postprocessing).clone()
            }
        };

        let evaluator = SupervisedEvaluator::builder(self.device, loader, network, inferer)
            .postprocessing(postprocessing)
            .amp(false)
            .build()?;
        info!(
            input = %self.input_path.display(),
            output_dir = %self.output_dir.display(),
            device = %self.device,
            seed = determinism.seed(),
            network = evaluator.network().name(),
            inferer = evaluator.inferer().name(),
            "workflow initialized"
        );
        self.evaluator = Some(evaluator);
        self.state = WorkflowState::Initialized;
        Ok(())
    }

    fn run(&mut self) -> BundleResult<()> {
        if self.state == WorkflowState::Finalized {
            return Err(BundleError::InvalidState {
                state: self.state.to_string(),
                operation: "run",
            });
        }
        let evaluator = self
            .evaluator
            .as_mut()
            .ok_or(BundleError::NotInitialized { operation: "run" })?;
        evaluator.run()?;
        Ok(())
    }

    fn finalize(&mut self) -> bool {
        self.evaluator = None;
        self.state = WorkflowState::Finalized;
        info!("workflow finalized");
        true
    }
}
