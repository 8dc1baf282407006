//! Bundle properties: names, declarations and values.
//!
//! A workflow declares the properties it exposes in a [`PropertyTable`].
//! Known names are dispatched through a static table of
//! [`PropertyAccessor`]s, so adding a property means adding one table row.

use crate::inferers::SharedInferer;
use crate::networks::{Device, SharedNetwork};
use medbundle_core::core::{BundleError, BundleResult};
use medbundle_core::processors::Compose;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Declares [`PropertyName`] together with its string forms.
macro_rules! property_names {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Standard bundle property names.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum PropertyName {
            $(
                #[serde(rename = $name)]
                $variant,
            )+
        }

        impl PropertyName {
            /// Every standard name, in declaration order.
            pub const ALL: &'static [PropertyName] = &[$(PropertyName::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(PropertyName::$variant => $name,)+
                }
            }
        }

        impl FromStr for PropertyName {
            type Err = BundleError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(PropertyName::$variant),)+
                    _ => Err(BundleError::unknown_property(s)),
                }
            }
        }
    };
}

property_names! {
    BundleRoot => "bundle_root",
    Device => "device",
    DatasetDir => "dataset_dir",
    Dataset => "dataset",
    DatasetData => "dataset_data",
    Evaluator => "evaluator",
    NetworkDef => "network_def",
    Inferer => "inferer",
    Handlers => "handlers",
    Preprocessing => "preprocessing",
    Postprocessing => "postprocessing",
    KeyMetric => "key_metric",
    Trainer => "trainer",
    MaxEpochs => "max_epochs",
    TrainDataset => "train_dataset",
    TrainDatasetData => "train_dataset_data",
    TrainInferer => "train_inferer",
    TrainHandlers => "train_handlers",
    TrainPreprocessing => "train_preprocessing",
    TrainPostprocessing => "train_postprocessing",
    TrainKeyMetric => "train_key_metric",
    ValInterval => "val_interval",
    ValHandlers => "val_handlers",
    ValDataset => "val_dataset",
    ValDatasetData => "val_dataset_data",
    ValInferer => "val_inferer",
    ValPreprocessing => "val_preprocessing",
    ValPostprocessing => "val_postprocessing",
    ValKeyMetric => "val_key_metric",
}

impl fmt::Display for PropertyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declaration of one property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySpec {
    pub description: String,
    #[serde(default)]
    pub required: bool,
    /// Location of the property in a config-driven bundle, when it differs
    /// from the name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl PropertySpec {
    pub fn new(description: impl Into<String>, required: bool) -> Self {
        Self {
            description: description.into(),
            required,
            id: None,
        }
    }

    pub fn required(description: impl Into<String>) -> Self {
        Self::new(description, true)
    }

    pub fn optional(description: impl Into<String>) -> Self {
        Self::new(description, false)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Ordered mapping from property name to declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyTable {
    entries: Vec<(String, PropertySpec)>,
}

impl PropertyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Properties of an inference bundle.
    pub fn inference() -> Self {
        use PropertyName as P;
        let mut table = Self::new();
        table.declare(P::BundleRoot, PropertySpec::required("root path of the bundle."));
        table.declare(
            P::Device,
            PropertySpec::required("target device to execute the bundle workflow."),
        );
        table.declare(P::DatasetDir, PropertySpec::required("directory path of the dataset."));
        table.declare(
            P::Dataset,
            PropertySpec::required("dataset object for the inference / evaluation logic."),
        );
        table.declare(
            P::Evaluator,
            PropertySpec::required("inference / evaluation workflow engine."),
        );
        table.declare(P::NetworkDef, PropertySpec::required("network module for the inference."));
        table.declare(
            P::Inferer,
            PropertySpec::required("inferer object to execute the model computation in inference."),
        );
        table.declare(
            P::DatasetData,
            PropertySpec::optional("data source for the inference / evaluation dataset.")
                .with_id("dataset#data"),
        );
        table.declare(
            P::Handlers,
            PropertySpec::optional("event-handlers for the inference / evaluation logic."),
        );
        table.declare(
            P::Preprocessing,
            PropertySpec::optional("preprocessing for the input data."),
        );
        table.declare(
            P::Postprocessing,
            PropertySpec::optional("postprocessing for the model output data."),
        );
        table.declare(P::KeyMetric, PropertySpec::optional("the key metric during evaluation."));
        table
    }

    /// Properties of a training bundle.
    pub fn train() -> Self {
        use PropertyName as P;
        let mut table = Self::new();
        table.declare(P::BundleRoot, PropertySpec::required("root path of the bundle."));
        table.declare(
            P::Device,
            PropertySpec::required("target device to execute the bundle workflow."),
        );
        table.declare(P::DatasetDir, PropertySpec::required("directory path of the dataset."));
        table.declare(
            P::Trainer,
            PropertySpec::required("training workflow engine.").with_id("train#trainer"),
        );
        table.declare(
            P::NetworkDef,
            PropertySpec::optional("network module for the training."),
        );
        table.declare(
            P::MaxEpochs,
            PropertySpec::required("max number of epochs to execute the training.")
                .with_id("train#trainer#max_epochs"),
        );
        table.declare(
            P::TrainDataset,
            PropertySpec::required("dataset object for the training logic.")
                .with_id("train#dataset"),
        );
        table.declare(
            P::TrainInferer,
            PropertySpec::required("inferer object to execute the model computation in training.")
                .with_id("train#inferer"),
        );
        table.declare(
            P::TrainDatasetData,
            PropertySpec::optional("data source for the training dataset.")
                .with_id("train#dataset#data"),
        );
        table.declare(
            P::TrainHandlers,
            PropertySpec::optional("event-handlers for the training logic.")
                .with_id("train#handlers"),
        );
        table.declare(
            P::TrainPreprocessing,
            PropertySpec::optional("preprocessing for the training input data.")
                .with_id("train#preprocessing"),
        );
        table.declare(
            P::TrainPostprocessing,
            PropertySpec::optional("postprocessing for the training model output data.")
                .with_id("train#postprocessing"),
        );
        table.declare(
            P::TrainKeyMetric,
            PropertySpec::optional("key metric to save the best checkpoint during training.")
                .with_id("train#key_metric"),
        );
        table.declare(
            P::Evaluator,
            PropertySpec::optional("validation workflow engine.").with_id("validate#evaluator"),
        );
        table.declare(
            P::ValInterval,
            PropertySpec::optional("validation interval during the training."),
        );
        table.declare(
            P::ValHandlers,
            PropertySpec::optional("event-handlers for the validation logic.")
                .with_id("validate#handlers"),
        );
        table.declare(
            P::ValDataset,
            PropertySpec::optional("dataset object for the validation logic.")
                .with_id("validate#dataset"),
        );
        table.declare(
            P::ValDatasetData,
            PropertySpec::optional("data source for the validation dataset.")
                .with_id("validate#dataset#data"),
        );
        table.declare(
            P::ValInferer,
            PropertySpec::optional("inferer object to execute the model computation in validation.")
                .with_id("validate#inferer"),
        );
        table.declare(
            P::ValPreprocessing,
            PropertySpec::optional("preprocessing for the validation input data.")
                .with_id("validate#preprocessing"),
        );
        table.declare(
            P::ValPostprocessing,
            PropertySpec::optional("postprocessing for the validation model output data.")
                .with_id("validate#postprocessing"),
        );
        table.declare(
            P::ValKeyMetric,
            PropertySpec::optional("key metric to save the best checkpoint during validation.")
                .with_id("validate#key_metric"),
        );
        table
    }

    fn declare(&mut self, name: PropertyName, spec: PropertySpec) {
        self.insert(name.as_str(), spec);
    }

    /// Declares or redeclares a property, keeping its original position.
    pub fn insert(&mut self, name: impl Into<String>, spec: PropertySpec) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = spec,
            None => self.entries.push((name, spec)),
        }
    }

    /// Declares a property with the given requirement and description.
    pub fn add_property(
        &mut self,
        name: impl Into<String>,
        required: bool,
        description: impl Into<String>,
    ) {
        self.insert(name, PropertySpec::new(description, required));
    }

    pub fn get(&self, name: &str) -> Option<&PropertySpec> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, spec)| spec)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertySpec)> {
        self.entries.iter().map(|(n, spec)| (n.as_str(), spec))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Names of the required properties, in declaration order.
    pub fn required_names(&self) -> impl Iterator<Item = &str> {
        self.iter().filter(|(_, spec)| spec.required).map(|(n, _)| n)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A property value.
///
/// Shared handles compare by identity: reading back an assigned network
/// yields the same object, not an equal copy.
#[derive(Debug, Clone)]
pub enum PropertyValue {
    Path(PathBuf),
    Device(Device),
    Network(SharedNetwork),
    Inferer(SharedInferer),
    Transform(Arc<Compose>),
}

impl PropertyValue {
    /// Short name of the variant, used in type errors.
    pub fn kind(&self) -> &'static str {
        match self {
            PropertyValue::Path(_) => "path",
            PropertyValue::Device(_) => "device",
            PropertyValue::Network(_) => "network",
            PropertyValue::Inferer(_) => "inferer",
            PropertyValue::Transform(_) => "transform",
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            PropertyValue::Path(path) => Some(path),
            _ => None,
        }
    }

    pub fn as_device(&self) -> Option<Device> {
        match self {
            PropertyValue::Device(device) => Some(*device),
            _ => None,
        }
    }

    pub fn as_network(&self) -> Option<&SharedNetwork> {
        match self {
            PropertyValue::Network(network) => Some(network),
            _ => None,
        }
    }

    pub fn as_inferer(&self) -> Option<&SharedInferer> {
        match self {
            PropertyValue::Inferer(inferer) => Some(inferer),
            _ => None,
        }
    }

    pub fn as_transform(&self) -> Option<&Arc<Compose>> {
        match self {
            PropertyValue::Transform(transform) => Some(transform),
            _ => None,
        }
    }

    /// Unwraps a path for the property `name`.
    ///
    /// # Errors
    ///
    /// Returns `PropertyType` for any other variant. The remaining `into_*`
    /// methods behave the same way.
    pub fn into_path(self, name: &str) -> BundleResult<PathBuf> {
        match self {
            PropertyValue::Path(path) => Ok(path),
            other => Err(BundleError::property_type(name, "path", other.kind())),
        }
    }

    pub fn into_device(self, name: &str) -> BundleResult<Device> {
        match self {
            PropertyValue::Device(device) => Ok(device),
            other => Err(BundleError::property_type(name, "device", other.kind())),
        }
    }

    pub fn into_network(self, name: &str) -> BundleResult<SharedNetwork> {
        match self {
            PropertyValue::Network(network) => Ok(network),
            other => Err(BundleError::property_type(name, "network", other.kind())),
        }
    }

    pub fn into_inferer(self, name: &str) -> BundleResult<SharedInferer> {
        match self {
            PropertyValue::Inferer(inferer) => Ok(inferer),
            other => Err(BundleError::property_type(name, "inferer", other.kind())),
        }
    }

    pub fn into_transform(self, name: &str) -> BundleResult<Arc<Compose>> {
        match self {
            PropertyValue::Transform(transform) => Ok(transform),
            other => Err(BundleError::property_type(name, "transform", other.kind())),
        }
    }
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PropertyValue::Path(a), PropertyValue::Path(b)) => a == b,
            (PropertyValue::Device(a), PropertyValue::Device(b)) => a == b,
            (PropertyValue::Network(a), PropertyValue::Network(b)) => Arc::ptr_eq(a, b),
            (PropertyValue::Inferer(a), PropertyValue::Inferer(b)) => Arc::ptr_eq(a, b),
            (PropertyValue::Transform(a), PropertyValue::Transform(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<PathBuf> for PropertyValue {
    fn from(path: PathBuf) -> Self {
        PropertyValue::Path(path)
    }
}

impl From<&Path> for PropertyValue {
    fn from(path: &Path) -> Self {
        PropertyValue::Path(path.to_path_buf())
    }
}

impl From<&str> for PropertyValue {
    fn from(path: &str) -> Self {
        PropertyValue::Path(PathBuf::from(path))
    }
}

impl From<Device> for PropertyValue {
    fn from(device: Device) -> Self {
        PropertyValue::Device(device)
    }
}

impl From<SharedNetwork> for PropertyValue {
    fn from(network: SharedNetwork) -> Self {
        PropertyValue::Network(network)
    }
}

impl From<SharedInferer> for PropertyValue {
    fn from(inferer: SharedInferer) -> Self {
        PropertyValue::Inferer(inferer)
    }
}

impl From<Arc<Compose>> for PropertyValue {
    fn from(transform: Arc<Compose>) -> Self {
        PropertyValue::Transform(transform)
    }
}

/// Result of reading a property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyLookup {
    /// The property is known and holds a value.
    Value(PropertyValue),
    /// The property is known but nothing has been assigned or built yet.
    Unset,
    /// The workflow does not implement this optional property.
    Unsupported,
}

impl PropertyLookup {
    pub fn value(&self) -> Option<&PropertyValue> {
        match self {
            PropertyLookup::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<PropertyValue> {
        match self {
            PropertyLookup::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, PropertyLookup::Unsupported)
    }
}

/// Result of assigning a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAssignment {
    Assigned,
    /// The workflow does not implement this optional property; the value was dropped.
    Ignored,
}

/// Getter and setter for one known property of workflow `W`.
pub struct PropertyAccessor<W> {
    pub name: PropertyName,
    pub get: fn(&W) -> Option<PropertyValue>,
    pub set: fn(&mut W, PropertyValue) -> BundleResult<()>,
}

impl<W> fmt::Debug for PropertyAccessor<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyAccessor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn find_accessor<'a, W>(
    accessors: &'a [PropertyAccessor<W>],
    name: &str,
) -> Option<&'a PropertyAccessor<W>> {
    accessors.iter().find(|accessor| accessor.name.as_str() == name)
}

/// Reads `name` through the accessor table.
///
/// # Errors
///
/// Returns `UnsupportedProperty` when no accessor matches and `spec` marks
/// the property as required.
pub fn dispatch_get<W>(
    accessors: &[PropertyAccessor<W>],
    workflow: &W,
    name: &str,
    spec: &PropertySpec,
) -> BundleResult<PropertyLookup> {
    match find_accessor(accessors, name) {
        Some(accessor) => {
            Ok((accessor.get)(workflow).map_or(PropertyLookup::Unset, PropertyLookup::Value))
        }
        None if spec.required => Err(BundleError::unsupported_property(name)),
        None => Ok(PropertyLookup::Unsupported),
    }
}

/// Assigns `name` through the accessor table.
///
/// # Errors
///
/// Returns `UnsupportedProperty` like [`dispatch_get`], or the setter's
/// `PropertyType` error when the value does not fit the slot.
pub fn dispatch_set<W>(
    accessors: &[PropertyAccessor<W>],
    workflow: &mut W,
    name: &str,
    spec: &PropertySpec,
    value: PropertyValue,
) -> BundleResult<PropertyAssignment> {
    match find_accessor(accessors, name) {
        Some(accessor) => {
            (accessor.set)(workflow, value)?;
            Ok(PropertyAssignment::Assigned)
        }
        None if spec.required => Err(BundleError::unsupported_property(name)),
        None => Ok(PropertyAssignment::Ignored),
    }
}
