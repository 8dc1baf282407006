//! The bundle workflow contract.

use super::properties::{
    PropertyAssignment, PropertyLookup, PropertySpec, PropertyTable, PropertyValue,
};
use crate::utils::Determinism;
use medbundle_core::core::{BundleError, BundleResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of work a bundle performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    Train,
    Inference,
}

impl WorkflowType {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowType::Train => "train",
            WorkflowType::Inference => "inference",
        }
    }

    /// Property declarations every workflow of this type carries.
    pub fn default_properties(self) -> PropertyTable {
        match self {
            WorkflowType::Train => PropertyTable::train(),
            WorkflowType::Inference => PropertyTable::inference(),
        }
    }
}

impl FromStr for WorkflowType {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "train" | "training" => Ok(WorkflowType::Train),
            "infer" | "inference" | "eval" | "evaluation" => Ok(WorkflowType::Inference),
            _ => Err(BundleError::config_error_with_context(
                "workflow_type",
                s,
                "expected one of train, training, infer, inference, eval, evaluation",
            )),
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle position of a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum WorkflowState {
    #[default]
    Uninitialized,
    Initialized,
    Finalized,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowState::Uninitialized => "uninitialized",
            WorkflowState::Initialized => "initialized",
            WorkflowState::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

/// A bundle workflow: a set of named properties plus an
/// initialize / run / finalize lifecycle.
///
/// Implementors provide property dispatch and the lifecycle; lookups by
/// name alone, requirement checks and property declaration come for free.
pub trait BundleWorkflow {
    fn workflow_type(&self) -> WorkflowType;

    /// Declared properties.
    fn properties(&self) -> &PropertyTable;

    fn properties_mut(&mut self) -> &mut PropertyTable;

    fn state(&self) -> WorkflowState;

    /// Reads a property.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedProperty` when the workflow does not implement
    /// `name` and `spec` marks it as required.
    fn get_property(&self, name: &str, spec: &PropertySpec) -> BundleResult<PropertyLookup>;

    /// Assigns a property.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedProperty` as [`BundleWorkflow::get_property`]
    /// does, or `PropertyType` when `value` does not fit the slot.
    fn set_property(
        &mut self,
        name: &str,
        spec: &PropertySpec,
        value: PropertyValue,
    ) -> BundleResult<PropertyAssignment>;

    /// Builds every component that has not been assigned.
    fn initialize(&mut self, determinism: &Determinism) -> BundleResult<()>;

    /// Executes the workflow once.
    fn run(&mut self) -> BundleResult<()>;

    /// Releases resources. Returns whether finalization succeeded.
    fn finalize(&mut self) -> bool;

    /// Reads a property using its declaration from [`BundleWorkflow::properties`].
    ///
    /// # Errors
    ///
    /// Returns `UnknownProperty` when `name` is not declared.
    fn property(&self, name: &str) -> BundleResult<PropertyLookup> {
        let spec = self
            .properties()
            .get(name)
            .cloned()
            .ok_or_else(|| BundleError::unknown_property(name))?;
        self.get_property(name, &spec)
    }

    /// Assigns a property using its declaration from [`BundleWorkflow::properties`].
    ///
    /// # Errors
    ///
    /// Returns `UnknownProperty` when `name` is not declared.
    fn set_property_by_name(
        &mut self,
        name: &str,
        value: PropertyValue,
    ) -> BundleResult<PropertyAssignment> {
        let spec = self
            .properties()
            .get(name)
            .cloned()
            .ok_or_else(|| BundleError::unknown_property(name))?;
        self.set_property(name, &spec, value)
    }

    /// Declares an extra property.
    fn add_property(&mut self, name: &str, required: bool, description: &str) {
        self.properties_mut().add_property(name, required, description);
    }

    /// Names of required properties that cannot be read back with a value.
    fn check_properties(&self) -> Vec<String> {
        self.properties()
            .iter()
            .filter(|(_, spec)| spec.required)
            .filter(|(name, spec)| {
                !matches!(self.get_property(name, spec), Ok(PropertyLookup::Value(_)))
            })
            .map(|(name, _)| name.to_string())
            .collect()
    }
}
