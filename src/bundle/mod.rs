//! Bundle workflows: declared properties plus an initialize / run /
//! finalize lifecycle.
//!
//! # Modules
//!
//! * `properties` - Property names, declarations, values and accessor dispatch
//! * `workflow` - The [`BundleWorkflow`] contract and lifecycle states
//! * `scripted` - A segmentation inference workflow assembled in code

pub mod properties;
mod scripted;
mod workflow;

pub use properties::{
    PropertyAccessor, PropertyAssignment, PropertyLookup, PropertyName, PropertySpec, PropertyTable,
    PropertyValue,
};
pub use scripted::ScriptedInferenceWorkflow;
pub use workflow::{BundleWorkflow, WorkflowState, WorkflowType};
