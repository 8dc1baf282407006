//! Error types for bundle workflows.
//!
//! This module defines the errors that can surface while driving a bundle
//! workflow: property dispatch failures, lifecycle misuse, volume I/O
//! problems, and failures raised inside transforms, networks and inferers.
//! Collaborator failures are carried through unchanged as sources.

use std::path::PathBuf;
use thiserror::Error;

/// Enum representing the stage of the pipeline an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    /// Error occurred during tensor operations.
    TensorOperation,
    /// Error occurred while loading or collating a batch.
    DataLoading,
    /// Error occurred while applying a postprocessing transform.
    PostProcessing,
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingStage::TensorOperation => write!(f, "tensor operation"),
            ProcessingStage::DataLoading => write!(f, "data loading"),
            ProcessingStage::PostProcessing => write!(f, "post-processing"),
        }
    }
}

/// Errors produced by bundle workflows and their collaborators.
#[derive(Error, Debug)]
pub enum BundleError {
    /// A property that the caller marked as required is not supported by the workflow.
    #[error("unsupported property '{name}' is required in the bundle properties.")]
    UnsupportedProperty {
        /// Name of the offending property.
        name: String,
    },

    /// The property name is not declared in the workflow's property table.
    #[error("property '{name}' is not declared by this workflow")]
    UnknownProperty {
        /// Name of the undeclared property.
        name: String,
    },

    /// A value of the wrong kind was assigned to a property slot.
    #[error("property '{name}' expects {expected}, got {actual}")]
    PropertyType {
        /// Name of the property.
        name: String,
        /// Kind of value the slot holds.
        expected: &'static str,
        /// Kind of value that was supplied.
        actual: &'static str,
    },

    /// A lifecycle operation was invoked before `initialize`.
    #[error("workflow must be initialized before {operation}")]
    NotInitialized {
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// A lifecycle operation is not allowed in the current state.
    #[error("cannot {operation} a workflow in state '{state}'")]
    InvalidState {
        /// Current lifecycle state.
        state: String,
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// The requested compute device cannot be used.
    #[error("device '{device}' is not available")]
    DeviceUnavailable {
        /// Display form of the device.
        device: String,
    },

    /// Error occurred during processing.
    #[error("{kind} failed: {context}")]
    Processing {
        /// The stage of processing where the error occurred.
        kind: ProcessingStage,
        /// Additional context about the error.
        context: String,
        /// The underlying error that caused this error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Error occurred during inference.
    #[error("inference")]
    Inference(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Error indicating invalid input.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// A message describing the invalid input.
        message: String,
    },

    /// Error indicating a configuration problem.
    #[error("configuration: {message}")]
    ConfigError {
        /// A message describing the configuration error.
        message: String,
    },

    /// A NIfTI file could not be decoded or encoded.
    #[error("nifti '{}': {message}", path.display())]
    Nifti {
        /// Path of the file being read or written.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// Error from tensor shape operations.
    #[error("tensor operation")]
    Tensor(#[from] ndarray::ShapeError),

    /// IO error.
    #[error("io")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the workspace.
pub type BundleResult<T> = Result<T, BundleError>;

impl BundleError {
    /// Creates an error for a required property the workflow does not support.
    pub fn unsupported_property(name: impl Into<String>) -> Self {
        Self::UnsupportedProperty { name: name.into() }
    }

    /// Creates an error for a property missing from the declared table.
    pub fn unknown_property(name: impl Into<String>) -> Self {
        Self::UnknownProperty { name: name.into() }
    }

    /// Creates an error for a value of the wrong kind.
    pub fn property_type(
        name: impl Into<String>,
        expected: &'static str,
        actual: &'static str,
    ) -> Self {
        Self::PropertyType {
            name: name.into(),
            expected,
            actual,
        }
    }

    /// Creates an error for tensor operations.
    ///
    /// # Arguments
    ///
    /// * `context` - Additional context about the error.
    /// * `error` - The underlying error that caused this error.
    pub fn tensor_operation(
        context: &str,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::processing_error(ProcessingStage::TensorOperation, context, error)
    }

    /// Creates an error for post-processing operations.
    ///
    /// # Arguments
    ///
    /// * `context` - Additional context about the error.
    /// * `error` - The underlying error that caused this error.
    pub fn post_processing(
        context: &str,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::processing_error(ProcessingStage::PostProcessing, context, error)
    }

    /// Creates an error for processing operations in the given stage.
    ///
    /// # Arguments
    ///
    /// * `kind` - The stage of processing where the error occurred.
    /// * `context` - Additional context about the error.
    /// * `error` - The underlying error that caused this error.
    pub fn processing_error(
        kind: ProcessingStage,
        context: &str,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Processing {
            kind,
            context: context.to_string(),
            source: Box::new(error),
        }
    }

    /// Creates an error for inference operations.
    pub fn inference_error(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Inference(Box::new(error))
    }

    /// Creates an error for invalid input.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Creates an error for configuration problems.
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Creates a configuration error naming the field and value at fault.
    pub fn config_error_with_context(field: &str, value: &str, reason: &str) -> Self {
        Self::ConfigError {
            message: format!(
                "Configuration error in field '{}' with value '{}': {}",
                field, value, reason
            ),
        }
    }

    /// Creates a NIfTI codec error.
    pub fn nifti(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Nifti {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<crate::core::config::ConfigError> for BundleError {
    fn from(error: crate::core::config::ConfigError) -> Self {
        Self::ConfigError {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_property_message_names_the_property() {
        let err = BundleError::unsupported_property("dataset_dir");
        assert_eq!(
            err.to_string(),
            "unsupported property 'dataset_dir' is required in the bundle properties."
        );
    }

    #[test]
    fn processing_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = BundleError::processing_error(ProcessingStage::DataLoading, "load", io);
        assert_eq!(err.to_string(), "data loading failed: load");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn config_error_converts() {
        let err: BundleError = crate::core::config::ConfigError::InvalidBatchSize.into();
        assert!(matches!(err, BundleError::ConfigError { .. }));
    }

    #[test]
    fn nifti_error_displays_path() {
        let err = BundleError::nifti("/tmp/a.nii", "bad magic");
        assert_eq!(err.to_string(), "nifti '/tmp/a.nii': bad magic");
    }
}
