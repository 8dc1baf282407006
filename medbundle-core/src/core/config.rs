//! Validation of the serde-backed component configs.

use thiserror::Error;

/// A config value that cannot be used.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("batch size must be at least 1")]
    InvalidBatchSize,

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The value is legal but asks for more resources than the process should take.
    #[error("resource limit exceeded: {message}")]
    ResourceLimitExceeded { message: String },
}

impl ConfigError {
    fn invalid(message: String) -> Self {
        Self::InvalidConfig { message }
    }
}

/// Upper bound on worker threads a config may request.
const MAX_WORKER_THREADS: usize = 256;

/// Checks a config before the component built from it is used.
///
/// Implemented by the configs of transforms, networks, inferers and
/// loaders. The provided helpers hold the checks they share.
pub trait ConfigValidator {
    /// Validates every field.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    fn validate(&self) -> Result<(), ConfigError>;

    fn validate_batch_size(&self, batch_size: usize) -> Result<(), ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        Ok(())
    }

    /// Accepts zero, which means work happens on the calling thread.
    fn validate_thread_count(&self, threads: usize) -> Result<(), ConfigError> {
        if threads > MAX_WORKER_THREADS {
            return Err(ConfigError::ResourceLimitExceeded {
                message: format!(
                    "{threads} worker threads requested, at most {MAX_WORKER_THREADS} allowed"
                ),
            });
        }
        Ok(())
    }

    /// Checks that `value` is finite and lies in `[min, max]`, or in
    /// `[min, max)` when `max_exclusive` is set.
    fn validate_f32_range(
        &self,
        value: f32,
        min: f32,
        max: f32,
        max_exclusive: bool,
        field: &str,
    ) -> Result<(), ConfigError> {
        let in_range = value.is_finite()
            && value >= min
            && if max_exclusive { value < max } else { value <= max };
        if !in_range {
            let close = if max_exclusive { ')' } else { ']' };
            return Err(ConfigError::invalid(format!(
                "{field} = {value} is outside [{min}, {max}{close}"
            )));
        }
        Ok(())
    }

    fn validate_positive_f32(&self, value: f32, field: &str) -> Result<(), ConfigError> {
        if value.is_finite() && value > 0.0 {
            return Ok(());
        }
        Err(ConfigError::invalid(format!("{field} = {value} must be positive")))
    }

    fn validate_positive_usize(&self, value: usize, field: &str) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::invalid(format!("{field} must be at least 1")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Always;

    impl ConfigValidator for Always {
        fn validate(&self) -> Result<(), ConfigError> {
            Ok(())
        }
    }

    #[test]
    fn batch_size_and_threads() {
        assert!(Always.validate_batch_size(1).is_ok());
        assert!(matches!(Always.validate_batch_size(0), Err(ConfigError::InvalidBatchSize)));
        assert!(Always.validate_thread_count(0).is_ok());
        assert!(Always.validate_thread_count(MAX_WORKER_THREADS).is_ok());
        assert!(matches!(
            Always.validate_thread_count(MAX_WORKER_THREADS + 1),
            Err(ConfigError::ResourceLimitExceeded { .. })
        ));
    }

    #[test]
    fn f32_range_respects_exclusive_bound() {
        assert!(Always.validate_f32_range(0.0, 0.0, 1.0, true, "overlap").is_ok());
        assert!(Always.validate_f32_range(0.25, 0.0, 1.0, true, "overlap").is_ok());
        assert!(Always.validate_f32_range(1.0, 0.0, 1.0, false, "overlap").is_ok());

        let err = Always.validate_f32_range(1.0, 0.0, 1.0, true, "overlap").unwrap_err();
        assert_eq!(err.to_string(), "invalid configuration: overlap = 1 is outside [0, 1)");
        assert!(Always.validate_f32_range(f32::NAN, 0.0, 1.0, false, "overlap").is_err());
    }

    #[test]
    fn positive_values() {
        assert!(Always.validate_positive_f32(0.1, "sigma").is_ok());
        assert!(Always.validate_positive_f32(0.0, "sigma").is_err());
        assert!(Always.validate_positive_f32(f32::INFINITY, "sigma").is_err());
        assert!(Always.validate_positive_usize(0, "roi").is_err());
        assert!(Always.validate_positive_usize(3, "roi").is_ok());
    }
}
