//! Sequential composition of transforms.

use crate::core::{BundleResult, Transform};
use crate::domain::Sample;
use std::sync::Arc;
use tracing::trace;

/// Applies a list of transforms in order.
///
/// `Compose` is itself a [`Transform`], so pipelines can be nested.
#[derive(Debug, Clone, Default)]
pub struct Compose {
    transforms: Vec<Arc<dyn Transform>>,
}

impl Compose {
    /// Creates a pipeline from already shared transforms.
    pub fn new(transforms: Vec<Arc<dyn Transform>>) -> Self {
        Self { transforms }
    }

    /// Appends a transform to the end of the pipeline.
    pub fn then<T: Transform + 'static>(mut self, transform: T) -> Self {
        self.transforms.push(Arc::new(transform));
        self
    }

    /// Number of transforms.
    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    /// Whether the pipeline is empty.
    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Names of the transforms in application order.
    pub fn names(&self) -> Vec<&'static str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }
}

impl Transform for Compose {
    fn name(&self) -> &'static str {
        "Compose"
    }

    fn apply(&self, sample: Sample) -> BundleResult<Sample> {
        self.transforms.iter().try_fold(sample, |sample, transform| {
            trace!(transform = transform.name(), "applying transform");
            transform.apply(sample)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BundleError;
    use crate::domain::Field;

    #[derive(Debug)]
    struct Tag(&'static str);

    impl Transform for Tag {
        fn name(&self) -> &'static str {
            self.0
        }

        fn apply(&self, mut sample: Sample) -> BundleResult<Sample> {
            let order = sample.len();
            sample.insert(format!("{order}_{}", self.0), Field::Path(self.0.into()));
            Ok(sample)
        }
    }

    #[derive(Debug)]
    struct Fail;

    impl Transform for Fail {
        fn name(&self) -> &'static str {
            "Fail"
        }

        fn apply(&self, _sample: Sample) -> BundleResult<Sample> {
            Err(BundleError::invalid_input("boom"))
        }
    }

    #[test]
    fn applies_transforms_in_order() -> Result<(), BundleError> {
        let pipeline = Compose::default().then(Tag("a")).then(Tag("b"));
        assert_eq!(pipeline.names(), vec!["a", "b"]);

        let out = pipeline.apply(Sample::new())?;
        let keys: Vec<_> = out.keys().collect();
        assert_eq!(keys, vec!["0_a", "1_b"]);
        Ok(())
    }

    #[test]
    fn stops_at_first_failure() {
        let pipeline = Compose::default().then(Fail).then(Tag("never"));
        assert!(pipeline.apply(Sample::new()).is_err());
    }

    #[test]
    fn empty_pipeline_is_identity() -> Result<(), BundleError> {
        let sample = Sample::new().with_path("image", "a.nii");
        assert_eq!(Compose::default().apply(sample.clone())?, sample);
        Ok(())
    }
}
