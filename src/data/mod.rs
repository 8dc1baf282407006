//! Datasets and batched loading.
//!
//! A [`Dataset`] holds raw samples (typically file paths) and applies its
//! preprocessing pipeline on access. A [`DataLoader`] groups dataset indexes
//! into batches and materializes each batch on a dedicated rayon pool.

use medbundle_core::core::config::{ConfigError, ConfigValidator};
use medbundle_core::core::{
    BatchSampler, BundleError, BundleResult, ProcessingStage, Tensor5D, Transform, stack_volumes,
};
use medbundle_core::domain::Sample;
use medbundle_core::processors::Compose;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// An indexable list of samples with an optional preprocessing pipeline.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    items: Vec<Sample>,
    transform: Option<Arc<Compose>>,
}

impl Dataset {
    pub fn new(items: Vec<Sample>) -> Self {
        Self {
            items,
            transform: None,
        }
    }

    /// Applies `transform` to every sample returned by [`Dataset::get`].
    pub fn with_transform(mut self, transform: Arc<Compose>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the transformed sample at `index`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an out-of-range index, otherwise whatever
    /// the preprocessing pipeline reports.
    pub fn get(&self, index: usize) -> BundleResult<Sample> {
        let item = self.items.get(index).cloned().ok_or_else(|| {
            BundleError::invalid_input(format!(
                "index {index} is out of range for a dataset of {} items",
                self.items.len()
            ))
        })?;
        match &self.transform {
            Some(transform) => transform.apply(item),
            None => Ok(item),
        }
    }
}

/// Configuration for [`DataLoader`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    #[serde(default = "LoaderConfig::default_batch_size")]
    pub batch_size: usize,
    /// Threads used to prepare a batch; zero loads on the calling thread.
    #[serde(default)]
    pub num_workers: usize,
    #[serde(default)]
    pub drop_last: bool,
}

impl LoaderConfig {
    fn default_batch_size() -> usize {
        1
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::default_batch_size(),
            num_workers: 0,
            drop_last: false,
        }
    }
}

impl ConfigValidator for LoaderConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.validate_batch_size(self.batch_size)?;
        self.validate_thread_count(self.num_workers)
    }
}

/// Samples loaded together, with their dataset indexes.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub samples: Vec<Sample>,
    pub indexes: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Stacks the channel-first volumes under `key` into one tensor.
    pub fn stack(&self, key: &str) -> BundleResult<Tensor5D> {
        let views = self
            .samples
            .iter()
            .map(|sample| sample.volume(key)?.view4())
            .collect::<BundleResult<Vec<_>>>()?;
        stack_volumes(&views)
    }
}

/// Iterates a dataset in batches.
#[derive(Debug)]
pub struct DataLoader {
    dataset: Dataset,
    config: LoaderConfig,
    sampler: BatchSampler,
    pool: Option<rayon::ThreadPool>,
}

impl DataLoader {
    /// Creates a loader, spawning `num_workers` threads when non-zero.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid config, or a data loading
    /// error when the worker pool cannot be created.
    pub fn new(dataset: Dataset, config: LoaderConfig) -> BundleResult<Self> {
        config.validate()?;
        let pool = if config.num_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_workers)
                .thread_name(|i| format!("medbundle-loader-{i}"))
                .build()
                .map_err(|e| {
                    BundleError::processing_error(
                        ProcessingStage::DataLoading,
                        "failed to start loader workers",
                        e,
                    )
                })?;
            Some(pool)
        } else {
            None
        };
        let sampler = BatchSampler::new(config.batch_size).with_drop_last(config.drop_last);
        Ok(Self {
            dataset,
            config,
            sampler,
            pool,
        })
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Number of batches per pass.
    pub fn len(&self) -> usize {
        self.sampler.num_batches(self.dataset.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the batches of one pass, in dataset order.
    pub fn iter(&self) -> impl Iterator<Item = BundleResult<Batch>> + '_ {
        let indexes: Vec<usize> = (0..self.dataset.len()).collect();
        let batches: Vec<Vec<usize>> = self
            .sampler
            .batches_with_indexes(&indexes)
            .map(|(_, positions)| positions)
            .collect();
        batches.into_iter().map(move |indexes| self.load_batch(indexes))
    }

    fn load_batch(&self, indexes: Vec<usize>) -> BundleResult<Batch> {
        let samples = match &self.pool {
            Some(pool) => pool.install(|| {
                indexes
                    .par_iter()
                    .map(|&i| self.dataset.get(i))
                    .collect::<BundleResult<Vec<_>>>()
            })?,
            None => indexes
                .iter()
                .map(|&i| self.dataset.get(i))
                .collect::<BundleResult<Vec<_>>>()?,
        };
        debug!(indexes = ?indexes, "loaded batch");
        Ok(Batch { samples, indexes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbundle_core::domain::{Field, Volume};
    use ndarray::Array4;

    /// Replaces the `image` path with a volume filled with the path's numeric name.
    #[derive(Debug)]
    struct Materialize;

    impl Transform for Materialize {
        fn name(&self) -> &'static str {
            "Materialize"
        }

        fn apply(&self, mut sample: Sample) -> BundleResult<Sample> {
            let value = match sample.get("image") {
                Some(Field::Path(p)) => p
                    .to_str()
                    .and_then(|s| s.parse::<f32>().ok())
                    .ok_or_else(|| BundleError::invalid_input("not a number"))?,
                _ => return Err(BundleError::invalid_input("missing image")),
            };
            let volume = Volume::from_channel_first(Array4::from_elem((1, 2, 2, 2), value));
            sample.insert("image", Field::Volume(volume));
            Ok(sample)
        }
    }

    fn dataset(n: usize) -> Dataset {
        let items = (0..n)
            .map(|i| Sample::new().with_path("image", i.to_string()))
            .collect();
        Dataset::new(items).with_transform(Arc::new(Compose::default().then(Materialize)))
    }

    #[test]
    fn dataset_applies_transform_on_access() -> Result<(), BundleError> {
        let ds = dataset(3);
        assert_eq!(ds.get(2)?.volume("image")?.data[[0, 0, 0, 0]], 2.0);
        assert!(ds.get(3).is_err());
        Ok(())
    }

    #[test]
    fn loader_batches_in_order_with_workers() -> Result<(), BundleError> {
        let loader = DataLoader::new(
            dataset(5),
            LoaderConfig::default()
                .with_batch_size(2)
                .with_num_workers(2),
        )?;
        assert_eq!(loader.len(), 3);

        let batches = loader.iter().collect::<BundleResult<Vec<_>>>()?;
        let indexes: Vec<_> = batches.iter().map(|b| b.indexes.clone()).collect();
        assert_eq!(indexes, vec![vec![0, 1], vec![2, 3], vec![4]]);

        let stacked = batches[1].stack("image")?;
        assert_eq!(stacked.shape(), &[2, 1, 2, 2, 2]);
        assert_eq!(stacked[[1, 0, 0, 0, 0]], 3.0);
        Ok(())
    }

    #[test]
    fn loader_without_workers_drops_last() -> Result<(), BundleError> {
        let loader = DataLoader::new(
            dataset(5),
            LoaderConfig::default()
                .with_batch_size(2)
                .with_drop_last(true),
        )?;
        assert_eq!(loader.iter().count(), 2);
        Ok(())
    }

    #[test]
    fn loader_surfaces_transform_errors() -> Result<(), BundleError> {
        let items = vec![Sample::new().with_path("image", "not-a-number")];
        let ds = Dataset::new(items).with_transform(Arc::new(Compose::default().then(Materialize)));
        let loader = DataLoader::new(ds, LoaderConfig::default().with_num_workers(1))?;
        assert!(loader.iter().next().is_some_and(|b| b.is_err()));
        Ok(())
    }

    #[test]
    fn rejects_zero_batch_size() {
        let config = LoaderConfig::default().with_batch_size(0);
        assert!(DataLoader::new(Dataset::default(), config).is_err());
    }

    #[test]
    fn config_defaults_from_json() -> Result<(), Box<dyn std::error::Error>> {
        let config: LoaderConfig = serde_json::from_str(r#"{"num_workers": 4}"#)?;
        assert_eq!(config, LoaderConfig::default().with_num_workers(4));
        Ok(())
    }
}
