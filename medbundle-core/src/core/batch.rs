//! Batch processing utilities.
//!
//! This module provides the tensor aliases used across the workspace, the
//! sampler that splits a dataset into index batches, and the collation step
//! that stacks channel-first volumes into a single batch tensor.

use crate::core::{BundleError, BundleResult};
use ndarray::{ArrayView4, Axis};

/// A channel-first volume `(channels, x, y, z)`.
pub type Tensor4D = ndarray::Array4<f32>;

/// A batch of channel-first volumes `(batch, channels, x, y, z)`.
pub type Tensor5D = ndarray::Array5<f32>;

/// A tensor of arbitrary rank.
pub type TensorD = ndarray::ArrayD<f32>;

/// A sampler that creates batches of data with a specified batch size.
#[derive(Debug, Clone)]
pub struct BatchSampler {
    /// The size of each batch.
    batch_size: usize,
    /// Whether a trailing short batch is dropped.
    drop_last: bool,
}

impl BatchSampler {
    /// Creates a new BatchSampler with the specified batch size.
    ///
    /// # Arguments
    ///
    /// * `batch_size` - The size of each batch. A size of zero yields no batches.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            drop_last: false,
        }
    }

    /// Drops the final batch when it holds fewer than `batch_size` items.
    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Returns the batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Returns the number of batches produced for `len` items.
    pub fn num_batches(&self, len: usize) -> usize {
        if self.batch_size == 0 {
            0
        } else if self.drop_last {
            len / self.batch_size
        } else {
            len.div_ceil(self.batch_size)
        }
    }

    /// Creates an iterator over batches of data.
    ///
    /// # Arguments
    ///
    /// * `data` - A slice of data to be batched.
    ///
    /// # Returns
    ///
    /// An iterator over batches of data.
    pub fn batches<'a, T>(&self, data: &'a [T]) -> impl Iterator<Item = &'a [T]> {
        let chunk = self.batch_size.max(1);
        let take = self.num_batches(data.len());
        data.chunks(chunk).take(take)
    }

    /// Creates an iterator over batches of data with their indexes.
    ///
    /// # Arguments
    ///
    /// * `data` - A slice of data to be batched.
    ///
    /// # Returns
    ///
    /// An iterator over tuples containing batches of data and their indexes.
    pub fn batches_with_indexes<'a, T>(
        &self,
        data: &'a [T],
    ) -> impl Iterator<Item = (&'a [T], Vec<usize>)> {
        let batch_size = self.batch_size.max(1);
        self.batches(data).enumerate().map(move |(batch_idx, chunk)| {
            let start_idx = batch_idx * batch_size;
            let indexes: Vec<usize> = (0..chunk.len()).map(|i| start_idx + i).collect();
            (chunk, indexes)
        })
    }
}

/// Stacks channel-first volumes into a `(batch, channels, x, y, z)` tensor.
///
/// All volumes must share the same shape.
///
/// # Errors
///
/// Returns `InvalidInput` when the list is empty or the shapes disagree.
pub fn stack_volumes(volumes: &[ArrayView4<'_, f32>]) -> BundleResult<Tensor5D> {
    let first = volumes
        .first()
        .ok_or_else(|| BundleError::invalid_input("cannot collate an empty batch"))?;

    for (i, volume) in volumes.iter().enumerate() {
        if volume.shape() != first.shape() {
            return Err(BundleError::invalid_input(format!(
                "All volumes in a batch must have the same shape. Volume 0: {:?}, volume {}: {:?}",
                first.shape(),
                i,
                volume.shape()
            )));
        }
    }

    Ok(ndarray::stack(Axis(0), volumes)?)
}
