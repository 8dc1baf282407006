//! Post-processing of network outputs.
//!
//! Both transforms expect channel-first volumes, as produced by the
//! evaluator when it splits a batch of predictions.

use super::map_voxels;
use crate::core::config::{ConfigError, ConfigValidator};
use crate::core::{BundleError, BundleResult, Transform};
use crate::domain::{Sample, Volume};
use ndarray::{Axis, Zip};
use serde::{Deserialize, Serialize};

fn channel_first<'a>(sample: &'a mut Sample, key: &str, op: &str) -> BundleResult<&'a mut Volume> {
    let volume = sample.volume_mut(key)?;
    if !volume.is_channel_first() {
        return Err(BundleError::post_processing(
            &format!("{op} on '{key}' requires a channel-first volume"),
            BundleError::invalid_input(format!("channel dim is {:?}", volume.meta.channel_dim)),
        ));
    }
    Ok(volume)
}

/// Which activation [`Activationsd`] applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationConfig {
    /// Softmax across the channel axis.
    #[serde(default)]
    pub softmax: bool,
    /// Element-wise logistic sigmoid.
    #[serde(default)]
    pub sigmoid: bool,
}

impl ConfigValidator for ActivationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.softmax && self.sigmoid {
            return Err(ConfigError::InvalidConfig {
                message: "softmax and sigmoid are mutually exclusive".to_string(),
            });
        }
        Ok(())
    }
}

/// Applies an activation to each keyed volume.
#[derive(Debug, Clone)]
pub struct Activationsd {
    keys: Vec<String>,
    config: ActivationConfig,
}

impl Activationsd {
    /// Creates the transform.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when both activations are requested.
    pub fn new<I, S>(keys: I, config: ActivationConfig) -> BundleResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        config.validate()?;
        Ok(Self {
            keys: keys.into_iter().map(Into::into).collect(),
            config,
        })
    }

    /// Softmax over channels for `keys`.
    pub fn softmax<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            config: ActivationConfig {
                softmax: true,
                sigmoid: false,
            },
        }
    }

    /// Sigmoid for `keys`.
    pub fn sigmoid<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            config: ActivationConfig {
                softmax: false,
                sigmoid: true,
            },
        }
    }
}

impl Transform for Activationsd {
    fn name(&self) -> &'static str {
        "Activationsd"
    }

    fn apply(&self, mut sample: Sample) -> BundleResult<Sample> {
        for key in &self.keys {
            if self.config.softmax {
                let volume = channel_first(&mut sample, key, "softmax")?;
                Zip::from(volume.data.lanes_mut(Axis(0))).par_for_each(|mut lane| {
                    let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                    lane.mapv_inplace(|v| (v - max).exp());
                    let sum = lane.sum();
                    lane.mapv_inplace(|v| v / sum);
                });
            } else if self.config.sigmoid {
                let volume = sample.volume_mut(key)?;
                map_voxels(&mut volume.data, |v| 1.0 / (1.0 + (-v).exp()));
            }
        }
        Ok(sample)
    }
}

/// How [`AsDiscreted`] discretizes values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AsDiscreteConfig {
    /// Replace the channel axis by the index of the largest channel.
    #[serde(default)]
    pub argmax: bool,
    /// Binarize with `value >= threshold`, applied after `argmax`.
    #[serde(default)]
    pub threshold: Option<f32>,
}

impl ConfigValidator for AsDiscreteConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.threshold {
            Some(t) if !t.is_finite() => Err(ConfigError::InvalidConfig {
                message: format!("threshold must be finite, got {t}"),
            }),
            _ => Ok(()),
        }
    }
}

/// Converts keyed volumes to discrete labels.
#[derive(Debug, Clone)]
pub struct AsDiscreted {
    keys: Vec<String>,
    config: AsDiscreteConfig,
}

impl AsDiscreted {
    /// Creates the transform.
    pub fn new<I, S>(keys: I, config: AsDiscreteConfig) -> BundleResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        config.validate()?;
        Ok(Self {
            keys: keys.into_iter().map(Into::into).collect(),
            config,
        })
    }

    /// Argmax over channels for `keys`.
    pub fn argmax<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            config: AsDiscreteConfig {
                argmax: true,
                threshold: None,
            },
        }
    }
}

impl Transform for AsDiscreted {
    fn name(&self) -> &'static str {
        "AsDiscreted"
    }

    fn apply(&self, mut sample: Sample) -> BundleResult<Sample> {
        for key in &self.keys {
            if self.config.argmax {
                let volume = channel_first(&mut sample, key, "argmax")?;
                // The first channel wins ties.
                let labels = volume.data.map_axis(Axis(0), |lane| {
                    let mut best = 0usize;
                    for (i, &v) in lane.iter().enumerate() {
                        if v > lane[best] {
                            best = i;
                        }
                    }
                    best as f32
                });
                volume.data = labels.insert_axis(Axis(0));
            }
            if let Some(threshold) = self.config.threshold {
                let volume = sample.volume_mut(key)?;
                map_voxels(&mut volume.data, |v| if v >= threshold { 1.0 } else { 0.0 });
            }
        }
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn pred(data: Array4<f32>) -> Sample {
        Sample::new().with_volume("pred", Volume::from_channel_first(data))
    }

    #[test]
    fn softmax_sums_to_one_per_voxel() -> Result<(), BundleError> {
        let data = Array4::from_shape_fn((3, 2, 2, 2), |(c, x, y, z)| (c * x + y + z) as f32);
        let out = Activationsd::softmax(["pred"]).apply(pred(data))?;
        let volume = out.volume("pred")?;
        for sum in volume.data.sum_axis(Axis(0)).iter() {
            assert!((sum - 1.0).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn softmax_of_equal_logits_is_uniform() -> Result<(), BundleError> {
        let logits = pred(Array4::from_elem((2, 1, 1, 1), 3.0));
        let out = Activationsd::softmax(["pred"]).apply(logits)?;
        assert!(out.volume("pred")?.data.iter().all(|&v| (v - 0.5).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn sigmoid_maps_zero_to_half() -> Result<(), BundleError> {
        let out = Activationsd::sigmoid(["pred"]).apply(pred(Array4::zeros((1, 2, 2, 2))))?;
        assert!(out.volume("pred")?.data.iter().all(|&v| v == 0.5));
        Ok(())
    }

    #[test]
    fn conflicting_activations_are_rejected() {
        let config = ActivationConfig {
            softmax: true,
            sigmoid: true,
        };
        assert!(Activationsd::new(["pred"], config).is_err());
    }

    #[test]
    fn argmax_keeps_a_singleton_channel() -> Result<(), BundleError> {
        let mut data = Array4::<f32>::zeros((2, 2, 1, 1));
        data[[1, 0, 0, 0]] = 0.9;
        data[[0, 1, 0, 0]] = 0.9;
        let out = AsDiscreted::argmax(["pred"]).apply(pred(data))?;
        let volume = out.volume("pred")?;
        assert_eq!(volume.shape(), &[1, 2, 1, 1]);
        assert_eq!(volume.data[[0, 0, 0, 0]], 1.0);
        assert_eq!(volume.data[[0, 1, 0, 0]], 0.0);
        Ok(())
    }

    #[test]
    fn argmax_ties_pick_the_first_channel() -> Result<(), BundleError> {
        let out = AsDiscreted::argmax(["pred"]).apply(pred(Array4::from_elem((3, 1, 1, 1), 0.5)))?;
        assert_eq!(out.volume("pred")?.data[[0, 0, 0, 0]], 0.0);
        Ok(())
    }

    #[test]
    fn threshold_binarizes_inclusively() -> Result<(), BundleError> {
        let data = Array4::from_shape_vec((1, 1, 1, 3), vec![0.2, 0.5, 0.7])?;
        let config = AsDiscreteConfig {
            argmax: false,
            threshold: Some(0.5),
        };
        let out = AsDiscreted::new(["pred"], config)?.apply(pred(data))?;
        let values: Vec<f32> = out.volume("pred")?.data.iter().copied().collect();
        assert_eq!(values, vec![0.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn argmax_requires_channel_first() {
        let volume = Volume::new(
            ndarray::Array3::<f32>::zeros((2, 2, 2)).into_dyn(),
            crate::domain::VolumeMeta::new(vec![2, 2, 2], crate::domain::ChannelDim::NoChannel),
        );
        let sample = Sample::new().with_volume("pred", volume);
        assert!(AsDiscreted::argmax(["pred"]).apply(sample).is_err());
    }
}
