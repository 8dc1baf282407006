//! Channel layout and intensity transforms.

use super::map_voxels;
use crate::core::config::{ConfigError, ConfigValidator};
use crate::core::{BundleResult, Transform};
use crate::domain::{ChannelDim, Sample};
use ndarray::{Axis, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::trace;

fn collect_keys<I, S>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    keys.into_iter().map(Into::into).collect()
}

/// Moves the channel axis of each volume to the front, adding one if absent.
#[derive(Debug, Clone)]
pub struct EnsureChannelFirstd {
    keys: Vec<String>,
    channel_dim: Option<ChannelDim>,
}

impl EnsureChannelFirstd {
    /// Creates the transform for `keys`, trusting the volume metadata.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: collect_keys(keys),
            channel_dim: None,
        }
    }

    /// Overrides the channel position recorded in the metadata.
    pub fn with_channel_dim(mut self, channel_dim: ChannelDim) -> Self {
        self.channel_dim = Some(channel_dim);
        self
    }
}

impl Transform for EnsureChannelFirstd {
    fn name(&self) -> &'static str {
        "EnsureChannelFirstd"
    }

    fn apply(&self, mut sample: Sample) -> BundleResult<Sample> {
        for key in &self.keys {
            let volume = sample.volume_mut(key)?;
            let channel_dim = self.channel_dim.unwrap_or(volume.meta.channel_dim);
            match channel_dim {
                ChannelDim::NoChannel => {
                    let data = std::mem::take(&mut volume.data);
                    volume.data = data.insert_axis(Axis(0));
                }
                ChannelDim::Axis(0) => {}
                ChannelDim::Axis(axis) => {
                    let ndim = volume.data.ndim();
                    if axis >= ndim {
                        return Err(crate::core::BundleError::invalid_input(format!(
                            "channel axis {axis} is out of range for a {ndim}-dimensional volume"
                        )));
                    }
                    let mut order = vec![axis];
                    order.extend((0..ndim).filter(|&a| a != axis));
                    volume.data = volume
                        .data
                        .view()
                        .permuted_axes(IxDyn(&order))
                        .as_standard_layout()
                        .into_owned();
                }
            }
            volume.meta.channel_dim = ChannelDim::Axis(0);
            trace!(key = %key, shape = ?volume.shape(), "channel first");
        }
        Ok(sample)
    }
}

/// Target range of [`ScaleIntensityd`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleIntensityConfig {
    /// Value the minimum intensity maps to.
    #[serde(default = "ScaleIntensityConfig::default_minv")]
    pub minv: f32,
    /// Value the maximum intensity maps to.
    #[serde(default = "ScaleIntensityConfig::default_maxv")]
    pub maxv: f32,
}

impl ScaleIntensityConfig {
    fn default_minv() -> f32 {
        0.0
    }

    fn default_maxv() -> f32 {
        1.0
    }
}

impl Default for ScaleIntensityConfig {
    fn default() -> Self {
        Self {
            minv: Self::default_minv(),
            maxv: Self::default_maxv(),
        }
    }
}

impl ConfigValidator for ScaleIntensityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.minv.is_finite() || !self.maxv.is_finite() {
            return Err(ConfigError::InvalidConfig {
                message: format!(
                    "intensity range must be finite, got [{}, {}]",
                    self.minv, self.maxv
                ),
            });
        }
        Ok(())
    }
}

/// Min-max rescales each volume into `[minv, maxv]`.
///
/// A constant volume has no range to stretch and is multiplied by `minv`.
#[derive(Debug, Clone)]
pub struct ScaleIntensityd {
    keys: Vec<String>,
    config: ScaleIntensityConfig,
}

impl ScaleIntensityd {
    /// Creates the transform with the default `[0, 1]` range.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: collect_keys(keys),
            config: ScaleIntensityConfig::default(),
        }
    }

    /// Creates the transform with a custom range.
    pub fn with_config<I, S>(keys: I, config: ScaleIntensityConfig) -> BundleResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        config.validate()?;
        Ok(Self {
            keys: collect_keys(keys),
            config,
        })
    }
}

impl Transform for ScaleIntensityd {
    fn name(&self) -> &'static str {
        "ScaleIntensityd"
    }

    fn apply(&self, mut sample: Sample) -> BundleResult<Sample> {
        let ScaleIntensityConfig { minv, maxv } = self.config;
        for key in &self.keys {
            let volume = sample.volume_mut(key)?;
            let (lo, hi) = volume
                .data
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                    (lo.min(v), hi.max(v))
                });
            if volume.data.is_empty() {
                continue;
            }

            if hi - lo == 0.0 {
                map_voxels(&mut volume.data, |v| v * minv);
            } else {
                let range = hi - lo;
                let span = maxv - minv;
                map_voxels(&mut volume.data, |v| (v - lo) / range * span + minv);
            }
            trace!(key = %key, lo, hi, "scaled intensity");
        }
        Ok(sample)
    }
}
