//! Sliding-window inference over volumes larger than the network's ROI.

use super::Inferer;
use crate::networks::Network;
use medbundle_core::core::config::{ConfigError, ConfigValidator};
use medbundle_core::core::{BundleError, BundleResult, Tensor5D, stack_volumes};
use ndarray::{Array3, Array4, Array5, ArrayView4, Axis, Zip, s};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Floor applied to Gaussian importance weights so every voxel is counted.
const MIN_IMPORTANCE: f32 = 1e-3;

/// How overlapping window predictions are weighted when blended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    /// Every voxel of a window counts equally.
    #[default]
    Constant,
    /// Voxels near the window centre count more.
    Gaussian,
}

/// Configuration for [`SlidingWindowInferer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowConfig {
    /// Window size per spatial axis; zero uses the full input extent.
    pub roi_size: [usize; 3],
    /// Number of windows sent to the network per forward call.
    #[serde(default = "SlidingWindowConfig::default_sw_batch_size")]
    pub sw_batch_size: usize,
    /// Fraction of a window shared with its neighbour, in `[0, 1)`.
    #[serde(default = "SlidingWindowConfig::default_overlap")]
    pub overlap: f32,
    #[serde(default)]
    pub mode: BlendMode,
    /// Gaussian sigma as a fraction of the window size.
    #[serde(default = "SlidingWindowConfig::default_sigma_scale")]
    pub sigma_scale: f32,
    /// Value used to pad inputs smaller than the window.
    #[serde(default)]
    pub padding_value: f32,
}

impl SlidingWindowConfig {
    fn default_sw_batch_size() -> usize {
        1
    }

    fn default_overlap() -> f32 {
        0.25
    }

    fn default_sigma_scale() -> f32 {
        0.125
    }

    /// Creates a configuration with the given window size and defaults otherwise.
    pub fn new(roi_size: [usize; 3]) -> Self {
        Self {
            roi_size,
            sw_batch_size: Self::default_sw_batch_size(),
            overlap: Self::default_overlap(),
            mode: BlendMode::default(),
            sigma_scale: Self::default_sigma_scale(),
            padding_value: 0.0,
        }
    }

    pub fn with_sw_batch_size(mut self, sw_batch_size: usize) -> Self {
        self.sw_batch_size = sw_batch_size;
        self
    }

    pub fn with_overlap(mut self, overlap: f32) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_mode(mut self, mode: BlendMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_padding_value(mut self, padding_value: f32) -> Self {
        self.padding_value = padding_value;
        self
    }
}

impl ConfigValidator for SlidingWindowConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.validate_batch_size(self.sw_batch_size)?;
        self.validate_f32_range(self.overlap, 0.0, 1.0, true, "overlap")?;
        self.validate_positive_f32(self.sigma_scale, "sigma_scale")?;
        if !self.padding_value.is_finite() {
            return Err(ConfigError::InvalidConfig {
                message: format!("padding_value must be finite, got {}", self.padding_value),
            });
        }
        Ok(())
    }
}

/// Window start offsets along one axis.
///
/// Windows step by `interval`; the last one is shifted back so that it ends
/// exactly at `size`.
fn axis_starts(size: usize, roi: usize, interval: usize) -> Vec<usize> {
    let count = (0..size.div_ceil(interval))
        .find(|d| d * interval + roi >= size)
        .map_or(1, |d| d + 1);
    (0..count)
        .map(|idx| {
            let start = idx * interval;
            start - (start + roi).saturating_sub(size)
        })
        .collect()
}

/// Step between window starts along one axis.
fn scan_interval(size: usize, roi: usize, overlap: f32) -> usize {
    if roi == size {
        roi
    } else {
        ((roi as f32 * (1.0 - overlap)) as usize).max(1)
    }
}

/// Weights applied to each window prediction before blending.
fn importance_map(roi: [usize; 3], mode: BlendMode, sigma_scale: f32) -> Array3<f32> {
    match mode {
        BlendMode::Constant => Array3::ones(roi),
        BlendMode::Gaussian => {
            let profile = |n: usize| -> Vec<f32> {
                let sigma = sigma_scale * n as f32;
                let centre = (n as f32 - 1.0) / 2.0;
                (0..n)
                    .map(|i| {
                        let d = i as f32 - centre;
                        (-(d * d) / (2.0 * sigma * sigma)).exp()
                    })
                    .collect()
            };
            let (px, py, pz) = (profile(roi[0]), profile(roi[1]), profile(roi[2]));
            let mut map = Array3::from_shape_fn(roi, |(x, y, z)| px[x] * py[y] * pz[z]);
            let max = map.fold(0.0f32, |m, &v| m.max(v));
            if max > 0.0 {
                map.mapv_inplace(|v| v / max);
            }
            let floor = map.fold(f32::INFINITY, |m, &v| m.min(v)).max(MIN_IMPORTANCE);
            map.mapv_inplace(|v| v.max(floor));
            map
        }
    }
}

/// Runs a network over overlapping windows and blends the results.
///
/// Inputs smaller than the window are padded symmetrically and the padding
/// is cropped from the output. Windows of all batch items are flattened into
/// one sequence and sent to the network `sw_batch_size` at a time.
#[derive(Debug, Clone)]
pub struct SlidingWindowInferer {
    config: SlidingWindowConfig,
}

impl SlidingWindowInferer {
    /// Creates an inferer.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` does not validate.
    pub fn new(config: SlidingWindowConfig) -> BundleResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SlidingWindowConfig {
        &self.config
    }

    /// Window start corners for a volume of `size` (after padding), last axis fastest.
    pub fn window_starts(&self, size: [usize; 3]) -> Vec<[usize; 3]> {
        let roi = self.effective_roi(size);
        let starts: Vec<Vec<usize>> = (0..3)
            .map(|i| {
                let size = size[i].max(roi[i]);
                axis_starts(size, roi[i], scan_interval(size, roi[i], self.config.overlap))
            })
            .collect();
        let mut windows = Vec::with_capacity(starts.iter().map(Vec::len).product());
        for &x in &starts[0] {
            for &y in &starts[1] {
                for &z in &starts[2] {
                    windows.push([x, y, z]);
                }
            }
        }
        windows
    }

    fn effective_roi(&self, size: [usize; 3]) -> [usize; 3] {
        let mut roi = self.config.roi_size;
        for (r, &s) in roi.iter_mut().zip(size.iter()) {
            if *r == 0 {
                *r = s;
            }
        }
        roi
    }

    fn pad(&self, inputs: &Tensor5D, roi: [usize; 3]) -> (Tensor5D, [usize; 3]) {
        let (batch, channels, sx, sy, sz) = inputs.dim();
        let size = [sx, sy, sz];
        if size.iter().zip(roi.iter()).all(|(s, r)| s >= r) {
            return (inputs.clone(), [0; 3]);
        }
        let mut before = [0; 3];
        let mut padded_size = size;
        for i in 0..3 {
            let diff = roi[i].saturating_sub(size[i]);
            before[i] = diff / 2;
            padded_size[i] = size[i] + diff;
        }
        let mut padded = Array5::from_elem(
            (batch, channels, padded_size[0], padded_size[1], padded_size[2]),
            self.config.padding_value,
        );
        padded
            .slice_mut(s![
                ..,
                ..,
                before[0]..before[0] + sx,
                before[1]..before[1] + sy,
                before[2]..before[2] + sz
            ])
            .assign(inputs);
        (padded, before)
    }
}

impl Inferer for SlidingWindowInferer {
    fn name(&self) -> &'static str {
        "SlidingWindowInferer"
    }

    fn infer(&self, inputs: &Tensor5D, network: &dyn Network) -> BundleResult<Tensor5D> {
        let (batch, _, sx, sy, sz) = inputs.dim();
        if batch == 0 {
            return Err(BundleError::invalid_input("sliding window inference on an empty batch"));
        }
        let original = [sx, sy, sz];
        let roi = self.effective_roi(original);
        let (padded, before) = self.pad(inputs, roi);
        let padded_size = [padded.dim().2, padded.dim().3, padded.dim().4];

        let windows = self.window_starts(padded_size);
        let importance = importance_map(roi, self.config.mode, self.config.sigma_scale);
        let total = windows.len() * batch;
        debug!(
            windows = windows.len(),
            batch,
            sw_batch_size = self.config.sw_batch_size,
            ?roi,
            "sliding window inference"
        );

        let mut output: Option<Array5<f32>> = None;
        let mut count =
            Array4::<f32>::zeros((batch, padded_size[0], padded_size[1], padded_size[2]));

        let slices: Vec<usize> = (0..total).collect();
        for chunk in slices.chunks(self.config.sw_batch_size) {
            let crops: Vec<ArrayView4<'_, f32>> = chunk
                .iter()
                .map(|&g| {
                    let (b, [x, y, z]) = (g / windows.len(), windows[g % windows.len()]);
                    padded.slice(s![b, .., x..x + roi[0], y..y + roi[1], z..z + roi[2]])
                })
                .collect();
            let window_batch = stack_volumes(&crops)?;
            let predictions = network.forward(&window_batch)?;
            trace!(windows = chunk.len(), "window batch done");

            let (_, out_channels, px, py, pz) = predictions.dim();
            if [px, py, pz] != roi {
                return Err(BundleError::inference_error(BundleError::invalid_input(format!(
                    "network changed the window size from {roi:?} to {:?}",
                    [px, py, pz]
                ))));
            }
            let output = output.get_or_insert_with(|| {
                Array5::zeros((batch, out_channels, padded_size[0], padded_size[1], padded_size[2]))
            });

            for (prediction, &g) in predictions.axis_iter(Axis(0)).zip(chunk) {
                let (b, [x, y, z]) = (g / windows.len(), windows[g % windows.len()]);
                let mut region =
                    output.slice_mut(s![b, .., x..x + roi[0], y..y + roi[1], z..z + roi[2]]);
                let channels = prediction.axis_iter(Axis(0));
                for (mut dst, src) in region.axis_iter_mut(Axis(0)).zip(channels) {
                    Zip::from(&mut dst)
                        .and(&src)
                        .and(&importance)
                        .for_each(|d, &p, &w| *d += p * w);
                }
                let mut counts =
                    count.slice_mut(s![b, x..x + roi[0], y..y + roi[1], z..z + roi[2]]);
                counts += &importance;
            }
        }

        let mut output =
            output.ok_or_else(|| BundleError::invalid_input("no windows were produced"))?;
        for (mut sample, counts) in output.axis_iter_mut(Axis(0)).zip(count.axis_iter(Axis(0))) {
            for mut channel in sample.axis_iter_mut(Axis(0)) {
                Zip::from(&mut channel)
                    .and(&counts)
                    .for_each(|v, &c| *v /= c);
            }
        }

        Ok(output
            .slice(s![
                ..,
                ..,
                before[0]..before[0] + sx,
                before[1]..before[1] + sy,
                before[2]..before[2] + sz
            ])
            .to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inferers::test_support::EchoNetwork;
    use std::sync::atomic::Ordering;

    fn ramp(shape: (usize, usize, usize, usize, usize)) -> Tensor5D {
        Array5::from_shape_fn(shape, |(b, _, x, y, z)| (b * 1000 + x * 100 + y * 10 + z) as f32)
    }

    #[test]
    fn axis_starts_cover_the_axis() {
        assert_eq!(axis_starts(10, 4, 3), vec![0, 3, 6]);
        assert_eq!(axis_starts(11, 4, 3), vec![0, 3, 6, 7]);
        assert_eq!(axis_starts(4, 4, 4), vec![0]);
    }

    #[test]
    fn scan_interval_follows_overlap() {
        assert_eq!(scan_interval(128, 64, 0.25), 48);
        assert_eq!(scan_interval(64, 64, 0.25), 64);
        assert_eq!(scan_interval(10, 1, 0.9), 1);
    }

    #[test]
    fn windows_are_ordered_last_axis_fastest() -> Result<(), BundleError> {
        let inferer =
            SlidingWindowInferer::new(SlidingWindowConfig::new([2, 2, 2]).with_overlap(0.0))?;
        let windows = inferer.window_starts([4, 2, 4]);
        assert_eq!(windows, vec![[0, 0, 0], [0, 0, 2], [2, 0, 0], [2, 0, 2]]);
        Ok(())
    }

    #[test]
    fn identity_network_is_reproduced_exactly() -> Result<(), BundleError> {
        let network = EchoNetwork::new(1);
        let config = SlidingWindowConfig::new([4, 4, 4]).with_sw_batch_size(3);
        let inferer = SlidingWindowInferer::new(config)?;
        let x = ramp((2, 1, 9, 7, 5));
        let y = inferer.infer(&x, &network)?;
        assert_eq!(y.shape(), x.shape());
        for (a, b) in y.iter().zip(x.iter()) {
            assert!((a - b).abs() < 1e-3, "{a} != {b}");
        }
        assert!(network.largest_batch.load(Ordering::SeqCst) <= 3);
        Ok(())
    }

    #[test]
    fn gaussian_blending_of_identity_is_identity() -> Result<(), BundleError> {
        let network = EchoNetwork::new(2);
        let config = SlidingWindowConfig::new([4, 4, 4]).with_mode(BlendMode::Gaussian);
        let inferer = SlidingWindowInferer::new(config)?;
        let x = ramp((1, 1, 6, 6, 6));
        let y = inferer.infer(&x, &network)?;
        assert_eq!(y.shape(), &[1, 2, 6, 6, 6]);
        for (a, b) in y.index_axis(Axis(1), 1).iter().zip(x.iter()) {
            assert!((a - b).abs() < 1e-2, "{a} != {b}");
        }
        Ok(())
    }

    #[test]
    fn small_inputs_are_padded_and_cropped() -> Result<(), BundleError> {
        let network = EchoNetwork::new(1);
        let inferer = SlidingWindowInferer::new(SlidingWindowConfig::new([8, 8, 8]))?;
        let x = ramp((1, 1, 3, 5, 8));
        let y = inferer.infer(&x, &network)?;
        assert_eq!(y, x);
        assert_eq!(network.calls(), 1);
        Ok(())
    }

    #[test]
    fn zero_roi_uses_full_extent() -> Result<(), BundleError> {
        let network = EchoNetwork::new(1);
        let inferer =
            SlidingWindowInferer::new(SlidingWindowConfig::new([0, 0, 2]).with_overlap(0.0))?;
        let y = inferer.infer(&ramp((1, 1, 3, 3, 4)), &network)?;
        assert_eq!(y.shape(), &[1, 1, 3, 3, 4]);
        assert_eq!(network.calls(), 2);
        Ok(())
    }

    #[test]
    fn gaussian_map_peaks_at_centre() {
        let map = importance_map([5, 5, 5], BlendMode::Gaussian, 0.125);
        assert_eq!(map[[2, 2, 2]], 1.0);
        assert!(map[[0, 0, 0]] >= MIN_IMPORTANCE);
        assert!(map[[0, 0, 0]] < map[[1, 1, 1]]);
    }

    #[test]
    fn rejects_invalid_config() {
        let config = SlidingWindowConfig::new([4, 4, 4]);
        assert!(SlidingWindowInferer::new(config.clone().with_overlap(1.0)).is_err());
        assert!(SlidingWindowInferer::new(config.with_sw_batch_size(0)).is_err());
    }

    #[test]
    fn config_defaults_from_json() -> Result<(), Box<dyn std::error::Error>> {
        let config: SlidingWindowConfig =
            serde_json::from_str(r#"{"roi_size": [64, 64, 32], "mode": "gaussian"}"#)?;
        assert_eq!(config.sw_batch_size, 1);
        assert_eq!(config.overlap, 0.25);
        assert_eq!(config.mode, BlendMode::Gaussian);
        Ok(())
    }
}
