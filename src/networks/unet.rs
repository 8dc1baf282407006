//! Residual UNet for volumetric segmentation.

use super::Network;
use super::layers::{
    ActType, Conv3d, ConvBlock, ConvKind, ConvTranspose3d, Layer, NormType, ResidualUnit,
    UnitOptions,
};
use medbundle_core::core::config::{ConfigError, ConfigValidator};
use medbundle_core::core::{BundleError, BundleResult, Tensor5D};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Configuration for [`UNet`].
///
/// `channels[i]` is the width of encoder level `i`; the last entry is the
/// bottleneck. `strides[i]` is the downsampling factor entering level `i + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UNetConfig {
    #[serde(default = "UNetConfig::default_spatial_dims")]
    pub spatial_dims: usize,
    #[serde(default = "UNetConfig::default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "UNetConfig::default_out_channels")]
    pub out_channels: usize,
    #[serde(default = "UNetConfig::default_channels")]
    pub channels: Vec<usize>,
    #[serde(default = "UNetConfig::default_strides")]
    pub strides: Vec<usize>,
    #[serde(default = "UNetConfig::default_kernel_size")]
    pub kernel_size: usize,
    #[serde(default = "UNetConfig::default_kernel_size")]
    pub up_kernel_size: usize,
    /// Residual units per level; zero builds plain conv blocks.
    #[serde(default = "UNetConfig::default_num_res_units")]
    pub num_res_units: usize,
    #[serde(default)]
    pub norm: NormType,
    #[serde(default)]
    pub act: ActType,
}

impl UNetConfig {
    fn default_spatial_dims() -> usize {
        3
    }

    fn default_in_channels() -> usize {
        1
    }

    fn default_out_channels() -> usize {
        2
    }

    fn default_channels() -> Vec<usize> {
        vec![2, 2, 4, 8, 4]
    }

    fn default_strides() -> Vec<usize> {
        vec![2, 2, 2, 2]
    }

    fn default_kernel_size() -> usize {
        3
    }

    fn default_num_res_units() -> usize {
        2
    }

    /// Sets the input and output channel counts.
    pub fn with_io_channels(mut self, in_channels: usize, out_channels: usize) -> Self {
        self.in_channels = in_channels;
        self.out_channels = out_channels;
        self
    }

    /// Sets the encoder widths and strides.
    pub fn with_levels(mut self, channels: Vec<usize>, strides: Vec<usize>) -> Self {
        self.channels = channels;
        self.strides = strides;
        self
    }

    /// Sets the number of residual units per level.
    pub fn with_num_res_units(mut self, num_res_units: usize) -> Self {
        self.num_res_units = num_res_units;
        self
    }

    /// Sets the normalization layer.
    pub fn with_norm(mut self, norm: NormType) -> Self {
        self.norm = norm;
        self
    }

    /// Sets the activation.
    pub fn with_act(mut self, act: ActType) -> Self {
        self.act = act;
        self
    }

    /// Total downsampling factor from input to bottleneck.
    pub fn downsample_factor(&self) -> usize {
        self.strides
            .iter()
            .take(self.channels.len().saturating_sub(1))
            .product()
    }
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            spatial_dims: Self::default_spatial_dims(),
            in_channels: Self::default_in_channels(),
            out_channels: Self::default_out_channels(),
            channels: Self::default_channels(),
            strides: Self::default_strides(),
            kernel_size: Self::default_kernel_size(),
            up_kernel_size: Self::default_kernel_size(),
            num_res_units: Self::default_num_res_units(),
            norm: NormType::default(),
            act: ActType::default(),
        }
    }
}

impl ConfigValidator for UNetConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.spatial_dims != 3 {
            return Err(ConfigError::InvalidConfig {
                message: format!("only 3 spatial dims are supported, got {}", self.spatial_dims),
            });
        }
        self.validate_positive_usize(self.in_channels, "in_channels")?;
        self.validate_positive_usize(self.out_channels, "out_channels")?;
        if self.channels.len() < 2 {
            return Err(ConfigError::InvalidConfig {
                message: "channels must list at least 2 levels".to_string(),
            });
        }
        if self.strides.len() < self.channels.len() - 1 {
            return Err(ConfigError::InvalidConfig {
                message: format!(
                    "{} channel levels need at least {} strides, got {}",
                    self.channels.len(),
                    self.channels.len() - 1,
                    self.strides.len()
                ),
            });
        }
        for &c in &self.channels {
            self.validate_positive_usize(c, "channels")?;
        }
        for &s in &self.strides {
            self.validate_positive_usize(s, "strides")?;
        }
        for (kernel, field) in [
            (self.kernel_size, "kernel_size"),
            (self.up_kernel_size, "up_kernel_size"),
        ] {
            if kernel % 2 == 0 {
                return Err(ConfigError::InvalidConfig {
                    message: format!("{field} must be odd, got {kernel}"),
                });
            }
        }
        Ok(())
    }
}

/// An encoder/decoder network with skip connections at every level.
///
/// Each level downsamples with a (residual) conv block, recurses into the
/// next level, concatenates the recursion's output with its own input and
/// upsamples with a transposed convolution. Spatial sizes must be divisible
/// by the product of the strides.
#[derive(Debug, Clone)]
pub struct UNet {
    config: UNetConfig,
    model: Layer,
}

impl UNet {
    /// Builds a UNet with weights drawn from `rng`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` does not validate.
    pub fn new<R: Rng + ?Sized>(config: UNetConfig, rng: &mut R) -> BundleResult<Self> {
        config.validate()?;
        let levels = config.channels.len();
        let model = Self::create_block(
            &config,
            config.in_channels,
            config.out_channels,
            &config.channels,
            &config.strides[..levels - 1],
            true,
            rng,
        );
        let unet = Self { config, model };
        debug!(
            channels = ?unet.config.channels,
            parameters = unet.parameter_count(),
            "built UNet"
        );
        Ok(unet)
    }

    /// The configuration the network was built from.
    pub fn config(&self) -> &UNetConfig {
        &self.config
    }

    /// Number of trainable parameters.
    pub fn parameter_count(&self) -> usize {
        self.model.parameter_count()
    }

    fn create_block<R: Rng + ?Sized>(
        config: &UNetConfig,
        in_channels: usize,
        out_channels: usize,
        channels: &[usize],
        strides: &[usize],
        is_top: bool,
        rng: &mut R,
    ) -> Layer {
        let (c, s) = (channels[0], strides[0]);
        let (sub, up_channels) = if channels.len() > 2 {
            (
                Self::create_block(config, c, c, &channels[1..], &strides[1..], false, rng),
                c * 2,
            )
        } else {
            (Self::down_layer(config, c, channels[1], 1, rng), c + channels[1])
        };
        let down = Self::down_layer(config, in_channels, c, s, rng);
        let up = Self::up_layer(config, up_channels, out_channels, s, is_top, rng);
        Layer::Sequential(vec![down, Layer::Skip(Box::new(sub)), up])
    }

    fn down_layer<R: Rng + ?Sized>(
        config: &UNetConfig,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        rng: &mut R,
    ) -> Layer {
        let kernel = config.kernel_size;
        if config.num_res_units > 0 {
            let options = UnitOptions {
                kernel,
                subunits: config.num_res_units,
                norm: config.norm,
                act: config.act,
                last_conv_only: false,
            };
            Layer::Residual(ResidualUnit::new(in_channels, out_channels, stride, options, rng))
        } else {
            let conv = Conv3d::new(in_channels, out_channels, kernel, stride, kernel / 2, rng);
            Layer::Conv(ConvBlock::new(ConvKind::Conv(conv), config.norm, config.act, false))
        }
    }

    fn up_layer<R: Rng + ?Sized>(
        config: &UNetConfig,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        is_top: bool,
        rng: &mut R,
    ) -> Layer {
        let kernel = config.up_kernel_size;
        let conv = ConvTranspose3d::new(
            in_channels,
            out_channels,
            kernel,
            stride,
            kernel / 2,
            stride - 1,
            rng,
        );
        let conv_only = is_top && config.num_res_units == 0;
        let up = Layer::Conv(ConvBlock::new(
            ConvKind::Transposed(conv),
            config.norm,
            config.act,
            conv_only,
        ));
        if config.num_res_units == 0 {
            return up;
        }
        let options = UnitOptions {
            kernel: config.kernel_size,
            subunits: 1,
            norm: config.norm,
            act: config.act,
            last_conv_only: is_top,
        };
        let unit = ResidualUnit::new(out_channels, out_channels, 1, options, rng);
        Layer::Sequential(vec![up, Layer::Residual(unit)])
    }
}

impl Network for UNet {
    fn name(&self) -> &str {
        "UNet"
    }

    fn in_channels(&self) -> usize {
        self.config.in_channels
    }

    fn out_channels(&self) -> usize {
        self.config.out_channels
    }

    fn validate_input(&self, input: &Tensor5D) -> BundleResult<()> {
        let channels = input.shape()[1];
        if channels != self.config.in_channels {
            return Err(BundleError::invalid_input(format!(
                "UNet expects {} input channels, got {}",
                self.config.in_channels, channels
            )));
        }
        let factor = self.config.downsample_factor();
        let spatial = &input.shape()[2..];
        if spatial.iter().any(|&d| d % factor != 0) {
            return Err(BundleError::invalid_input(format!(
                "UNet spatial size {spatial:?} must be divisible by {factor}"
            )));
        }
        Ok(())
    }

    fn forward(&self, input: &Tensor5D) -> BundleResult<Tensor5D> {
        self.validate_input(input)?;
        self.model.forward(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array5;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn input(shape: (usize, usize, usize, usize, usize)) -> Tensor5D {
        Array5::from_shape_fn(shape, |(_, _, x, y, z)| ((x + y + z) % 5) as f32 / 5.0)
    }

    #[test]
    fn default_config_is_the_small_segmentation_net() {
        let config = UNetConfig::default();
        assert_eq!(config.channels, vec![2, 2, 4, 8, 4]);
        assert_eq!(config.strides, vec![2, 2, 2, 2]);
        assert_eq!(config.num_res_units, 2);
        assert_eq!(config.norm, NormType::Batch);
        assert_eq!(config.downsample_factor(), 16);
    }

    #[test]
    fn config_fills_defaults_from_json() -> Result<(), Box<dyn std::error::Error>> {
        let config: UNetConfig =
            serde_json::from_str(r#"{"out_channels": 3, "norm": "instance"}"#)?;
        assert_eq!(config.out_channels, 3);
        assert_eq!(config.norm, NormType::Instance);
        assert_eq!(config.channels, UNetConfig::default().channels);

        let json = serde_json::to_string(&config)?;
        assert_eq!(serde_json::from_str::<UNetConfig>(&json)?, config);
        Ok(())
    }

    #[test]
    fn rejects_inconsistent_levels() {
        let mut rng = StdRng::seed_from_u64(0);
        let short = UNetConfig::default().with_levels(vec![4, 8, 16], vec![2]);
        assert!(UNet::new(short, &mut rng).is_err());
        let single = UNetConfig::default().with_levels(vec![4], vec![]);
        assert!(UNet::new(single, &mut rng).is_err());
    }

    #[test]
    fn forward_preserves_spatial_shape() -> Result<(), BundleError> {
        let mut rng = StdRng::seed_from_u64(0);
        let unet = UNet::new(UNetConfig::default(), &mut rng)?;
        let y = unet.forward(&input((2, 1, 16, 16, 32)))?;
        assert_eq!(y.shape(), &[2, 2, 16, 16, 32]);
        assert!(y.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn same_seed_gives_same_weights() -> Result<(), BundleError> {
        let x = input((1, 1, 16, 16, 16));
        let a = UNet::new(UNetConfig::default(), &mut StdRng::seed_from_u64(0))?.forward(&x)?;
        let b = UNet::new(UNetConfig::default(), &mut StdRng::seed_from_u64(0))?.forward(&x)?;
        let c = UNet::new(UNetConfig::default(), &mut StdRng::seed_from_u64(1))?.forward(&x)?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        Ok(())
    }

    #[test]
    fn plain_conv_variant_builds_and_runs() -> Result<(), BundleError> {
        let mut rng = StdRng::seed_from_u64(5);
        let config = UNetConfig::default()
            .with_levels(vec![4, 8, 16], vec![2, 2])
            .with_num_res_units(0)
            .with_norm(NormType::Instance)
            .with_act(ActType::Relu)
            .with_io_channels(2, 3);
        let unet = UNet::new(config, &mut rng)?;
        let y = unet.forward(&input((1, 2, 8, 8, 8)))?;
        assert_eq!(y.shape(), &[1, 3, 8, 8, 8]);
        Ok(())
    }

    #[test]
    fn rejects_indivisible_spatial_size() -> Result<(), BundleError> {
        let mut rng = StdRng::seed_from_u64(0);
        let unet = UNet::new(UNetConfig::default(), &mut rng)?;
        assert!(unet.forward(&input((1, 1, 20, 16, 16))).is_err());
        assert!(unet.forward(&input((1, 2, 16, 16, 16))).is_err());
        Ok(())
    }
}
