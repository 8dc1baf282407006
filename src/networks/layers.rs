//! 3D convolution building blocks.
//!
//! All layers operate on `(batch, channels, x, y, z)` tensors. Convolutions
//! are computed one output plane `(batch, out_channel)` at a time, with the
//! planes spread over the rayon thread pool.

use medbundle_core::core::{BundleError, BundleResult, Tensor5D};
use ndarray::{Array1, Array5, Axis, concatenate};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Epsilon added to variances by the normalization layers.
const NORM_EPS: f32 = 1e-5;
/// Initial slope of PReLU for negative inputs.
const PRELU_INIT: f32 = 0.25;

/// Normalization applied after a convolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormType {
    /// Batch normalization with running statistics (evaluation mode).
    #[default]
    Batch,
    /// Per-sample, per-channel normalization without affine parameters.
    Instance,
}

/// Activation applied after normalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActType {
    #[default]
    PRelu,
    Relu,
}

/// Draws weights uniformly from `(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
fn init_weights<R: Rng + ?Sized>(
    rng: &mut R,
    shape: (usize, usize, usize, usize, usize),
    fan_in: usize,
) -> (Array5<f32>, f32) {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    let weight = Array5::from_shape_simple_fn(shape, || rng.gen_range(-bound..bound));
    (weight, bound)
}

fn init_bias<R: Rng + ?Sized>(rng: &mut R, len: usize, bound: f32) -> Array1<f32> {
    Array1::from_shape_simple_fn(len, || rng.gen_range(-bound..bound))
}

fn check_channels(layer: &str, expected: usize, input: &Tensor5D) -> BundleResult<()> {
    let got = input.shape()[1];
    if got != expected {
        return Err(BundleError::invalid_input(format!(
            "{layer} expects {expected} input channels, got {got}"
        )));
    }
    Ok(())
}

/// A strided, zero-padded 3D convolution with a cubic kernel.
#[derive(Debug, Clone)]
pub struct Conv3d {
    /// Weights laid out as `(out, in, kx, ky, kz)`.
    weight: Array5<f32>,
    bias: Array1<f32>,
    stride: usize,
    padding: usize,
}

impl Conv3d {
    /// Creates a randomly initialized convolution.
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> Self {
        let fan_in = in_channels * kernel.pow(3);
        let (weight, bound) = init_weights(
            rng,
            (out_channels, in_channels, kernel, kernel, kernel),
            fan_in,
        );
        let bias = init_bias(rng, out_channels, bound);
        Self {
            weight,
            bias,
            stride,
            padding,
        }
    }

    /// Creates a convolution from explicit parameters.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the kernel is not cubic, the bias
    /// length differs from the output channel count, or the stride is zero.
    pub fn from_parts(
        weight: Array5<f32>,
        bias: Array1<f32>,
        stride: usize,
        padding: usize,
    ) -> BundleResult<Self> {
        let (out_channels, _, kx, ky, kz) = weight.dim();
        if kx != ky || ky != kz {
            return Err(BundleError::config_error(format!(
                "kernel must be cubic, got {kx}x{ky}x{kz}"
            )));
        }
        if bias.len() != out_channels {
            return Err(BundleError::config_error(format!(
                "bias has {} entries for {out_channels} output channels",
                bias.len()
            )));
        }
        if stride == 0 {
            return Err(BundleError::config_error("stride must be at least 1"));
        }
        Ok(Self {
            weight,
            bias,
            stride,
            padding,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_channels(&self) -> usize {
        self.weight.shape()[0]
    }

    fn kernel(&self) -> usize {
        self.weight.shape()[2]
    }

    fn output_len(&self, n: usize) -> BundleResult<usize> {
        let padded = n + 2 * self.padding;
        if padded < self.kernel() {
            return Err(BundleError::invalid_input(format!(
                "spatial size {n} is smaller than kernel {} after padding",
                self.kernel()
            )));
        }
        Ok((padded - self.kernel()) / self.stride + 1)
    }

    /// Number of trainable parameters.
    pub fn parameter_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    pub fn forward(&self, input: &Tensor5D) -> BundleResult<Tensor5D> {
        check_channels("Conv3d", self.in_channels(), input)?;
        let (batch, channels, sx, sy, sz) = input.dim();
        let (ox, oy, oz) = (
            self.output_len(sx)?,
            self.output_len(sy)?,
            self.output_len(sz)?,
        );
        let out_channels = self.out_channels();
        let (k, s, p) = (self.kernel(), self.stride, self.padding as isize);

        let input = input.as_standard_layout();
        let src = input
            .as_slice()
            .ok_or_else(|| BundleError::invalid_input("input is not contiguous"))?;
        let plane = ox * oy * oz;
        let mut out = vec![0f32; batch * out_channels * plane];

        out.par_chunks_mut(plane.max(1))
            .enumerate()
            .for_each(|(idx, dst)| {
                let (b, o) = (idx / out_channels, idx % out_channels);
                dst.fill(self.bias[o]);
                for ic in 0..channels {
                    let base = (b * channels + ic) * sx * sy * sz;
                    for kx in 0..k {
                        for ky in 0..k {
                            for kz in 0..k {
                                let w = self.weight[[o, ic, kx, ky, kz]];
                                for x in 0..ox {
                                    let ix = (x * s + kx) as isize - p;
                                    if ix < 0 || ix >= sx as isize {
                                        continue;
                                    }
                                    for y in 0..oy {
                                        let iy = (y * s + ky) as isize - p;
                                        if iy < 0 || iy >= sy as isize {
                                            continue;
                                        }
                                        let src_row = base + (ix as usize * sy + iy as usize) * sz;
                                        let dst_row = (x * oy + y) * oz;
                                        for z in 0..oz {
                                            let iz = (z * s + kz) as isize - p;
                                            if iz < 0 || iz >= sz as isize {
                                                continue;
                                            }
                                            dst[dst_row + z] += w * src[src_row + iz as usize];
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            });

        Ok(Array5::from_shape_vec((batch, out_channels, ox, oy, oz), out)?)
    }
}

/// A transposed 3D convolution, the upsampling counterpart of [`Conv3d`].
#[derive(Debug, Clone)]
pub struct ConvTranspose3d {
    /// Weights laid out as `(in, out, kx, ky, kz)`.
    weight: Array5<f32>,
    bias: Array1<f32>,
    stride: usize,
    padding: usize,
    output_padding: usize,
}

impl ConvTranspose3d {
    /// Creates a randomly initialized transposed convolution.
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        output_padding: usize,
        rng: &mut R,
    ) -> Self {
        // Fan-in is taken over the output channels, as the weight is stored transposed.
        let fan_in = out_channels * kernel.pow(3);
        let (weight, bound) = init_weights(
            rng,
            (in_channels, out_channels, kernel, kernel, kernel),
            fan_in,
        );
        let bias = init_bias(rng, out_channels, bound);
        Self {
            weight,
            bias,
            stride,
            padding,
            output_padding,
        }
    }

    /// Creates a transposed convolution from explicit parameters.
    pub fn from_parts(
        weight: Array5<f32>,
        bias: Array1<f32>,
        stride: usize,
        padding: usize,
        output_padding: usize,
    ) -> BundleResult<Self> {
        let (_, out_channels, kx, ky, kz) = weight.dim();
        if kx != ky || ky != kz {
            return Err(BundleError::config_error(format!(
                "kernel must be cubic, got {kx}x{ky}x{kz}"
            )));
        }
        if bias.len() != out_channels {
            return Err(BundleError::config_error(format!(
                "bias has {} entries for {out_channels} output channels",
                bias.len()
            )));
        }
        if stride == 0 || output_padding >= stride {
            return Err(BundleError::config_error(format!(
                "invalid stride {stride} / output padding {output_padding}"
            )));
        }
        Ok(Self {
            weight,
            bias,
            stride,
            padding,
            output_padding,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn out_channels(&self) -> usize {
        self.weight.shape()[1]
    }

    fn kernel(&self) -> usize {
        self.weight.shape()[2]
    }

    fn output_len(&self, n: usize) -> BundleResult<usize> {
        let full = n.saturating_sub(1) * self.stride + self.kernel() + self.output_padding;
        if n == 0 || full <= 2 * self.padding {
            return Err(BundleError::invalid_input(format!(
                "spatial size {n} produces an empty transposed convolution output"
            )));
        }
        Ok(full - 2 * self.padding)
    }

    /// Number of trainable parameters.
    pub fn parameter_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    pub fn forward(&self, input: &Tensor5D) -> BundleResult<Tensor5D> {
        check_channels("ConvTranspose3d", self.in_channels(), input)?;
        let (batch, channels, sx, sy, sz) = input.dim();
        let (ox, oy, oz) = (
            self.output_len(sx)?,
            self.output_len(sy)?,
            self.output_len(sz)?,
        );
        let out_channels = self.out_channels();
        let (k, s, p) = (self.kernel(), self.stride, self.padding as isize);

        let input = input.as_standard_layout();
        let src = input
            .as_slice()
            .ok_or_else(|| BundleError::invalid_input("input is not contiguous"))?;
        let plane = ox * oy * oz;
        let mut out = vec![0f32; batch * out_channels * plane];

        // Each input voxel scatters into the plane owned by this task only.
        out.par_chunks_mut(plane.max(1))
            .enumerate()
            .for_each(|(idx, dst)| {
                let (b, o) = (idx / out_channels, idx % out_channels);
                dst.fill(self.bias[o]);
                for ic in 0..channels {
                    let base = (b * channels + ic) * sx * sy * sz;
                    for kx in 0..k {
                        for ky in 0..k {
                            for kz in 0..k {
                                let w = self.weight[[ic, o, kx, ky, kz]];
                                for ix in 0..sx {
                                    let x = (ix * s + kx) as isize - p;
                                    if x < 0 || x >= ox as isize {
                                        continue;
                                    }
                                    for iy in 0..sy {
                                        let y = (iy * s + ky) as isize - p;
                                        if y < 0 || y >= oy as isize {
                                            continue;
                                        }
                                        let src_row = base + (ix * sy + iy) * sz;
                                        let dst_row = (x as usize * oy + y as usize) * oz;
                                        for iz in 0..sz {
                                            let z = (iz * s + kz) as isize - p;
                                            if z < 0 || z >= oz as isize {
                                                continue;
                                            }
                                            dst[dst_row + z as usize] += w * src[src_row + iz];
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            });

        Ok(Array5::from_shape_vec((batch, out_channels, ox, oy, oz), out)?)
    }
}

/// Normalization layers in evaluation mode.
#[derive(Debug, Clone)]
pub enum Norm {
    Batch {
        running_mean: Array1<f32>,
        running_var: Array1<f32>,
        gamma: Array1<f32>,
        beta: Array1<f32>,
    },
    Instance,
}

impl Norm {
    /// Creates a freshly initialized normalization over `channels`.
    pub fn new(kind: NormType, channels: usize) -> Self {
        match kind {
            NormType::Batch => Norm::Batch {
                running_mean: Array1::zeros(channels),
                running_var: Array1::ones(channels),
                gamma: Array1::ones(channels),
                beta: Array1::zeros(channels),
            },
            NormType::Instance => Norm::Instance,
        }
    }

    fn parameter_count(&self) -> usize {
        match self {
            Norm::Batch { gamma, beta, .. } => gamma.len() + beta.len(),
            Norm::Instance => 0,
        }
    }

    pub fn apply(&self, x: &mut Tensor5D) {
        match self {
            Norm::Batch {
                running_mean,
                running_var,
                gamma,
                beta,
            } => {
                for (c, mut channel) in x.axis_iter_mut(Axis(1)).enumerate() {
                    let scale = gamma[c] / (running_var[c] + NORM_EPS).sqrt();
                    let shift = beta[c] - running_mean[c] * scale;
                    channel.mapv_inplace(|v| v * scale + shift);
                }
            }
            Norm::Instance => {
                for mut sample in x.axis_iter_mut(Axis(0)) {
                    for mut channel in sample.axis_iter_mut(Axis(0)) {
                        let mean = channel.mean().unwrap_or(0.0);
                        let var = channel.var(0.0);
                        let inv_std = 1.0 / (var + NORM_EPS).sqrt();
                        channel.mapv_inplace(|v| (v - mean) * inv_std);
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    /// Leaky rectifier with a single learnable negative slope.
    PRelu { slope: f32 },
    Relu,
}

impl Activation {
    pub fn new(kind: ActType) -> Self {
        match kind {
            ActType::PRelu => Activation::PRelu { slope: PRELU_INIT },
            ActType::Relu => Activation::Relu,
        }
    }

    pub fn apply(&self, x: &mut Tensor5D) {
        match *self {
            Activation::PRelu { slope } => {
                x.mapv_inplace(|v| if v >= 0.0 { v } else { slope * v })
            }
            Activation::Relu => x.mapv_inplace(|v| v.max(0.0)),
        }
    }
}

/// The convolution inside a [`ConvBlock`].
#[derive(Debug, Clone)]
pub enum ConvKind {
    Conv(Conv3d),
    Transposed(ConvTranspose3d),
}

impl ConvKind {
    fn forward(&self, x: &Tensor5D) -> BundleResult<Tensor5D> {
        match self {
            ConvKind::Conv(conv) => conv.forward(x),
            ConvKind::Transposed(conv) => conv.forward(x),
        }
    }

    fn parameter_count(&self) -> usize {
        match self {
            ConvKind::Conv(conv) => conv.parameter_count(),
            ConvKind::Transposed(conv) => conv.parameter_count(),
        }
    }
}

/// Convolution followed by normalization and activation.
///
/// With `conv_only` the block is a bare convolution.
#[derive(Debug, Clone)]
pub struct ConvBlock {
    conv: ConvKind,
    norm: Option<Norm>,
    act: Option<Activation>,
}

impl ConvBlock {
    pub fn new(conv: ConvKind, norm: NormType, act: ActType, conv_only: bool) -> Self {
        let channels = match &conv {
            ConvKind::Conv(c) => c.out_channels(),
            ConvKind::Transposed(c) => c.out_channels(),
        };
        if conv_only {
            Self {
                conv,
                norm: None,
                act: None,
            }
        } else {
            Self {
                conv,
                norm: Some(Norm::new(norm, channels)),
                act: Some(Activation::new(act)),
            }
        }
    }

    pub fn forward(&self, x: &Tensor5D) -> BundleResult<Tensor5D> {
        let mut y = self.conv.forward(x)?;
        if let Some(norm) = &self.norm {
            norm.apply(&mut y);
        }
        if let Some(act) = &self.act {
            act.apply(&mut y);
        }
        Ok(y)
    }

    fn parameter_count(&self) -> usize {
        let norm = self.norm.as_ref().map_or(0, Norm::parameter_count);
        let act = usize::from(matches!(self.act, Some(Activation::PRelu { .. })));
        self.conv.parameter_count() + norm + act
    }
}

/// Options shared by the blocks of a [`ResidualUnit`].
#[derive(Debug, Clone, Copy)]
pub struct UnitOptions {
    pub kernel: usize,
    pub subunits: usize,
    pub norm: NormType,
    pub act: ActType,
    /// Leave the last subunit without normalization and activation.
    pub last_conv_only: bool,
}

/// A stack of conv blocks with an additive shortcut.
///
/// Only the first block is strided. The shortcut is the identity when shape
/// is preserved, otherwise a bare convolution that matches it.
#[derive(Debug, Clone)]
pub struct ResidualUnit {
    units: Vec<ConvBlock>,
    residual: Option<Conv3d>,
}

impl ResidualUnit {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        options: UnitOptions,
        rng: &mut R,
    ) -> Self {
        let padding = options.kernel / 2;
        let subunits = options.subunits.max(1);
        let mut units = Vec::with_capacity(subunits);
        let (mut channels, mut unit_stride) = (in_channels, stride);
        for su in 0..subunits {
            let conv_only = options.last_conv_only && su == subunits - 1;
            let conv = Conv3d::new(
                channels,
                out_channels,
                options.kernel,
                unit_stride,
                padding,
                rng,
            );
            units.push(ConvBlock::new(
                ConvKind::Conv(conv),
                options.norm,
                options.act,
                conv_only,
            ));
            channels = out_channels;
            unit_stride = 1;
        }

        let residual = if stride != 1 || in_channels != out_channels {
            let (kernel, padding) = if stride == 1 {
                (1, 0)
            } else {
                (options.kernel, padding)
            };
            Some(Conv3d::new(
                in_channels,
                out_channels,
                kernel,
                stride,
                padding,
                rng,
            ))
        } else {
            None
        };

        Self { units, residual }
    }

    pub fn forward(&self, x: &Tensor5D) -> BundleResult<Tensor5D> {
        let shortcut = match &self.residual {
            Some(conv) => conv.forward(x)?,
            None => x.clone(),
        };
        let mut units = self.units.iter();
        let mut y = match units.next() {
            Some(first) => first.forward(x)?,
            None => x.clone(),
        };
        for unit in units {
            y = unit.forward(&y)?;
        }
        if y.shape() != shortcut.shape() {
            return Err(BundleError::tensor_operation(
                "residual unit",
                BundleError::invalid_input(format!(
                    "branch shape {:?} differs from shortcut {:?}",
                    y.shape(),
                    shortcut.shape()
                )),
            ));
        }
        y += &shortcut;
        Ok(y)
    }

    fn parameter_count(&self) -> usize {
        self.units.iter().map(ConvBlock::parameter_count).sum::<usize>()
            + self.residual.as_ref().map_or(0, Conv3d::parameter_count)
    }
}

/// A node of a network graph.
#[derive(Debug, Clone)]
pub enum Layer {
    Conv(ConvBlock),
    Residual(ResidualUnit),
    Sequential(Vec<Layer>),
    /// Concatenates the input with the wrapped layer's output along channels.
    Skip(Box<Layer>),
}

impl Layer {
    pub fn forward(&self, x: &Tensor5D) -> BundleResult<Tensor5D> {
        match self {
            Layer::Conv(block) => block.forward(x),
            Layer::Residual(unit) => unit.forward(x),
            Layer::Sequential(layers) => {
                let mut layers = layers.iter();
                let Some(first) = layers.next() else {
                    return Ok(x.clone());
                };
                let mut y = first.forward(x)?;
                for layer in layers {
                    y = layer.forward(&y)?;
                }
                Ok(y)
            }
            Layer::Skip(inner) => {
                let y = inner.forward(x)?;
                Ok(concatenate(Axis(1), &[x.view(), y.view()])?)
            }
        }
    }

    /// Number of trainable parameters below this node.
    pub fn parameter_count(&self) -> usize {
        match self {
            Layer::Conv(block) => block.parameter_count(),
            Layer::Residual(unit) => unit.parameter_count(),
            Layer::Sequential(layers) => layers.iter().map(Layer::parameter_count).sum(),
            Layer::Skip(inner) => inner.parameter_count(),
        }
    }
}
