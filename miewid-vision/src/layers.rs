//! Dense building blocks of the embedding network, implemented on ndarray.
//!
//! Every layer exposes `state_dict` / `load_state_dict` against a flat
//! name → tensor map so the whole network serialises to one checkpoint.

use anyhow::Result;
use ndarray::{s, Array1, Array2, Array4, ArrayD, Axis, IxDyn};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::checkpoint::{insert_param, load_param, StateDict};
use crate::error::ModelError;

/// Closed set of parameterised layer kinds; selects the initialisation
/// scheme when the layer is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Hidden linear projection: Kaiming normal over fan-out.
    Linear,
    /// Convolution: Kaiming normal over fan-in.
    Conv,
    /// Batch-norm affine parameters: weight 1, bias 0.
    BatchNorm,
    /// Plain classifier: normal with std 0.001.
    Classifier,
    /// Angular-margin class centres: Xavier uniform.
    MarginHead,
    /// Elastic-margin class centres: normal with std 0.01.
    ElasticHead,
}

impl LayerKind {
    /// Draws an initial weight tensor. Linear shapes are `(out, in)`,
    /// convolution shapes `(out, in, kh, kw)`.
    pub fn init_weight<R: Rng + ?Sized>(self, shape: &[usize], rng: &mut R) -> ArrayD<f32> {
        let fan_out = shape.first().copied().unwrap_or(1).max(1);
        let fan_in = shape.iter().skip(1).product::<usize>().max(1);
        match self {
            LayerKind::Linear => normal(shape, (2.0 / fan_out as f32).sqrt(), rng),
            LayerKind::Conv => normal(shape, (2.0 / fan_in as f32).sqrt(), rng),
            LayerKind::BatchNorm => ArrayD::ones(IxDyn(shape)),
            LayerKind::Classifier => normal(shape, 0.001, rng),
            LayerKind::MarginHead => {
                let bound = (6.0 / (fan_in + fan_out) as f32).sqrt();
                ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.gen_range(-bound..bound))
            }
            LayerKind::ElasticHead => normal(shape, 0.01, rng),
        }
    }
}

fn normal<R: Rng + ?Sized>(shape: &[usize], std: f32, rng: &mut R) -> ArrayD<f32> {
    ArrayD::from_shape_simple_fn(IxDyn(shape), || {
        let z: f32 = rng.sample(StandardNormal);
        z * std
    })
}

fn init_matrix<R: Rng + ?Sized>(kind: LayerKind, rows: usize, cols: usize, rng: &mut R) -> Array2<f32> {
    let w = kind.init_weight(&[rows, cols], rng);
    Array2::from_shape_vec((rows, cols), w.into_raw_vec_and_offset().0)
        .unwrap_or_else(|_| Array2::zeros((rows, cols)))
}

/// Fully connected layer, `y = x · Wᵀ + b`.
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        bias: bool,
        kind: LayerKind,
        rng: &mut R,
    ) -> Self {
        Self {
            weight: init_matrix(kind, out_features, in_features, rng),
            bias: bias.then(|| Array1::zeros(out_features)),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut y = x.dot(&self.weight.t());
        if let Some(bias) = &self.bias {
            y += bias;
        }
        y
    }

    pub fn state_dict(&self, prefix: &str, sd: &mut StateDict) {
        insert_param(sd, &format!("{prefix}.weight"), &self.weight);
        if let Some(bias) = &self.bias {
            insert_param(sd, &format!("{prefix}.bias"), bias);
        }
    }

    pub fn load_state_dict(&mut self, prefix: &str, sd: &StateDict) -> Result<()> {
        self.weight = load_param(sd, &format!("{prefix}.weight"), self.weight.shape())?;
        if let Some(bias) = &self.bias {
            self.bias = Some(load_param(sd, &format!("{prefix}.bias"), bias.shape())?);
        }
        Ok(())
    }
}

/// 1-D batch normalisation with running statistics.
#[derive(Debug, Clone)]
pub struct BatchNorm1d {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
    pub momentum: f32,
    pub eps: f32,
}

impl BatchNorm1d {
    pub fn new(features: usize) -> Self {
        Self {
            weight: Array1::ones(features),
            bias: Array1::zeros(features),
            running_mean: Array1::zeros(features),
            running_var: Array1::ones(features),
            momentum: 0.1,
            eps: 1e-5,
        }
    }

    pub fn features(&self) -> usize {
        self.weight.len()
    }

    /// Normalises with batch statistics while training (and updates the
    /// running estimates), with running statistics otherwise. A training
    /// batch of one sample has no variance and falls back to the running
    /// statistics.
    pub fn forward(&mut self, x: &Array2<f32>, training: bool) -> Array2<f32> {
        let n = x.nrows();
        let (mean, var) = if training && n > 1 {
            let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(x.ncols()));
            let var = x.var_axis(Axis(0), 0.0);
            let unbiased = &var * (n as f32 / (n - 1) as f32);
            self.running_mean = &self.running_mean * (1.0 - self.momentum) + &mean * self.momentum;
            self.running_var = &self.running_var * (1.0 - self.momentum) + &unbiased * self.momentum;
            (mean, var)
        } else {
            (self.running_mean.clone(), self.running_var.clone())
        };
        let scale = &self.weight / &var.mapv(|v| (v + self.eps).sqrt());
        (x - &mean) * &scale + &self.bias
    }

    pub fn state_dict(&self, prefix: &str, sd: &mut StateDict) {
        insert_param(sd, &format!("{prefix}.weight"), &self.weight);
        insert_param(sd, &format!("{prefix}.bias"), &self.bias);
        insert_param(sd, &format!("{prefix}.running_mean"), &self.running_mean);
        insert_param(sd, &format!("{prefix}.running_var"), &self.running_var);
    }

    pub fn load_state_dict(&mut self, prefix: &str, sd: &StateDict) -> Result<()> {
        let shape = [self.features()];
        self.weight = load_param(sd, &format!("{prefix}.weight"), &shape)?;
        self.bias = load_param(sd, &format!("{prefix}.bias"), &shape)?;
        self.running_mean = load_param(sd, &format!("{prefix}.running_mean"), &shape)?;
        self.running_var = load_param(sd, &format!("{prefix}.running_var"), &shape)?;
        Ok(())
    }
}

/// Inverted dropout; identity outside training.
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    pub p: f32,
}

impl Dropout {
    pub fn forward<R: Rng + ?Sized>(&self, x: &Array2<f32>, training: bool, rng: &mut R) -> Array2<f32> {
        if !training || self.p <= 0.0 {
            return x.clone();
        }
        let keep = 1.0 - self.p;
        x.mapv(|v| if rng.gen::<f32>() < keep { v / keep } else { 0.0 })
    }
}

/// Square-kernel 2-D convolution over NCHW tensors.
#[derive(Debug, Clone)]
pub struct Conv2d {
    pub weight: Array4<f32>,
    pub bias: Array1<f32>,
    pub stride: usize,
    pub padding: usize,
}

impl Conv2d {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> Self {
        let shape = [out_channels, in_channels, kernel, kernel];
        let w = LayerKind::Conv.init_weight(&shape, rng);
        Self {
            weight: Array4::from_shape_vec(shape, w.into_raw_vec_and_offset().0)
                .unwrap_or_else(|_| Array4::zeros(shape)),
            bias: Array1::zeros(out_channels),
            stride: stride.max(1),
            padding,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>> {
        let (batch, channels, h, w) = x.dim();
        let (out_c, in_c, k, _) = self.weight.dim();
        if channels != in_c {
            return Err(ModelError::ShapeMismatch {
                name: "conv input".into(),
                expected: vec![batch, in_c, h, w],
                got: x.shape().to_vec(),
            }
            .into());
        }
        let (p, stride) = (self.padding, self.stride);
        if h + 2 * p < k || w + 2 * p < k {
            anyhow::bail!("feature map {h}x{w} smaller than kernel {k}");
        }
        let oh = (h + 2 * p - k) / stride + 1;
        let ow = (w + 2 * p - k) / stride + 1;

        let kernel = self.weight.to_shape((out_c, in_c * k * k))?;
        let mut out = Array4::zeros((batch, out_c, oh, ow));
        let mut cols = Array2::<f32>::zeros((in_c * k * k, oh * ow));

        for n in 0..batch {
            cols.fill(0.0);
            for ci in 0..in_c {
                for ky in 0..k {
                    for kx in 0..k {
                        let row = (ci * k + ky) * k + kx;
                        for oy in 0..oh {
                            let iy = (oy * stride + ky) as isize - p as isize;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for ox in 0..ow {
                                let ix = (ox * stride + kx) as isize - p as isize;
                                if ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                cols[[row, oy * ow + ox]] = x[[n, ci, iy as usize, ix as usize]];
                            }
                        }
                    }
                }
            }
            let mut y = kernel.dot(&cols);
            y += &self.bias.view().insert_axis(Axis(1));
            out.slice_mut(s![n, .., .., ..])
                .assign(&y.to_shape((out_c, oh, ow))?);
        }
        Ok(out)
    }

    pub fn state_dict(&self, prefix: &str, sd: &mut StateDict) {
        insert_param(sd, &format!("{prefix}.weight"), &self.weight);
        insert_param(sd, &format!("{prefix}.bias"), &self.bias);
    }

    pub fn load_state_dict(&mut self, prefix: &str, sd: &StateDict) -> Result<()> {
        self.weight = load_param(sd, &format!("{prefix}.weight"), self.weight.shape())?;
        self.bias = load_param(sd, &format!("{prefix}.bias"), self.bias.shape())?;
        Ok(())
    }
}

pub fn relu_inplace(x: &mut Array4<f32>) {
    x.mapv_inplace(|v| v.max(0.0));
}
