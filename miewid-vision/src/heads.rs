//! Classification heads used only in training mode. Inference never runs one.

use std::f32::consts::PI;

use anyhow::Result;
use ndarray::{Array2, Zip};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{insert_param, load_param, StateDict};
use crate::distance::l2_normalize_rows;
use crate::error::ModelError;
use crate::layers::{LayerKind, Linear};

/// Keeps cosines strictly inside the domain of `acos`.
const COS_EPS: f32 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossModule {
    #[default]
    Arcface,
    ElasticArcface,
    Softmax,
}

impl LossModule {
    pub fn as_str(self) -> &'static str {
        match self {
            LossModule::Arcface => "arcface",
            LossModule::ElasticArcface => "elastic_arcface",
            LossModule::Softmax => "softmax",
        }
    }
}

/// Margin-head hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarginParams {
    /// Logit scale.
    pub s: f32,
    /// Additive angular margin, radians.
    pub margin: f32,
    /// Label smoothing mass spread over all classes.
    pub ls_eps: f32,
    /// Spread of the per-sample margin for the elastic variant.
    pub margin_std: f32,
}

impl Default for MarginParams {
    fn default() -> Self {
        Self {
            s: 30.0,
            margin: 0.5,
            ls_eps: 0.0,
            margin_std: 0.0125,
        }
    }
}

fn cosine_logits(x: &Array2<f32>, weight: &Array2<f32>) -> Array2<f32> {
    let xn = l2_normalize_rows(x.view());
    let wn = l2_normalize_rows(weight.view());
    xn.dot(&wn.t()).mapv(|c| c.clamp(-1.0 + COS_EPS, 1.0 - COS_EPS))
}

/// Additive angular margin (ArcFace).
#[derive(Debug, Clone)]
pub struct ArcMarginProduct {
    /// Class centres, `(n_classes, in_features)`.
    pub weight: Array2<f32>,
    pub s: f32,
    pub margin: f32,
    pub ls_eps: f32,
    pub easy_margin: bool,
}

impl ArcMarginProduct {
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        n_classes: usize,
        params: &MarginParams,
        rng: &mut R,
    ) -> Self {
        let w = LayerKind::MarginHead.init_weight(&[n_classes, in_features], rng);
        Self {
            weight: Array2::from_shape_vec((n_classes, in_features), w.into_raw_vec_and_offset().0)
                .unwrap_or_else(|_| Array2::zeros((n_classes, in_features))),
            s: params.s,
            margin: params.margin,
            ls_eps: params.ls_eps,
            easy_margin: false,
        }
    }

    pub fn forward(&self, x: &Array2<f32>, labels: &[usize]) -> Array2<f32> {
        let n_classes = self.weight.nrows();
        let (cos_m, sin_m) = (self.margin.cos(), self.margin.sin());
        // Beyond θ + m = π, cos(θ + m) stops decreasing; fall back to a linear penalty.
        let th = (PI - self.margin).cos();
        let mm = (PI - self.margin).sin() * self.margin;

        let cosine = cosine_logits(x, &self.weight);
        let mut out = cosine.clone();
        for (row, &label) in labels.iter().enumerate() {
            for class in 0..n_classes {
                let c = cosine[[row, class]];
                let sine = (1.0 - c * c).clamp(0.0, 1.0).sqrt();
                let mut phi = c * cos_m - sine * sin_m;
                phi = if self.easy_margin {
                    if c > 0.0 { phi } else { c }
                } else if c > th {
                    phi
                } else {
                    c - mm
                };
                let hot = if class == label { 1.0 } else { 0.0 };
                let target = (1.0 - self.ls_eps) * hot + self.ls_eps / n_classes as f32;
                out[[row, class]] = (target * phi + (1.0 - target) * c) * self.s;
            }
        }
        out
    }
}

/// ArcFace with a per-sample margin drawn from `Normal(margin, std)`.
#[derive(Debug, Clone)]
pub struct ElasticArcFace {
    pub weight: Array2<f32>,
    pub s: f32,
    pub margin: f32,
    pub std: f32,
}

impl ElasticArcFace {
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        n_classes: usize,
        params: &MarginParams,
        rng: &mut R,
    ) -> Self {
        let w = LayerKind::ElasticHead.init_weight(&[n_classes, in_features], rng);
        Self {
            weight: Array2::from_shape_vec((n_classes, in_features), w.into_raw_vec_and_offset().0)
                .unwrap_or_else(|_| Array2::zeros((n_classes, in_features))),
            s: params.s,
            margin: params.margin,
            std: params.margin_std,
        }
    }

    pub fn forward<R: Rng + ?Sized>(&self, x: &Array2<f32>, labels: &[usize], rng: &mut R) -> Array2<f32> {
        let mut out = cosine_logits(x, &self.weight);
        for (row, &label) in labels.iter().enumerate() {
            let z: f32 = rng.sample(StandardNormal);
            let m = self.margin + self.std * z;
            let theta = out[[row, label]].acos();
            out[[row, label]] = (theta + m).clamp(0.0, PI).cos();
        }
        out * self.s
    }
}

/// Training-time classification head.
#[derive(Debug, Clone)]
pub enum Head {
    Arc(ArcMarginProduct),
    Elastic(ElasticArcFace),
    Softmax(Linear),
}

impl Head {
    pub fn build<R: Rng + ?Sized>(
        loss: LossModule,
        in_features: usize,
        n_classes: usize,
        params: &MarginParams,
        rng: &mut R,
    ) -> Self {
        match loss {
            LossModule::Arcface => Head::Arc(ArcMarginProduct::new(in_features, n_classes, params, rng)),
            LossModule::ElasticArcface => {
                Head::Elastic(ElasticArcFace::new(in_features, n_classes, params, rng))
            }
            LossModule::Softmax => Head::Softmax(Linear::new(
                in_features,
                n_classes,
                true,
                LayerKind::Classifier,
                rng,
            )),
        }
    }

    pub fn n_classes(&self) -> usize {
        match self {
            Head::Arc(h) => h.weight.nrows(),
            Head::Elastic(h) => h.weight.nrows(),
            Head::Softmax(l) => l.out_features(),
        }
    }

    pub fn in_features(&self) -> usize {
        match self {
            Head::Arc(h) => h.weight.ncols(),
            Head::Elastic(h) => h.weight.ncols(),
            Head::Softmax(l) => l.in_features(),
        }
    }

    /// `labels` must already be validated against [`Head::n_classes`].
    pub fn forward<R: Rng + ?Sized>(&self, x: &Array2<f32>, labels: &[usize], rng: &mut R) -> Array2<f32> {
        match self {
            Head::Arc(h) => h.forward(x, labels),
            Head::Elastic(h) => h.forward(x, labels, rng),
            Head::Softmax(l) => l.forward(x),
        }
    }

    pub fn state_dict(&self, prefix: &str, sd: &mut StateDict) {
        match self {
            Head::Arc(h) => insert_param(sd, &format!("{prefix}.weight"), &h.weight),
            Head::Elastic(h) => insert_param(sd, &format!("{prefix}.weight"), &h.weight),
            Head::Softmax(l) => l.state_dict(prefix, sd),
        }
    }

    pub fn load_state_dict(&mut self, prefix: &str, sd: &StateDict) -> Result<()> {
        let key = format!("{prefix}.weight");
        match self {
            Head::Arc(h) => h.weight = load_param(sd, &key, h.weight.shape())?,
            Head::Elastic(h) => h.weight = load_param(sd, &key, h.weight.shape())?,
            Head::Softmax(l) => l.load_state_dict(prefix, sd)?,
        }
        Ok(())
    }
}

pub(crate) fn check_labels(labels: &[usize], batch: usize, n_classes: usize) -> Result<(), ModelError> {
    if labels.len() != batch {
        return Err(ModelError::BatchMismatch {
            images: batch,
            labels: labels.len(),
        });
    }
    match labels.iter().find(|&&l| l >= n_classes) {
        Some(&label) => Err(ModelError::LabelOutOfRange { label, n_classes }),
        None => Ok(()),
    }
}

/// Mean negative log-likelihood of `labels` under softmax(`logits`).
pub fn cross_entropy(logits: &Array2<f32>, labels: &[usize]) -> Result<f32> {
    check_labels(labels, logits.nrows(), logits.ncols())?;
    if labels.is_empty() {
        anyhow::bail!("cross entropy over an empty batch");
    }
    let mut total = 0.0f32;
    Zip::from(logits.rows()).and(labels).for_each(|row, &label| {
        let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let lse = row.mapv(|v| (v - max).exp()).sum().ln() + max;
        total += lse - row[label];
    });
    Ok(total / labels.len() as f32)
}
