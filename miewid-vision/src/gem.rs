//! Generalized-mean pooling. `p = 1` is average pooling; large `p` approaches
//! max pooling.

use anyhow::Result;
use ndarray::{array, s, Array1, Array2, Array4};

use crate::checkpoint::{insert_param, load_param, StateDict};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gem {
    pub p: f32,
    pub eps: f32,
}

impl Default for Gem {
    fn default() -> Self {
        Self { p: 3.0, eps: 1e-6 }
    }
}

impl Gem {
    /// Pools an NCHW feature map to `(N, C)`. Activations are floored at
    /// `eps` before the power so zero or negative inputs stay finite.
    pub fn forward(&self, x: &Array4<f32>) -> Result<Array2<f32>> {
        let (batch, channels, h, w) = x.dim();
        if h * w == 0 {
            anyhow::bail!("GeM pooling over an empty {h}x{w} feature map");
        }
        let area = (h * w) as f32;
        let inv_p = 1.0 / self.p;
        Ok(Array2::from_shape_fn((batch, channels), |(n, c)| {
            let sum: f32 = x
                .slice(s![n, c, .., ..])
                .iter()
                .map(|&v| v.max(self.eps).powf(self.p))
                .sum();
            (sum / area).powf(inv_p)
        }))
    }

    pub fn state_dict(&self, prefix: &str, sd: &mut StateDict) {
        insert_param(sd, &format!("{prefix}.p"), &array![self.p]);
    }

    pub fn load_state_dict(&mut self, prefix: &str, sd: &StateDict) -> Result<()> {
        let p: Array1<f32> = load_param(sd, &format!("{prefix}.p"), &[1])?;
        let p = p[0];
        if !p.is_finite() || p <= 0.0 {
            anyhow::bail!("invalid GeM exponent {p}");
        }
        self.p = p;
        Ok(())
    }
}
