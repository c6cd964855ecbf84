//! Feature extractors that feed the pooling layer.

use anyhow::Result;
use ndarray::Array4;
use rand::Rng;

use crate::checkpoint::StateDict;
use crate::layers::{relu_inplace, Conv2d};

/// Convolutional feature extractor producing an NCHW feature map.
pub trait Backbone {
    fn forward(&mut self, images: &Array4<f32>) -> Result<Array4<f32>>;

    /// Channel count of the produced feature map.
    fn out_features(&self) -> usize;

    /// Backbones whose weights live outside the checkpoint keep the defaults.
    fn state_dict(&self, _prefix: &str, _sd: &mut StateDict) {}

    fn load_state_dict(&mut self, _prefix: &str, _sd: &StateDict) -> Result<()> {
        Ok(())
    }

    /// Identity of weights kept outside the state dict, if any.
    fn fingerprint(&self) -> Option<&str> {
        None
    }
}

/// Small native backbone: stacked 3x3 stride-2 convolutions with ReLU.
#[derive(Debug, Clone)]
pub struct ConvStem {
    pub layers: Vec<Conv2d>,
    in_channels: usize,
}

impl ConvStem {
    pub fn new<R: Rng + ?Sized>(in_channels: usize, channels: &[usize], rng: &mut R) -> Result<Self> {
        if channels.is_empty() {
            anyhow::bail!("conv stem needs at least one layer");
        }
        let mut layers = Vec::with_capacity(channels.len());
        let mut prev = in_channels;
        for &c in channels {
            layers.push(Conv2d::new(prev, c, 3, 2, 1, rng));
            prev = c;
        }
        Ok(Self { layers, in_channels })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }
}

impl Backbone for ConvStem {
    fn forward(&mut self, images: &Array4<f32>) -> Result<Array4<f32>> {
        let mut x = images.clone();
        for conv in &self.layers {
            x = conv.forward(&x)?;
            relu_inplace(&mut x);
        }
        Ok(x)
    }

    fn out_features(&self) -> usize {
        self.layers.last().map_or(self.in_channels, Conv2d::out_channels)
    }

    fn state_dict(&self, prefix: &str, sd: &mut StateDict) {
        for (i, conv) in self.layers.iter().enumerate() {
            conv.state_dict(&format!("{prefix}.stem.{i}"), sd);
        }
    }

    fn load_state_dict(&mut self, prefix: &str, sd: &StateDict) -> Result<()> {
        for (i, conv) in self.layers.iter_mut().enumerate() {
            conv.load_state_dict(&format!("{prefix}.stem.{i}"), sd)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_stem_shapes() -> Result<()> {
        let mut stem = ConvStem::new(3, &[4, 8], &mut StdRng::seed_from_u64(0))?;
        let x = Array4::from_elem((2, 3, 16, 12), 0.5f32);
        let y = stem.forward(&x)?;
        assert_eq!(y.dim(), (2, 8, 4, 3));
        assert_eq!(stem.out_features(), 8);
        assert!(y.iter().all(|&v| v >= 0.0));

        let mut sd = StateDict::new();
        stem.state_dict("backbone", &mut sd);
        assert!(sd.contains_key("backbone.stem.1.weight"));
        assert!(ConvStem::new(3, &[], &mut StdRng::seed_from_u64(0)).is_err());
        Ok(())
    }
}
