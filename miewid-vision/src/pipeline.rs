use anyhow::{Context, Result};
use log::debug;
use ndarray::{concatenate, Array2, Array3, ArrayView2, Axis};
use rayon::prelude::*;

use crate::net::MiewIdNet;
use crate::preprocess::{stack_batch, ImageInput, Preprocess};

/// Batched inference: load → preprocess → network → embeddings.
pub struct Pipeline {
    pub net: MiewIdNet,
    pub preprocess: Preprocess,
    pub batch_size: usize,
    /// Decode and transform each batch's images on the rayon pool.
    pub multithread: bool,
}

impl Pipeline {
    pub fn new(mut net: MiewIdNet, preprocess: Preprocess, batch_size: usize, multithread: bool) -> Self {
        net.eval();
        Self {
            net,
            preprocess,
            batch_size: batch_size.max(1),
            multithread,
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.net.embedding_dim()
    }

    /// Changes whenever the weights or the test transform change.
    pub fn fingerprint(&self) -> Result<String> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.net.fingerprint()?.as_bytes());
        hasher.update(format!("{:?}", self.preprocess).as_bytes());
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// One embedding row per input, in input order.
    pub fn embed(&mut self, inputs: &[ImageInput]) -> Result<Array2<f32>> {
        let mut chunks = Vec::with_capacity(inputs.len().div_ceil(self.batch_size));
        for (i, batch) in inputs.chunks(self.batch_size).enumerate() {
            let tensors = load_batch(&self.preprocess, batch, self.multithread)?;
            let images = stack_batch(&tensors)?;
            debug!("embedding batch {} ({} images)", i, batch.len());
            chunks.push(self.net.extract_feat(&images).context("forward pass")?);
        }
        self.join(chunks)
    }

    fn join(&self, chunks: Vec<Array2<f32>>) -> Result<Array2<f32>> {
        if chunks.is_empty() {
            return Ok(Array2::zeros((0, self.embedding_dim())));
        }
        let views: Vec<ArrayView2<f32>> = chunks.iter().map(|c| c.view()).collect();
        Ok(concatenate(Axis(0), &views)?)
    }
}

fn load_batch(pre: &Preprocess, batch: &[ImageInput], parallel: bool) -> Result<Vec<Array3<f32>>> {
    if parallel {
        batch.par_iter().map(|input| pre.load(input)).collect()
    } else {
        batch.iter().map(|input| pre.load(input)).collect()
    }
}
