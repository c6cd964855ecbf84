//! Session-scoped memo of per-annotation embeddings.
//!
//! The cache is owned by whoever runs the model and is tagged with the
//! checkpoint fingerprint that produced its entries; swapping the checkpoint
//! goes through [`EmbeddingCache::retag`], which drops stale vectors.

use std::collections::HashMap;

use anyhow::Result;
use log::info;
use ndarray::{Array1, Array2};

use crate::annotation::Aid;

#[derive(Debug, Clone, Default)]
pub struct EmbeddingCache {
    entries: HashMap<Aid, Array1<f32>>,
    model_tag: String,
}

impl EmbeddingCache {
    pub fn new(model_tag: impl Into<String>) -> Self {
        Self {
            entries: HashMap::new(),
            model_tag: model_tag.into(),
        }
    }

    pub fn model_tag(&self) -> &str {
        &self.model_tag
    }

    /// Switches to a new model tag, clearing every entry if it changed.
    pub fn retag(&mut self, model_tag: &str) {
        if self.model_tag != model_tag {
            if !self.entries.is_empty() {
                info!("model changed, dropping {} cached embeddings", self.entries.len());
            }
            self.entries.clear();
            self.model_tag = model_tag.to_string();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, aid: Aid) -> bool {
        self.entries.contains_key(&aid)
    }

    pub fn get(&self, aid: Aid) -> Option<&Array1<f32>> {
        self.entries.get(&aid)
    }

    pub fn insert(&mut self, aid: Aid, embedding: Array1<f32>) {
        self.entries.insert(aid, embedding);
    }

    pub fn evict(&mut self, aid: Aid) -> Option<Array1<f32>> {
        self.entries.remove(&aid)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (Aid, &Array1<f32>)> {
        self.entries.iter().map(|(&aid, emb)| (aid, emb))
    }

    /// Returns one row per id in `aids` order. Every id not yet cached is
    /// passed to `compute` in a single call, which must return one row per
    /// id it was given.
    pub fn get_or_compute<F>(&mut self, aids: &[Aid], compute: F) -> Result<Array2<f32>>
    where
        F: FnOnce(&[Aid]) -> Result<Array2<f32>>,
    {
        let mut dirty: Vec<Aid> = aids.iter().copied().filter(|aid| !self.contains(*aid)).collect();
        dirty.sort_unstable();
        dirty.dedup();

        if !dirty.is_empty() {
            info!("computing {} non-cached embeddings", dirty.len());
            let computed = compute(&dirty)?;
            if computed.nrows() != dirty.len() {
                anyhow::bail!(
                    "embedding batch returned {} rows for {} annotations",
                    computed.nrows(),
                    dirty.len()
                );
            }
            if let Some(width) = self.width() {
                if computed.ncols() != width {
                    anyhow::bail!(
                        "embedding width {} does not match cached width {width}",
                        computed.ncols()
                    );
                }
            }
            for (aid, row) in dirty.iter().zip(computed.rows()) {
                self.entries.insert(*aid, row.to_owned());
            }
        }

        self.gather(aids)
    }

    fn width(&self) -> Option<usize> {
        self.entries.values().next().map(|e| e.len())
    }

    fn gather(&self, aids: &[Aid]) -> Result<Array2<f32>> {
        let width = self.width().unwrap_or(0);
        let mut out = Array2::zeros((aids.len(), width));
        for (mut row, aid) in out.rows_mut().into_iter().zip(aids) {
            let emb = self
                .get(*aid)
                .ok_or_else(|| anyhow::anyhow!("annotation {aid} missing from cache"))?;
            row.assign(emb);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fake_model(calls: &Cell<usize>) -> impl Fn(&[Aid]) -> Result<Array2<f32>> + '_ {
        move |aids| {
            calls.set(calls.get() + 1);
            Ok(Array2::from_shape_fn((aids.len(), 3), |(i, j)| {
                aids[i] as f32 * 10.0 + j as f32
            }))
        }
    }

    #[test]
    fn test_second_call_is_served_from_cache() -> Result<()> {
        let calls = Cell::new(0);
        let mut cache = EmbeddingCache::new("ckpt-a");
        let first = cache.get_or_compute(&[3, 1, 2], fake_model(&calls))?;
        let second = cache.get_or_compute(&[3, 1, 2], fake_model(&calls))?;
        assert_eq!(calls.get(), 1);
        assert_eq!(first, second);
        assert_eq!(first.row(0).to_vec(), vec![30.0, 31.0, 32.0]);
        Ok(())
    }

    #[test]
    fn test_misses_are_batched_once() -> Result<()> {
        let calls = Cell::new(0);
        let mut cache = EmbeddingCache::new("ckpt-a");
        cache.get_or_compute(&[1], fake_model(&calls))?;
        let seen = Cell::new(Vec::new());
        let out = cache.get_or_compute(&[1, 4, 5, 4], |aids| {
            seen.set(aids.to_vec());
            fake_model(&calls)(aids)
        })?;
        assert_eq!(seen.take(), vec![4, 5]);
        assert_eq!(calls.get(), 2);
        assert_eq!(out.nrows(), 4);
        assert_eq!(out.row(1), out.row(3));
        Ok(())
    }

    #[test]
    fn test_bad_batch_inserts_nothing() {
        let mut cache = EmbeddingCache::new("ckpt-a");
        let res = cache.get_or_compute(&[1, 2], |_| Ok(Array2::zeros((1, 3))));
        assert!(res.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evict_clear_and_retag() -> Result<()> {
        let calls = Cell::new(0);
        let mut cache = EmbeddingCache::new("ckpt-a");
        cache.get_or_compute(&[1, 2], fake_model(&calls))?;
        assert!(cache.evict(1).is_some());
        assert!(!cache.contains(1));
        cache.get_or_compute(&[1, 2], fake_model(&calls))?;
        assert_eq!(calls.get(), 2);

        cache.retag("ckpt-a");
        assert_eq!(cache.len(), 2);
        cache.retag("ckpt-b");
        assert!(cache.is_empty());
        assert_eq!(cache.model_tag(), "ckpt-b");

        cache.get_or_compute(&[7], fake_model(&calls))?;
        cache.clear();
        assert!(cache.is_empty());
        Ok(())
    }

    #[test]
    fn test_empty_request() -> Result<()> {
        let mut cache = EmbeddingCache::default();
        let out = cache.get_or_compute(&[], |_| unreachable!())?;
        assert_eq!(out.nrows(), 0);
        Ok(())
    }
}
