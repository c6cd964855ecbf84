//! Host-facing entry points: cached embeddings, pairwise scores and
//! one-vs-all evaluation over an annotation set.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};
use miewid_vision::{
    compute_distance_matrix, preprocess::stack_batch, Backbone, Checkpoint, ConvStem, Metric,
    MiewIdNet, OnnxBackbone, Pipeline,
};
use ndarray::Array2;
use rand::{rngs::StdRng, SeedableRng};

use crate::annotation::{subset_with_resights_range, Aid, Annotation, AnnotationSet};
use crate::cache::EmbeddingCache;
use crate::config::{Config, CONV_STEM};
use crate::eval::{accuracy_at_k, eval_onevsall, RankReport};
use crate::matcher::{
    aid_scores_from_name_scores, distance_to_score, name_scores_from_distances, pred_light,
    NameDistance, PairScore,
};
use crate::storage;

/// Cap on the cumulative match curve computed by [`Identifier::evaluate_distmat`].
pub const DEFAULT_MAX_RANK: usize = 50;

/// Turns annotations into embedding rows, one per annotation, in order.
pub trait Embedder {
    fn embed_annotations(&mut self, annotations: &[&Annotation]) -> Result<Array2<f32>>;
}

impl Embedder for Pipeline {
    fn embed_annotations(&mut self, annotations: &[&Annotation]) -> Result<Array2<f32>> {
        let inputs: Vec<_> = annotations.iter().map(|a| a.image_input()).collect();
        self.embed(&inputs)
    }
}

/// Builds the network described by `cfg` and loads `checkpoint` into it.
pub fn build_pipeline(cfg: &Config, checkpoint: Option<&Checkpoint>) -> Result<Pipeline> {
    let params = &cfg.model_params;
    let mut rng = StdRng::seed_from_u64(cfg.engine.seed);
    let backbone: Box<dyn Backbone> = if params.model_name == CONV_STEM {
        Box::new(ConvStem::new(3, &params.stem_channels, &mut rng)?)
    } else {
        let path = params
            .backbone_path
            .as_deref()
            .with_context(|| format!("backbone {} needs backbone_path", params.model_name))?;
        Box::new(OnnxBackbone::open(path, &cfg.engine.device, params.backbone_features)?)
    };
    let mut net = MiewIdNet::new(backbone, &params.net_config(cfg.engine.seed))?;
    match checkpoint {
        Some(ckpt) => net.load_checkpoint(ckpt).context("loading checkpoint")?,
        None => warn!("no checkpoint given, using freshly initialised weights"),
    }
    Ok(Pipeline::new(
        net,
        cfg.preprocess(),
        cfg.test.batch_size,
        cfg.test.multithread,
    ))
}

pub struct Identifier<E> {
    annotations: AnnotationSet,
    embedder: E,
    cache: EmbeddingCache,
}

impl Identifier<Pipeline> {
    /// Loads config-described weights from `checkpoint_path` (if any) and
    /// wraps them with an empty cache tagged by the pipeline fingerprint.
    pub fn from_config(cfg: &Config, annotations: AnnotationSet, checkpoint_path: Option<&Path>) -> Result<Self> {
        let checkpoint = checkpoint_path.map(Checkpoint::load).transpose()?;
        let pipeline = build_pipeline(cfg, checkpoint.as_ref())?;
        let tag = pipeline.fingerprint()?;
        Ok(Self::new(annotations, pipeline, EmbeddingCache::new(tag)))
    }

    /// Swaps in new weights. Cached embeddings from the old weights are
    /// dropped. A checkpoint that does not fit leaves weights and cache as
    /// they were.
    pub fn reload_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        self.embedder.net.load_checkpoint(checkpoint)?;
        let tag = self.embedder.fingerprint()?;
        self.cache.retag(&tag);
        Ok(())
    }

    /// Margin-head cross-entropy of the current weights on `aids`, with class
    /// ids assigned over every identity in the annotation set.
    ///
    /// Runs a training-mode forward pass, which moves the batch-norm running
    /// statistics, so cached embeddings are dropped.
    pub fn training_loss(&mut self, aids: &[Aid]) -> Result<f32> {
        let classes = self.annotations.name_to_class();
        if classes.len() != self.embedder.net.n_classes() {
            warn!(
                "annotation set has {} identities, head was built for {}",
                classes.len(),
                self.embedder.net.n_classes()
            );
        }
        let annots = self.annotations.lookup(aids)?;
        let labels = annots
            .iter()
            .map(|a| {
                let label = a.db_label();
                classes
                    .get(&label)
                    .copied()
                    .with_context(|| format!("no class for {label}"))
            })
            .collect::<Result<Vec<usize>>>()?;
        let tensors = annots
            .iter()
            .map(|a| self.embedder.preprocess.load(&a.image_input()))
            .collect::<Result<Vec<_>>>()?;
        let images = stack_batch(&tensors)?;
        let loss = self.embedder.net.loss(&images, &labels);
        self.cache.clear();
        let tag = self.embedder.fingerprint()?;
        self.cache.retag(&tag);
        loss
    }
}

impl<E: Embedder> Identifier<E> {
    pub fn new(annotations: AnnotationSet, embedder: E, cache: EmbeddingCache) -> Self {
        Self {
            annotations,
            embedder,
            cache,
        }
    }

    /// Preloads the cache with stored embeddings of this annotation set.
    pub fn restore_store(&mut self, dir: &Path) -> Result<usize> {
        storage::restore_cache(dir, &mut self.cache, &self.annotations)
    }

    pub fn persist_store(&self, dir: &Path) -> Result<()> {
        storage::persist_cache(dir, &self.cache, &self.annotations)
    }

    pub fn annotations(&self) -> &AnnotationSet {
        &self.annotations
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut EmbeddingCache {
        &mut self.cache
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    /// One embedding row per aid; only uncached aids reach the model, in a
    /// single call.
    pub fn embeddings(&mut self, aids: &[Aid]) -> Result<Array2<f32>> {
        let Self {
            annotations,
            embedder,
            cache,
        } = self;
        cache.get_or_compute(aids, |dirty| {
            let annots = annotations.lookup(dirty)?;
            embedder.embed_annotations(&annots)
        })
    }

    /// Closest distance per identity from `qaid` to `daids`, nearest first.
    pub fn predict_light(&mut self, qaid: Aid, daids: &[Aid], n_results: usize) -> Result<Vec<NameDistance>> {
        let db_labels = self.annotations.db_labels(daids)?;
        let db = self.embeddings(daids)?;
        let query = self.embeddings(&[qaid])?;
        pred_light(query.row(0), db.view(), &db_labels, n_results)
    }

    /// Cosine distance from `qaid` to each of `daids`, which must be unique.
    pub fn predict_light_distance(&mut self, qaid: Aid, daids: &[Aid]) -> Result<Vec<f32>> {
        let unique: HashSet<Aid> = daids.iter().copied().collect();
        if unique.len() != daids.len() {
            anyhow::bail!("database annotation ids must be unique");
        }
        let db = self.embeddings(daids)?;
        let query = self.embeddings(&[qaid])?;
        let distmat = compute_distance_matrix(query.view(), db.view(), Metric::Cosine)?;
        Ok(distmat.row(0).to_vec())
    }

    /// Scores every `(qaid_list[i], daid_list[i])` pair.
    ///
    /// With `use_knn`, each query's identities are ranked by their closest
    /// annotation (the query itself excluded) and each identity's score is
    /// split across its database annotations. Otherwise every pair is scored
    /// from its own distance. A pair of an annotation with itself scores 0.
    pub fn score_pairs(&mut self, qaid_list: &[Aid], daid_list: &[Aid], use_knn: bool) -> Result<Vec<PairScore>> {
        if qaid_list.len() != daid_list.len() {
            anyhow::bail!(
                "{} query ids for {} database ids",
                qaid_list.len(),
                daid_list.len()
            );
        }
        let qaids = unique_in_order(qaid_list);
        let daids = unique_in_order(daid_list);

        let mut table: HashMap<Aid, HashMap<Aid, f64>> = HashMap::new();
        for &qaid in &qaids {
            let scores: HashMap<Aid, f64> = if use_knn {
                let others: Vec<Aid> = daids.iter().copied().filter(|&d| d != qaid).collect();
                let name_dists = self.predict_light(qaid, &others, others.len())?;
                let name_scores = name_scores_from_distances(&name_dists);
                let labels = self.annotations.db_labels(&others)?;
                others
                    .into_iter()
                    .zip(aid_scores_from_name_scores(&name_scores, &labels))
                    .collect()
            } else {
                let distances = self.predict_light_distance(qaid, &daids)?;
                daids
                    .iter()
                    .copied()
                    .zip(distances.into_iter().map(distance_to_score))
                    .collect()
            };
            table.insert(qaid, scores);
        }

        Ok(qaid_list
            .iter()
            .zip(daid_list)
            .map(|(&qaid, &daid)| {
                let score = if qaid == daid {
                    0.0
                } else {
                    table
                        .get(&qaid)
                        .and_then(|s| s.get(&daid))
                        .copied()
                        .unwrap_or(0.0)
                };
                PairScore { qaid, daid, score }
            })
            .collect())
    }

    /// One-vs-all evaluation of `aids` against each other. Logs mAP and the
    /// requested Rank-k accuracies.
    pub fn evaluate_distmat(&mut self, aids: &[Aid], ranks: &[usize]) -> Result<Option<RankReport>> {
        let embs = self.embeddings(aids)?;
        info!("computing distance matrix ...");
        let distmat = compute_distance_matrix(embs.view(), embs.view(), Metric::Cosine)?;
        info!("computing ranks ...");
        let labels = self.annotations.db_labels(aids)?;
        let Some(report) = eval_onevsall(distmat.view(), &labels, DEFAULT_MAX_RANK) else {
            warn!("no annotation has another sighting of its identity, nothing to evaluate");
            return Ok(None);
        };
        info!("** Results **");
        info!("mAP: {:.1}%", report.map * 100.0);
        for &r in ranks {
            info!("Rank-{:<3}: {:.1}%", r, report.rank(r) * 100.0);
        }
        Ok(Some(report))
    }

    /// 1-based rank of `qaid`'s identity among the identities of the other
    /// `daids`, `None` if it is not among them.
    pub fn query_rank(&mut self, qaid: Aid, daids: &[Aid]) -> Result<Option<usize>> {
        let others: Vec<Aid> = daids.iter().copied().filter(|&d| d != qaid).collect();
        let ans = self.predict_light(qaid, &others, others.len())?;
        let truth = self
            .annotations
            .get(qaid)
            .with_context(|| format!("unknown annotation {qaid}"))?
            .db_label();
        Ok(ans.iter().position(|d| d.label == truth).map(|i| i + 1))
    }

    pub fn mass_accuracy(&mut self, aids: &[Aid], daids: Option<&[Aid]>) -> Result<Vec<Option<usize>>> {
        let daids = daids.unwrap_or(aids).to_vec();
        aids.iter().map(|&aid| self.query_rank(aid, &daids)).collect()
    }

    /// Accuracy-at-k over identities seen between `min_sights` and
    /// `max_sights` times (larger identities are subsampled).
    pub fn new_accuracy(
        &mut self,
        aids: &[Aid],
        min_sights: usize,
        max_sights: usize,
        seed: u64,
        max_rank: usize,
    ) -> Result<Vec<f32>> {
        let subset = subset_with_resights_range(&self.annotations, aids, min_sights, max_sights, seed)?;
        let ranks = self.mass_accuracy(&subset, None)?;
        let accuracy = accuracy_at_k(&ranks, max_rank);
        info!(
            "accuracy at k for annotations with {min_sights}-{max_sights} sightings: {accuracy:?}"
        );
        Ok(accuracy)
    }
}

fn unique_in_order(aids: &[Aid]) -> Vec<Aid> {
    let mut seen = HashSet::new();
    aids.iter().copied().filter(|aid| seen.insert(*aid)).collect()
}
