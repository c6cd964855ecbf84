//! Distance-to-score conversion and identity-level score aggregation.

use std::collections::HashMap;

use anyhow::Result;
use miewid_vision::{compute_distance_matrix, Metric};
use ndarray::{ArrayView1, ArrayView2};

use crate::annotation::Aid;

/// Closest distance from a query to any annotation of one identity.
#[derive(Debug, Clone, PartialEq)]
pub struct NameDistance {
    pub label: String,
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairScore {
    pub qaid: Aid,
    pub daid: Aid,
    pub score: f64,
}

/// Maps a cosine distance in `[0, 2]` to a similarity in `[0, 1]`.
pub fn distance_to_score(distance: f32) -> f64 {
    (2.0 - distance as f64) / 2.0
}

/// Ranks database rows by cosine distance to `query` and keeps the closest
/// annotation of each identity, nearest first. At most `n_results`
/// identities are returned.
pub fn pred_light(
    query: ArrayView1<f32>,
    db: ArrayView2<f32>,
    db_labels: &[String],
    n_results: usize,
) -> Result<Vec<NameDistance>> {
    if db.nrows() != db_labels.len() {
        anyhow::bail!("{} database embeddings for {} labels", db.nrows(), db_labels.len());
    }
    let distmat = compute_distance_matrix(query.insert_axis(ndarray::Axis(0)), db, Metric::Cosine)?;
    let distances = distmat.row(0);

    let mut order: Vec<usize> = (0..distances.len()).collect();
    order.sort_by(|&a, &b| distances[a].total_cmp(&distances[b]));

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for idx in order {
        if out.len() >= n_results {
            break;
        }
        let label = &db_labels[idx];
        if seen.insert(label.as_str()) {
            out.push(NameDistance {
                label: label.clone(),
                distance: distances[idx],
            });
        }
    }
    Ok(out)
}

pub fn name_scores_from_distances(distances: &[NameDistance]) -> HashMap<String, f64> {
    distances
        .iter()
        .map(|d| (d.label.clone(), distance_to_score(d.distance)))
        .collect()
}

/// Spreads each identity's score evenly over that identity's database
/// annotations, so the scores of one identity sum to its name score.
/// Identities without a score get 0.
pub fn aid_scores_from_name_scores(name_scores: &HashMap<String, f64>, db_labels: &[String]) -> Vec<f64> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for label in db_labels {
        *counts.entry(label.as_str()).or_default() += 1;
    }
    db_labels
        .iter()
        .map(|label| match name_scores.get(label) {
            Some(score) => score / counts[label.as_str()] as f64,
            None => 0.0,
        })
        .collect()
}

/// Highest-scoring candidate; ties keep the first.
pub fn best_score(scores: &[PairScore]) -> Option<PairScore> {
    scores.iter().copied().fold(None, |acc, s| match acc {
        Some(best) if best.score >= s.score => Some(best),
        _ => Some(s),
    })
}
