//! Pairwise distances between embedding rows.

use anyhow::Result;
use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

const NORM_EPS: f32 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// `1 − cos`, in `[0, 2]`.
    #[default]
    Cosine,
    /// Squared euclidean distance.
    Euclidean,
}

/// Scales every row to unit L2 norm; all-zero rows stay zero.
pub fn l2_normalize_rows(x: ArrayView2<f32>) -> Array2<f32> {
    let norms = x
        .map_axis(Axis(1), |row| row.dot(&row).sqrt().max(NORM_EPS))
        .insert_axis(Axis(1));
    &x / &norms
}

/// Pairwise distances between the rows of `a` (queries) and `b`
/// (database), shape `(|a|, |b|)`.
pub fn compute_distance_matrix(
    a: ArrayView2<f32>,
    b: ArrayView2<f32>,
    metric: Metric,
) -> Result<Array2<f32>> {
    if a.nrows() == 0 || b.nrows() == 0 {
        return Ok(Array2::zeros((a.nrows(), b.nrows())));
    }
    if a.ncols() != b.ncols() {
        anyhow::bail!(
            "embedding width mismatch: {} vs {}",
            a.ncols(),
            b.ncols()
        );
    }
    let distmat = match metric {
        Metric::Cosine => {
            let an = l2_normalize_rows(a);
            let bn = l2_normalize_rows(b);
            an.dot(&bn.t()).mapv(|sim| 1.0 - sim)
        }
        Metric::Euclidean => {
            let a_sq = a.map_axis(Axis(1), |r| r.dot(&r)).insert_axis(Axis(1));
            let b_sq = b.map_axis(Axis(1), |r| r.dot(&r)).insert_axis(Axis(0));
            let mut d = a.dot(&b.t()) * -2.0;
            d += &a_sq;
            d += &b_sq;
            d.mapv(|v| v.max(0.0))
        }
    };
    Ok(distmat)
}
