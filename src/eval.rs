//! One-vs-all retrieval accuracy: cumulative match curve and mAP.

use log::warn;
use ndarray::ArrayView2;

#[derive(Debug, Clone, PartialEq)]
pub struct RankReport {
    /// `cmc[k - 1]` is the fraction of valid queries whose first correct
    /// match is within the top `k`.
    pub cmc: Vec<f32>,
    pub map: f32,
    /// Queries that had at least one other annotation of their identity.
    pub num_valid: usize,
}

impl RankReport {
    /// Accuracy at rank `k` (1-based); ranks past the curve saturate.
    pub fn rank(&self, k: usize) -> f32 {
        if k == 0 || self.cmc.is_empty() {
            return 0.0;
        }
        self.cmc[(k - 1).min(self.cmc.len() - 1)]
    }
}

/// Evaluates a square query-vs-database distance matrix where row `i` and
/// column `i` are the same annotation. Each query's own column is skipped.
/// Queries whose identity has no other annotation cannot be matched and are
/// left out of every average; `None` means no query was valid.
pub fn eval_onevsall<L: PartialEq>(distmat: ArrayView2<f32>, labels: &[L], max_rank: usize) -> Option<RankReport> {
    let (num_q, num_g) = distmat.dim();
    if num_q != labels.len() || num_g != labels.len() {
        warn!(
            "distance matrix {num_q}x{num_g} does not match {} labels",
            labels.len()
        );
        return None;
    }
    let candidates = num_g.saturating_sub(1);
    let max_rank = if max_rank > candidates {
        if candidates > 0 {
            warn!("only {candidates} candidates per query, capping max_rank from {max_rank}");
        }
        candidates
    } else {
        max_rank
    };
    if max_rank == 0 {
        return None;
    }

    let mut cmc_sum = vec![0.0f64; max_rank];
    let mut ap_sum = 0.0f64;
    let mut num_valid = 0usize;

    for q in 0..num_q {
        let row = distmat.row(q);
        let mut order: Vec<usize> = (0..num_g).filter(|&g| g != q).collect();
        order.sort_by(|&a, &b| row[a].total_cmp(&row[b]));
        let matches: Vec<bool> = order.iter().map(|&g| labels[g] == labels[q]).collect();

        let num_rel = matches.iter().filter(|&&m| m).count();
        if num_rel == 0 {
            continue;
        }
        num_valid += 1;

        if let Some(first) = matches.iter().position(|&m| m) {
            for hit in cmc_sum.iter_mut().skip(first) {
                *hit += 1.0;
            }
        }

        let mut hits = 0usize;
        let mut precision_sum = 0.0f64;
        for (i, &m) in matches.iter().enumerate() {
            if m {
                hits += 1;
                precision_sum += hits as f64 / (i + 1) as f64;
            }
        }
        ap_sum += precision_sum / num_rel as f64;
    }

    if num_valid == 0 {
        return None;
    }
    Some(RankReport {
        cmc: cmc_sum.iter().map(|&c| (c / num_valid as f64) as f32).collect(),
        map: (ap_sum / num_valid as f64) as f32,
        num_valid,
    })
}

/// Cumulative fraction of queries answered within each rank. `ranks` holds
/// 1-based ranks, `None` for queries whose identity was not found.
pub fn accuracy_at_k(ranks: &[Option<usize>], max_rank: usize) -> Vec<f32> {
    if ranks.is_empty() {
        return vec![0.0; max_rank];
    }
    let total = ranks.len() as f32;
    (1..=max_rank)
        .map(|k| ranks.iter().filter(|r| matches!(r, Some(r) if *r <= k)).count() as f32 / total)
        .collect()
}
