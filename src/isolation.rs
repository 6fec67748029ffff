//! Isolation forest for multivariate outlier detection.
//!
//! Outliers need fewer random axis-aligned cuts to be isolated, so their
//! average path length across the ensemble is short. Scores follow the usual
//! convention shifted by the 0.5 baseline: `0.5 - 2^(-E[h(x)] / c(psi))`.
//! Typical points score near zero and outliers score below it.

use rand::{rngs::StdRng, seq::index, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::stats;

// ---

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IsolationParams {
    pub n_trees: usize,
    /// Subsample size per tree (psi), capped at the number of rows.
    pub max_samples: usize,
    /// Expected fraction of anomalies; sets the decision threshold.
    pub contamination: f64,
    pub seed: u64,
}

impl Default for IsolationParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_samples: 256,
            contamination: 0.1,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
enum INode {
    External {
        size: usize,
    },
    Internal {
        feature: usize,
        split: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone)]
struct ITree {
    nodes: Vec<INode>,
}

impl ITree {
    fn build(data: &[Vec<f64>], rows: &mut [usize], height_limit: usize, rng: &mut StdRng) -> Self {
        // ---
        let mut tree = ITree { nodes: Vec::new() };
        tree.grow(data, rows, 0, height_limit, rng);
        tree
    }

    fn grow(
        &mut self,
        data: &[Vec<f64>],
        rows: &mut [usize],
        depth: usize,
        height_limit: usize,
        rng: &mut StdRng,
    ) -> usize {
        // ---
        let id = self.nodes.len();
        self.nodes.push(INode::External { size: rows.len() });
        if depth >= height_limit || rows.len() <= 1 {
            return id;
        }

        // Only features that still vary inside this node can isolate anything.
        let dims = data[rows[0]].len();
        let spans: Vec<(usize, f64, f64)> = (0..dims)
            .filter_map(|f| {
                let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &r| {
                    (lo.min(data[r][f]), hi.max(data[r][f]))
                });
                (hi > lo).then_some((f, lo, hi))
            })
            .collect();
        if spans.is_empty() {
            return id;
        }

        let (feature, lo, hi) = spans[rng.gen_range(0..spans.len())];
        let split = rng.gen_range(lo..hi);

        let mut boundary = 0;
        for i in 0..rows.len() {
            if data[rows[i]][feature] < split {
                rows.swap(i, boundary);
                boundary += 1;
            }
        }
        let (l, r) = rows.split_at_mut(boundary);
        let left = self.grow(data, l, depth + 1, height_limit, rng);
        let right = self.grow(data, r, depth + 1, height_limit, rng);
        self.nodes[id] = INode::Internal {
            feature,
            split,
            left,
            right,
        };
        id
    }

    fn path_length(&self, row: &[f64]) -> f64 {
        // ---
        let mut id = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[id] {
                INode::External { size } => return depth + average_path_length(*size),
                INode::Internal {
                    feature,
                    split,
                    left,
                    right,
                } => {
                    id = if row[*feature] < *split { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Average path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    // ---
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Debug, Clone)]
pub struct IsolationForest {
    trees: Vec<ITree>,
    dims: usize,
    psi: usize,
    /// Scores strictly below this are anomalies.
    offset: f64,
}

impl IsolationForest {
    pub fn fit(data: &[Vec<f64>], params: IsolationParams) -> Result<Self> {
        // ---
        let Some(first) = data.first() else {
            return Err(PipelineError::InvalidInput(
                "isolation forest needs at least one row".to_string(),
            ));
        };
        let dims = first.len();
        if dims == 0 || data.iter().any(|r| r.len() != dims) {
            return Err(PipelineError::InvalidInput(
                "isolation forest rows must share a non-zero width".to_string(),
            ));
        }

        let psi = params.max_samples.clamp(1, data.len());
        let height_limit = (psi as f64).log2().ceil().max(0.0) as usize;
        let mut rng = StdRng::seed_from_u64(params.seed);

        let trees = (0..params.n_trees.max(1))
            .map(|_| {
                let mut rows = index::sample(&mut rng, data.len(), psi).into_vec();
                ITree::build(data, &mut rows, height_limit, &mut rng)
            })
            .collect();

        let mut forest = Self {
            trees,
            dims,
            psi,
            offset: 0.0,
        };

        let mut train_scores: Vec<f64> = data.iter().map(|r| forest.raw_score(r)).collect();
        train_scores.sort_by(f64::total_cmp);
        let contamination = params.contamination.clamp(f64::EPSILON, 0.5);
        forest.offset = stats::quantile_sorted(&train_scores, contamination);
        Ok(forest)
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Anomaly score; lower is more anomalous.
    pub fn score(&self, row: &[f64]) -> Result<f64> {
        // ---
        if row.len() != self.dims {
            return Err(PipelineError::InvalidInput(format!(
                "expected {} dimensions, got {}",
                self.dims,
                row.len()
            )));
        }
        Ok(self.raw_score(row))
    }

    /// `(is_anomaly, score)` for one row.
    pub fn detect(&self, row: &[f64]) -> Result<(bool, f64)> {
        // ---
        let score = self.score(row)?;
        Ok((score < self.offset, score))
    }

    fn raw_score(&self, row: &[f64]) -> f64 {
        // ---
        let mean_path = self.trees.iter().map(|t| t.path_length(row)).sum::<f64>()
            / self.trees.len() as f64;
        let c = average_path_length(self.psi);
        if c <= 0.0 {
            return 0.0;
        }
        0.5 - 2f64.powf(-mean_path / c)
    }
}
