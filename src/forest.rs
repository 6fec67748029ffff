//! Random forest regressor: bootstrap-aggregated `smartcore` regression trees.
//!
//! Per-tree predictions are exposed so the predictor can derive an interval
//! from the spread of the ensemble instead of a parametric assumption.

use std::fmt;

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::tree::decision_tree_regressor::{
    DecisionTreeRegressor, DecisionTreeRegressorParameters,
};

use crate::error::{PipelineError, Result};

// ---

type Tree = DecisionTreeRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

/// Fixed, documented hyperparameters. Overridable per training request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    /// `None` grows trees until leaves are pure or too small to split.
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub bootstrap: bool,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: Some(20),
            min_samples_split: 2,
            min_samples_leaf: 1,
            bootstrap: true,
            seed: 42,
        }
    }
}

impl ForestParams {
    fn tree_params(&self, seed: u64) -> DecisionTreeRegressorParameters {
        // ---
        DecisionTreeRegressorParameters {
            max_depth: self.max_depth.map(|d| d.min(u16::MAX as usize) as u16),
            min_samples_leaf: self.min_samples_leaf.max(1),
            min_samples_split: self.min_samples_split.max(2),
            seed: Some(seed),
        }
    }
}

fn model_error(e: smartcore::error::Failed) -> PipelineError {
    PipelineError::Model(e.to_string())
}

/// Row-major dense copy of `rows`.
fn to_matrix<'a>(rows: impl ExactSizeIterator<Item = &'a Vec<f64>>, width: usize) -> DenseMatrix<f64> {
    // ---
    let n = rows.len();
    let mut flat = Vec::with_capacity(n * width);
    for row in rows {
        flat.extend_from_slice(row);
    }
    DenseMatrix::new(n, width, flat, false)
}

fn mse(predicted: &[f64], actual: &[f64]) -> f64 {
    // ---
    let sum: f64 = predicted
        .iter()
        .zip(actual)
        .map(|(p, a)| (p - a) * (p - a))
        .sum();
    sum / actual.len() as f64
}

#[derive(Serialize, Deserialize)]
pub struct RandomForest {
    n_features: usize,
    trees: Vec<Tree>,
    feature_importances: Vec<f64>,
}

impl fmt::Debug for RandomForest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RandomForest")
            .field("n_features", &self.n_features)
            .field("n_trees", &self.trees.len())
            .finish_non_exhaustive()
    }
}

impl RandomForest {
    /// Fit on a row-major feature matrix.
    ///
    /// Trees are fit in parallel; tree `k` bootstraps with a generator seeded
    /// with `seed + k`, so results do not depend on thread scheduling.
    pub fn fit(x: &[Vec<f64>], y: &[f64], params: ForestParams) -> Result<Self> {
        // ---
        if x.is_empty() || x.len() != y.len() {
            return Err(PipelineError::InvalidInput(format!(
                "cannot fit forest on {} rows and {} targets",
                x.len(),
                y.len()
            )));
        }
        if params.n_estimators == 0 {
            return Err(PipelineError::InvalidInput(
                "n_estimators must be at least 1".to_string(),
            ));
        }
        let n_features = x[0].len();
        if n_features == 0 || x.iter().any(|r| r.len() != n_features) {
            return Err(PipelineError::InvalidInput(
                "feature rows must share a non-zero width".to_string(),
            ));
        }

        let n = x.len();
        let trees = (0..params.n_estimators)
            .into_par_iter()
            .map(|k| {
                let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(k as u64));
                let samples: Vec<usize> = if params.bootstrap {
                    (0..n).map(|_| rng.gen_range(0..n)).collect()
                } else {
                    (0..n).collect()
                };
                let matrix = to_matrix(samples.iter().map(|&i| &x[i]), n_features);
                let targets: Vec<f64> = samples.iter().map(|&i| y[i]).collect();
                Tree::fit(&matrix, &targets, params.tree_params(rng.gen())).map_err(model_error)
            })
            .collect::<Result<Vec<Tree>>>()?;

        let mut forest = Self {
            n_features,
            trees,
            feature_importances: Vec::new(),
        };
        forest.feature_importances = forest.permutation_importances(x, y, params.seed)?;
        Ok(forest)
    }

    /// Increase in training error when one column is shuffled, normalised to
    /// sum to one. All zeros when no column carries signal.
    fn permutation_importances(&self, x: &[Vec<f64>], y: &[f64], seed: u64) -> Result<Vec<f64>> {
        // ---
        let baseline = mse(&self.predict_batch(x)?, y);
        let mut importances = (0..self.n_features)
            .into_par_iter()
            .map(|j| {
                let mut column: Vec<f64> = x.iter().map(|r| r[j]).collect();
                column.shuffle(&mut StdRng::seed_from_u64(seed.wrapping_add(j as u64)));
                let shuffled: Vec<Vec<f64>> = x
                    .iter()
                    .zip(column)
                    .map(|(row, v)| {
                        let mut row = row.clone();
                        row[j] = v;
                        row
                    })
                    .collect();
                Ok((mse(&self.predict_batch(&shuffled)?, y) - baseline).max(0.0))
            })
            .collect::<Result<Vec<f64>>>()?;

        let total: f64 = importances.iter().sum();
        if total > 0.0 {
            importances.iter_mut().for_each(|v| *v /= total);
        }
        Ok(importances)
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Normalised permutation importances, aligned with the columns.
    pub fn feature_importances(&self) -> &[f64] {
        &self.feature_importances
    }

    /// Every tree's prediction for one row.
    pub fn tree_predictions(&self, row: &[f64]) -> Result<Vec<f64>> {
        // ---
        self.check_width(row)?;
        let matrix = DenseMatrix::new(1, self.n_features, row.to_vec(), false);
        self.trees
            .iter()
            .map(|t| {
                let preds = t.predict(&matrix).map_err(model_error)?;
                preds
                    .first()
                    .copied()
                    .ok_or_else(|| PipelineError::Model("tree returned no prediction".to_string()))
            })
            .collect()
    }

    /// Ensemble mean for one row.
    pub fn predict(&self, row: &[f64]) -> Result<f64> {
        // ---
        let preds = self.tree_predictions(row)?;
        Ok(preds.iter().sum::<f64>() / preds.len() as f64)
    }

    /// Ensemble mean for every row, one tree pass per tree.
    pub fn predict_batch(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>> {
        // ---
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        for row in rows {
            self.check_width(row)?;
        }
        let matrix = to_matrix(rows.iter(), self.n_features);
        let per_tree = self
            .trees
            .par_iter()
            .map(|t| t.predict(&matrix).map_err(model_error))
            .collect::<Result<Vec<Vec<f64>>>>()?;

        let mut sums = vec![0.0; rows.len()];
        for preds in &per_tree {
            for (acc, p) in sums.iter_mut().zip(preds) {
                *acc += p;
            }
        }
        let k = self.trees.len() as f64;
        Ok(sums.into_iter().map(|s| s / k).collect())
    }

    fn check_width(&self, row: &[f64]) -> Result<()> {
        // ---
        if row.len() != self.n_features {
            return Err(PipelineError::InvalidInput(format!(
                "expected {} features, got {}",
                self.n_features,
                row.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn small_params() -> ForestParams {
        ForestParams {
            n_estimators: 20,
            max_depth: Some(8),
            ..ForestParams::default()
        }
    }

    /// y = 3 * x0 with an irrelevant x1.
    fn linear_data(n: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
        // ---
        let x: Vec<Vec<f64>> = (0..n)
            .map(|i| vec![i as f64 / 10.0, ((i * 7919) % 13) as f64])
            .collect();
        let y = x.iter().map(|r| 3.0 * r[0]).collect();
        (x, y)
    }

    #[test]
    fn test_forest_learns_monotonic_signal() {
        // ---
        let (x, y) = linear_data(300);
        let forest = RandomForest::fit(&x, &y, small_params()).unwrap();

        assert_eq!(forest.n_trees(), 20);
        let pred = forest.predict(&[15.0, 3.0]).unwrap();
        assert!((pred - 45.0).abs() < 2.0, "prediction was {pred}");
    }

    #[test]
    fn test_batch_matches_single_row_predictions() {
        // ---
        let (x, y) = linear_data(120);
        let forest = RandomForest::fit(&x, &y, small_params()).unwrap();
        let batch = forest.predict_batch(&x[..10]).unwrap();
        for (row, b) in x[..10].iter().zip(&batch) {
            assert!((forest.predict(row).unwrap() - b).abs() < 1e-9);
        }
        assert!(forest.predict_batch(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_importances_favour_informative_feature() {
        // ---
        let (x, y) = linear_data(300);
        let forest = RandomForest::fit(&x, &y, small_params()).unwrap();
        let imp = forest.feature_importances();

        assert_eq!(imp.len(), 2);
        assert!((imp.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(imp[0] > imp[1]);
    }

    #[test]
    fn test_fit_is_deterministic_for_seed() {
        // ---
        let (x, y) = linear_data(120);
        let a = RandomForest::fit(&x, &y, small_params()).unwrap();
        let b = RandomForest::fit(&x, &y, small_params()).unwrap();
        let row = [4.2, 1.0];
        assert_eq!(
            a.tree_predictions(&row).unwrap(),
            b.tree_predictions(&row).unwrap()
        );
    }

    #[test]
    fn test_constant_target_predicts_constant() {
        // ---
        let x = vec![vec![1.0], vec![2.0], vec![3.0]];
        let y = vec![5.0, 5.0, 5.0];
        let forest = RandomForest::fit(&x, &y, small_params()).unwrap();
        assert_eq!(forest.predict(&[10.0]).unwrap(), 5.0);
        assert!(forest.feature_importances().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_rejects_bad_input() {
        // ---
        assert!(RandomForest::fit(&[], &[], small_params()).is_err());
        assert!(RandomForest::fit(&[vec![1.0]], &[1.0, 2.0], small_params()).is_err());
        assert!(RandomForest::fit(&[vec![1.0], vec![1.0, 2.0]], &[1.0, 2.0], small_params()).is_err());

        let (x, y) = linear_data(30);
        let forest = RandomForest::fit(&x, &y, small_params()).unwrap();
        assert!(matches!(
            forest.predict(&[1.0]),
            Err(PipelineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_serde_round_trip_preserves_predictions() {
        // ---
        let (x, y) = linear_data(80);
        let forest = RandomForest::fit(&x, &y, small_params()).unwrap();
        let json = serde_json::to_string(&forest).unwrap();
        let restored: RandomForest = serde_json::from_str(&json).unwrap();
        let row = [3.3, 2.0];
        assert_eq!(
            forest.tree_predictions(&row).unwrap(),
            restored.tree_predictions(&row).unwrap()
        );
    }
}
