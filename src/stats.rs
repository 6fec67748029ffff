//! Small numeric helpers shared by training, prediction and anomaly scoring.

// ---

pub fn mean(values: &[f64]) -> f64 {
    // ---
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (divides by `n`).
pub fn std_population(values: &[f64]) -> f64 {
    // ---
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Sample standard deviation (divides by `n - 1`), `None` below two values.
pub fn std_sample(values: &[f64]) -> Option<f64> {
    // ---
    if values.len() < 2 {
        return None;
    }
    let m = mean(values);
    let ss = values.iter().map(|v| (v - m).powi(2)).sum::<f64>();
    Some((ss / (values.len() - 1) as f64).sqrt())
}

/// Linear-interpolated quantile of an already sorted slice.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    // ---
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegressionScores {
    pub r2: f64,
    pub mae: f64,
    pub rmse: f64,
    /// Percent.
    pub mape: f64,
}

/// Score predictions against actual values.
///
/// MAPE skips actual values that are effectively zero. R² is 0 when the
/// actual values have no variance.
pub fn regression_scores(predicted: &[f64], actual: &[f64]) -> RegressionScores {
    // ---
    let n = predicted.len().min(actual.len());
    if n == 0 {
        return RegressionScores {
            r2: 0.0,
            mae: 0.0,
            rmse: 0.0,
            mape: 0.0,
        };
    }
    let pairs = || predicted.iter().zip(actual.iter()).take(n);
    let nf = n as f64;

    let mae = pairs().map(|(p, a)| (p - a).abs()).sum::<f64>() / nf;
    let mse = pairs().map(|(p, a)| (p - a).powi(2)).sum::<f64>() / nf;

    let (mape_sum, mape_n) = pairs()
        .filter(|(_, a)| a.abs() > 1e-10)
        .fold((0.0, 0usize), |(s, c), (p, a)| (s + ((a - p) / a).abs(), c + 1));
    let mape = if mape_n == 0 {
        0.0
    } else {
        mape_sum / mape_n as f64 * 100.0
    };

    let mean_actual = actual.iter().take(n).sum::<f64>() / nf;
    let ss_tot: f64 = actual.iter().take(n).map(|a| (a - mean_actual).powi(2)).sum();
    let ss_res: f64 = pairs().map(|(p, a)| (a - p).powi(2)).sum();
    let r2 = if ss_tot.abs() < 1e-10 {
        0.0
    } else {
        1.0 - ss_res / ss_tot
    };

    RegressionScores {
        r2,
        mae,
        rmse: mse.sqrt(),
        mape,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_std_variants() {
        // ---
        let v = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((mean(&v) - 5.0).abs() < 1e-12);
        assert!((std_population(&v) - 2.0).abs() < 1e-12);
        assert!((std_sample(&v).unwrap() - 2.138089935).abs() < 1e-6);
        assert_eq!(std_sample(&[1.0]), None);
    }

    #[test]
    fn test_quantile_interpolates() {
        // ---
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile_sorted(&sorted, 0.5), 3.0);
        assert_eq!(quantile_sorted(&sorted, 0.25), 2.0);
        assert!((quantile_sorted(&[1.0, 2.0], 0.75) - 1.75).abs() < 1e-12);
        assert_eq!(quantile_sorted(&[], 0.5), 0.0);
    }

    #[test]
    fn test_regression_scores() {
        // ---
        let predictions = [1.0, 2.0, 3.0, 4.0, 5.0];
        let targets = [1.1, 2.1, 2.9, 4.2, 4.8];
        let s = regression_scores(&predictions, &targets);

        assert!(s.mae < 0.3);
        assert!(s.rmse < 0.4);
        assert!(s.r2 > 0.9);
        assert!(s.mape > 0.0 && s.mape < 10.0);
    }

    #[test]
    fn test_r2_negative_for_bad_model() {
        // ---
        let s = regression_scores(&[10.0, 10.0, 10.0], &[1.0, 2.0, 3.0]);
        assert!(s.r2 < 0.0);
    }
}
