//! Ordinary least-squares fit used to sanity-check a propensity model.

/// Fit quality of `actual = a + b × predicted`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fit {
    /// Intercept.
    pub intercept: f64,
    /// Slope.
    pub slope: f64,
    /// Coefficient of determination.
    pub r_squared: f64,
    /// Root mean squared residual.
    pub rmse: f64,
}

/// Fits a simple linear regression of `actual` on `predicted`.
///
/// A predictor with zero variance yields a flat fit through the mean; a
/// target with zero variance yields `r_squared = 0`. Returns `None` for
/// empty or mismatched input.
#[must_use]
pub fn linear_fit(predicted: &[f64], actual: &[f64]) -> Option<Fit> {
    if predicted.is_empty() || predicted.len() != actual.len() {
        return None;
    }

    #[allow(clippy::cast_precision_loss)]
    let n = predicted.len() as f64;
    let mean_x = predicted.iter().sum::<f64>() / n;
    let mean_y = actual.iter().sum::<f64>() / n;

    let mut cov_xy = 0.0;
    let mut var_x = 0.0;
    for (x, y) in predicted.iter().zip(actual) {
        cov_xy += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x).powi(2);
    }

    let slope = if var_x > 0.0 { cov_xy / var_x } else { 0.0 };
    let intercept = mean_y - slope * mean_x;

    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for (x, y) in predicted.iter().zip(actual) {
        let fitted = slope.mul_add(*x, intercept);
        ss_res += (y - fitted).powi(2);
        ss_tot += (y - mean_y).powi(2);
    }

    let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };

    Some(Fit {
        intercept,
        slope,
        r_squared,
        rmse: (ss_res / n).sqrt(),
    })
}
