//! Small numerical kernels shared by the pipeline stages.
//!
//! Everything here works on plain slices so that the callers can feed rows, columns or
//! extracted spectra without copying them into matrices first. Least-squares problems are
//! solved with `nalgebra`'s SVD.

use itertools::Itertools;
use nalgebra::{DMatrix, DVector};

use crate::grismo_errors::GrismoError;

/// Median of a slice (mean of the two central values for even lengths).
///
/// Returns `NaN` for an empty slice.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Arithmetic mean, `NaN` for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Running median with edge replication ("nearest" boundary handling).
pub fn median_filter(values: &[f64], size: usize) -> Vec<f64> {
    let n = values.len();
    if size <= 1 || n == 0 {
        return values.to_vec();
    }
    let before = size / 2;
    let mut window = Vec::with_capacity(size);
    (0..n)
        .map(|i| {
            window.clear();
            window.extend((i..i + size).map(|k| values[k.saturating_sub(before).min(n - 1)]));
            median(&window)
        })
        .collect()
}

/// Running median whose first and last `keep` samples are copied unsmoothed.
pub fn median_filter_keep_edges(values: &[f64], size: usize, keep: usize) -> Vec<f64> {
    let mut filtered = median_filter(values, size);
    let n = values.len();
    let keep = keep.min(n);
    filtered[..keep].copy_from_slice(&values[..keep]);
    filtered[n - keep..].copy_from_slice(&values[n - keep..]);
    filtered
}

/// Boxcar smoothing with zero fill beyond the ends.
pub fn boxcar(values: &[f64], width: usize) -> Vec<f64> {
    let n = values.len();
    if width <= 1 || n == 0 {
        return values.to_vec();
    }
    let half = (width / 2) as isize;
    (0..n as isize)
        .map(|i| {
            let lo = i - half;
            let hi = lo + width as isize;
            let sum: f64 = (lo..hi)
                .filter(|&j| j >= 0 && j < n as isize)
                .map(|j| values[j as usize])
                .sum();
            sum / width as f64
        })
        .collect()
}

/// Result of a polynomial least-squares fit.
#[derive(Debug, Clone)]
pub struct PolyFit {
    /// Coefficients in increasing power order.
    pub coefficients: Vec<f64>,
    /// Sum of squared residuals.
    pub residual_ss: f64,
}

impl PolyFit {
    pub fn eval(&self, x: f64) -> f64 {
        polyval(&self.coefficients, x)
    }

    /// First derivative at `x`.
    pub fn slope(&self, x: f64) -> f64 {
        self.coefficients
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .fold(0.0, |acc, (k, c)| acc * x + k as f64 * c)
    }
}

/// Evaluate a polynomial given in increasing power order (Horner scheme).
pub fn polyval(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

/// Least-squares polynomial of degree `degree` through `(x, y)`.
pub fn polyfit(x: &[f64], y: &[f64], degree: usize) -> Result<PolyFit, GrismoError> {
    let n = x.len();
    let n_terms = degree + 1;
    if n != y.len() {
        return Err(GrismoError::SingularFit(format!(
            "abscissa and ordinate lengths differ ({n} vs {})",
            y.len()
        )));
    }
    if n < n_terms {
        return Err(GrismoError::SingularFit(format!(
            "{n} points cannot constrain a degree {degree} polynomial"
        )));
    }

    // centre and scale the abscissa to keep the Vandermonde matrix well conditioned
    let x_mid = (x.iter().cloned().fold(f64::INFINITY, f64::min)
        + x.iter().cloned().fold(f64::NEG_INFINITY, f64::max))
        / 2.0;
    let x_scale = x
        .iter()
        .map(|v| (v - x_mid).abs())
        .fold(0.0, f64::max)
        .max(f64::MIN_POSITIVE);

    let design = DMatrix::from_fn(n, n_terms, |i, k| ((x[i] - x_mid) / x_scale).powi(k as i32));
    let rhs = DVector::from_column_slice(y);
    let svd = design.clone().svd(true, true);
    let scaled = svd
        .solve(&rhs, 1e-12)
        .map_err(|e| GrismoError::SingularFit(e.to_string()))?;

    let residual_ss = (&design * &scaled - &rhs).norm_squared();
    let coefficients = unscale_polynomial(scaled.as_slice(), x_mid, x_scale);
    Ok(PolyFit {
        coefficients,
        residual_ss,
    })
}

/// Expand p((x - m) / s) into plain power coefficients of x.
fn unscale_polynomial(scaled: &[f64], mid: f64, scale: f64) -> Vec<f64> {
    let n = scaled.len();
    let mut out = vec![0.0; n];
    for (k, c) in scaled.iter().enumerate() {
        // c * ((x - mid) / scale)^k, binomial expansion
        let factor = c / scale.powi(k as i32);
        let mut binom = 1.0;
        for j in 0..=k {
            let term = binom * (-mid).powi((k - j) as i32);
            out[j] += factor * term;
            binom = binom * (k - j) as f64 / (j + 1) as f64;
        }
    }
    out
}

/// Ordinary least-squares line, returned as `(intercept, slope)`.
pub fn fit_line(x: &[f64], y: &[f64]) -> Result<(f64, f64), GrismoError> {
    let fit = polyfit(x, y, 1)?;
    Ok((fit.coefficients[0], fit.coefficients[1]))
}

/// Piecewise-linear interpolation of `(xp, fp)` at `x`; `xp` must be increasing.
///
/// Outside `[xp[0], xp[last]]` the `left` / `right` values are returned.
pub fn interp(x: f64, xp: &[f64], fp: &[f64], left: f64, right: f64) -> f64 {
    let n = xp.len();
    if n == 0 {
        return left;
    }
    if x < xp[0] {
        return left;
    }
    if x > xp[n - 1] {
        return right;
    }
    let j = searchsorted(xp, x);
    if j < n && xp[j] == x {
        return fp[j];
    }
    if j == 0 {
        return fp[0];
    }
    let (x0, x1) = (xp[j - 1], xp[j]);
    let (y0, y1) = (fp[j - 1], fp[j]);
    if x1 == x0 {
        return y1;
    }
    y0 + (x - x0) / (x1 - x0) * (y1 - y0)
}

/// Interpolate every point of `x`, clamping to the end values outside `xp`.
pub fn interp_clamped(x: &[f64], xp: &[f64], fp: &[f64]) -> Vec<f64> {
    let (first, last) = match (fp.first(), fp.last()) {
        (Some(f), Some(l)) => (*f, *l),
        _ => return vec![0.0; x.len()],
    };
    x.iter().map(|&v| interp(v, xp, fp, first, last)).collect()
}

/// Index of the first element of the sorted slice that is not less than `value`.
pub fn searchsorted(sorted: &[f64], value: f64) -> usize {
    sorted.partition_point(|v| *v < value)
}

/// Most frequent value of a slice (the smallest one on ties).
pub fn modal_value(values: &[f64]) -> Option<f64> {
    values
        .iter()
        .cloned()
        .sorted_by(|a, b| a.total_cmp(b))
        .chunk_by(|v| v.to_bits())
        .into_iter()
        .map(|(_, group)| {
            let group: Vec<f64> = group.collect();
            (group[0], group.len())
        })
        .fold(None, |best: Option<(f64, usize)>, (value, count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((value, count)),
        })
        .map(|(value, _)| value)
}

/// Flux-weighted centroid of `values` placed at `positions`.
pub fn weighted_centroid(positions: &[f64], values: &[f64]) -> Option<f64> {
    let total: f64 = values.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return None;
    }
    Some(
        positions
            .iter()
            .zip(values)
            .map(|(p, v)| p * v)
            .sum::<f64>()
            / total,
    )
}

#[cfg(test)]
mod numeric_test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_median() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        assert!(median(&[]).is_nan());
    }

    #[test]
    fn test_median_filter_nearest() {
        let data = [1.0, 9.0, 1.0, 1.0, 5.0, 5.0, 5.0];
        let filtered = median_filter(&data, 3);
        assert_eq!(filtered, vec![1.0, 1.0, 1.0, 1.0, 5.0, 5.0, 5.0]);

        let kept = median_filter_keep_edges(&data, 3, 1);
        assert_eq!(kept[0], 1.0);
        assert_eq!(kept[1], 1.0);
        assert_eq!(kept[6], 5.0);
    }

    #[test]
    fn test_boxcar_zero_fill() {
        let smoothed = boxcar(&[3.0, 3.0, 3.0, 3.0], 3);
        assert_relative_eq!(smoothed[0], 2.0);
        assert_relative_eq!(smoothed[1], 3.0);
        assert_relative_eq!(smoothed[3], 2.0);
    }

    #[test]
    fn test_polyfit_recovers_cubic() {
        let x: Vec<f64> = (0..1014).map(|v| v as f64).collect();
        let y: Vec<f64> = x
            .iter()
            .map(|v| 2.5 - 1.0e-2 * v + 3.0e-5 * v * v - 1.0e-8 * v * v * v)
            .collect();
        let fit = polyfit(&x, &y, 3).unwrap();
        assert_relative_eq!(fit.coefficients[0], 2.5, epsilon = 1e-8);
        assert_relative_eq!(fit.coefficients[1], -1.0e-2, epsilon = 1e-10);
        assert_relative_eq!(fit.coefficients[2], 3.0e-5, epsilon = 1e-12);
        assert_relative_eq!(fit.coefficients[3], -1.0e-8, epsilon = 1e-14);
        assert!(fit.residual_ss < 1e-12);
        assert_relative_eq!(fit.eval(500.0), y[500], epsilon = 1e-9);
    }

    #[test]
    fn test_fit_line() {
        let (b, m) = fit_line(&[0.0, 1.0, 2.0], &[1.0, 3.0, 5.0]).unwrap();
        assert_relative_eq!(b, 1.0, epsilon = 1e-12);
        assert_relative_eq!(m, 2.0, epsilon = 1e-12);
        assert!(fit_line(&[1.0], &[1.0]).is_err());
    }

    #[test]
    fn test_interp() {
        let xp = [0.0, 1.0, 2.0];
        let fp = [0.0, 10.0, 30.0];
        assert_eq!(interp(0.5, &xp, &fp, -1.0, -2.0), 5.0);
        assert_eq!(interp(1.0, &xp, &fp, -1.0, -2.0), 10.0);
        assert_eq!(interp(-0.1, &xp, &fp, -1.0, -2.0), -1.0);
        assert_eq!(interp(2.1, &xp, &fp, -1.0, -2.0), -2.0);
        assert_eq!(interp_clamped(&[3.0], &xp, &fp), vec![30.0]);
    }

    #[test]
    fn test_modal_value() {
        assert_eq!(modal_value(&[2.0, 1.0, 2.0, 3.0, 1.0]), Some(1.0));
        assert_eq!(modal_value(&[4.0, 4.0, 1.0]), Some(4.0));
        assert_eq!(modal_value(&[]), None);
    }
}
