//! Gaussian profile fits used by the centroid estimators.
//!
//! Both fits share a small Levenberg–Marquardt solver working on `nalgebra` dynamic
//! vectors: the 1-D model (amplitude, centre, sigma, constant) is fit to the marginal
//! sums of a cutout, the 2-D axis-aligned model (amplitude, x₀, y₀, σx, σy, constant)
//! to the cutout itself.

use nalgebra::{DMatrix, DVector};
use ndarray::ArrayView2;

use crate::numeric::weighted_centroid;

/// Configuration of the Levenberg–Marquardt iterations.
#[derive(Debug, Clone, PartialEq)]
pub struct LmConfig {
    pub max_iterations: usize,
    /// Stop once every parameter step is below this value
    pub convergence_threshold: f64,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        LmConfig {
            max_iterations: 100,
            convergence_threshold: 1e-9,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LmResult {
    pub params: DVector<f64>,
    pub chi2: f64,
    pub converged: bool,
    pub iterations: usize,
}

/// Least-squares model: residuals and model Jacobian at a parameter vector.
pub trait LmModel {
    /// `data − model` at every sample.
    fn residuals(&self, params: &DVector<f64>) -> DVector<f64>;

    /// ∂model/∂params, one row per sample.
    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64>;

    /// Keep the parameters inside their physical domain after a step.
    fn constrain(&self, _params: &mut DVector<f64>) {}
}

/// Minimise the squared residuals of `model` starting from `initial`.
pub fn levenberg_marquardt<M: LmModel>(
    model: &M,
    initial: DVector<f64>,
    config: &LmConfig,
) -> LmResult {
    let mut params = initial;
    let mut lambda = config.initial_lambda;
    let mut chi2 = model.residuals(&params).norm_squared();
    let mut converged = false;
    let mut iterations = 0;

    for iter in 0..config.max_iterations {
        iterations = iter + 1;
        let r = model.residuals(&params);
        let j = model.jacobian(&params);
        let jt = j.transpose();
        let hessian = &jt * &j;
        let gradient = &jt * &r;

        let mut damped = hessian.clone();
        for k in 0..damped.nrows() {
            damped[(k, k)] *= 1.0 + lambda;
        }
        let Some(delta) = damped.lu().solve(&gradient) else {
            break;
        };

        let mut trial = &params + &delta;
        model.constrain(&mut trial);
        let trial_chi2 = model.residuals(&trial).norm_squared();

        if trial_chi2 < chi2 {
            params = trial;
            chi2 = trial_chi2;
            lambda *= config.lambda_down;
            if delta.amax() < config.convergence_threshold {
                converged = true;
                break;
            }
        } else {
            lambda *= config.lambda_up;
            if lambda > 1e10 {
                // no downhill step left: already at the minimum
                converged = true;
                break;
            }
        }
    }

    LmResult {
        params,
        chi2,
        converged,
        iterations,
    }
}

/// Gaussian plus constant, parameters `[amplitude, centre, sigma, constant]`.
struct Gaussian1D<'a> {
    x: &'a [f64],
    y: &'a [f64],
}

impl LmModel for Gaussian1D<'_> {
    fn residuals(&self, p: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            self.x.len(),
            self.x.iter().zip(self.y).map(|(&x, &y)| {
                let z = (x - p[1]) / p[2];
                y - (p[0] * (-0.5 * z * z).exp() + p[3])
            }),
        )
    }

    fn jacobian(&self, p: &DVector<f64>) -> DMatrix<f64> {
        let (amp, mu, sigma) = (p[0], p[1], p[2]);
        DMatrix::from_fn(self.x.len(), 4, |i, k| {
            let dx = self.x[i] - mu;
            let e = (-0.5 * dx * dx / (sigma * sigma)).exp();
            match k {
                0 => e,
                1 => amp * e * dx / (sigma * sigma),
                2 => amp * e * dx * dx / (sigma * sigma * sigma),
                _ => 1.0,
            }
        })
    }

    fn constrain(&self, p: &mut DVector<f64>) {
        p[2] = p[2].abs().max(0.1);
    }
}

/// Result of a 1-D Gaussian fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gaussian1DFit {
    pub amplitude: f64,
    pub center: f64,
    pub sigma: f64,
    pub constant: f64,
}

/// Fit a Gaussian plus constant to samples `(x, y)`.
///
/// Returns `None` with fewer than five samples or a flat profile.
pub fn fit_gaussian_1d(x: &[f64], y: &[f64], config: &LmConfig) -> Option<Gaussian1DFit> {
    if x.len() < 5 || x.len() != y.len() {
        return None;
    }
    let lo = y.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = y.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !(hi > lo) {
        return None;
    }
    let weights: Vec<f64> = y.iter().map(|v| v - lo).collect();
    let center = weighted_centroid(x, &weights)?;
    let variance = x
        .iter()
        .zip(&weights)
        .map(|(xi, w)| w * (xi - center).powi(2))
        .sum::<f64>()
        / weights.iter().sum::<f64>();
    let span = (x[x.len() - 1] - x[0]).abs().max(1.0);
    let sigma = variance.sqrt().clamp(0.5, span / 2.0);

    let model = Gaussian1D { x, y };
    let result = levenberg_marquardt(
        &model,
        DVector::from_vec(vec![hi - lo, center, sigma, lo]),
        config,
    );
    let p = result.params;
    Some(Gaussian1DFit {
        amplitude: p[0],
        center: p[1],
        sigma: p[2],
        constant: p[3],
    })
}

/// Axis-aligned 2-D Gaussian plus constant over a cutout,
/// parameters `[amplitude, x0, y0, sigma_x, sigma_y, constant]`.
struct Gaussian2D<'a> {
    data: ArrayView2<'a, f64>,
}

impl Gaussian2D<'_> {
    fn samples(&self) -> impl Iterator<Item = (f64, f64, f64)> + '_ {
        self.data
            .indexed_iter()
            .map(|((row, col), &v)| (col as f64, row as f64, v))
    }
}

impl LmModel for Gaussian2D<'_> {
    fn residuals(&self, p: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            self.data.len(),
            self.samples().map(|(x, y, v)| {
                let zx = (x - p[1]) / p[3];
                let zy = (y - p[2]) / p[4];
                v - (p[0] * (-0.5 * (zx * zx + zy * zy)).exp() + p[5])
            }),
        )
    }

    fn jacobian(&self, p: &DVector<f64>) -> DMatrix<f64> {
        let (amp, x0, y0, sx, sy) = (p[0], p[1], p[2], p[3], p[4]);
        let mut j = DMatrix::zeros(self.data.len(), 6);
        for (i, (x, y, _)) in self.samples().enumerate() {
            let (dx, dy) = (x - x0, y - y0);
            let e = (-0.5 * (dx * dx / (sx * sx) + dy * dy / (sy * sy))).exp();
            j[(i, 0)] = e;
            j[(i, 1)] = amp * e * dx / (sx * sx);
            j[(i, 2)] = amp * e * dy / (sy * sy);
            j[(i, 3)] = amp * e * dx * dx / (sx * sx * sx);
            j[(i, 4)] = amp * e * dy * dy / (sy * sy * sy);
            j[(i, 5)] = 1.0;
        }
        j
    }

    fn constrain(&self, p: &mut DVector<f64>) {
        let limit = self.data.nrows().max(self.data.ncols()) as f64;
        p[3] = p[3].abs().clamp(0.3, limit);
        p[4] = p[4].abs().clamp(0.3, limit);
    }
}

/// Result of a 2-D Gaussian fit, positions in cutout pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gaussian2DFit {
    pub amplitude: f64,
    pub x: f64,
    pub y: f64,
    pub sigma_x: f64,
    pub sigma_y: f64,
    pub constant: f64,
}

/// Fit an axis-aligned 2-D Gaussian plus constant to `cutout` (`[row, col]`).
///
/// The starting point comes from the 1-D fits of the marginal sums.
pub fn fit_gaussian_2d(cutout: ArrayView2<f64>, config: &LmConfig) -> Option<Gaussian2DFit> {
    let (nrows, ncols) = cutout.dim();
    if nrows < 3 || ncols < 3 {
        return None;
    }
    let lo = cutout.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = cutout.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !(hi > lo) {
        return None;
    }

    let (gx, gy) = marginal_fits(cutout, config)?;
    let initial = DVector::from_vec(vec![
        hi - lo,
        gx.center,
        gy.center,
        gx.sigma.abs(),
        gy.sigma.abs(),
        lo,
    ]);
    let model = Gaussian2D { data: cutout };
    let p = levenberg_marquardt(&model, initial, config).params;
    Some(Gaussian2DFit {
        amplitude: p[0],
        x: p[1],
        y: p[2],
        sigma_x: p[3],
        sigma_y: p[4],
        constant: p[5],
    })
}

/// 1-D Gaussian fits of the column sums (x) and row sums (y) of a cutout.
pub fn marginal_fits(
    cutout: ArrayView2<f64>,
    config: &LmConfig,
) -> Option<(Gaussian1DFit, Gaussian1DFit)> {
    let (nrows, ncols) = cutout.dim();
    let xs: Vec<f64> = (0..ncols).map(|v| v as f64).collect();
    let ys: Vec<f64> = (0..nrows).map(|v| v as f64).collect();
    let col_sums: Vec<f64> = cutout.columns().into_iter().map(|c| c.sum()).collect();
    let row_sums: Vec<f64> = cutout.rows().into_iter().map(|r| r.sum()).collect();
    let gx = fit_gaussian_1d(&xs, &col_sums, config)?;
    let gy = fit_gaussian_1d(&ys, &row_sums, config)?;
    Some((gx, gy))
}

#[cfg(test)]
mod gaussian_test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    #[test]
    fn test_fit_gaussian_1d_exact() {
        let x: Vec<f64> = (0..21).map(|v| v as f64).collect();
        let y: Vec<f64> = x
            .iter()
            .map(|v| 50.0 * (-0.5 * ((v - 9.3) / 1.7f64).powi(2)).exp() + 3.0)
            .collect();
        let fit = fit_gaussian_1d(&x, &y, &LmConfig::default()).unwrap();
        assert_abs_diff_eq!(fit.center, 9.3, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.sigma, 1.7, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.amplitude, 50.0, epsilon = 1e-5);
        assert_abs_diff_eq!(fit.constant, 3.0, epsilon = 1e-5);
    }

    #[test]
    fn test_fit_gaussian_2d_exact() {
        let img = Array2::from_shape_fn((25, 25), |(r, c)| {
            let dx = (c as f64 - 12.4) / 1.6;
            let dy = (r as f64 - 11.8) / 2.1;
            400.0 * (-0.5 * (dx * dx + dy * dy)).exp() + 1.0
        });
        let fit = fit_gaussian_2d(img.view(), &LmConfig::default()).unwrap();
        assert_abs_diff_eq!(fit.x, 12.4, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.y, 11.8, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.sigma_x, 1.6, epsilon = 1e-5);
        assert_abs_diff_eq!(fit.sigma_y, 2.1, epsilon = 1e-5);
    }

    #[test]
    fn test_flat_profile_rejected() {
        let x: Vec<f64> = (0..10).map(|v| v as f64).collect();
        assert!(fit_gaussian_1d(&x, &[2.0; 10], &LmConfig::default()).is_none());
    }
}
