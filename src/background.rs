//! # Background model
//!
//! Two background terms are removed from a grism exposure:
//!
//! * the **sky** term, a scaled copy of the broadband sky flat subtracted from the whole
//!   readout before tracing ([`scale_sky_flat`]); what it removed along the trace is
//!   measured again on the sky-flat-divided image ([`sky_background`]) so that it can be
//!   added back into the gross spectrum;
//! * the **residual** term, measured in two boxes above and below the fitted trace, smoothed
//!   with a running median, fit with a cubic per box and combined into one curve that is
//!   subtracted column by column ([`fit_background`]).
//!
//! The cubic fits reject outliers once: points whose residual exceeds the smaller of the
//! two fit errors are dropped and each fit is repeated on the survivors.

use ndarray::{Array2, ArrayView2, Axis};
use tracing::{debug, warn};

use crate::constants::{Pixel, DETECTOR_SIZE};
use crate::grismo_errors::GrismoError;
use crate::numeric::{boxcar, mean, median, median_filter_keep_edges, polyfit, PolyFit};
use crate::params::ExtractParams;

/// Smallest sky-flat value used as a divisor.
const MIN_SKY_FLAT: f64 = 0.001;
/// Largest mean residual background accepted (counts/s/px).
const MAX_MEAN_BACKGROUND: f64 = 3.0;

/// Result of scaling the sky flat to an exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct SkyFlatScaling {
    /// Mean ratio of the smoothed image and sky-flat row profiles
    pub ratio: f64,
    /// Standard deviation of that ratio
    pub ratio_sigma: f64,
    /// Mean smoothed row level times the extraction height
    pub avgbkg: f64,
    /// Sky flat times `ratio`
    pub scaled_flat: Array2<f64>,
}

/// Scale `flat` to the sky level of `image`.
///
/// Both images are collapsed to row profiles, smoothed with running medians (61 px for the
/// image and 21 px for the flat, leaving 30 and 20 edge samples unsmoothed) and their
/// ratio averaged over the central rows 100–900 of the full frame, scaled to the readout.
pub fn scale_sky_flat(
    image: ArrayView2<f64>,
    flat: ArrayView2<f64>,
    gwidth: usize,
) -> Result<SkyFlatScaling, GrismoError> {
    if image.dim() != flat.dim() {
        return Err(GrismoError::InvalidParameter(format!(
            "sky flat shape {:?} differs from image shape {:?}",
            flat.dim(),
            image.dim()
        )));
    }
    let row_profile = |a: ArrayView2<f64>| -> Vec<f64> {
        a.mean_axis(Axis(1)).map(|m| m.to_vec()).unwrap_or_default()
    };
    let imav = row_profile(image);
    let bkav = row_profile(flat);
    if imav.is_empty() {
        return Err(GrismoError::InvalidParameter("empty image".into()));
    }
    let smimav = median_filter_keep_edges(&imav, 61, 30);
    let smbkav = median_filter_keep_edges(&bkav, 21, 20);

    let n = imav.len();
    let scale = n as f64 / DETECTOR_SIZE as f64;
    let lo = ((100.0 * scale).round() as usize).min(n);
    let hi = ((900.0 * scale).round() as usize + 1).min(n).max(lo);

    let ratios: Vec<f64> = (lo..hi)
        .filter(|&i| smbkav[i] > 0.0)
        .map(|i| smimav[i] / smbkav[i])
        .collect();
    let ratio = if ratios.is_empty() { 0.0 } else { mean(&ratios) };
    let ratio_sigma = if ratios.is_empty() {
        0.0
    } else {
        (ratios.iter().map(|r| (r - ratio).powi(2)).sum::<f64>() / ratios.len() as f64).sqrt()
    };
    let avgbkg = if hi > lo {
        mean(&smimav[lo..hi]) * gwidth as f64
    } else {
        0.0
    };
    debug!(ratio, ratio_sigma, avgbkg, "sky flat scaled");

    Ok(SkyFlatScaling {
        ratio,
        ratio_sigma,
        avgbkg,
        scaled_flat: flat.mapv(|v| v * ratio),
    })
}

/// `raw / max(scaled_flat, 0.001)`, the image in units of the sky flat.
pub fn sky_image(raw: ArrayView2<f64>, scaled_flat: ArrayView2<f64>) -> Array2<f64> {
    let mut out = raw.to_owned();
    out.zip_mut_with(&scaled_flat, |v, &f| *v /= f.max(MIN_SKY_FLAT));
    out
}

/// Median of the `bwidth`-high box centred `dist` pixels away from the trace in every
/// column (`dist` negative below the trace).
pub fn sample_box(image: ArrayView2<f64>, yfit: &[Pixel], dist: Pixel, bwidth: usize) -> Vec<f64> {
    let nrows = image.nrows() as i64;
    let half = (bwidth / 2) as i64;
    let mut column = Vec::with_capacity(bwidth);
    yfit.iter()
        .enumerate()
        .map(|(col, y)| {
            let ypos = (y + dist).round() as i64;
            let y1 = (ypos - half).clamp(0, nrows);
            let y2 = (ypos + half + 1).clamp(0, nrows);
            column.clear();
            column.extend((y1..y2).map(|r| image[[r as usize, col]]));
            median(&column)
        })
        .collect()
}

/// Sky background along the trace, from the sky-flat-divided image.
///
/// Mean of the two background boxes, median filtered with `bmedian`, boxcar smoothed with
/// `bmean1` then `bmean2` and scaled to the extraction height.
pub fn sky_background(
    sky_image: ArrayView2<f64>,
    yfit: &[Pixel],
    params: &ExtractParams,
) -> Vec<f64> {
    let lower = sample_box(sky_image, yfit, -params.lbdist, params.bwidth);
    let upper = sample_box(sky_image, yfit, params.ubdist, params.bwidth);
    let raw: Vec<f64> = lower.iter().zip(&upper).map(|(l, u)| (l + u) / 2.0).collect();

    let mut back = if params.bmedian > 1 {
        median_filter_keep_edges(&raw, params.bmedian, params.bmedian / 2)
    } else {
        raw
    };
    for width in [params.bmean1, params.bmean2] {
        if width > 1 {
            back = boxcar(&back, width);
        }
    }
    back.iter_mut().for_each(|v| *v *= params.gwidth as f64);
    back
}

/// Fit of one background box.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxFit {
    /// Median of the box in each column
    pub raw: Vec<f64>,
    /// `raw` after the running median
    pub smoothed: Vec<f64>,
    /// Cubic evaluated at every column
    pub fit: Vec<f64>,
    /// Samples kept by the outlier rejection
    pub n_good: usize,
    pub error: f64,
}

/// Residual background under the trace.
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundModel {
    pub lower: BoxFit,
    pub upper: BoxFit,
    /// Smaller of the two first-pass fit errors
    pub sigma: f64,
    /// Background per pixel subtracted from every column
    pub per_pixel: Vec<f64>,
}

impl BackgroundModel {
    /// Background summed over the extraction height.
    pub fn extracted(&self, gwidth: usize) -> Vec<f64> {
        self.per_pixel.iter().map(|v| v * gwidth as f64).collect()
    }

    /// Subtract the per-pixel background from every row of `image`.
    pub fn subtract(&self, image: &mut Array2<f64>) {
        for mut row in image.rows_mut() {
            row.iter_mut()
                .zip(&self.per_pixel)
                .for_each(|(v, b)| *v -= b);
        }
    }
}

fn first_pass(raw: Vec<f64>, bmedian: usize, x: &[f64]) -> Result<(Vec<f64>, PolyFit, f64), GrismoError> {
    let smoothed = if bmedian > 1 {
        median_filter_keep_edges(&raw, bmedian, bmedian / 2)
    } else {
        raw
    };
    let fit = polyfit(x, &smoothed, 3)?;
    let error = (fit.residual_ss / (x.len() as f64 - 2.0)).sqrt();
    Ok((smoothed, fit, error))
}

fn second_pass(
    raw: Vec<f64>,
    smoothed: Vec<f64>,
    first: PolyFit,
    first_error: f64,
    sigma: f64,
    x: &[f64],
) -> Result<BoxFit, GrismoError> {
    let good: Vec<usize> = (0..x.len())
        .filter(|&i| (smoothed[i] - first.eval(x[i])).abs() <= sigma)
        .collect();
    let n_good = good.len();

    let (fit, error) = if n_good >= (x.len() / 5).max(4) {
        let gx: Vec<f64> = good.iter().map(|&i| x[i]).collect();
        let gy: Vec<f64> = good.iter().map(|&i| smoothed[i]).collect();
        let refit = polyfit(&gx, &gy, 3)?;
        let error = (refit.residual_ss / (n_good as f64 - 2.0)).sqrt();
        (refit, error)
    } else {
        (first, first_error)
    };

    Ok(BoxFit {
        raw,
        fit: x.iter().map(|&v| fit.eval(v)).collect(),
        smoothed,
        n_good,
        error,
    })
}

/// Measure the residual background around the trace `yfit` (one value per column).
///
/// Return
/// ------
/// * [`GrismoError::InsufficientBackgroundPoints`] when fewer than a fifth of the columns
///   survive the rejection in both boxes.
/// * [`GrismoError::BackgroundFitDiverged`] when the mean background exceeds 3 counts/s.
pub fn fit_background(
    image: ArrayView2<f64>,
    yfit: &[Pixel],
    params: &ExtractParams,
) -> Result<BackgroundModel, GrismoError> {
    let nsb = yfit.len();
    if nsb < 5 {
        return Err(GrismoError::InsufficientBackgroundPoints {
            lower: 0,
            upper: 0,
            total: nsb,
        });
    }
    let x: Vec<f64> = (0..nsb).map(|v| v as f64).collect();

    let lower_raw = sample_box(image, yfit, -params.lbdist, params.bwidth);
    let upper_raw = sample_box(image, yfit, params.ubdist, params.bwidth);
    let (lo_smooth, lo_first, lo_err) = first_pass(lower_raw.clone(), params.bmedian, &x)?;
    let (up_smooth, up_first, up_err) = first_pass(upper_raw.clone(), params.bmedian, &x)?;
    // floor for noiseless data
    let scale = lo_smooth
        .iter()
        .chain(&up_smooth)
        .fold(1.0f64, |m, v| m.max(v.abs()));
    let sigma = lo_err.min(up_err).max(1e-12 * scale);

    let lower = second_pass(lower_raw, lo_smooth, lo_first, lo_err, sigma, &x)?;
    let upper = second_pass(upper_raw, up_smooth, up_first, up_err, sigma, &x)?;

    let mean_abs = |v: &[f64]| v.iter().map(|a| a.abs()).sum::<f64>() / v.len() as f64;
    let mut back = if mean_abs(&upper.fit) < mean_abs(&lower.fit) {
        upper.fit.clone()
    } else {
        lower.fit.clone()
    };
    for i in 0..nsb {
        let (lo, up) = (lower.fit[i], upper.fit[i]);
        if up.abs() - back[i].abs() > 3.0 * sigma && up < lo {
            back[i] = up;
        }
        if lo.abs() - back[i].abs() > 3.0 * sigma && lo < up {
            back[i] = lo;
        }
    }

    let min_good = nsb as f64 / 5.0;
    let lower_ok = lower.n_good as f64 >= min_good;
    let upper_ok = upper.n_good as f64 >= min_good;
    match (lower_ok, upper_ok) {
        (false, false) => {
            return Err(GrismoError::InsufficientBackgroundPoints {
                lower: lower.n_good,
                upper: upper.n_good,
                total: nsb,
            })
        }
        (false, true) => {
            warn!(n_good = lower.n_good, "too few lower background points, using the upper fit");
            back = upper.fit.clone();
        }
        (true, false) => {
            warn!(n_good = upper.n_good, "too few upper background points, using the lower fit");
            back = lower.fit.clone();
        }
        (true, true) => {}
    }

    let level = mean(&back);
    if level.abs() > MAX_MEAN_BACKGROUND {
        return Err(GrismoError::BackgroundFitDiverged(level.abs()));
    }
    debug!(
        sigma,
        lower_good = lower.n_good,
        upper_good = upper.n_good,
        level,
        "background fit"
    );

    Ok(BackgroundModel {
        lower,
        upper,
        sigma,
        per_pixel: back,
    })
}

#[cfg(test)]
mod background_test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::constants::Grating;

    fn params() -> ExtractParams {
        ExtractParams::for_grating(Grating::G102)
    }

    #[test]
    fn test_sample_box_rows() {
        let img = Array2::from_shape_fn((100, 3), |(r, _)| r as f64);
        let yfit = vec![50.0, 50.4, 50.6];
        // rows 25..=31 around 50 − 22
        assert_eq!(sample_box(img.view(), &yfit, -22.0, 7), vec![28.0, 28.0, 29.0]);
        // clipped at the top of the image
        assert_eq!(sample_box(img.view(), &yfit, 48.0, 7), vec![97.0, 97.0, 97.5]);
    }

    #[test]
    fn test_smooth_background_recovered() {
        let yfit = vec![500.0; 400];
        let img = Array2::from_shape_fn((1014, 400), |(_, c)| 0.5 + 1e-3 * c as f64);
        let model = fit_background(img.view(), &yfit, &params()).unwrap();
        for (c, b) in model.per_pixel.iter().enumerate() {
            assert_abs_diff_eq!(*b, 0.5 + 1e-3 * c as f64, epsilon = 1e-8);
        }
        let mut sub = img.clone();
        model.subtract(&mut sub);
        assert!(sub.iter().all(|v| v.abs() < 1e-8));
        assert_abs_diff_eq!(model.extracted(6)[10], 6.0 * 0.51, epsilon = 1e-7);
    }

    #[test]
    fn test_lower_level_box_preferred() {
        let yfit = vec![500.0; 300];
        let img = Array2::from_shape_fn((1014, 300), |(r, _)| if r < 500 { 0.2 } else { 1.0 });
        let model = fit_background(img.view(), &yfit, &params()).unwrap();
        assert_abs_diff_eq!(model.per_pixel[150], 0.2, epsilon = 1e-9);
    }

    #[test]
    fn test_divergent_background_rejected() {
        let yfit = vec![500.0; 200];
        let img = Array2::from_elem((1014, 200), 4.0);
        let res = fit_background(img.view(), &yfit, &params());
        assert!(matches!(res, Err(GrismoError::BackgroundFitDiverged(_))));
    }

    /// Column values alternating in 7 px blocks of `±amp` around `base`, with a 4 px block at
    /// `base` in the middle of every 32 px period. Its cubic fit is nearly flat, so only the
    /// `base` columns (one in eight) lie within the fit error.
    fn blocky(ncols: usize, base: f64, amp: f64) -> Vec<f64> {
        (0..ncols)
            .map(|c| match c % 32 {
                0..=6 | 25..=31 => base + amp,
                7..=13 | 18..=24 => base - amp,
                _ => base,
            })
            .collect()
    }

    fn two_boxes(lower: &[f64], upper: &[f64]) -> Array2<f64> {
        Array2::from_shape_fn((1014, lower.len()), |(r, c)| {
            if r < 500 {
                lower[c]
            } else {
                upper[c]
            }
        })
    }

    #[test]
    fn test_too_few_points_in_both_boxes() {
        let yfit = vec![500.0; 320];
        let img = two_boxes(&blocky(320, 0.5, 40.0), &blocky(320, 0.5, 60.0));
        let res = fit_background(img.view(), &yfit, &params());
        assert_eq!(
            res,
            Err(GrismoError::InsufficientBackgroundPoints {
                lower: 40,
                upper: 40,
                total: 320
            })
        );
    }

    #[test]
    fn test_one_bad_box_falls_back_to_the_other() {
        let yfit = vec![500.0; 320];
        let smooth = vec![0.2; 320];
        let img = two_boxes(&smooth, &blocky(320, 1.0, 40.0));
        let model = fit_background(img.view(), &yfit, &params()).unwrap();
        assert!(model.upper.n_good < 64);
        assert_eq!(model.lower.n_good, 320);
        for b in &model.per_pixel {
            assert_abs_diff_eq!(*b, 0.2, epsilon = 1e-9);
        }

        // and the other way round
        let img = two_boxes(&blocky(320, 1.0, 40.0), &smooth);
        let model = fit_background(img.view(), &yfit, &params()).unwrap();
        assert!(model.lower.n_good < 64);
        assert_abs_diff_eq!(model.per_pixel[160], 0.2, epsilon = 1e-9);
    }

    #[test]
    fn test_sky_flat_scaling() {
        let flat = Array2::from_shape_fn((1014, 50), |(r, _)| 1.0 + 1e-4 * r as f64);
        let img = flat.mapv(|v| 0.8 * v);
        let scaling = scale_sky_flat(img.view(), flat.view(), 6).unwrap();
        assert_abs_diff_eq!(scaling.ratio, 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(scaling.ratio_sigma, 0.0, epsilon = 1e-12);
        let sky = sky_image(img.view(), scaling.scaled_flat.view());
        assert!(sky.iter().all(|v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_sky_background_constant() {
        let sky = Array2::from_elem((1014, 100), 2.0);
        let back = sky_background(sky.view(), &vec![500.0; 100], &params());
        // boxcar zero fill lowers the ends, the centre keeps the full level
        assert_abs_diff_eq!(back[50], 12.0, epsilon = 1e-12);
        assert!(back[0] < 12.0);
    }
}
