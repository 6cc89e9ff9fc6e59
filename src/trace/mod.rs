//! # Trace fitting
//!
//! Finds where the dispersed spectrum runs across the detector.
//!
//! An approximate trace is drawn from the zeroth-order position with the mean angle of the
//! dispersion solution. For each of the −1, +1 and +2 orders, the columns whose stitched
//! wavelength falls in the order's search range are collapsed into a cross-dispersion
//! profile inside a `ywidth`-high box around the approximate trace; the flux-weighted
//! centroid of the three pixels around the profile peak is the order's position. A straight
//! line through the zeroth order and the found orders is the trace.
//!
//! When the angle is forced, the profile is measured along the approximate trace instead
//! and the line is only shifted.

pub mod extract;

use std::collections::BTreeMap;

use ndarray::{s, Array2, ArrayView2};
use tracing::{debug, warn};

use crate::constants::{
    Angstrom, Degree, Pixel, Radian, SpectralOrder, MIN_ORDER_PIXELS, MIN_PROFILE_PEAK,
    ORDER_END_LIMIT, ORDER_NOT_FOUND, ORDER_START_LIMIT,
};
use crate::grismo_errors::GrismoError;
use crate::numeric::{fit_line, mean, median, median_filter_keep_edges};
use crate::params::ExtractParams;

/// Width of the row median filter applied before building profiles.
const ROW_FILTER: usize = 7;
/// Unfiltered columns kept at each end of a row.
const ROW_FILTER_EDGE: usize = 4;
/// Smallest column accepted as an order position.
const MIN_ORDER_X: Pixel = 4.0;
/// Order positions further left than this are ignored by the line fit.
const MIN_FIT_X: Pixel = -500.0;

/// Inputs of the trace fit.
#[derive(Debug, Clone)]
pub struct TraceInput<'a> {
    /// Background-subtracted (and possibly flatfielded) science image
    pub image: ArrayView2<'a, f64>,
    /// Stitched wavelength of every column
    pub wave: &'a [Angstrom],
    /// Zeroth-order position, found or predicted
    pub zeroth: (Pixel, Pixel),
    /// The zeroth order was not located and the aXe solution is in use
    pub axe: bool,
    /// Mean trace angle of the dispersion solution
    pub angle: Radian,
    pub planetary_nebula: bool,
}

/// Position of one spectral order on the detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderPosition {
    /// Signed order number, 0 for the zeroth order
    pub order: i32,
    pub x: Pixel,
    pub y: Pixel,
}

/// Straight-line trace `y = intercept + slope · x`.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFit {
    pub intercept: Pixel,
    pub slope: f64,
    /// `atan(slope)`
    pub angle: Degree,
    /// Trace row at every column
    pub yfit: Vec<Pixel>,
    /// Order positions the line was fit to, empty for a forced angle
    pub positions: Vec<OrderPosition>,
    pub fixed_slope: bool,
    /// Soft failures met while searching the orders
    pub notes: Vec<String>,
}

impl TraceFit {
    fn from_line(
        intercept: Pixel,
        slope: f64,
        ncols: usize,
        positions: Vec<OrderPosition>,
        fixed_slope: bool,
        notes: Vec<String>,
    ) -> Self {
        TraceFit {
            intercept,
            slope,
            angle: slope.atan().to_degrees(),
            yfit: (0..ncols).map(|x| intercept + slope * x as f64).collect(),
            positions,
            fixed_slope,
            notes,
        }
    }

    pub fn y_at(&self, x: Pixel) -> Pixel {
        self.intercept + self.slope * x
    }
}

/// Approximate trace row at every column, drawn from the zeroth order with `angle`.
pub fn approximate_trace(
    ncols: usize,
    zeroth: (Pixel, Pixel),
    angle: Radian,
    params: &ExtractParams,
) -> Vec<Pixel> {
    let (xc, yc) = zeroth;
    let slope = angle.sin() + params.yshift;
    (0..ncols)
        .map(|x| yc + params.y_offset + (x as f64 - xc) * slope)
        .collect()
}

/// Row-wise running median used to suppress isolated hot pixels in the profiles.
pub fn filter_rows(image: ArrayView2<f64>) -> Array2<f64> {
    let mut out = image.to_owned();
    for (mut dst, src) in out.rows_mut().into_iter().zip(image.rows()) {
        let row = src.to_vec();
        let keep = ROW_FILTER_EDGE.min(row.len() / 2);
        let filtered = median_filter_keep_edges(&row, ROW_FILTER, keep);
        dst.iter_mut().zip(filtered).for_each(|(d, v)| *d = v);
    }
    out
}

/// Fit the trace of a grism exposure.
///
/// With a forced slope in `params` the multi-order search is skipped.
///
/// Return
/// ------
/// * [`GrismoError::CannotFitTraceAngle`] when fewer than two order positions survive.
pub fn fit_trace(input: &TraceInput, params: &ExtractParams) -> Result<TraceFit, GrismoError> {
    let (_, ncols) = input.image.dim();
    if input.wave.len() != ncols {
        return Err(GrismoError::InvalidParameter(format!(
            "wavelength array has {} columns, image {ncols}",
            input.wave.len()
        )));
    }
    let fimage = filter_rows(input.image);

    match params.slope {
        Some(slope) => {
            let angle = slope.to_radians();
            let yapprox = approximate_trace(ncols, input.zeroth, angle, params);
            Ok(fit_fixed_slope(fimage.view(), &yapprox, params))
        }
        None => {
            let yapprox = approximate_trace(ncols, input.zeroth, input.angle, params);
            fit_orders(input, fimage.view(), &yapprox, params)
        }
    }
}

/// Result of the profile search of one order.
struct ProfileSearch {
    y: Pixel,
    y1: usize,
    y2: usize,
    note: Option<String>,
}

/// Collapse `fimage[y1..=y2, x1..=x2]` into a profile and centroid its peak, shifting the
/// box and retrying when nothing is found.
fn search_profile(
    fimage: ArrayView2<f64>,
    (x1, x2): (usize, usize),
    (mut y1, mut y2): (usize, usize),
    planetary_nebula: bool,
    params: &ExtractParams,
) -> ProfileSearch {
    let nrows = fimage.nrows();
    let ywidth = params.ywidth;
    let mut note = None;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let mut profile: Vec<f64> = (y1..=y2)
            .map(|row| fimage.slice(s![row, x1..=x2]).sum())
            .collect();
        let level = median(&profile);
        profile.iter_mut().for_each(|p| *p = (*p - level).max(0.0));
        if planetary_nebula && profile.len() > 1 {
            let last = profile.len() - 1;
            profile[0] = 0.0;
            profile[last] = 0.0;
        }

        let (maxpos, pmax) = profile
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &v)| {
                if v > bv {
                    (i, v)
                } else {
                    (bi, bv)
                }
            });

        let y = if !(pmax > 0.0) {
            note = Some(
                GrismoError::ProfileNotPositive(format!("rows {y1}..={y2}, attempt {attempt}"))
                    .to_string(),
            );
            ORDER_NOT_FOUND
        } else if maxpos == 0 || pmax <= MIN_PROFILE_PEAK {
            ORDER_NOT_FOUND
        } else {
            let hi = (maxpos + 1).min(profile.len() - 1);
            let weights = &profile[maxpos - 1..=hi];
            let rows = (maxpos - 1..=hi).map(|j| (y1 + j) as f64);
            rows.zip(weights).map(|(r, w)| r * w).sum::<f64>() / weights.iter().sum::<f64>()
        };

        if y != ORDER_NOT_FOUND || attempt > params.max_profile_retries {
            return ProfileSearch { y, y1, y2, note };
        }

        let step = ywidth.saturating_sub(3);
        y1 = if maxpos == 0 {
            y1.saturating_sub(step)
        } else {
            (y1 + step).min(nrows.saturating_sub(ywidth + 1))
        };
        y2 = (y1 + ywidth - 1).min(nrows - 1);
        debug!(attempt, y1, y2, "profile peak not found, shifting the search box");
    }
}

fn fit_orders(
    input: &TraceInput,
    fimage: ArrayView2<f64>,
    yapprox: &[Pixel],
    params: &ExtractParams,
) -> Result<TraceFit, GrismoError> {
    let (nrows, ncols) = fimage.dim();
    let (xc, yc) = input.zeroth;
    let mut notes = Vec::new();

    let mut found: BTreeMap<i32, (Pixel, Pixel)> = BTreeMap::new();
    found.insert(0, (xc, if input.axe { -yc } else { yc }));
    let mut bins: BTreeMap<i32, (usize, usize)> = BTreeMap::new();
    let mut y1pred = 0.0;

    for order in SpectralOrder::ALL {
        let (low, high) = params.order_range(order).stitched(order);
        let xrang: Vec<usize> = (0..ncols)
            .filter(|&x| input.wave[x] >= low && input.wave[x] <= high)
            .collect();
        let (Some(&x1), Some(&last)) = (xrang.first(), xrang.last()) else {
            notes.push(format!("order {order} not on the detector"));
            continue;
        };
        if x1 >= ORDER_START_LIMIT || xrang.len() < MIN_ORDER_PIXELS {
            notes.push(format!(
                "order {order} has {} usable columns from column {x1}",
                xrang.len()
            ));
            continue;
        }
        let x2 = last.min(ORDER_END_LIMIT).min(ncols - 1);
        let xf = mean(&xrang.iter().map(|&x| x as f64).collect::<Vec<_>>());
        let mid = (x1 + x2) / 2;

        let half = (params.ywidth / 2) as i64;
        let mut y1 = (yapprox[mid].round() as i64 - half).max(0);
        let mut y2 = (y1 + params.ywidth as i64 - 1).min(nrows as i64 - 1);
        match order {
            SpectralOrder::Plus1 => y1pred = yapprox[mid],
            SpectralOrder::Plus2 => {
                if let (Some(&(_, yf1)), Some(&(b1, b2))) = (found.get(&1), bins.get(&1)) {
                    if yf1 >= 0.0 {
                        let ydel = yf1 - yapprox[(b1 + b2) / 2];
                        y1 = (y1 as f64 + ydel).round() as i64;
                        y2 = (y2 as f64 + ydel).round() as i64;
                    }
                }
            }
            SpectralOrder::Minus1 => {}
        }
        let y1 = y1.clamp(0, nrows as i64 - 1) as usize;
        let y2 = y2.clamp(y1 as i64, nrows as i64 - 1) as usize;

        let search = search_profile(
            fimage,
            (x1, x2),
            (y1, y2),
            input.planetary_nebula,
            params,
        );
        if let Some(note) = search.note {
            notes.push(format!("order {order}: {note}"));
        }
        bins.insert(order.number(), (x1, x2));
        if search.y == ORDER_NOT_FOUND {
            warn!(%order, "order not found in its search box");
            notes.push(
                GrismoError::OrderNotFound(format!("order {order} in its search box")).to_string(),
            );
        }
        found.insert(order.number(), (xf, search.y));

        if order == SpectralOrder::Minus1 && input.planetary_nebula {
            let window = input.image.slice(s![search.y1..=search.y2, x1..=x2]);
            if let Some(((row, col), _)) = window
                .indexed_iter()
                .max_by(|a, b| a.1.total_cmp(b.1))
            {
                found.insert(-1, ((x1 + col) as f64, (search.y1 + row) as f64));
            }
        }
        debug!(%order, x1, x2, xf, y = found[&order.number()].1, "order searched");
    }

    let valid_count = found
        .values()
        .filter(|(x, y)| *x >= MIN_ORDER_X && *y >= 0.0)
        .count();
    if valid_count == 1 {
        if let (Some(&(_, yp1)), Some(&(x0, y0))) = (found.get(&1), found.get(&0)) {
            if yp1 >= 0.0 {
                found.insert(0, (x0, y0.abs() + (yp1 - y1pred)));
            }
        }
    }

    let mut good: Vec<i32> = found
        .iter()
        .filter(|(_, (x, y))| *x >= MIN_FIT_X && *y != 0.0 && *y != ORDER_NOT_FOUND)
        .map(|(k, _)| *k)
        .collect();
    if good.len() <= 1 {
        return Err(GrismoError::CannotFitTraceAngle(format!(
            "{} usable order position(s)",
            good.len()
        )));
    }
    if good.len() >= 3 && input.axe {
        good.retain(|k| found[k].1 > 0.0);
    } else {
        for (_, (_, y)) in found.iter_mut() {
            *y = y.abs();
        }
    }
    if good.len() <= 1 {
        return Err(GrismoError::CannotFitTraceAngle(format!(
            "{} usable order position(s)",
            good.len()
        )));
    }

    let positions: Vec<OrderPosition> = good
        .iter()
        .map(|k| OrderPosition {
            order: *k,
            x: found[k].0,
            y: found[k].1,
        })
        .collect();
    let xs: Vec<f64> = positions.iter().map(|p| p.x).collect();
    let ys: Vec<f64> = positions.iter().map(|p| p.y).collect();
    let (intercept, slope) = fit_line(&xs, &ys)?;
    debug!(intercept, slope, orders = ?good, "trace fit");

    Ok(TraceFit::from_line(
        intercept, slope, ncols, positions, false, notes,
    ))
}

/// Linear interpolation of column `x` at fractional row `y`, clamped to the image.
fn sample_column(image: ArrayView2<f64>, x: usize, y: f64) -> f64 {
    let last = image.nrows() as f64 - 1.0;
    let y = y.clamp(0.0, last);
    let r0 = y.floor() as usize;
    let r1 = (r0 + 1).min(image.nrows() - 1);
    let t = y - r0 as f64;
    image[[r0, x]] * (1.0 - t) + image[[r1, x]] * t
}

fn fit_fixed_slope(fimage: ArrayView2<f64>, yapprox: &[Pixel], params: &ExtractParams) -> TraceFit {
    let ncols = fimage.ncols();
    let mut notes = Vec::new();
    let yoff: Vec<f64> = (0..params.ywidth)
        .map(|i| i as f64 - params.ywidth as f64 / 2.0)
        .collect();
    let mut profile: Vec<f64> = yoff
        .iter()
        .map(|dy| {
            (0..ncols)
                .map(|x| sample_column(fimage, x, yapprox[x] + dy))
                .sum()
        })
        .collect();
    let level = median(&profile);
    profile.iter_mut().for_each(|p| *p -= level);
    let cut = profile.iter().cloned().fold(f64::NEG_INFINITY, f64::max) / 4.0;
    profile.iter_mut().for_each(|p| *p = (*p - cut).max(0.0));

    let total: f64 = profile.iter().sum();
    let ycent = if total > 0.0 {
        profile.iter().zip(&yoff).map(|(p, y)| p * y).sum::<f64>() / total
    } else {
        notes.push("no profile along the forced-slope trace, keeping the approximate trace".into());
        0.0
    };

    // the shifted approximate trace is itself a line
    let slope = if ncols > 1 {
        (yapprox[ncols - 1] - yapprox[0]) / (ncols - 1) as f64
    } else {
        0.0
    };
    let intercept = yapprox.first().copied().unwrap_or(0.0) + ycent;
    debug!(ycent, intercept, slope, "trace with forced slope");
    TraceFit::from_line(intercept, slope, ncols, Vec::new(), true, notes)
}
