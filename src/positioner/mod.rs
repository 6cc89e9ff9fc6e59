//! # Point-source positioner
//!
//! Sub-pixel location of a point source around an approximate position, used for the
//! zeroth order on grism frames and for the target on direct images.
//!
//! ## Estimators
//!
//! Four independent estimators run inside a square search box centred on the integer
//! approximate position:
//!
//! | Method | Module | Principle |
//! |--------|--------|-----------|
//! | [`CentroidMethod::Gaussian1D`] | [`gaussian`] | Gaussian fits of the two marginal sums |
//! | [`CentroidMethod::Gaussian2D`] | [`gaussian`] | Axis-aligned 2-D Gaussian fit |
//! | [`CentroidMethod::CenterOfMass`] | [`moments`] | Median-subtracted centre of mass |
//! | [`CentroidMethod::StarFinder`] | [`star_finder`] | Matched filter, brightest peak |
//!
//! ## Selection
//!
//! The authoritative centroid is the first valid estimate in a fixed priority order:
//! centre of mass first for planetary nebulae (their compact cores bias profile fits),
//! star finder first for everything else. An estimate is valid when its position is
//! positive and its flux is positive.
//!
//! When no estimate is valid the result is flagged not found at `(−1, −1)`. When the
//! chosen position lies further than [`PositionerParams::margin`] from the approximate
//! position the integer approximate position is used instead. The default margin is half
//! the search box: the box estimators always stay inside it, but the star finder searches
//! a wider window (±[`STAR_FINDER_HALF_BOX`](crate::constants::STAR_FINDER_HALF_BOX) px)
//! and its brightest peak may be a neighbouring source outside the box.

pub mod gaussian;
pub mod moments;
pub mod star_finder;

use std::fmt;

use ndarray::{s, Array2, ArrayView2};
use tracing::debug;

use crate::constants::{
    Pixel, CENTROID_BOX, DQ_DIRECT_IMAGE_MASK, NOT_FOUND, STAR_FINDER_HALF_BOX,
};
use crate::exposure::{DirectPosition, ImagePlanes};
use crate::grismo_errors::GrismoError;
use crate::numeric::median;

use gaussian::{fit_gaussian_2d, marginal_fits, LmConfig};
use moments::{center_of_mass, Cutout};
use star_finder::find_brightest;

/// Centroiding estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CentroidMethod {
    Gaussian1D,
    Gaussian2D,
    CenterOfMass,
    StarFinder,
}

impl CentroidMethod {
    pub const ALL: [CentroidMethod; 4] = [
        CentroidMethod::Gaussian1D,
        CentroidMethod::Gaussian2D,
        CentroidMethod::CenterOfMass,
        CentroidMethod::StarFinder,
    ];

    /// Priority order used to pick the authoritative estimate.
    pub fn priority(planetary_nebula: bool) -> [CentroidMethod; 4] {
        use CentroidMethod::*;
        if planetary_nebula {
            [CenterOfMass, Gaussian2D, Gaussian1D, StarFinder]
        } else {
            [StarFinder, CenterOfMass, Gaussian2D, Gaussian1D]
        }
    }
}

impl fmt::Display for CentroidMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CentroidMethod::Gaussian1D => "gaussian-1d",
            CentroidMethod::Gaussian2D => "gaussian-2d",
            CentroidMethod::CenterOfMass => "center-of-mass",
            CentroidMethod::StarFinder => "star-finder",
        };
        f.write_str(name)
    }
}

/// Position returned by one estimator, in image pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CentroidEstimate {
    pub method: CentroidMethod,
    pub x: Pixel,
    pub y: Pixel,
    pub flux: f64,
}

impl CentroidEstimate {
    pub fn is_valid(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.flux.is_finite()
            && self.x > 0.0
            && self.y > 0.0
            && self.flux > 0.0
    }
}

/// Authoritative source position of an exposure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Centroid {
    pub x: Pixel,
    pub y: Pixel,
    /// `x` minus the approximate position
    pub x_err: Pixel,
    /// `y` minus the approximate position
    pub y_err: Pixel,
    /// Estimator that produced the position, `None` for the approximate fallback or a
    /// manual position
    pub method: Option<CentroidMethod>,
    pub found: bool,
}

impl Centroid {
    pub fn not_found() -> Self {
        Centroid {
            x: NOT_FOUND,
            y: NOT_FOUND,
            x_err: 0.0,
            y_err: 0.0,
            method: None,
            found: false,
        }
    }

    fn at(x: Pixel, y: Pixel, approx: (Pixel, Pixel), method: Option<CentroidMethod>) -> Self {
        Centroid {
            x,
            y,
            x_err: x - approx.0,
            y_err: y - approx.1,
            method,
            found: true,
        }
    }
}

/// Tuning of the positioner.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionerParams {
    /// Side of the search box (px)
    pub box_size: usize,
    /// Largest accepted distance from the approximate position on either axis (px).
    /// Rejects star-finder peaks that fall outside the search box.
    pub margin: Pixel,
    /// Detection threshold of the star finder (filtered counts)
    pub threshold: f64,
    /// Expected FWHM of the source (px)
    pub fwhm: f64,
    /// Half side of the star-finder sub-image (px)
    pub finder_half_box: usize,
    pub lm: LmConfig,
}

impl Default for PositionerParams {
    fn default() -> Self {
        PositionerParams {
            box_size: CENTROID_BOX,
            margin: (CENTROID_BOX / 2) as f64,
            threshold: 10.0,
            fwhm: 2.0,
            finder_half_box: STAR_FINDER_HALF_BOX,
            lm: LmConfig::default(),
        }
    }
}

/// Every estimate of one search together with the automatic choice.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionReport {
    pub approx: (Pixel, Pixel),
    pub estimates: Vec<CentroidEstimate>,
    pub automatic: Centroid,
}

impl PositionReport {
    pub fn estimate(&self, method: CentroidMethod) -> Option<&CentroidEstimate> {
        self.estimates.iter().find(|e| e.method == method)
    }

    /// Centroid built from a specific estimator, if it produced a valid estimate.
    pub fn centroid_from(&self, method: CentroidMethod) -> Option<Centroid> {
        self.estimate(method)
            .filter(|e| e.is_valid())
            .map(|e| Centroid::at(e.x, e.y, self.approx, Some(method)))
    }

    /// Centroid at a position chosen outside the estimators.
    pub fn manual(&self, x: Pixel, y: Pixel) -> Centroid {
        Centroid::at(x, y, self.approx, None)
    }
}

/// Run all estimators around `approx` and select the authoritative centroid.
pub fn locate(
    image: ArrayView2<f64>,
    approx: (Pixel, Pixel),
    planetary_nebula: bool,
    params: &PositionerParams,
) -> PositionReport {
    let xi = approx.0.round() as i64;
    let yi = approx.1.round() as i64;

    let mut estimates = Vec::with_capacity(4);
    if let Some(cut) = Cutout::around(image, xi, yi, params.box_size / 2) {
        if let Some((gx, gy)) = marginal_fits(cut.data, &params.lm) {
            let (x, y) = cut.to_image(gx.center, gy.center);
            estimates.push(CentroidEstimate {
                method: CentroidMethod::Gaussian1D,
                x,
                y,
                flux: gx.amplitude.min(gy.amplitude),
            });
        }
        if let Some(g) = fit_gaussian_2d(cut.data, &params.lm) {
            let (x, y) = cut.to_image(g.x, g.y);
            estimates.push(CentroidEstimate {
                method: CentroidMethod::Gaussian2D,
                x,
                y,
                flux: 2.0 * std::f64::consts::PI * g.amplitude * g.sigma_x * g.sigma_y,
            });
        }
        if let Some((x, y, flux)) = center_of_mass(cut.data) {
            let (x, y) = cut.to_image(x, y);
            estimates.push(CentroidEstimate {
                method: CentroidMethod::CenterOfMass,
                x,
                y,
                flux,
            });
        }
    }
    if let Some(cut) = Cutout::around(image, xi, yi, params.finder_half_box) {
        if let Some(det) = find_brightest(cut.data, params.fwhm, params.threshold) {
            let (x, y) = cut.to_image(det.x, det.y);
            estimates.push(CentroidEstimate {
                method: CentroidMethod::StarFinder,
                x,
                y,
                flux: det.peak,
            });
        }
    }

    for e in &estimates {
        debug!(method = %e.method, x = e.x, y = e.y, flux = e.flux, "centroid estimate");
    }

    let chosen = CentroidMethod::priority(planetary_nebula)
        .into_iter()
        .find_map(|m| estimates.iter().find(|e| e.method == m && e.is_valid()));

    let automatic = match chosen {
        None => Centroid::not_found(),
        Some(e)
            if (e.x - xi as f64).abs() > params.margin
                || (e.y - yi as f64).abs() > params.margin =>
        {
            debug!(
                method = %e.method,
                x = e.x,
                y = e.y,
                "centroid outside the search margin, keeping the approximate position"
            );
            Centroid::at(xi as f64, yi as f64, approx, None)
        }
        Some(e) => Centroid::at(e.x, e.y, approx, Some(e.method)),
    };

    PositionReport {
        approx,
        estimates,
        automatic,
    }
}

/// Blank border rows at the bottom and top of a direct image.
const DIRECT_BORDER_ROWS: (usize, usize) = (20, 30);
/// Blank border columns at the left and right of a direct image.
const DIRECT_BORDER_COLS: (usize, usize) = (10, 10);
/// Half width of the window kept around the predicted target position.
const DIRECT_WINDOW: i64 = 35;
/// Side of the box the target centroid is measured in.
const DIRECT_BOX: usize = 22;

/// Locate the target on a direct (imaging) exposure.
///
/// `predicted` is the position of the target from the sky transform; `star` optionally
/// forces the search centre. The returned errors are measured minus predicted.
///
/// Return
/// ------
/// * [`GrismoError::CentroidNotFound`] when the predicted position is within three
///   pixels of the left or right edge, or when the box holds no flux.
pub fn locate_direct_image(
    planes: &ImagePlanes,
    predicted: (Pixel, Pixel),
    star: (Option<Pixel>, Option<Pixel>),
) -> Result<DirectPosition, GrismoError> {
    let (nrows, ncols) = planes.shape();
    let (xastr, yastr) = predicted;
    let mut xappr = xastr.round() as i64;
    let mut yappr = yastr.round() as i64;

    if star.0.is_none() && star.1.is_none() && (xappr <= 3 || xappr >= ncols as i64 - 4) {
        return Err(GrismoError::CentroidNotFound(format!(
            "target predicted at the detector edge (x = {xastr:.1})"
        )));
    }
    if let Some(x) = star.0 {
        xappr = x.round() as i64;
    }
    if let Some(y) = star.1 {
        yappr = y.round() as i64;
    }

    let mut data = planes.sci.clone();
    data.zip_mut_with(&planes.dq, |v, &dq| {
        if dq & DQ_DIRECT_IMAGE_MASK != 0 {
            *v = 0.0;
        }
    });

    let clamp = |v: i64, n: usize| v.clamp(0, n as i64) as usize;
    let keep_x = (clamp(xappr - DIRECT_WINDOW, ncols), clamp(xappr + DIRECT_WINDOW, ncols - 1));
    let keep_y = (clamp(yappr - DIRECT_WINDOW, nrows), clamp(yappr + DIRECT_WINDOW, nrows - 1));
    let keep_x = (
        keep_x.0.max(DIRECT_BORDER_COLS.0),
        keep_x.1.min(ncols.saturating_sub(DIRECT_BORDER_COLS.1)),
    );
    let keep_y = (
        keep_y.0.max(DIRECT_BORDER_ROWS.0),
        keep_y.1.min(nrows.saturating_sub(DIRECT_BORDER_ROWS.1)),
    );
    data.indexed_iter_mut().for_each(|((r, c), v)| {
        if r < keep_y.0 || r >= keep_y.1 || c < keep_x.0 || c >= keep_x.1 {
            *v = 0.0;
        }
    });

    let smoothed = median_filter_3x3(data.view());
    let (ypos, xpos) = smoothed
        .indexed_iter()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(p, _)| p)
        .ok_or_else(|| GrismoError::CentroidNotFound("empty direct image".into()))?;

    let x1 = xpos.saturating_sub(10);
    let x2 = (x1 + DIRECT_BOX).min(ncols - 1);
    let y1 = ypos.saturating_sub(10);
    let y2 = (y1 + DIRECT_BOX).min(nrows - 1);
    let mut sub = data.slice(s![y1..y2, x1..x2]).to_owned();
    let level = median(&sub.iter().cloned().collect::<Vec<_>>());
    sub.mapv_inplace(|v| v - level);
    let cut = sub.iter().cloned().fold(f64::NEG_INFINITY, f64::max) / 5.0;
    sub.mapv_inplace(|v| (v - cut).max(0.0));

    let xs: Vec<f64> = (x1..x2).map(|v| v as f64).collect();
    let ys: Vec<f64> = (y1..y2).map(|v| v as f64).collect();
    let xprofile: Vec<f64> = sub.columns().into_iter().map(|c| c.sum()).collect();
    let yprofile: Vec<f64> = sub.rows().into_iter().map(|r| r.sum()).collect();
    let no_flux = || GrismoError::CentroidNotFound("no flux in the direct-image box".into());
    let xc = crate::numeric::weighted_centroid(&xs, &xprofile).ok_or_else(no_flux)?;
    let yc = crate::numeric::weighted_centroid(&ys, &yprofile).ok_or_else(no_flux)?;

    Ok(DirectPosition {
        xc,
        yc,
        xerr: xc - xastr,
        yerr: yc - yastr,
    })
}

/// 3 × 3 median filter with zero padding.
fn median_filter_3x3(image: ArrayView2<f64>) -> Array2<f64> {
    let (nrows, ncols) = image.dim();
    let mut window = Vec::with_capacity(9);
    Array2::from_shape_fn((nrows, ncols), |(r, c)| {
        window.clear();
        for dr in -1i64..=1 {
            for dc in -1i64..=1 {
                let rr = r as i64 + dr;
                let cc = c as i64 + dc;
                let inside = rr >= 0 && cc >= 0 && (rr as usize) < nrows && (cc as usize) < ncols;
                window.push(if inside {
                    image[[rr as usize, cc as usize]]
                } else {
                    0.0
                });
            }
        }
        median(&window)
    })
}
