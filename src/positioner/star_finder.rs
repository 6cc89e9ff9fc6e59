//! Matched-filter point-source finder.
//!
//! The image is convolved with a zero-sum Gaussian kernel of the requested FWHM, local
//! maxima of the filtered image above the detection threshold are collected and the
//! brightest one is refined with 1-D Gaussian fits of the marginal sums in a small window.

use ndarray::{s, Array2, ArrayView2};

use super::gaussian::{fit_gaussian_1d, LmConfig};
use crate::constants::Pixel;

const FWHM_TO_SIGMA: f64 = 2.354_820_045;

/// Half width of the window used to refine a detection.
const REFINE_HALF: usize = 3;

/// One detection, positions relative to the searched image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub x: Pixel,
    pub y: Pixel,
    /// Peak of the filtered image
    pub peak: f64,
}

/// Zero-sum Gaussian kernel normalised so that a matching Gaussian of amplitude `A`
/// filters to `A`.
fn kernel(fwhm: f64) -> Array2<f64> {
    let sigma = fwhm / FWHM_TO_SIGMA;
    let radius = ((1.5 * sigma) as usize).max(2);
    let size = 2 * radius + 1;
    let r = radius as f64;
    let g = Array2::from_shape_fn((size, size), |(i, j)| {
        let dy = i as f64 - r;
        let dx = j as f64 - r;
        (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
    });
    let mean = g.mean().unwrap_or(0.0);
    let centered = g.mapv(|v| v - mean);
    let norm = centered.mapv(|v| v * v).sum();
    centered / norm
}

/// Correlate `image` with `kernel` where the kernel fits entirely; the border is left at
/// `-inf` so that no detection can land there.
fn filter(image: ArrayView2<f64>, kernel: &Array2<f64>) -> Array2<f64> {
    let (nrows, ncols) = image.dim();
    let r = kernel.nrows() / 2;
    let mut out = Array2::from_elem((nrows, ncols), f64::NEG_INFINITY);
    if nrows <= 2 * r || ncols <= 2 * r {
        return out;
    }
    for row in r..nrows - r {
        for col in r..ncols - r {
            let window = image.slice(s![row - r..=row + r, col - r..=col + r]);
            out[[row, col]] = (&window * kernel).sum();
        }
    }
    out
}

/// Brightest local maximum of the filtered image above `threshold`.
pub fn find_brightest(image: ArrayView2<f64>, fwhm: f64, threshold: f64) -> Option<Detection> {
    let filtered = filter(image, &kernel(fwhm));
    let (nrows, ncols) = filtered.dim();
    let mut best: Option<(usize, usize, f64)> = None;

    for row in 1..nrows.saturating_sub(1) {
        for col in 1..ncols.saturating_sub(1) {
            let v = filtered[[row, col]];
            if !(v > threshold) {
                continue;
            }
            let neighbours = filtered.slice(s![row - 1..=row + 1, col - 1..=col + 1]);
            let is_peak = neighbours
                .indexed_iter()
                .all(|((i, j), &n)| (i, j) == (1, 1) || n < v);
            if is_peak && best.map_or(true, |(_, _, b)| v > b) {
                best = Some((row, col, v));
            }
        }
    }

    let (row, col, peak) = best?;
    let (x, y) = refine(image, row, col);
    Some(Detection { x, y, peak })
}

/// Sub-pixel position of a peak from Gaussian fits of the window marginals; the peak
/// pixel itself is kept on any axis whose fit fails or wanders out of the window.
fn refine(image: ArrayView2<f64>, row: usize, col: usize) -> (Pixel, Pixel) {
    let (nrows, ncols) = image.dim();
    let r0 = row.saturating_sub(REFINE_HALF);
    let c0 = col.saturating_sub(REFINE_HALF);
    let r1 = (row + REFINE_HALF + 1).min(nrows);
    let c1 = (col + REFINE_HALF + 1).min(ncols);
    let window = image.slice(s![r0..r1, c0..c1]);
    let config = LmConfig::default();

    let axis_fit = |sums: Vec<f64>, start: usize, peak: usize| {
        let pos: Vec<f64> = (start..start + sums.len()).map(|v| v as f64).collect();
        fit_gaussian_1d(&pos, &sums, &config)
            .map(|g| g.center)
            .filter(|c| (c - peak as f64).abs() <= REFINE_HALF as f64)
            .unwrap_or(peak as f64)
    };
    let x = axis_fit(
        window.columns().into_iter().map(|c| c.sum()).collect(),
        c0,
        col,
    );
    let y = axis_fit(window.rows().into_iter().map(|r| r.sum()).collect(), r0, row);
    (x, y)
}
