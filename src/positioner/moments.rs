use ndarray::{s, ArrayView2};

use crate::constants::Pixel;
use crate::numeric::{median, weighted_centroid};

/// Square sub-image of an exposure with the full-image position of its first pixel.
#[derive(Debug, Clone)]
pub struct Cutout<'a> {
    pub data: ArrayView2<'a, f64>,
    /// Column of `data[[.., 0]]` in the parent image
    pub x0: usize,
    /// Row of `data[[0, ..]]` in the parent image
    pub y0: usize,
}

impl<'a> Cutout<'a> {
    /// Box of `2·half + 1` pixels centred on the integer pixel `(xc, yc)`, clipped to
    /// the image. `None` when the centre lies outside the image.
    pub fn around(image: ArrayView2<'a, f64>, xc: i64, yc: i64, half: usize) -> Option<Self> {
        let (nrows, ncols) = image.dim();
        if xc < 0 || yc < 0 || xc as usize >= ncols || yc as usize >= nrows {
            return None;
        }
        let half = half as i64;
        let x0 = (xc - half).max(0) as usize;
        let y0 = (yc - half).max(0) as usize;
        let x1 = ((xc + half + 1) as usize).min(ncols);
        let y1 = ((yc + half + 1) as usize).min(nrows);
        Some(Cutout {
            data: image.slice_move(s![y0..y1, x0..x1]),
            x0,
            y0,
        })
    }

    /// Parent-image position of a cutout-relative position.
    pub fn to_image(&self, x: Pixel, y: Pixel) -> (Pixel, Pixel) {
        (x + self.x0 as f64, y + self.y0 as f64)
    }
}

/// Intensity-weighted centre of mass of the cutout after removing its median level.
///
/// Returns the cutout-relative `(x, y)` and the summed background-subtracted flux, or
/// `None` when nothing is left above the median.
pub fn center_of_mass(cutout: ArrayView2<f64>) -> Option<(Pixel, Pixel, f64)> {
    let values: Vec<f64> = cutout.iter().cloned().collect();
    let level = median(&values);
    if !level.is_finite() {
        return None;
    }
    let weights = cutout.mapv(|v| (v - level).max(0.0));
    let flux = weights.sum();
    if !(flux > 0.0) {
        return None;
    }

    let xs: Vec<f64> = (0..cutout.ncols()).map(|v| v as f64).collect();
    let ys: Vec<f64> = (0..cutout.nrows()).map(|v| v as f64).collect();
    let col_sums: Vec<f64> = weights.columns().into_iter().map(|c| c.sum()).collect();
    let row_sums: Vec<f64> = weights.rows().into_iter().map(|r| r.sum()).collect();
    Some((
        weighted_centroid(&xs, &col_sums)?,
        weighted_centroid(&ys, &row_sums)?,
        flux,
    ))
}
