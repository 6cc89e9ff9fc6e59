//! # Box extraction
//!
//! Sums a `gwidth`-high box centred on the fitted trace in every column. The box edges
//! generally fall inside a pixel: the full pixels strictly between the two edge pixels
//! are summed, and the edge pixels contribute with the fraction of their height inside
//! the box. Errors add in quadrature with the same weights.
//!
//! Before summing, pixels of the box flagged with one of the repair bits are replaced
//! by the mean of their left and right neighbours (never in the first or last column).
//! The exposure time of a column is the flux-weighted mean of the time plane, using the
//! positive part of the unrepaired image as weights.

use ndarray::Array2;
use tracing::debug;

use crate::constants::{Angstrom, Degree, Grating, Pixel};
use crate::dispersion::SolutionKind;
use crate::exposure::ImagePlanes;
use crate::grismo_errors::GrismoError;
use crate::params::ProcessingOrder;

/// Per-column sums of the extraction box.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSums {
    pub flux: Vec<f64>,
    pub err: Vec<f64>,
    pub dq: Vec<u32>,
    pub time: Vec<f64>,
}

/// Background terms measured along the trace, one value per column.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BackgroundColumns {
    /// Residual background summed over the extraction height
    pub residual: Vec<f64>,
    /// Sky background summed over the extraction height
    pub sky: Vec<f64>,
    /// Median of the lower background box
    pub lower: Vec<f64>,
    /// Median of the upper background box
    pub upper: Vec<f64>,
}

/// Provenance of an extracted spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionMetadata {
    pub root: String,
    pub target: String,
    pub grating: Grating,
    pub direct_image: Option<String>,
    /// Direct-image position the zeroth order was predicted from
    pub xc: Pixel,
    pub yc: Pixel,
    pub xerr: Pixel,
    pub yerr: Pixel,
    /// Reference position of the dispersion solution
    pub zeroth: (Pixel, Pixel),
    /// The zeroth order was located on the exposure
    pub zeroth_found: bool,
    pub solution: SolutionKind,
    pub avgbkg: f64,
    pub flatfield: String,
    pub sky_flat: String,
    pub trace_intercept: Pixel,
    pub trace_slope: f64,
    pub angle: Degree,
    pub gwidth: usize,
    pub bwidth: usize,
    pub ubdist: Pixel,
    pub lbdist: Pixel,
    pub bmedian: usize,
    pub bmean1: usize,
    pub bmean2: usize,
    pub wl_offset: Angstrom,
    pub processing_order: ProcessingOrder,
}

/// One-dimensional spectrum of an exposure, indexed by readout column.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedSpectrum {
    pub x: Vec<usize>,
    pub y_fit: Vec<Pixel>,
    pub wavelength: Vec<Angstrom>,
    pub net: Vec<f64>,
    /// `net` plus both background terms
    pub gross: Vec<f64>,
    pub background: Vec<f64>,
    pub dq: Vec<u32>,
    pub err: Vec<f64>,
    pub background_lower: Vec<f64>,
    pub background_upper: Vec<f64>,
    pub time: Vec<f64>,
    pub metadata: ExtractionMetadata,
}

impl ExtractedSpectrum {
    /// Assemble the spectrum from the column sums and the background terms.
    pub fn new(
        wavelength: Vec<Angstrom>,
        y_fit: Vec<Pixel>,
        sums: ColumnSums,
        background: BackgroundColumns,
        metadata: ExtractionMetadata,
    ) -> Result<Self, GrismoError> {
        let n = wavelength.len();
        let lengths = [
            y_fit.len(),
            sums.flux.len(),
            sums.err.len(),
            sums.dq.len(),
            sums.time.len(),
            background.residual.len(),
            background.sky.len(),
            background.lower.len(),
            background.upper.len(),
        ];
        if lengths.iter().any(|&l| l != n) {
            return Err(GrismoError::InvalidParameter(format!(
                "spectrum columns disagree in length: wavelength {n}, others {lengths:?}"
            )));
        }

        let total_back: Vec<f64> = background
            .residual
            .iter()
            .zip(&background.sky)
            .map(|(r, s)| r + s)
            .collect();
        let gross = sums
            .flux
            .iter()
            .zip(&total_back)
            .map(|(f, b)| f + b)
            .collect();

        Ok(ExtractedSpectrum {
            x: (0..n).collect(),
            y_fit,
            wavelength,
            net: sums.flux,
            gross,
            background: total_back,
            dq: sums.dq,
            err: sums.err,
            background_lower: background.lower,
            background_upper: background.upper,
            time: sums.time,
            metadata,
        })
    }

    pub fn len(&self) -> usize {
        self.wavelength.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelength.is_empty()
    }

    /// Smallest and largest wavelength of the spectrum.
    pub fn wavelength_span(&self) -> Option<(Angstrom, Angstrom)> {
        let first = *self.wavelength.first()?;
        Some(
            self.wavelength
                .iter()
                .fold((first, first), |(lo, hi), &w| (lo.min(w), hi.max(w))),
        )
    }
}

/// Sum the extraction box along `yfit` in every column.
///
/// `image` is the background-subtracted science plane; it is repaired in place. Errors,
/// data quality and exposure times come from `planes`.
pub fn extract_columns(
    image: &mut Array2<f64>,
    planes: &ImagePlanes,
    yfit: &[Pixel],
    gwidth: usize,
    repair_mask: u32,
) -> Result<ColumnSums, GrismoError> {
    let (nrows, ncols) = image.dim();
    if planes.shape() != (nrows, ncols) {
        return Err(GrismoError::InvalidParameter(format!(
            "image shape {:?} differs from the planes {:?}",
            (nrows, ncols),
            planes.shape()
        )));
    }
    if yfit.len() != ncols {
        return Err(GrismoError::InvalidParameter(format!(
            "trace has {} columns, image {ncols}",
            yfit.len()
        )));
    }
    if nrows == 0 {
        return Err(GrismoError::InvalidParameter("empty image".into()));
    }

    let weights = image.mapv(|v| v.max(0.0));
    let err = planes.err.view();
    let dq = planes.dq.view();
    let time = planes.time.view();

    let mut sums = ColumnSums {
        flux: Vec::with_capacity(ncols),
        err: Vec::with_capacity(ncols),
        dq: Vec::with_capacity(ncols),
        time: Vec::with_capacity(ncols),
    };
    let mut repaired = 0usize;

    for (col, &y) in yfit.iter().enumerate() {
        let (y1, y2, iy1, iy2) = box_edges(nrows, y, gwidth);

        if col > 0 && col + 1 < ncols {
            for row in iy1..=iy2 {
                if dq[[row, col]] & repair_mask != 0 {
                    image[[row, col]] = (image[[row, col - 1]] + image[[row, col + 1]]) / 2.0;
                    repaired += 1;
                }
            }
        }

        let frac1 = 0.5 + iy1 as f64 - y1;
        let frac2 = 0.5 + y2 - iy2 as f64;
        let full = iy1 + 1..iy2.max(iy1 + 1);

        let mut flux = frac1 * image[[iy1, col]] + frac2 * image[[iy2, col]];
        let mut var = frac1 * err[[iy1, col]].powi(2) + frac2 * err[[iy2, col]].powi(2);
        let mut tot_time = frac1 * time[[iy1, col]] * weights[[iy1, col]]
            + frac2 * time[[iy2, col]] * weights[[iy2, col]];
        let mut time_weight = frac1 * weights[[iy1, col]] + frac2 * weights[[iy2, col]];
        for row in full {
            flux += image[[row, col]];
            var += err[[row, col]].powi(2);
            tot_time += time[[row, col]] * weights[[row, col]];
            time_weight += weights[[row, col]];
        }

        let mean_time = if time_weight > 0.0 {
            tot_time / time_weight
        } else {
            (iy1..=iy2)
                .map(|row| time[[row, col]])
                .fold(f64::NEG_INFINITY, f64::max)
        };

        sums.flux.push(flux);
        sums.err.push(var.sqrt());
        sums.dq.push((iy1..=iy2).fold(0, |acc, row| acc | dq[[row, col]]));
        sums.time.push(mean_time);
    }

    debug!(ncols, gwidth, repaired, "columns extracted");
    Ok(sums)
}

/// Fractional edges `(y1, y2)` of the extraction box at trace row `y` and the rows
/// `(iy1, iy2)` holding them.
fn box_edges(nrows: usize, y: Pixel, gwidth: usize) -> (f64, f64, usize, usize) {
    let half = (gwidth / 2) as f64;
    let y1 = (y - half).max(0.0);
    let y2 = (y + half).min(nrows as f64).max(y1 + 1.0);
    let last = nrows.saturating_sub(1);
    (
        y1,
        y2,
        (y1.round() as usize).min(last),
        (y2.round() as usize).min(last),
    )
}

#[cfg(test)]
mod extract_test {
    use super::*;
    use approx::assert_relative_eq;

    fn planes(nrows: usize, ncols: usize, sci: f64) -> ImagePlanes {
        ImagePlanes::new(
            Array2::from_elem((nrows, ncols), sci),
            Array2::from_elem((nrows, ncols), 0.5),
            Array2::zeros((nrows, ncols)),
            Array2::from_elem((nrows, ncols), 300.0),
        )
        .unwrap()
    }

    fn metadata() -> ExtractionMetadata {
        ExtractionMetadata {
            root: "ibbu01a1q".into(),
            target: "GD153".into(),
            grating: Grating::G102,
            direct_image: None,
            xc: 0.0,
            yc: 0.0,
            xerr: 0.0,
            yerr: 0.0,
            zeroth: (0.0, 0.0),
            zeroth_found: true,
            solution: SolutionKind::ZerothOrder,
            avgbkg: 0.0,
            flatfield: "unit".into(),
            sky_flat: "unit".into(),
            trace_intercept: 0.0,
            trace_slope: 0.0,
            angle: 0.0,
            gwidth: 6,
            bwidth: 13,
            ubdist: 31.5,
            lbdist: 31.5,
            bmedian: 7,
            bmean1: 7,
            bmean2: 7,
            wl_offset: 0.0,
            processing_order: ProcessingOrder::FlatFirst,
        }
    }

    #[test]
    fn test_uniform_image_sums_gwidth_rows() {
        let p = planes(40, 8, 2.0);
        let mut img = p.sci.clone();
        let yfit: Vec<f64> = (0..8).map(|c| 20.0 + 0.1 * c as f64).collect();
        let sums = extract_columns(&mut img, &p, &yfit, 6, 24).unwrap();
        for c in 0..8 {
            assert_relative_eq!(sums.flux[c], 12.0, epsilon = 1e-12);
            assert_relative_eq!(sums.err[c], (6.0f64 * 0.25).sqrt(), epsilon = 1e-12);
            assert_relative_eq!(sums.time[c], 300.0, epsilon = 1e-12);
            assert_eq!(sums.dq[c], 0);
        }
    }

    #[test]
    fn test_bad_pixels_repaired_and_flagged() {
        let mut p = planes(40, 8, 1.0);
        p.sci[[20, 4]] = 1000.0;
        p.dq[[20, 4]] = 16;
        p.sci[[20, 0]] = 50.0;
        p.dq[[20, 0]] = 8;
        let mut img = p.sci.clone();
        let sums = extract_columns(&mut img, &p, &vec![20.0; 8], 6, 24).unwrap();
        assert_relative_eq!(sums.flux[4], 6.0, epsilon = 1e-12);
        assert_eq!(sums.dq[4], 16);
        // the first column is never repaired
        assert_relative_eq!(sums.flux[0], 55.0, epsilon = 1e-12);
        assert_eq!(sums.dq[0], 8);
    }

    #[test]
    fn test_time_fallback_for_empty_column() {
        let mut p = planes(40, 3, 0.0);
        p.time[[21, 1]] = 450.0;
        let mut img = p.sci.clone();
        let sums = extract_columns(&mut img, &p, &[20.0, 20.0, 20.0], 6, 24).unwrap();
        assert_relative_eq!(sums.time[1], 450.0);
        assert_relative_eq!(sums.time[0], 300.0);
    }

    #[test]
    fn test_box_clipped_at_image_edge() {
        let p = planes(10, 2, 1.0);
        let mut img = p.sci.clone();
        let sums = extract_columns(&mut img, &p, &[0.5, 9.5], 6, 24).unwrap();
        assert!(sums.flux.iter().all(|f| f.is_finite()));
        assert_eq!(box_edges(10, 9.5, 6), (6.5, 10.0, 7, 9));
        assert!(extract_columns(&mut img, &p, &[1.0], 6, 24).is_err());
    }

    #[test]
    fn test_spectrum_assembly() {
        let sums = ColumnSums {
            flux: vec![10.0, 20.0],
            err: vec![1.0, 1.0],
            dq: vec![0, 4],
            time: vec![300.0, 300.0],
        };
        let back = BackgroundColumns {
            residual: vec![1.0, 1.0],
            sky: vec![0.5, 0.25],
            lower: vec![0.1, 0.1],
            upper: vec![0.2, 0.2],
        };
        let spec = ExtractedSpectrum::new(vec![8000.0, 8024.5], vec![500.0, 500.0], sums, back, metadata())
            .unwrap();
        assert_eq!(spec.x, vec![0, 1]);
        assert_eq!(spec.gross, vec![11.5, 21.25]);
        assert_eq!(spec.background, vec![1.5, 1.25]);
        assert_eq!(spec.wavelength_span(), Some((8000.0, 8024.5)));

        let short = ColumnSums {
            flux: vec![1.0],
            err: vec![1.0],
            dq: vec![0],
            time: vec![1.0],
        };
        assert!(ExtractedSpectrum::new(vec![1.0, 2.0], vec![0.0, 0.0], short, BackgroundColumns::default(), metadata())
            .is_err());
    }
}
