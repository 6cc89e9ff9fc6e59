#![allow(dead_code)]

use std::sync::Arc;

use grismo::constants::{Filter, Grating, Pixel, DETECTOR_SIZE};
use grismo::dispersion::{solve, SolutionKind};
use grismo::exposure::{Exposure, ImagePlanes, LinearWcs};
use grismo::params::{ExtractParams, ProcessingOrder};
use grismo::trace::approximate_trace;
use grismo::trace::extract::{
    BackgroundColumns, ColumnSums, ExtractedSpectrum, ExtractionMetadata,
};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

pub const SKY: f64 = 1.0;
pub const EXPOSURE_TIME: f64 = 100.0;
/// Peak count rate of the dispersed continuum
pub const CONTINUUM: f64 = 5.0;
/// Sum over rows of a unit-amplitude Gaussian profile with σ = 1
pub const PROFILE_SUM: f64 = 2.506_628_274_631;

pub const TARGET_RA: f64 = 194.259_125;
pub const TARGET_DEC: f64 = 22.030_888;

/// Route pipeline logs to the test harness; later calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Add a circular Gaussian source centred on `(x, y)`.
pub fn add_source(image: &mut Array2<f64>, (x, y): (Pixel, Pixel), sigma: f64, amplitude: f64) {
    let (nrows, ncols) = image.dim();
    let reach = (6.0 * sigma).ceil() as i64;
    for r in (y.round() as i64 - reach)..=(y.round() as i64 + reach) {
        for c in (x.round() as i64 - reach)..=(x.round() as i64 + reach) {
            if r < 0 || c < 0 || r as usize >= nrows || c as usize >= ncols {
                continue;
            }
            let d2 = (c as f64 - x).powi(2) + (r as f64 - y).powi(2);
            image[[r as usize, c as usize]] += amplitude * (-0.5 * d2 / (sigma * sigma)).exp();
        }
    }
}

pub fn add_noise(image: &mut Array2<f64>, sigma: f64, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, sigma).unwrap();
    image.mapv_inplace(|v| v + normal.sample(&mut rng));
}

/// Planes around a science array: flat errors, clean DQ and a uniform exposure time.
pub fn planes(sci: Array2<f64>) -> ImagePlanes {
    let shape = sci.dim();
    ImagePlanes::new(
        sci,
        Array2::from_elem(shape, 0.05),
        Array2::zeros(shape),
        Array2::from_elem(shape, EXPOSURE_TIME),
    )
    .unwrap()
}

/// Transform putting the target on `pixel`.
pub fn wcs_at(pixel: (Pixel, Pixel)) -> Arc<LinearWcs> {
    Arc::new(LinearWcs::with_scale(pixel, (TARGET_RA, TARGET_DEC), 0.13).unwrap())
}

/// Continuum amplitude of the dispersed spectrum at column `x`, with one emission line.
pub fn continuum(x: usize, line_column: f64) -> f64 {
    CONTINUUM + 2.0 * CONTINUUM * (-0.5 * ((x as f64 - line_column) / 2.5).powi(2)).exp()
}

/// A synthetic G102 readout with its zeroth order at `zeroth`.
#[derive(Debug, Clone)]
pub struct SyntheticGrism {
    pub planes: ImagePlanes,
    /// Row of the dispersed spectrum in every column
    pub trace: Vec<Pixel>,
    pub line_column: f64,
}

/// Full-frame G102 readout: sky, a bright zeroth order and a first/second-order spectrum
/// drawn along the trace predicted from the zeroth order.
pub fn synthetic_g102(zeroth: (Pixel, Pixel), seed: u64) -> SyntheticGrism {
    let params = ExtractParams::for_grating(Grating::G102);
    let solution = solve(
        Grating::G102,
        SolutionKind::ZerothOrder,
        zeroth,
        (0, 0),
        DETECTOR_SIZE,
        0.0,
    )
    .unwrap();
    let trace = approximate_trace(DETECTOR_SIZE, zeroth, solution.angle, &params);
    // an emission line at 9500 Å
    let line_column = solution
        .wave
        .iter()
        .position(|&w| w >= 9500.0)
        .unwrap() as f64;

    let mut sci = Array2::from_elem((DETECTOR_SIZE, DETECTOR_SIZE), SKY);
    add_source(&mut sci, zeroth, 1.5, 200.0);
    let start = zeroth.0.round() as usize + 25;
    for x in start..DETECTOR_SIZE {
        let amplitude = continuum(x, line_column);
        let y = trace[x];
        for r in (y.round() as usize - 6)..=(y.round() as usize + 6) {
            sci[[r, x]] += amplitude * (-0.5 * (r as f64 - y).powi(2)).exp();
        }
    }
    add_noise(&mut sci, 0.02, seed);

    SyntheticGrism {
        planes: planes(sci),
        trace,
        line_column,
    }
}

/// Imaging readout with a star at `star`.
pub fn synthetic_direct(star: (Pixel, Pixel), seed: u64) -> ImagePlanes {
    let mut sci = Array2::from_elem((DETECTOR_SIZE, DETECTOR_SIZE), 0.5);
    add_source(&mut sci, star, 1.2, 500.0);
    add_noise(&mut sci, 0.02, seed);
    planes(sci)
}

pub fn grism_exposure(root: &str, obset: &str, date: f64, planes: ImagePlanes) -> Exposure {
    Exposure::new(root, Filter::Grism(Grating::G102), "GD153", obset, date).with_planes(planes)
}

pub fn metadata(root: &str) -> ExtractionMetadata {
    ExtractionMetadata {
        root: root.to_string(),
        target: "GD153".into(),
        grating: Grating::G102,
        direct_image: None,
        xc: 520.0,
        yc: 500.0,
        xerr: 0.0,
        yerr: 0.0,
        zeroth: (268.0, 496.0),
        zeroth_found: true,
        solution: SolutionKind::ZerothOrder,
        avgbkg: 6.0,
        flatfield: "unit_G102_cube".into(),
        sky_flat: "unit_G102_sky".into(),
        trace_intercept: 493.0,
        trace_slope: 0.0106,
        angle: 0.61,
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

/// Linear-dispersion spectrum whose features sit `shift` pixels to the right.
///
/// 400 columns of 24.5 Å from 6000 Å, continuum 10 with three emission lines.
pub fn linear_spectrum(root: &str, shift: f64, time: f64) -> ExtractedSpectrum {
    let n = 400;
    let wavelength: Vec<f64> = (0..n).map(|i| 6000.0 + 24.5 * i as f64).collect();
    let line = |i: usize, c: f64, a: f64| a * (-0.5 * ((i as f64 - shift - c) / 2.0).powi(2)).exp();
    let flux: Vec<f64> = (0..n)
        .map(|i| 10.0 + line(i, 120.0, 30.0) + line(i, 170.0, 15.0) + line(i, 210.0, 20.0))
        .collect();
    let sums = ColumnSums {
        err: vec![0.5; n],
        dq: vec![0; n],
        time: vec![time; n],
        flux,
    };
    let background = BackgroundColumns {
        residual: vec![0.1; n],
        sky: vec![6.0; n],
        lower: vec![0.01; n],
        upper: vec![0.02; n],
    };
    ExtractedSpectrum::new(wavelength, vec![500.0; n], sums, background, metadata(root)).unwrap()
}
