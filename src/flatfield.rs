//! # Flatfield correction
//!
//! Grism flatfields depend on wavelength: every detector pixel carries a polynomial in the
//! normalised wavelength `w = (λ − λmin) / (λmax − λmin)` stored as one coefficient plane
//! per power (the flatfield "cube"). The exposure's first-order wavelength map selects
//! where on that polynomial each column sits.
//!
//! Calibration data reach the pipeline through the [`CalibrationSource`] trait so that the
//! decoding of the calibration files stays outside of the crate. [`InMemoryCalibration`]
//! is the plain implementation used when the arrays are already loaded.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ndarray::{s, Array2, ArrayView2};
use tracing::debug;

use crate::constants::{Angstrom, Grating, DETECTOR_SIZE};
use crate::grismo_errors::GrismoError;

/// Responses at or below this value are not trusted and replaced by 1.
const MIN_RESPONSE: f64 = 0.5;

/// Wavelength-dependent flatfield of one grating.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatfieldCube {
    /// Identifier recorded in the extracted products
    pub name: String,
    /// Coefficient planes in increasing power of the normalised wavelength
    pub coefficients: Vec<Array2<f64>>,
    pub wmin: Angstrom,
    pub wmax: Angstrom,
}

impl FlatfieldCube {
    pub fn new(
        name: &str,
        coefficients: Vec<Array2<f64>>,
        wmin: Angstrom,
        wmax: Angstrom,
    ) -> Result<Self, GrismoError> {
        let Some(first) = coefficients.first() else {
            return Err(GrismoError::MissingCalibration(format!(
                "flatfield cube {name} has no coefficient plane"
            )));
        };
        if coefficients.iter().any(|c| c.dim() != first.dim()) {
            return Err(GrismoError::MissingCalibration(format!(
                "flatfield cube {name} has planes of different shapes"
            )));
        }
        if !(wmax > wmin) {
            return Err(GrismoError::InvalidWavelengthRange(format!(
                "flatfield cube {name}: wmin {wmin} >= wmax {wmax}"
            )));
        }
        Ok(FlatfieldCube {
            name: name.to_string(),
            coefficients,
            wmin,
            wmax,
        })
    }

    /// A full-frame cube whose response is 1 everywhere.
    pub fn unit(name: &str) -> Self {
        FlatfieldCube {
            name: name.to_string(),
            coefficients: vec![Array2::ones((DETECTOR_SIZE, DETECTOR_SIZE))],
            wmin: 0.0,
            wmax: 1.0,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.coefficients.first().map_or((0, 0), |c| c.dim())
    }

    /// Response of full-frame pixel `(row, col)` at wavelength `wave`.
    pub fn response(&self, row: usize, col: usize, wave: Angstrom) -> f64 {
        let w = (wave.abs() - self.wmin) / (self.wmax - self.wmin);
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, plane| acc * w + plane[[row, col]])
    }
}

/// Broadband sky flat of one grating, used to scale and remove the sky background.
#[derive(Debug, Clone, PartialEq)]
pub struct SkyFlat {
    pub name: String,
    pub image: Array2<f64>,
}

impl SkyFlat {
    pub fn new(name: &str, image: Array2<f64>) -> Self {
        SkyFlat {
            name: name.to_string(),
            image,
        }
    }

    /// The part of the sky flat under a readout.
    pub fn readout(
        &self,
        offset: (usize, usize),
        shape: (usize, usize),
    ) -> Result<ArrayView2<'_, f64>, GrismoError> {
        let (x0, y0) = offset;
        let (nrows, ncols) = shape;
        if y0 + nrows > self.image.nrows() || x0 + ncols > self.image.ncols() {
            return Err(GrismoError::MissingCalibration(format!(
                "sky flat {} ({:?}) does not cover a {nrows}x{ncols} readout at {offset:?}",
                self.name,
                self.image.dim()
            )));
        }
        Ok(self.image.slice(s![y0..y0 + nrows, x0..x0 + ncols]))
    }
}

/// Provider of the per-grating calibration data.
pub trait CalibrationSource: Send + Sync + fmt::Debug {
    fn flatfield_cube(&self, grating: Grating) -> Result<Arc<FlatfieldCube>, GrismoError>;

    fn sky_flat(&self, grating: Grating) -> Result<Arc<SkyFlat>, GrismoError>;
}

/// Calibration data already held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCalibration {
    cubes: HashMap<Grating, Arc<FlatfieldCube>>,
    sky_flats: HashMap<Grating, Arc<SkyFlat>>,
}

impl InMemoryCalibration {
    pub fn new() -> Self {
        InMemoryCalibration::default()
    }

    /// Unit flatfield cubes and flat sky flats for both gratings.
    pub fn uniform() -> Self {
        let mut cal = InMemoryCalibration::new();
        for grating in [Grating::G102, Grating::G141] {
            cal = cal
                .with_cube(grating, FlatfieldCube::unit(&format!("unit_{grating}_cube")))
                .with_sky_flat(
                    grating,
                    SkyFlat::new(
                        &format!("unit_{grating}_sky"),
                        Array2::ones((DETECTOR_SIZE, DETECTOR_SIZE)),
                    ),
                );
        }
        cal
    }

    pub fn with_cube(mut self, grating: Grating, cube: FlatfieldCube) -> Self {
        self.cubes.insert(grating, Arc::new(cube));
        self
    }

    pub fn with_sky_flat(mut self, grating: Grating, flat: SkyFlat) -> Self {
        self.sky_flats.insert(grating, Arc::new(flat));
        self
    }
}

impl CalibrationSource for InMemoryCalibration {
    fn flatfield_cube(&self, grating: Grating) -> Result<Arc<FlatfieldCube>, GrismoError> {
        self.cubes
            .get(&grating)
            .cloned()
            .ok_or_else(|| GrismoError::MissingCalibration(format!("no flatfield cube for {grating}")))
    }

    fn sky_flat(&self, grating: Grating) -> Result<Arc<SkyFlat>, GrismoError> {
        self.sky_flats
            .get(&grating)
            .cloned()
            .ok_or_else(|| GrismoError::MissingCalibration(format!("no sky flat for {grating}")))
    }
}

/// Divide `image` by the flatfield evaluated on the first-order wavelength map.
///
/// Columns whose wavelength lies outside the grating's flatfield range, and pixels with a
/// response at or below 0.5, are left untouched.
pub fn apply_flatfield(
    image: &mut Array2<f64>,
    wav1st: &[Angstrom],
    cube: &FlatfieldCube,
    grating: Grating,
    offset: (usize, usize),
) -> Result<(), GrismoError> {
    let (nrows, ncols) = image.dim();
    let (x0, y0) = offset;
    let (cube_rows, cube_cols) = cube.shape();
    if wav1st.len() != ncols {
        return Err(GrismoError::InvalidParameter(format!(
            "wavelength map has {} columns, image {ncols}",
            wav1st.len()
        )));
    }
    if y0 + nrows > cube_rows || x0 + ncols > cube_cols {
        return Err(GrismoError::MissingCalibration(format!(
            "flatfield cube {} ({cube_rows}x{cube_cols}) does not cover a {nrows}x{ncols} readout at {offset:?}",
            cube.name
        )));
    }

    let (low, high) = grating.flatfield_range();
    let columns: Vec<usize> = (0..ncols)
        .filter(|&c| (low..=high).contains(&wav1st[c].abs()))
        .collect();
    debug!(cube = %cube.name, columns = columns.len(), "applying flatfield");

    for row in 0..nrows {
        for &col in &columns {
            let ff = cube.response(row + y0, col + x0, wav1st[col]);
            if ff > MIN_RESPONSE {
                image[[row, col]] /= ff;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod flatfield_test {
    use super::*;
    use approx::assert_relative_eq;

    fn cube() -> FlatfieldCube {
        FlatfieldCube::new(
            "test_cube",
            vec![
                Array2::from_elem((20, 20), 1.0),
                Array2::from_elem((20, 20), 0.5),
                Array2::from_elem((20, 20), -0.25),
            ],
            8000.0,
            12000.0,
        )
        .unwrap()
    }

    #[test]
    fn test_response_polynomial() {
        let c = cube();
        // w = 0.5 → 1 + 0.25 − 0.0625
        assert_relative_eq!(c.response(3, 4, 10000.0), 1.1875);
        // −1 order wavelengths are negative
        assert_relative_eq!(c.response(3, 4, -10000.0), 1.1875);
    }

    #[test]
    fn test_apply_flatfield_ranges() {
        let c = cube();
        let mut img = Array2::from_elem((4, 5), 2.0);
        let wav = [6000.0, 10000.0, -10000.0, 12000.0, 20000.0];
        apply_flatfield(&mut img, &wav, &c, Grating::G102, (2, 3)).unwrap();
        assert_relative_eq!(img[[0, 0]], 2.0);
        assert_relative_eq!(img[[1, 1]], 2.0 / 1.1875);
        assert_relative_eq!(img[[2, 2]], 2.0 / 1.1875);
        assert_relative_eq!(img[[3, 3]], 2.0 / 1.25);
        assert_relative_eq!(img[[3, 4]], 2.0);
    }

    #[test]
    fn test_low_response_ignored_and_coverage_checked() {
        let low = FlatfieldCube::new("low", vec![Array2::from_elem((10, 10), 0.3)], 0.0, 1.0)
            .unwrap();
        let mut img = Array2::from_elem((2, 2), 5.0);
        apply_flatfield(&mut img, &[9000.0, 9000.0], &low, Grating::G102, (0, 0)).unwrap();
        assert_relative_eq!(img[[1, 1]], 5.0);

        let err = apply_flatfield(&mut img, &[9000.0, 9000.0], &low, Grating::G102, (9, 0));
        assert!(matches!(err, Err(GrismoError::MissingCalibration(_))));
        assert!(InMemoryCalibration::new().flatfield_cube(Grating::G141).is_err());
    }
}
