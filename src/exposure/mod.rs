//! # Exposure records
//!
//! An [`Exposure`] is one detector readout together with everything the pipeline learns
//! about it while running: the located zeroth order, the fitted trace, the extracted
//! spectrum and the free-text audit notes.
//!
//! Exposures are created by the caller (typically from a metadata table and image files
//! decoded elsewhere), stored in an [`ExposureRepository`](crate::exposure::repository::ExposureRepository)
//! keyed by root, and updated in place by each stage.
//!
//! ## Image planes
//!
//! The four planes of a readout are kept in [`ImagePlanes`] as `ndarray` arrays indexed
//! `[row, column]`, i.e. `[y, x]`. Sub-array readouts carry their offset inside the full
//! 1014 × 1014 frame in [`Exposure::subarray_offset`].
//!
//! ## Sky transform
//!
//! Predicting where a target lands on the detector needs a world → pixel mapping. It is
//! abstracted behind the [`SkyTransform`] trait so that callers can plug in any WCS
//! implementation; [`LinearWcs`] is a small tangent-plane approximation that is good enough
//! over a detector-sized field.

pub mod repository;

use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use nalgebra::{Matrix2, Vector2};
use ndarray::Array2;

use crate::constants::{Degree, Filter, Grating, Pixel, MJD};
use crate::grismo_errors::GrismoError;
use crate::positioner::Centroid;
use crate::trace::extract::ExtractedSpectrum;
use crate::trace::TraceFit;

/// Science, error, data-quality and exposure-time planes of one readout.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePlanes {
    /// Count rate (e⁻/s)
    pub sci: Array2<f64>,
    /// 1σ uncertainty of `sci`
    pub err: Array2<f64>,
    /// Data-quality bit flags
    pub dq: Array2<u32>,
    /// Effective exposure time per pixel (s)
    pub time: Array2<f64>,
}

impl ImagePlanes {
    /// Build the planes, checking that every array has the science plane's shape.
    pub fn new(
        sci: Array2<f64>,
        err: Array2<f64>,
        dq: Array2<u32>,
        time: Array2<f64>,
    ) -> Result<Self, GrismoError> {
        let shape = sci.dim();
        if err.dim() != shape || dq.dim() != shape || time.dim() != shape {
            return Err(GrismoError::InvalidParameter(format!(
                "image planes disagree in shape: sci {:?}, err {:?}, dq {:?}, time {:?}",
                shape,
                err.dim(),
                dq.dim(),
                time.dim()
            )));
        }
        Ok(ImagePlanes { sci, err, dq, time })
    }

    /// `(rows, columns)` of the readout.
    pub fn shape(&self) -> (usize, usize) {
        self.sci.dim()
    }

    pub fn ncols(&self) -> usize {
        self.sci.ncols()
    }

    pub fn nrows(&self) -> usize {
        self.sci.nrows()
    }
}

/// World → pixel mapping of an exposure.
pub trait SkyTransform: Send + Sync + fmt::Debug {
    /// Zero-based `(x, y)` pixel position of the sky position `(ra, dec)` in degrees.
    fn sky_to_pixel(&self, ra: Degree, dec: Degree) -> (Pixel, Pixel);
}

/// Linear tangent-plane approximation of a FITS-style WCS.
///
/// `cd` maps pixel offsets from `crpix` onto (ξ, η) offsets in degrees, where
/// ξ = (α − α₀)·cos δ₀ and η = δ − δ₀. The matrix must be invertible.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearWcs {
    /// Zero-based reference pixel
    pub crpix: (Pixel, Pixel),
    /// Sky position of the reference pixel (degrees)
    pub crval: (Degree, Degree),
    cd: Matrix2<f64>,
    cd_inverse: Matrix2<f64>,
}

impl LinearWcs {
    /// Build the transform from its CD matrix (degrees per pixel).
    ///
    /// Return
    /// ------
    /// * [`GrismoError::InvalidParameter`] if `cd` is singular or not finite.
    pub fn new(
        crpix: (Pixel, Pixel),
        crval: (Degree, Degree),
        cd: Matrix2<f64>,
    ) -> Result<Self, GrismoError> {
        let cd_inverse = cd
            .try_inverse()
            .filter(|inv| inv.iter().all(|v| v.is_finite()))
            .ok_or_else(|| GrismoError::InvalidParameter(format!("singular CD matrix {cd:?}")))?;
        Ok(LinearWcs {
            crpix,
            crval,
            cd,
            cd_inverse,
        })
    }

    /// A north-up, east-left transform with a square pixel scale in arcseconds.
    pub fn with_scale(
        crpix: (Pixel, Pixel),
        crval: (Degree, Degree),
        arcsec_per_px: f64,
    ) -> Result<Self, GrismoError> {
        let s = arcsec_per_px / 3600.0;
        LinearWcs::new(crpix, crval, Matrix2::new(-s, 0.0, 0.0, s))
    }

    /// CD matrix (degrees per pixel).
    pub fn cd(&self) -> &Matrix2<f64> {
        &self.cd
    }
}

impl SkyTransform for LinearWcs {
    fn sky_to_pixel(&self, ra: Degree, dec: Degree) -> (Pixel, Pixel) {
        let mut dra = ra - self.crval.0;
        // wrap across the 0/360 seam
        if dra > 180.0 {
            dra -= 360.0;
        } else if dra < -180.0 {
            dra += 360.0;
        }
        let xi_eta = Vector2::new(dra * self.crval.1.to_radians().cos(), dec - self.crval.1);
        let offset = self.cd_inverse * xi_eta;
        (self.crpix.0 + offset.x, self.crpix.1 + offset.y)
    }
}

/// Target position measured on a direct (imaging) exposure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectPosition {
    pub xc: Pixel,
    pub yc: Pixel,
    /// Measured minus WCS-predicted column
    pub xerr: Pixel,
    /// Measured minus WCS-predicted row
    pub yerr: Pixel,
}

/// One detector readout and the pipeline state attached to it.
#[derive(Debug, Clone)]
pub struct Exposure {
    pub root: String,
    pub filter: Filter,
    /// Scan rate in arcsec/s, `0` for stare exposures
    pub scan_rate: f64,
    pub target: String,
    /// Observation-set identifier (visit)
    pub obset: String,
    pub date: MJD,
    /// Dither offset `(postarg1, postarg2)` in arcsec
    pub postarg: (f64, f64),
    pub planetary_nebula: bool,
    /// Root of the direct image associated with a grism exposure
    pub direct_image: Option<String>,
    pub planes: Option<ImagePlanes>,
    /// Column and row of the first readout pixel inside the full frame
    pub subarray_offset: (usize, usize),
    pub sky: Option<Arc<dyn SkyTransform>>,
    /// Nominal `(ra, dec)` of the target in degrees
    pub target_position: Option<(Degree, Degree)>,
    pub use_exposure: bool,
    pub notes: Vec<String>,

    /// Target position located on this exposure (imaging exposures only)
    pub direct_position: Option<DirectPosition>,
    /// Zeroth-order centroid (grism exposures only)
    pub centroid: Option<Centroid>,
    pub trace: Option<TraceFit>,
    pub spectrum: Option<ExtractedSpectrum>,
    pub extracted_path: Option<Utf8PathBuf>,
    pub coadded_path: Option<Utf8PathBuf>,
}

impl Exposure {
    /// A fresh exposure with no image planes and no pipeline state.
    pub fn new(root: &str, filter: Filter, target: &str, obset: &str, date: MJD) -> Self {
        Exposure {
            root: root.to_string(),
            filter,
            scan_rate: 0.0,
            target: target.to_string(),
            obset: obset.to_string(),
            date,
            postarg: (0.0, 0.0),
            planetary_nebula: false,
            direct_image: None,
            planes: None,
            subarray_offset: (0, 0),
            sky: None,
            target_position: None,
            use_exposure: true,
            notes: Vec::new(),
            direct_position: None,
            centroid: None,
            trace: None,
            spectrum: None,
            extracted_path: None,
            coadded_path: None,
        }
    }

    pub fn with_planes(mut self, planes: ImagePlanes) -> Self {
        self.planes = Some(planes);
        self
    }

    pub fn with_sky(mut self, sky: Arc<dyn SkyTransform>, target: (Degree, Degree)) -> Self {
        self.sky = Some(sky);
        self.target_position = Some(target);
        self
    }

    pub fn with_postarg(mut self, postarg: (f64, f64)) -> Self {
        self.postarg = postarg;
        self
    }

    pub fn with_subarray_offset(mut self, offset: (usize, usize)) -> Self {
        self.subarray_offset = offset;
        self
    }

    pub fn planetary_nebula(mut self, pn: bool) -> Self {
        self.planetary_nebula = pn;
        self
    }

    pub fn scan_rate(mut self, rate: f64) -> Self {
        self.scan_rate = rate;
        self
    }

    pub fn is_stare(&self) -> bool {
        self.scan_rate == 0.0
    }

    pub fn is_grism(&self) -> bool {
        self.filter.is_grism()
    }

    pub fn grating(&self) -> Option<Grating> {
        self.filter.grating()
    }

    /// Grating of a grism exposure, or [`GrismoError::UnknownGrating`] for imaging ones.
    pub fn require_grating(&self) -> Result<Grating, GrismoError> {
        self.filter
            .grating()
            .ok_or_else(|| GrismoError::UnknownGrating(format!("{} ({})", self.filter, self.root)))
    }

    pub fn planes(&self) -> Result<&ImagePlanes, GrismoError> {
        self.planes
            .as_ref()
            .ok_or_else(|| GrismoError::MissingImage(self.root.clone()))
    }

    /// Append a free-text reason to the audit trail.
    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Predicted pixel position of the target from the sky transform.
    pub fn predicted_target_pixel(&self) -> Option<(Pixel, Pixel)> {
        match (&self.sky, self.target_position) {
            (Some(sky), Some((ra, dec))) => Some(sky.sky_to_pixel(ra, dec)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod exposure_test {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    #[test]
    fn test_linear_wcs_round_numbers() {
        let wcs = LinearWcs::with_scale((506.0, 506.0), (194.25, 22.03), 0.13).unwrap();
        let (x, y) = wcs.sky_to_pixel(194.25, 22.03);
        assert_relative_eq!(x, 506.0);
        assert_relative_eq!(y, 506.0);

        // 13 arcsec north is 100 pixels up
        let (x, y) = wcs.sky_to_pixel(194.25, 22.03 + 13.0 / 3600.0);
        assert_relative_eq!(x, 506.0, epsilon = 1e-9);
        assert_relative_eq!(y, 606.0, epsilon = 1e-9);

        // east is to the left
        let (x, _) = wcs.sky_to_pixel(194.25 + 0.001, 22.03);
        assert!(x < 506.0);
    }

    #[test]
    fn test_linear_wcs_rejects_singular_cd() {
        let collapsed = Matrix2::new(3.6e-5, 0.0, 0.0, 0.0);
        let res = LinearWcs::new((506.0, 506.0), (194.25, 22.03), collapsed);
        assert!(matches!(res, Err(GrismoError::InvalidParameter(_))));

        let res = LinearWcs::with_scale((506.0, 506.0), (194.25, 22.03), 0.0);
        assert!(matches!(res, Err(GrismoError::InvalidParameter(_))));

        let rotated = Matrix2::new(0.0, -3.6e-5, 3.6e-5, 0.0);
        let wcs = LinearWcs::new((506.0, 506.0), (194.25, 22.03), rotated).unwrap();
        assert_eq!(wcs.cd(), &rotated);
        // north runs along +x on this readout
        let (x, y) = wcs.sky_to_pixel(194.25, 22.03 + 3.6e-5);
        assert_relative_eq!(x, 507.0, epsilon = 1e-9);
        assert_relative_eq!(y, 506.0, epsilon = 1e-9);
    }

    #[test]
    fn test_planes_shape_check() {
        let ok = ImagePlanes::new(
            Array2::zeros((10, 12)),
            Array2::zeros((10, 12)),
            Array2::zeros((10, 12)),
            Array2::zeros((10, 12)),
        );
        assert_eq!(ok.unwrap().shape(), (10, 12));

        let bad = ImagePlanes::new(
            Array2::zeros((10, 12)),
            Array2::zeros((10, 11)),
            Array2::zeros((10, 12)),
            Array2::zeros((10, 12)),
        );
        assert!(matches!(bad, Err(GrismoError::InvalidParameter(_))));
    }

    #[test]
    fn test_exposure_notes_and_grating() {
        let mut exp = Exposure::new(
            "ibbu01a1q",
            "G102".parse().unwrap(),
            "GD153",
            "ibbu01",
            55000.0,
        );
        assert!(exp.is_stare());
        assert_eq!(exp.require_grating().unwrap(), Grating::G102);
        exp.add_note("zeroth order not found");
        assert_eq!(exp.notes, vec!["zeroth order not found".to_string()]);
        assert!(matches!(exp.planes(), Err(GrismoError::MissingImage(_))));

        let img = Exposure::new("ibbu01a0q", "F098M".parse().unwrap(), "GD153", "ibbu01", 55000.0);
        assert!(img.require_grating().is_err());
    }
}
