//! # Constants and type definitions for grismo
//!
//! This module centralizes the **detector geometry**, **data-quality bit masks**, and
//! **common type definitions** used throughout the `grismo` library.
//!
//! ## Overview
//!
//! - Detector size and centroiding search geometry
//! - Data-quality flag masks used by extraction and co-addition
//! - Core type aliases (wavelength, pixel, angle)
//! - The [`Grating`], [`Filter`] and [`SpectralOrder`] identifiers
//!
//! These definitions are shared by every pipeline stage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::grismo_errors::GrismoError;

// -------------------------------------------------------------------------------------------------
// Detector geometry
// -------------------------------------------------------------------------------------------------

/// Width (and height) in pixels of a full-frame detector readout
pub const DETECTOR_SIZE: usize = 1014;

/// Side of the square box used by the zeroth-order centroid estimators
pub const CENTROID_BOX: usize = 31;

/// Half-side of the sub-image handed to the point-source finder
pub const STAR_FINDER_HALF_BOX: usize = 20;

/// A predicted zeroth order closer than this to an edge is treated as off-detector
pub const ZEROTH_ORDER_EDGE: f64 = 4.0;

/// Upper on-detector limit for a predicted zeroth order
pub const ZEROTH_ORDER_MAX: f64 = 998.0;

/// Sentinel coordinate of a centroid that could not be found
pub const NOT_FOUND: f64 = -1.0;

/// Sentinel trace position of a spectral order whose profile had no usable peak
pub const ORDER_NOT_FOUND: f64 = -999.0;

/// Minimum number of dispersion pixels an order needs before its profile is measured
pub const MIN_ORDER_PIXELS: usize = 50;

/// Orders starting at or beyond this column are ignored by the trace fit
pub const ORDER_START_LIMIT: usize = 985;

/// Last column used to collapse an order profile
pub const ORDER_END_LIMIT: usize = 990;

/// Profiles with a peak at or below this level are treated as empty
pub const MIN_PROFILE_PEAK: f64 = 2.0;

// -------------------------------------------------------------------------------------------------
// Data-quality flags
// -------------------------------------------------------------------------------------------------

/// Pixels repaired from their horizontal neighbours before extraction (8 | 16)
pub const DQ_REPAIR_MASK: u32 = 8 | 16;

/// Flags that mark a spectrum point as unusable during co-addition
///
/// Bits 32 and 512 are tolerated.
pub const DQ_COADD_MASK: u32 = 4 | 8 | 16 | 64 | 128 | 256;

/// Flag zeroed out on direct images before the target is located
pub const DQ_DIRECT_IMAGE_MASK: u32 = 32;

// -------------------------------------------------------------------------------------------------
// Co-addition limits
// -------------------------------------------------------------------------------------------------

/// Fraction of an order's nominal range a spectrum may leave uncovered at either end
pub const COVERAGE_TOLERANCE: f64 = 0.14;

/// Cross-correlation offsets larger than this (pixels) drop the exposure from the order
pub const MAX_ALIGNMENT_OFFSET: f64 = 12.0;

/// Coverage gap (Å) beyond which a measured offset is discarded
pub const MAX_COVERAGE_GAP: f64 = 1000.0;

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Wavelength in Ångström
pub type Angstrom = f64;
/// Position in detector pixels
pub type Pixel = f64;
/// Angle in degrees
pub type Degree = f64;
/// Angle in radians
pub type Radian = f64;
/// Modified Julian Date (days)
pub type MJD = f64;

// -------------------------------------------------------------------------------------------------
// Identifiers
// -------------------------------------------------------------------------------------------------

/// Dispersive element of a grism exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grating {
    /// Blue grism, 8000–11500 Å first order
    G102,
    /// Red grism, 10750–17000 Å first order
    G141,
}

impl Grating {
    /// Wavelength range (Å, absolute value) in which the flatfield cube is valid.
    pub fn flatfield_range(&self) -> (Angstrom, Angstrom) {
        match self {
            Grating::G102 => (7000.0, 12000.0),
            Grating::G141 => (9000.0, 18000.0),
        }
    }
}

impl fmt::Display for Grating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grating::G102 => write!(f, "G102"),
            Grating::G141 => write!(f, "G141"),
        }
    }
}

impl FromStr for Grating {
    type Err = GrismoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "G102" => Ok(Grating::G102),
            "G141" => Ok(Grating::G141),
            other => Err(GrismoError::UnknownGrating(other.to_string())),
        }
    }
}

/// Optical element of an exposure: a grism or an imaging filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Filter {
    Grism(Grating),
    /// Imaging filter name (e.g. `F098M`)
    Imaging(String),
}

impl Filter {
    pub fn grating(&self) -> Option<Grating> {
        match self {
            Filter::Grism(g) => Some(*g),
            Filter::Imaging(_) => None,
        }
    }

    pub fn is_grism(&self) -> bool {
        matches!(self, Filter::Grism(_))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Grism(g) => write!(f, "{g}"),
            Filter::Imaging(name) => write!(f, "{name}"),
        }
    }
}

impl FromStr for Filter {
    type Err = GrismoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_uppercase();
        if name.starts_with('G') {
            Ok(Filter::Grism(name.parse()?))
        } else if name.starts_with('F') {
            Ok(Filter::Imaging(name))
        } else {
            Err(GrismoError::UnknownGrating(name))
        }
    }
}

/// Spectral order handled by the extraction and co-addition stages.
///
/// Wavelengths of the −1 order are stored negated, and wavelengths of the +2 order are
/// stored doubled, so that a stitched wavelength array is monotonic across all orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SpectralOrder {
    Minus1,
    Plus1,
    Plus2,
}

impl SpectralOrder {
    /// Orders in processing order.
    pub const ALL: [SpectralOrder; 3] = [
        SpectralOrder::Minus1,
        SpectralOrder::Plus1,
        SpectralOrder::Plus2,
    ];

    /// Signed order number (−1, 1, 2).
    pub fn number(&self) -> i32 {
        match self {
            SpectralOrder::Minus1 => -1,
            SpectralOrder::Plus1 => 1,
            SpectralOrder::Plus2 => 2,
        }
    }

    /// Position of the order in [`SpectralOrder::ALL`].
    pub fn index(&self) -> usize {
        match self {
            SpectralOrder::Minus1 => 0,
            SpectralOrder::Plus1 => 1,
            SpectralOrder::Plus2 => 2,
        }
    }
}

impl fmt::Display for SpectralOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:+}", self.number())
    }
}

#[cfg(test)]
mod constants_test {
    use super::*;

    #[test]
    fn test_filter_from_str() {
        assert_eq!("g102".parse::<Filter>().unwrap(), Filter::Grism(Grating::G102));
        assert_eq!(
            "F140W".parse::<Filter>().unwrap(),
            Filter::Imaging("F140W".into())
        );
        assert!("G800L".parse::<Filter>().is_err());
        assert!("clear".parse::<Filter>().is_err());
    }

    #[test]
    fn test_order_display() {
        let labels: Vec<String> = SpectralOrder::ALL.iter().map(|o| o.to_string()).collect();
        assert_eq!(labels, vec!["-1", "+1", "+2"]);
    }
}
