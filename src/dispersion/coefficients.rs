//! Fixed dispersion coefficients of the WFC3 IR grisms.
//!
//! Every order relation has the form `scale · (A + B·(x − x₀))` where `A` and `B` are
//! polynomial surfaces in the reference position `(x₀, y₀)`. The zeroth-order solution
//! uses bilinear surfaces referenced to the zeroth-order image, the aXe solution
//! quadratic surfaces referenced to the direct-image position.

use std::fmt;
use std::str::FromStr;

use crate::constants::{Angstrom, Degree, Grating, Pixel, SpectralOrder};
use crate::grismo_errors::GrismoError;

/// `a + b·x + c·y + d·x² + e·x·y + f·y²`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Surface {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl Surface {
    pub const fn bilinear(a: f64, b: f64, c: f64) -> Self {
        Surface {
            a,
            b,
            c,
            d: 0.0,
            e: 0.0,
            f: 0.0,
        }
    }

    pub const fn quadratic(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
        Surface { a, b, c, d, e, f }
    }

    pub fn eval(&self, x: Pixel, y: Pixel) -> f64 {
        self.a + self.b * x + self.c * y + self.d * x * x + self.e * x * y + self.f * y * y
    }
}

/// Pixel → wavelength relation of one spectral order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderRelation {
    /// Intercept surface `A(x₀, y₀)`
    pub intercept: Surface,
    /// Dispersion surface `B(x₀, y₀)` (Å/px)
    pub slope: Surface,
    /// Factor applied to `A + B·(x − x₀)`
    pub scale: f64,
}

impl OrderRelation {
    /// Intercept and slope evaluated at the reference position.
    pub fn terms(&self, x0: Pixel, y0: Pixel) -> (Angstrom, f64) {
        (self.intercept.eval(x0, y0), self.slope.eval(x0, y0))
    }
}

/// Which of the two solutions a set of coefficients belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SolutionKind {
    /// Referenced to the located zeroth-order image
    ZerothOrder,
    /// Referenced to the predicted direct-image position
    Axe,
}

impl fmt::Display for SolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolutionKind::ZerothOrder => f.write_str("zeroth"),
            SolutionKind::Axe => f.write_str("axe"),
        }
    }
}

impl FromStr for SolutionKind {
    type Err = GrismoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "zeroth" => Ok(SolutionKind::ZerothOrder),
            "axe" => Ok(SolutionKind::Axe),
            other => Err(GrismoError::InvalidParameter(format!(
                "unknown dispersion solution '{other}'"
            ))),
        }
    }
}

/// How the first-order map is derived from the stitched +2 pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondOrderMapping {
    /// Half of the stitched value, rounded down to the Ångström
    HalfFloor,
    /// Half of the stitched value
    Half,
}

/// Complete coefficient set of one grating and solution kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolutionCoefficients {
    pub kind: SolutionKind,
    /// Relations of the −1, +1 and +2 orders, indexed by [`SpectralOrder::index`]
    pub orders: [OrderRelation; 3],
    /// First-order wavelengths below this value are replaced by the −1 relation
    pub low_threshold: Angstrom,
    /// Wavelengths above this value are replaced by the +2 relation
    pub high_threshold: Angstrom,
    pub second_order: SecondOrderMapping,
    /// Mean trace angle
    pub angle: Degree,
}

impl SolutionCoefficients {
    pub fn order(&self, order: SpectralOrder) -> &OrderRelation {
        &self.orders[order.index()]
    }
}

const fn relation(intercept: Surface, slope: Surface, scale: f64) -> OrderRelation {
    OrderRelation {
        intercept,
        slope,
        scale,
    }
}

const G102_ZEROTH: SolutionCoefficients = SolutionCoefficients {
    kind: SolutionKind::ZerothOrder,
    orders: [
        relation(
            Surface::bilinear(205.229, -0.015426, -0.019207),
            Surface::bilinear(24.7007, 0.000047, 0.001478),
            1.0,
        ),
        relation(
            Surface::bilinear(148.538, 0.145605, -0.008558),
            Surface::bilinear(23.8796, -0.000332, 0.001489),
            1.0,
        ),
        relation(
            Surface::bilinear(213.571, 0.561877, -0.040419),
            Surface::bilinear(23.9983, -0.000797, 0.001532),
            1.0,
        ),
    ],
    low_threshold: -7000.0,
    high_threshold: 14000.0,
    second_order: SecondOrderMapping::HalfFloor,
    angle: 0.61,
};

const G141_ZEROTH: SolutionCoefficients = SolutionCoefficients {
    kind: SolutionKind::ZerothOrder,
    orders: [
        relation(
            Surface::bilinear(165.764, 0.055688, 0.016568),
            Surface::bilinear(46.4521, 0.000382, 0.002960),
            1.0,
        ),
        relation(
            Surface::bilinear(156.339, 0.111342, -0.010926),
            Surface::bilinear(45.3203, -0.000408, 0.002818),
            1.0,
        ),
        relation(
            Surface::bilinear(193.093, 0.164508, -0.017031),
            Surface::bilinear(45.6062, -0.000499, 0.002840),
            1.0,
        ),
    ],
    low_threshold: -8000.0,
    high_threshold: 18000.0,
    second_order: SecondOrderMapping::HalfFloor,
    angle: 0.42,
};

const G102_AXE: SolutionCoefficients = SolutionCoefficients {
    kind: SolutionKind::Axe,
    orders: [
        relation(
            Surface::quadratic(-6376.843, 0.0, -1.11124775, 0.0, 0.0, 0.00095901),
            Surface::quadratic(-24.27561, 0.0, -0.003251784, 0.0, 0.0, 1.4988e-6),
            -1.0,
        ),
        relation(
            Surface::quadratic(
                6344.081,
                0.20143085,
                0.080213136,
                -0.00019613,
                0.0000301396,
                -0.0000843157,
            ),
            Surface::quadratic(
                24.00123,
                -0.00071606,
                0.00084115,
                8.9775481e-7,
                -3.160441e-7,
                7.1404362e-7,
            ),
            1.0,
        ),
        relation(
            Surface::quadratic(
                3189.9195,
                0.291324446,
                0.039748254,
                0.000405844,
                6.5079365e-6,
                -0.00003221,
            ),
            Surface::quadratic(12.08004, -0.00046352, 0.000670315, 5.7894508e-7, 0.0, 5.667e-8),
            2.0,
        ),
    ],
    low_threshold: 300.0,
    high_threshold: 14000.0,
    second_order: SecondOrderMapping::Half,
    angle: 0.66,
};

const G141_AXE: SolutionCoefficients = SolutionCoefficients {
    kind: SolutionKind::Axe,
    orders: [
        // the dispersion of the −1 order is negative like the G102 one
        relation(
            Surface::quadratic(-46.4855, 0.0, -0.8732184, 0.0, 0.0, 0.0009233797),
            Surface::quadratic(-44.972279, 0.0, -0.004813895, 0.0, 0.0, 2.0768286663e-6),
            -1.0,
        ),
        relation(
            Surface::quadratic(
                8951.386,
                0.08044033,
                -0.00927970,
                0.000021857,
                -0.000011048,
                0.000033527,
            ),
            Surface::quadratic(
                44.972279,
                0.000492789,
                0.00357824,
                -9.175233345e-7,
                2.235506e-7,
                -9.25869e-7,
            ),
            1.0,
        ),
        relation(
            Surface::quadratic(
                4474.5297,
                0.17615670,
                0.046354019,
                -0.00012965,
                0.00001513,
                -0.00002961,
            ),
            Surface::quadratic(
                22.8791467,
                -0.0002159637,
                0.00133454,
                4.277729e-8,
                -8.522518e-8,
                6.08125e-8,
            ),
            2.0,
        ),
    ],
    low_threshold: 300.0,
    high_threshold: 19000.0,
    second_order: SecondOrderMapping::Half,
    angle: 0.44,
};

/// Coefficients of `grating` for the requested solution.
pub fn coefficients(grating: Grating, kind: SolutionKind) -> &'static SolutionCoefficients {
    match (grating, kind) {
        (Grating::G102, SolutionKind::ZerothOrder) => &G102_ZEROTH,
        (Grating::G141, SolutionKind::ZerothOrder) => &G141_ZEROTH,
        (Grating::G102, SolutionKind::Axe) => &G102_AXE,
        (Grating::G141, SolutionKind::Axe) => &G141_AXE,
    }
}
