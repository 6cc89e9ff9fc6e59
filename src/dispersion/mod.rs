//! # Dispersion solver
//!
//! Builds the per-column wavelength array of a grism exposure from a reference position.
//!
//! The +1 relation is evaluated over the full 1014-column frame first. Columns whose
//! wavelength falls below the low threshold of the solution take the −1 relation, columns
//! above the high threshold the +2 relation, and each replacement is followed by a repair
//! pass that linearly redistributes any values left out of order at the junction.
//!
//! Alongside the stitched array a first-order map (`wav1st`) is kept: it equals the
//! stitched array except on +2 columns, where it holds the equivalent first-order
//! wavelength. The flatfield cube is evaluated on this map.

pub mod coefficients;

use tracing::debug;

use crate::constants::{Angstrom, Grating, Pixel, Radian, SpectralOrder, DETECTOR_SIZE};
use crate::grismo_errors::GrismoError;

pub use coefficients::SolutionKind;
use coefficients::{coefficients, SecondOrderMapping};

/// Wavelength arrays of one exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct DispersionSolution {
    pub grating: Grating,
    pub kind: SolutionKind,
    /// Reference position in full-frame pixels
    pub reference: (Pixel, Pixel),
    /// Stitched wavelength of every readout column (Å, −1 order negative)
    pub wave: Vec<Angstrom>,
    /// First-order equivalent wavelength of every readout column
    pub wav1st: Vec<Angstrom>,
    /// Intercept and slope of the −1, +1 and +2 relations at the reference position
    pub terms: [(Angstrom, f64); 3],
    /// Mean trace angle
    pub angle: Radian,
}

impl DispersionSolution {
    pub fn len(&self) -> usize {
        self.wave.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wave.is_empty()
    }

    /// Readout columns whose stitched wavelength lies in `[low, high]`.
    pub fn columns_in(&self, low: Angstrom, high: Angstrom) -> Vec<usize> {
        self.wave
            .iter()
            .enumerate()
            .filter(|(_, w)| **w >= low && **w <= high)
            .map(|(i, _)| i)
            .collect()
    }

    /// Intercept and slope of one order.
    pub fn order_terms(&self, order: SpectralOrder) -> (Angstrom, f64) {
        self.terms[order.index()]
    }
}

/// Solve the wavelength arrays of a readout.
///
/// Arguments
/// ---------
/// * `reference` - zeroth-order position (zeroth-order solution) or direct-image position
///   (aXe solution), in readout pixels.
/// * `subarray_offset` - column and row of the first readout pixel in the full frame.
/// * `ncols` - readout width.
/// * `wl_offset` - constant added to every wavelength.
///
/// Return
/// ------
/// * [`GrismoError::WavelengthNotMonotonic`] if the stitched array still decreases after
///   repair, with the index of the first offending column.
pub fn solve(
    grating: Grating,
    kind: SolutionKind,
    reference: (Pixel, Pixel),
    subarray_offset: (usize, usize),
    ncols: usize,
    wl_offset: Angstrom,
) -> Result<DispersionSolution, GrismoError> {
    let coeffs = coefficients(grating, kind);
    let x0 = reference.0 + subarray_offset.0 as f64;
    let y0 = reference.1 + subarray_offset.1 as f64;

    let terms = SpectralOrder::ALL.map(|o| coeffs.order(o).terms(x0, y0));
    let relation = |order: SpectralOrder, x: usize| {
        let (a, b) = terms[order.index()];
        coeffs.order(order).scale * (a + b * (x as f64 - x0))
    };

    let mut wave: Vec<Angstrom> = (0..DETECTOR_SIZE)
        .map(|x| relation(SpectralOrder::Plus1, x))
        .collect();

    let minus: Vec<usize> = (0..DETECTOR_SIZE)
        .filter(|&x| wave[x] < coeffs.low_threshold)
        .collect();
    for &x in &minus {
        wave[x] = relation(SpectralOrder::Minus1, x);
    }
    if let (Some(&first), Some(&last)) = (minus.first(), minus.last()) {
        make_monotonic(&mut wave, first, last);
    }

    let mut wav1st = wave.clone();
    let plus2: Vec<usize> = (0..DETECTOR_SIZE)
        .filter(|&x| wave[x] > coeffs.high_threshold)
        .collect();
    for &x in &plus2 {
        let w = relation(SpectralOrder::Plus2, x);
        wave[x] = w;
        wav1st[x] = match coeffs.second_order {
            SecondOrderMapping::HalfFloor => (w / 2.0).floor(),
            SecondOrderMapping::Half => w / 2.0,
        };
    }
    if let (Some(&first), Some(&last)) = (plus2.first(), plus2.last()) {
        make_monotonic(&mut wave, first, last);
    }

    if let Some(i) = (1..wave.len()).find(|&i| wave[i] < wave[i - 1]) {
        return Err(GrismoError::WavelengthNotMonotonic(i));
    }

    debug!(
        %grating,
        ?kind,
        x0,
        y0,
        minus1 = minus.len(),
        plus2 = plus2.len(),
        "dispersion solved"
    );

    let start = subarray_offset.0.min(DETECTOR_SIZE);
    let end = (start + ncols).min(DETECTOR_SIZE);
    let shift = |v: &[f64]| v[start..end].iter().map(|w| w + wl_offset).collect::<Vec<_>>();

    Ok(DispersionSolution {
        grating,
        kind,
        reference: (x0, y0),
        wave: shift(&wave),
        wav1st: shift(&wav1st),
        terms,
        angle: coeffs.angle.to_radians(),
    })
}

/// Repair the junctions of a replaced run `first..=last` so the array keeps increasing.
///
/// Values just after the run that fall below its last value, and values just before it
/// that exceed its first value, are spread linearly between the run and the next
/// in-order value (at least 1 Å apart).
pub fn make_monotonic(wave: &mut [f64], first: usize, last: usize) {
    let n = wave.len();
    if last + 1 < n {
        let edge = wave[last];
        let npts = wave[last + 1..].iter().take_while(|w| **w < edge).count();
        if npts > 0 {
            let next = wave.get(last + 1 + npts).copied().unwrap_or(edge + 1.0);
            let step = (next - edge).max(1.0) / (npts + 1) as f64;
            for k in 1..=npts {
                wave[last + k] = edge + step * k as f64;
            }
        }
    }
    if first > 0 {
        let edge = wave[first];
        let npts = wave[..first].iter().rev().take_while(|w| **w > edge).count();
        if npts > 0 {
            let prev = if first > npts {
                wave[first - npts - 1]
            } else {
                edge - 1.0
            };
            let step = (edge - prev).max(1.0) / (npts + 1) as f64;
            for k in 1..=npts {
                wave[first - k] = edge - step * k as f64;
            }
        }
    }
}

#[cfg(test)]
mod dispersion_test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_make_monotonic_after_run() {
        let mut w = vec![-50.0, -40.0, -30.0, -35.0, -32.0, -10.0, 0.0];
        make_monotonic(&mut w, 0, 2);
        // two values below -30 are spread between -30 and -10
        assert_relative_eq!(w[3], -30.0 + 20.0 / 3.0);
        assert_relative_eq!(w[4], -30.0 + 40.0 / 3.0);
        assert!(w.windows(2).all(|p| p[0] <= p[1]));
    }

    #[test]
    fn test_make_monotonic_before_run() {
        let mut w = vec![10.0, 20.0, 35.0, 40.0, 30.0, 50.0];
        make_monotonic(&mut w, 4, 5);
        assert_relative_eq!(w[3], 30.0 - 10.0 / 3.0);
        assert_relative_eq!(w[2], 30.0 - 20.0 / 3.0);
        assert!(w.windows(2).all(|p| p[0] <= p[1]));
    }

    #[test]
    fn test_zeroth_order_solution_g102() {
        let sol = solve(Grating::G102, SolutionKind::ZerothOrder, (400.0, 500.0), (0, 0), 1014, 0.0)
            .unwrap();
        assert_eq!(sol.len(), 1014);
        let (b, m) = sol.order_terms(SpectralOrder::Plus1);
        assert_relative_eq!(b, 148.538 + 0.145605 * 400.0 - 0.008558 * 500.0, epsilon = 1e-9);
        assert_relative_eq!(sol.wave[450], b + m * 50.0, epsilon = 1e-9);
        assert!(sol.wave.windows(2).all(|p| p[0] <= p[1]));
        // −1 pixels carry negative wavelengths, +2 ones doubled
        assert!(sol.wave[0] < -7000.0);
        assert!(sol.wave[1013] > 14000.0);
        assert_relative_eq!(sol.wav1st[1013], (sol.wave[1013] / 2.0).floor());
        assert_relative_eq!(sol.angle, 0.61f64.to_radians());
    }

    #[test]
    fn test_wavelength_offset_and_subarray() {
        let full = solve(Grating::G141, SolutionKind::Axe, (500.0, 500.0), (0, 0), 1014, 0.0)
            .unwrap();
        let sub = solve(Grating::G141, SolutionKind::Axe, (250.0, 250.0), (250, 250), 512, 10.0)
            .unwrap();
        assert_eq!(sub.len(), 512);
        assert_eq!(sub.reference, (500.0, 500.0));
        assert_relative_eq!(sub.wave[0], full.wave[250] + 10.0, epsilon = 1e-9);
        assert_relative_eq!(sub.wave[511], full.wave[761] + 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_all_solutions_monotonic_over_detector() {
        for grating in [Grating::G102, Grating::G141] {
            for kind in [SolutionKind::ZerothOrder, SolutionKind::Axe] {
                for x in (100..=900).step_by(200) {
                    for y in (100..=900).step_by(200) {
                        let res = solve(grating, kind, (x as f64, y as f64), (0, 0), 1014, 0.0);
                        assert!(res.is_ok(), "{grating} {kind:?} at ({x}, {y}): {res:?}");
                    }
                }
            }
        }
    }
}
