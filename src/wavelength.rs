//! # Emission-line wavelength check
//!
//! Planetary-nebula exposures show a few bright Paschen and He I emission lines whose
//! wavelengths are known to a fraction of an Ångström. Where they land on an extracted
//! spectrum measures the zero point error of the dispersion solution:
//!
//! 1. the laboratory air wavelengths are converted to vacuum and shifted by the nebula's
//!    radial velocity;
//! 2. every line inside the grating's usable range is searched within ±150/|order| Å
//!    (G102) or ±250/|order| Å (G141) of its expected position, provided the order reaches
//!    the top of that range; the continuum is the mean of the first and last fifth of the
//!    search window;
//! 3. the line centre is the centroid of the profile above half its peak
//!    ([`line_centroid`]);
//! 4. a least-squares constant through the corrections asked for by the well-measured
//!    lines gives the change to apply to `wl_offset` ([`fit_wavelength_offset`]).
//!
//! Corrections are expressed on the stitched wavelength scale (−1 order negated, +2 order
//! doubled), which is the scale `wl_offset` is added on.

use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::constants::{Angstrom, Grating, SpectralOrder};
use crate::grismo_errors::GrismoError;
use crate::numeric::{mean, polyfit, weighted_centroid};
use crate::params::{ExtractParams, ParamKey};
use crate::trace::extract::ExtractedSpectrum;

/// Speed of light (km/s)
const SPEED_OF_LIGHT: f64 = 299_792.458;

/// Laboratory air wavelengths (Å) of the nebular lines used for the check
pub const LAB_AIR_LINES: [Angstrom; 6] = [9068.6, 9532.5, 10830.0, 12818.1, 16109.3, 16407.2];

/// Flags that make a pixel next to a line peak suspect
const DQ_LINE_MASK: u32 = 32 | 256 | 512;

/// Vacuum wavelength of an air wavelength (Å).
pub fn air_to_vacuum(air: Angstrom) -> Angstrom {
    let s2 = (1.0e4 / air).powi(2);
    let n = 1.0
        + 0.000_083_366_242_120_83
        + 0.024_089_268_699_68 / (130.106_592_452_2 - s2)
        + 0.000_159_974_089_489_7 / (38.925_687_932_93 - s2);
    air * n
}

/// Rest vacuum wavelengths of the reference lines.
pub fn reference_lines() -> Vec<Angstrom> {
    LAB_AIR_LINES.iter().map(|&w| air_to_vacuum(w)).collect()
}

/// Wavelength range in which lines of one order are searched.
fn line_range(grating: Grating, order: SpectralOrder) -> (Angstrom, Angstrom) {
    match (grating, order) {
        (Grating::G102, _) => (8900.0, 11100.0),
        // the third order of 10830 Å swamps the second order beyond 13000 Å
        (Grating::G141, SpectralOrder::Plus2) => (10800.0, 13000.0),
        (Grating::G141, _) => (10800.0, 17500.0),
    }
}

fn half_window(grating: Grating, order: SpectralOrder) -> Angstrom {
    let first = match grating {
        Grating::G102 => 150.0,
        Grating::G141 => 250.0,
    };
    first / order.number().abs() as f64
}

/// Quality of a line centroid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFit {
    Good,
    /// Fewer than two points above half maximum; the centroid is the window midpoint
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineCentroid {
    pub position: f64,
    pub fit: LineFit,
}

/// Centroid of an emission line sampled at `positions`.
///
/// The continuum and half of the remaining peak are subtracted. Only the core between the
/// first and the last point above half maximum is kept, clipped at zero, so the weights
/// fall to zero at the edges and a point more or less in the wings matters little.
///
/// Return
/// ------
/// * [`GrismoError::InvalidParameter`] if the profile is empty or the two slices differ
///   in length.
pub fn line_centroid(
    positions: &[f64],
    flux: &[f64],
    continuum: f64,
) -> Result<LineCentroid, GrismoError> {
    if positions.is_empty() || positions.len() != flux.len() {
        return Err(GrismoError::InvalidParameter(format!(
            "line profile needs matching non-empty samples ({} positions, {} fluxes)",
            positions.len(),
            flux.len()
        )));
    }
    let profile: Vec<f64> = flux.iter().map(|f| f - continuum).collect();
    let half = 0.5 * profile.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let core = profile.iter().positions(|p| *p - half >= 0.0);
    let (first, last) = match core.minmax() {
        itertools::MinMaxResult::NoElements => (1, 0),
        itertools::MinMaxResult::OneElement(i) => (i, i),
        itertools::MinMaxResult::MinMax(lo, hi) => (lo, hi),
    };
    let weights: Vec<f64> = profile
        .iter()
        .enumerate()
        .map(|(i, p)| {
            if (first..=last).contains(&i) {
                (p - half).max(0.0)
            } else {
                0.0
            }
        })
        .collect();

    let n_good = weights.iter().filter(|w| **w > 0.0).count();
    let centroid = match n_good {
        0 | 1 => None,
        _ => weighted_centroid(positions, &weights),
    };
    Ok(match centroid {
        Some(position) => LineCentroid {
            position,
            fit: LineFit::Good,
        },
        None => {
            let position = positions[(positions.len() - 1) / 2];
            warn!(position, "bad line profile, centroid set to the window midpoint");
            LineCentroid {
                position,
                fit: LineFit::Bad,
            }
        }
    })
}

/// One emission line located on a spectrum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineMeasurement {
    pub order: SpectralOrder,
    /// Vacuum rest wavelength
    pub rest: Angstrom,
    /// Rest wavelength shifted by the radial velocity
    pub expected: Angstrom,
    /// Fractional readout column of the centroid
    pub column: f64,
    /// Order wavelength of the centroid on the current solution
    pub measured: Angstrom,
    pub fit: LineFit,
    /// A flagged pixel lies within one column of the peak
    pub flagged: bool,
}

impl LineMeasurement {
    /// Change of the stitched wavelength scale that puts this line where it belongs.
    pub fn correction(&self) -> Angstrom {
        self.order.number() as f64 * (self.expected - self.measured)
    }
}

/// Stitched wavelength at a fractional column.
fn wavelength_at(wavelength: &[Angstrom], column: f64) -> Angstrom {
    match wavelength.len() {
        0 => f64::NAN,
        1 => wavelength[0],
        n => {
            let i = (column.floor().max(0.0) as usize).min(n - 2);
            wavelength[i] + (column - i as f64) * (wavelength[i + 1] - wavelength[i])
        }
    }
}

/// Locate the reference lines of one order on a stitched wavelength array.
///
/// Arguments
/// ---------
/// * `wavelength` - stitched wavelengths of the spectrum (Å).
/// * `net`, `dq` - net count rate and data-quality flags, one per column.
/// * `radial_velocity` - radial velocity of the nebula (km/s).
///
/// Return
/// ------
/// * The lines found, bluest first. Lines outside the order's search range, or whose
///   search window misses the spectrum, are skipped.
/// * [`GrismoError::InvalidParameter`] if the columns disagree in length.
pub fn measure_lines(
    grating: Grating,
    wavelength: &[Angstrom],
    net: &[f64],
    dq: &[u32],
    order: SpectralOrder,
    radial_velocity: f64,
) -> Result<Vec<LineMeasurement>, GrismoError> {
    let n = wavelength.len();
    if net.len() != n || dq.len() != n {
        return Err(GrismoError::InvalidParameter(format!(
            "spectrum columns disagree in length: wavelength {n}, net {}, dq {}",
            net.len(),
            dq.len()
        )));
    }

    let number = order.number() as f64;
    let order_wave: Vec<Angstrom> = wavelength.iter().map(|w| w / number).collect();
    let reach = order_wave.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let (low, high) = line_range(grating, order);
    if reach < high {
        debug!(%grating, %order, reach, "order does not cover the line range");
        return Ok(Vec::new());
    }
    let dw = half_window(grating, order);
    let doppler = 1.0 + radial_velocity / SPEED_OF_LIGHT;

    let mut lines = Vec::new();
    for rest in reference_lines().into_iter().filter(|w| (low..=high).contains(w)) {
        let expected = rest * doppler;
        let window: Vec<usize> = (0..n)
            .filter(|&i| (order_wave[i] - expected).abs() < dw)
            .collect();
        let (first, last) = match (window.first(), window.last()) {
            (Some(&f), Some(&l)) => (f, l),
            _ => {
                debug!(%order, rest, "line window outside the spectrum");
                continue;
            }
        };

        let span = (last - first) as f64 / 5.0;
        let side = |from: f64, to: f64| {
            let values: Vec<f64> = (first..=last)
                .filter(|&i| (from..=to).contains(&(i as f64)))
                .map(|i| net[i])
                .collect();
            mean(&values)
        };
        let continuum = (side(first as f64, first as f64 + span)
            + side(last as f64 - span, last as f64))
            / 2.0;

        let columns: Vec<f64> = window.iter().map(|&i| i as f64).collect();
        let flux: Vec<f64> = window.iter().map(|&i| net[i]).collect();
        let centroid = line_centroid(&columns, &flux, continuum)?;

        let peak = window
            .iter()
            .copied()
            .max_by(|&a, &b| net[a].total_cmp(&net[b]))
            .unwrap_or(first);
        let flagged = (peak.saturating_sub(1)..=(peak + 1).min(n - 1))
            .any(|i| dq[i] & DQ_LINE_MASK != 0);
        if flagged {
            warn!(%order, rest, peak, "line centred on flagged pixels");
        }

        let measured = wavelength_at(wavelength, centroid.position) / number;
        debug!(
            %order,
            rest,
            expected,
            column = centroid.position,
            measured,
            fit = ?centroid.fit,
            "line measured"
        );
        lines.push(LineMeasurement {
            order,
            rest,
            expected,
            column: centroid.position,
            measured,
            fit: centroid.fit,
            flagged,
        });
    }
    Ok(lines)
}

/// Locate the reference lines of every order of an extracted spectrum.
pub fn measure_spectrum(
    spectrum: &ExtractedSpectrum,
    radial_velocity: f64,
) -> Result<Vec<LineMeasurement>, GrismoError> {
    SpectralOrder::ALL
        .iter()
        .map(|&order| {
            measure_lines(
                spectrum.metadata.grating,
                &spectrum.wavelength,
                &spectrum.net,
                &spectrum.dq,
                order,
                radial_velocity,
            )
        })
        .flatten_ok()
        .collect()
}

/// Zero point correction fitted to a set of line measurements.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WavelengthOffset {
    /// Amount to add to `wl_offset` (Å, stitched scale)
    pub correction: Angstrom,
    /// Scatter of the individual line corrections about it (Å)
    pub rms: Angstrom,
    pub n_lines: usize,
}

impl WavelengthOffset {
    /// Fold the correction into the extraction parameters and return the new `wl_offset`.
    pub fn apply(&self, params: &mut ExtractParams) -> Result<Angstrom, GrismoError> {
        let updated = params.wl_offset + self.correction;
        params.set(ParamKey::WlOffset, updated)?;
        Ok(updated)
    }
}

/// Least-squares wavelength zero point from the well-measured lines.
///
/// Return
/// ------
/// * [`GrismoError::NoMeasuredLines`] if no line has a good centroid.
pub fn fit_wavelength_offset(lines: &[LineMeasurement]) -> Result<WavelengthOffset, GrismoError> {
    let (expected, corrections): (Vec<f64>, Vec<f64>) = lines
        .iter()
        .filter(|l| l.fit == LineFit::Good)
        .map(|l| (l.expected, l.correction()))
        .unzip();
    if corrections.is_empty() {
        return Err(GrismoError::NoMeasuredLines(format!(
            "none of {} lines has a usable profile",
            lines.len()
        )));
    }

    let fit = polyfit(&expected, &corrections, 0)?;
    let n_lines = corrections.len();
    let offset = WavelengthOffset {
        correction: fit.coefficients[0],
        rms: (fit.residual_ss / n_lines as f64).sqrt(),
        n_lines,
    };
    info!(
        correction = offset.correction,
        rms = offset.rms,
        n_lines,
        "wavelength zero point measured"
    );
    Ok(offset)
}

#[cfg(test)]
mod wavelength_test {
    use super::*;
    use approx::assert_abs_diff_eq;

    const N: usize = 1014;

    /// Stitched wavelengths of 10 Å/px that pass through `knots` exactly.
    fn wavelength_through(knots: &[(usize, f64)]) -> Vec<f64> {
        (0..N)
            .map(|x| {
                let (first, last) = (knots[0], knots[knots.len() - 1]);
                if x <= first.0 {
                    return first.1 - 10.0 * (first.0 - x) as f64;
                }
                if x >= last.0 {
                    return last.1 + 10.0 * (x - last.0) as f64;
                }
                let k = knots.iter().rposition(|(c, _)| *c <= x).unwrap();
                let ((c0, w0), (c1, w1)) = (knots[k], knots[k + 1]);
                w0 + (w1 - w0) * (x - c0) as f64 / (c1 - c0) as f64
            })
            .collect()
    }

    /// Columns of the three G102 lines, and a spectrum showing them there whose
    /// wavelengths read `error` Å too red.
    fn g102_spectrum(error: f64) -> (Vec<usize>, Vec<f64>, Vec<f64>) {
        let lines = reference_lines();
        let rest = &lines[..3];
        let columns: Vec<usize> = rest
            .iter()
            .map(|w| ((w - 6000.0) / 10.0).round() as usize)
            .collect();
        let knots: Vec<(usize, f64)> = columns
            .iter()
            .zip(rest)
            .map(|(&c, &w)| (c, w + error))
            .collect();
        let wavelength = wavelength_through(&knots);
        let net = (0..N)
            .map(|x| {
                10.0 + columns
                    .iter()
                    .map(|&c| 100.0 * (-0.5 * ((x as f64 - c as f64) / 2.0).powi(2)).exp())
                    .sum::<f64>()
            })
            .collect();
        (columns, wavelength, net)
    }

    #[test]
    fn test_air_to_vacuum() {
        assert_abs_diff_eq!(air_to_vacuum(10830.0), 10832.9668, epsilon = 1e-3);
        assert_abs_diff_eq!(air_to_vacuum(9068.6), 9071.0894, epsilon = 1e-3);
        assert_abs_diff_eq!(air_to_vacuum(16407.2), 16411.6824, epsilon = 1e-3);
    }

    #[test]
    fn test_line_centroid_of_symmetric_profile() {
        let positions: Vec<f64> = (100..113).map(|x| x as f64).collect();
        let flux: Vec<f64> = [0.0, 0.0, 1.0, 4.0, 7.0, 9.0, 10.0, 9.0, 7.0, 4.0, 1.0, 0.0, 0.0]
            .iter()
            .map(|f| f + 2.0)
            .collect();
        let c = line_centroid(&positions, &flux, 2.0).unwrap();
        assert_eq!(c.fit, LineFit::Good);
        assert_abs_diff_eq!(c.position, 106.0, epsilon = 1e-12);

        // a brighter red wing pulls the centroid
        let mut skewed = flux.clone();
        skewed[7] += 2.0;
        assert!(line_centroid(&positions, &skewed, 2.0).unwrap().position > 106.0);
    }

    #[test]
    fn test_unresolved_profiles_fall_back_to_midpoint() {
        let positions: Vec<f64> = (0..9).map(|x| x as f64).collect();
        let flat = line_centroid(&positions, &[3.0; 9], 3.0).unwrap();
        assert_eq!(flat.fit, LineFit::Bad);
        assert_eq!(flat.position, 4.0);

        let spike = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 10.0, 0.0, 0.0];
        let c = line_centroid(&positions, &spike, 0.0).unwrap();
        assert_eq!(c, LineCentroid { position: 4.0, fit: LineFit::Bad });

        assert!(matches!(
            line_centroid(&[], &[], 0.0),
            Err(GrismoError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_measure_g102_first_order() {
        let (columns, wavelength, net) = g102_spectrum(4.0);
        let dq = vec![0; N];
        let lines =
            measure_lines(Grating::G102, &wavelength, &net, &dq, SpectralOrder::Plus1, 0.0)
                .unwrap();

        // 12821 Å lies beyond the G102 range
        assert_eq!(lines.len(), 3);
        for ((line, &column), rest) in lines.iter().zip(&columns).zip(reference_lines()) {
            assert_eq!(line.fit, LineFit::Good);
            assert!(!line.flagged);
            assert_abs_diff_eq!(line.rest, rest, epsilon = 1e-12);
            assert_abs_diff_eq!(line.column, column as f64, epsilon = 1e-9);
            assert_abs_diff_eq!(line.measured, rest + 4.0, epsilon = 1e-9);
            assert_abs_diff_eq!(line.correction(), -4.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_orders_short_of_the_range_have_no_lines() {
        let (_, wavelength, net) = g102_spectrum(0.0);
        let dq = vec![0; N];
        // no negative wavelengths, and the second order stops near 8100 Å
        for order in [SpectralOrder::Minus1, SpectralOrder::Plus2] {
            let lines = measure_lines(Grating::G102, &wavelength, &net, &dq, order, 0.0).unwrap();
            assert!(lines.is_empty());
        }
        assert!(matches!(
            measure_lines(Grating::G102, &wavelength, &net[1..], &dq, SpectralOrder::Plus1, 0.0),
            Err(GrismoError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_flagged_peak_and_radial_velocity() {
        let (columns, wavelength, net) = g102_spectrum(0.0);
        let mut dq = vec![0; N];
        dq[columns[1] + 1] = 256;
        // 16.2 km/s * 10833 Å / c is about 0.59 Å
        let lines =
            measure_lines(Grating::G102, &wavelength, &net, &dq, SpectralOrder::Plus1, 16.2)
                .unwrap();

        assert_eq!(lines.iter().map(|l| l.flagged).collect::<Vec<_>>(), [false, true, false]);
        let he = lines[2];
        assert_abs_diff_eq!(he.expected - he.rest, he.rest * 16.2 / SPEED_OF_LIGHT, epsilon = 1e-9);
        assert_abs_diff_eq!(he.measured, he.rest, epsilon = 1e-9);
        assert!(he.correction() > 0.5);
    }

    fn measurement(
        order: SpectralOrder,
        expected: f64,
        measured: f64,
        fit: LineFit,
    ) -> LineMeasurement {
        LineMeasurement {
            order,
            rest: expected,
            expected,
            column: 0.0,
            measured,
            fit,
            flagged: false,
        }
    }

    #[test]
    fn test_offset_fit_averages_good_lines() {
        let lines = [
            measurement(SpectralOrder::Plus1, 9071.0, 9074.0, LineFit::Good),
            measurement(SpectralOrder::Plus1, 10833.0, 10837.0, LineFit::Good),
            measurement(SpectralOrder::Plus1, 9535.0, 9000.0, LineFit::Bad),
            // one Å of second-order wavelength is two on the stitched scale
            measurement(SpectralOrder::Plus2, 9535.0, 9534.0, LineFit::Good),
        ];
        let offset = fit_wavelength_offset(&lines).unwrap();
        assert_eq!(offset.n_lines, 3);
        assert_abs_diff_eq!(offset.correction, -5.0 / 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(offset.rms, (62.0_f64 / 9.0).sqrt(), epsilon = 1e-9);

        let mut params = ExtractParams::for_grating(Grating::G102);
        params.wl_offset = 2.0;
        assert_abs_diff_eq!(offset.apply(&mut params).unwrap(), 1.0 / 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(params.wl_offset, 1.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_offset_fit_needs_a_good_line() {
        let lines = [measurement(SpectralOrder::Plus1, 9071.0, 9074.0, LineFit::Bad)];
        assert!(matches!(
            fit_wavelength_offset(&lines),
            Err(GrismoError::NoMeasuredLines(_))
        ));
        assert!(fit_wavelength_offset(&[]).is_err());
    }
}
