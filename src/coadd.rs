//! # Co-addition
//!
//! Merges the extracted spectra of one exposure group (observation set and grating) into
//! a single spectrum.
//!
//! Each of the −1, +1 and +2 orders is combined separately:
//!
//! 1. the spectra covering the order's nominal range (within 14 % at either end) are kept,
//!    the first one being the wavelength reference;
//! 2. every other spectrum is interpolated onto the reference grid and cross-correlated
//!    against it, bad points being bridged from their neighbours first; the offset found,
//!    converted to Ångström with the reference dispersion, corrects its wavelengths;
//! 3. the output grid is the corrected wavelength array starting furthest to the blue,
//!    extended with the red tail of the one reaching furthest (and optionally doubled);
//! 4. every quantity is interpolated onto that grid, with zeros outside a spectrum, and
//!    the good points combined: exposure-time weighted net, plain means for gross and
//!    background, time-weighted variance. Where every spectrum is bad, all of them are
//!    used.
//!
//! The three orders are clipped to their own wavelength regions, concatenated and sorted.

use tracing::{debug, info, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::constants::{
    Angstrom, Grating, SpectralOrder, COVERAGE_TOLERANCE, MAX_ALIGNMENT_OFFSET,
    MAX_COVERAGE_GAP, MJD,
};
use crate::cross_correlate::cross_correlate;
use crate::grismo_errors::GrismoError;
use crate::numeric::{interp, interp_clamped, modal_value, searchsorted};
use crate::params::{CoaddParams, CrossCorrParams};
use crate::trace::extract::ExtractedSpectrum;

/// Where a co-added spectrum comes from.
#[derive(Debug, Clone, PartialEq)]
pub struct CoaddProvenance {
    /// Roots of the exposures of the group, in input order
    pub roots: Vec<String>,
    pub target: String,
    pub grating: Grating,
    pub obset: String,
    /// Date of the first exposure
    pub date: MJD,
}

/// Merged spectrum of one exposure group.
#[derive(Debug, Clone, PartialEq)]
pub struct CoaddedSpectrum {
    pub wave: Vec<Angstrom>,
    pub gross: Vec<f64>,
    pub back: Vec<f64>,
    pub net: Vec<f64>,
    /// Standard deviation of the contributing net values
    pub stdev: Vec<f64>,
    /// Propagated statistical error
    pub stat_error: Vec<f64>,
    /// Standard error of the mean
    pub error_mean: Vec<f64>,
    /// Number of good contributing points
    pub npts: Vec<usize>,
    pub exposure_time: Vec<f64>,
    pub provenance: CoaddProvenance,
}

impl CoaddedSpectrum {
    fn empty(provenance: CoaddProvenance) -> Self {
        CoaddedSpectrum {
            wave: Vec::new(),
            gross: Vec::new(),
            back: Vec::new(),
            net: Vec::new(),
            stdev: Vec::new(),
            stat_error: Vec::new(),
            error_mean: Vec::new(),
            npts: Vec::new(),
            exposure_time: Vec::new(),
            provenance,
        }
    }

    pub fn len(&self) -> usize {
        self.wave.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wave.is_empty()
    }

    fn extend_from(&mut self, order: &CoaddedSpectrum, keep: impl Fn(Angstrom) -> bool) {
        for i in (0..order.len()).filter(|&i| keep(order.wave[i])) {
            self.wave.push(order.wave[i]);
            self.gross.push(order.gross[i]);
            self.back.push(order.back[i]);
            self.net.push(order.net[i]);
            self.stdev.push(order.stdev[i]);
            self.stat_error.push(order.stat_error[i]);
            self.error_mean.push(order.error_mean[i]);
            self.npts.push(order.npts[i]);
            self.exposure_time.push(order.exposure_time[i]);
        }
    }

    fn sort_by_wavelength(&mut self) {
        let mut idx: Vec<usize> = (0..self.len()).collect();
        idx.sort_by(|&a, &b| self.wave[a].total_cmp(&self.wave[b]));
        let pick_f = |v: &[f64]| idx.iter().map(|&i| v[i]).collect::<Vec<_>>();
        self.wave = pick_f(&self.wave);
        self.gross = pick_f(&self.gross);
        self.back = pick_f(&self.back);
        self.net = pick_f(&self.net);
        self.stdev = pick_f(&self.stdev);
        self.stat_error = pick_f(&self.stat_error);
        self.error_mean = pick_f(&self.error_mean);
        self.exposure_time = pick_f(&self.exposure_time);
        self.npts = idx.iter().map(|&i| self.npts[i]).collect();
    }
}

/// Result of a co-addition, with the reasons recorded along the way.
#[derive(Debug, Clone, PartialEq)]
pub struct CoaddOutcome {
    pub spectrum: CoaddedSpectrum,
    /// `(root, reason)` pairs to append to the exposures' notes
    pub notes: Vec<(String, String)>,
    /// Group-level warnings (orders without qualifying spectra)
    pub warnings: Vec<String>,
}

/// One spectrum of the group.
#[derive(Debug, Clone, Copy)]
pub struct CoaddInput<'a> {
    pub root: &'a str,
    pub spectrum: &'a ExtractedSpectrum,
}

/// Net flux with bad points bridged from their good neighbours.
pub fn bridge_bad_points(net: &[f64], good: &[bool]) -> Vec<f64> {
    let mut out = net.to_vec();
    let n = net.len();
    for j in 1..n {
        if good[j] {
            continue;
        }
        if j + 1 < n && good[j - 1] && good[j + 1] {
            out[j] = (out[j - 1] + out[j + 1]) / 2.0;
        } else if j + 2 < n && good[j - 1] && good[j + 2] {
            let v = (out[j - 1] + out[j + 2]) / 2.0;
            out[j] = v;
            out[j + 1] = v;
        }
    }
    out
}

/// Output grid of one order from the corrected wavelength arrays.
pub fn build_grid(corrected: &[Vec<Angstrom>], region_end: Angstrom, double: bool) -> Vec<Angstrom> {
    let extreme = |pick_max: bool| {
        corrected
            .iter()
            .enumerate()
            .flat_map(|(i, w)| w.iter().map(move |v| (i, *v)))
            .fold(None, |best: Option<(usize, f64)>, (i, v)| match best {
                Some((_, b)) if (pick_max && b >= v) || (!pick_max && b <= v) => best,
                _ => Some((i, v)),
            })
    };
    let Some((imin, _)) = extreme(false) else {
        return Vec::new();
    };
    let mut wave = corrected[imin].clone();
    let top = wave.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if let Some((imax, global_max)) = extreme(true) {
        if top < region_end && global_max > top {
            wave.extend(corrected[imax].iter().filter(|&&v| v > top));
        }
    }

    if double && wave.len() > 1 {
        let deltas: Vec<f64> = wave.windows(2).map(|p| p[1] - p[0]).collect();
        if let Some(delta) = modal_value(&deltas) {
            let half = delta / 2.0;
            let mids: Vec<f64> = wave[..wave.len() - 1].iter().map(|w| w + half).collect();
            wave.extend(mids);
            wave.sort_by(|a, b| a.total_cmp(b));
        }
    }
    wave
}

/// Wavelength correction of one spectrum relative to the reference.
enum Alignment {
    Shift { offset: f64, note: Option<String> },
    Dropped(String),
}

struct OrderFrame<'a> {
    order: SpectralOrder,
    reference: &'a [Angstrom],
    reference_net: &'a [f64],
    /// Reference dispersion at the order centre (Å/px)
    delam: f64,
    /// Nominal range clipped to the reference coverage
    range: (Angstrom, Angstrom),
    window: Option<(Angstrom, Angstrom)>,
    coverage_gap: f64,
    xcorr: CrossCorrParams,
}

impl OrderFrame<'_> {
    fn align(&self, wave: &[Angstrom], bridged: &[f64]) -> Alignment {
        let shifted = interp_clamped(self.reference, wave, bridged);
        let (wb, we) = self.window.unwrap_or(self.range);
        let lo = wave.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = wave.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let (wb, we) = (wb.max(lo), we.min(hi));
        let ib = searchsorted(self.reference, wb);
        let ie = searchsorted(self.reference, we).min(self.reference.len().saturating_sub(1));
        if ib > ie {
            return Alignment::Shift {
                offset: 0.0,
                note: Some(format!(
                    "order {}: empty correlation range [{wb:.0}, {we:.0}]",
                    self.order
                )),
            };
        }

        let result = cross_correlate(
            &self.reference_net[ib..=ie],
            &shifted[ib..=ie],
            &self.xcorr,
        );
        let (mut offset, mut note) = match result {
            Ok(peak) => (peak.offset, None),
            Err(e) => (0.0, Some(format!("order {}: {e}, offset set to 0", self.order))),
        };
        if self.coverage_gap > MAX_COVERAGE_GAP {
            offset = 0.0;
            note = Some(format!(
                "order {}: coverage gap {:.0} Å, offset set to 0",
                self.order, self.coverage_gap
            ));
        }
        if offset.abs() > MAX_ALIGNMENT_OFFSET {
            return Alignment::Dropped(format!(
                "order {}: {}",
                self.order,
                GrismoError::OffsetExceedsCap(offset)
            ));
        }
        Alignment::Shift { offset, note }
    }
}

/// Per-point sums of one order.
struct Accumulator {
    f: Vec<f64>,
    ft: Vec<f64>,
    f2: Vec<f64>,
    g: Vec<f64>,
    b: Vec<f64>,
    t: Vec<f64>,
    var: Vec<f64>,
    npts: Vec<usize>,
}

impl Accumulator {
    fn new(n: usize) -> Self {
        Accumulator {
            f: vec![0.0; n],
            ft: vec![0.0; n],
            f2: vec![0.0; n],
            g: vec![0.0; n],
            b: vec![0.0; n],
            t: vec![0.0; n],
            var: vec![0.0; n],
            npts: vec![0; n],
        }
    }
}

/// Interpolated columns of one spectrum on the output grid.
struct Resampled {
    net: Vec<f64>,
    back: Vec<f64>,
    gross: Vec<f64>,
    var: Vec<f64>,
    time: Vec<f64>,
    good: Vec<bool>,
}

fn resample(grid: &[Angstrom], wave: &[Angstrom], spec: &ExtractedSpectrum, mask: u32) -> Resampled {
    let at = |values: &[f64]| -> Vec<f64> {
        grid.iter().map(|&w| interp(w, wave, values, 0.0, 0.0)).collect()
    };
    let var: Vec<f64> = spec.err.iter().map(|e| e * e).collect();
    let quality: Vec<f64> = spec
        .dq
        .iter()
        .map(|d| if d & mask == 0 { 1.0 } else { 0.0 })
        .collect();
    Resampled {
        net: at(&spec.net),
        back: at(&spec.background),
        gross: at(&spec.gross),
        var: at(&var),
        time: at(&spec.time),
        good: at(&quality).into_iter().map(|m| m >= 1.0).collect(),
    }
}

fn combine(grid: Vec<Angstrom>, parts: &[Resampled], provenance: &CoaddProvenance) -> CoaddedSpectrum {
    let n = grid.len();
    let ngood = parts.len();
    let mut acc = Accumulator::new(n);
    for p in parts {
        for k in (0..n).filter(|&k| p.good[k]) {
            acc.f[k] += p.net[k];
            acc.ft[k] += p.time[k] * p.net[k];
            acc.g[k] += p.gross[k];
            acc.t[k] += p.time[k];
            acc.f2[k] += p.net[k] * p.net[k];
            acc.var[k] += p.time[k] * p.time[k] * p.var[k];
            acc.npts[k] += 1;
        }
        for k in 0..n {
            acc.b[k] += p.back[k];
        }
    }

    // no good point anywhere: use every spectrum
    let all_bad: Vec<usize> = (0..n).filter(|&k| acc.npts[k] == 0).collect();
    for &k in &all_bad {
        for p in parts {
            acc.f[k] += p.net[k];
            acc.ft[k] += p.time[k] * p.net[k];
            acc.g[k] += p.gross[k];
            acc.t[k] += p.time[k];
            acc.f2[k] += p.net[k] * p.net[k];
            acc.var[k] += p.time[k] * p.time[k] * p.var[k];
        }
    }

    let mut out = CoaddedSpectrum::empty(provenance.clone());
    for k in 0..n {
        let count = if acc.npts[k] == 0 { ngood } else { acc.npts[k] };
        let npts = count.max(1) as f64;
        let weight = if acc.t[k] == 0.0 { 1.0 } else { acc.t[k] };
        let mean = acc.f[k] / npts;
        let stdev = (acc.f2[k] / npts - mean * mean).max(0.0).sqrt();

        out.wave.push(grid[k]);
        out.net.push(acc.ft[k] / weight);
        out.stat_error.push(acc.var[k].sqrt() / weight);
        out.back.push(acc.b[k] / ngood.max(1) as f64);
        out.gross.push(acc.g[k] / npts);
        out.stdev.push(stdev);
        out.error_mean.push(stdev / npts.sqrt());
        out.npts.push(acc.npts[k]);
        out.exposure_time.push(acc.t[k]);
    }
    debug!(points = n, spectra = ngood, all_bad = all_bad.len(), "order combined");
    out
}

fn wavelength_bounds(wave: &[Angstrom]) -> (Angstrom, Angstrom) {
    wave.iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &w| (lo.min(w), hi.max(w)))
}

/// Co-add the spectra of one group.
///
/// Return
/// ------
/// * [`GrismoError::NoQualifyingSpectra`] when no order has a spectrum covering it.
pub fn coadd(
    inputs: &[CoaddInput],
    params: &CoaddParams,
    provenance: CoaddProvenance,
) -> Result<CoaddOutcome, GrismoError> {
    let mut notes: Vec<(String, String)> = Vec::new();
    let mut warnings = Vec::new();
    let inputs: Vec<&CoaddInput> = inputs.iter().filter(|i| !i.spectrum.is_empty()).collect();
    if inputs.is_empty() {
        return Err(GrismoError::NoQualifyingSpectra(format!(
            "{} {}: no extracted spectrum",
            provenance.obset, provenance.grating
        )));
    }

    let goods: Vec<Vec<bool>> = inputs
        .iter()
        .map(|i| i.spectrum.dq.iter().map(|d| d & params.quality_mask == 0).collect())
        .collect();
    let bridged: Vec<Vec<f64>> = inputs
        .iter()
        .zip(&goods)
        .map(|(i, g)| bridge_bad_points(&i.spectrum.net, g))
        .collect();

    let mut regions = params.regions;
    let first_min = inputs
        .iter()
        .filter_map(|i| i.spectrum.wavelength.first())
        .cloned()
        .fold(f64::INFINITY, f64::min);
    let last_max = inputs
        .iter()
        .filter_map(|i| i.spectrum.wavelength.last())
        .cloned()
        .fold(f64::NEG_INFINITY, f64::max);
    regions[0].0 = regions[0].0.max(first_min);
    regions[2].1 = regions[2].1.min(last_max);

    let mut merged = CoaddedSpectrum::empty(provenance.clone());
    let mut any_order = false;

    for order in SpectralOrder::ALL {
        let n = order.number() as f64;
        let (wb, we) = match order {
            SpectralOrder::Minus1 => (-params.wend, -params.wbeg),
            _ => (params.wbeg * n, params.wend * n),
        };
        let d10 = (we - wb) * COVERAGE_TOLERANCE;
        let members: Vec<usize> = (0..inputs.len())
            .filter(|&j| {
                let w = &inputs[j].spectrum.wavelength;
                let (_, hi) = wavelength_bounds(w);
                hi >= we - d10 && w.first().is_some_and(|&w0| w0 <= wb + d10)
            })
            .collect();
        let Some((&reference, others)) = members.split_first() else {
            let msg = format!(
                "{} {}: no spectrum covers order {order} ({:.0}–{:.0} Å)",
                provenance.obset, provenance.grating, params.wbeg, params.wend
            );
            warn!("{msg}");
            warnings.push(msg);
            continue;
        };

        let wl1 = &inputs[reference].spectrum.wavelength;
        let mut corrected: Vec<(usize, Vec<Angstrom>)> = vec![(reference, wl1.clone())];

        if !others.is_empty() {
            let wcent = (wb + we) / 2.0;
            let icen = searchsorted(wl1, wcent).min(wl1.len().saturating_sub(2));
            let delam = if wl1.len() > 1 {
                wl1[icen + 1] - wl1[icen]
            } else {
                0.0
            };
            let (lo, hi) = wavelength_bounds(wl1);
            let range = (wb.max(lo), we.min(hi));
            let frame = OrderFrame {
                order,
                reference: wl1,
                reference_net: &bridged[reference],
                delam,
                range,
                window: params.xcorr_windows[order.index()],
                coverage_gap: (params.wend - params.wbeg) - ((range.1 - range.0) / n).abs(),
                xcorr: params.xcorr,
            };

            let align_one = |&j: &usize| (j, frame.align(&inputs[j].spectrum.wavelength, &bridged[j]));
            #[cfg(feature = "parallel")]
            let alignments: Vec<(usize, Alignment)> = others.par_iter().map(align_one).collect();
            #[cfg(not(feature = "parallel"))]
            let alignments: Vec<(usize, Alignment)> = others.iter().map(align_one).collect();

            for (j, alignment) in alignments {
                let root = inputs[j].root.to_string();
                match alignment {
                    Alignment::Shift { offset, note } => {
                        if let Some(note) = note {
                            warn!(%root, "{note}");
                            notes.push((root.clone(), note));
                        }
                        debug!(%root, %order, offset, "alignment offset");
                        let shift = offset * frame.delam;
                        corrected.push((
                            j,
                            inputs[j].spectrum.wavelength.iter().map(|w| w + shift).collect(),
                        ));
                    }
                    Alignment::Dropped(reason) => {
                        warn!(%root, "{reason}, exposure dropped from the order");
                        notes.push((root, format!("{reason}, dropped from the co-add")));
                    }
                }
            }
        }

        let (_, region_end) = regions[order.index()];
        let waves: Vec<Vec<Angstrom>> = corrected.iter().map(|(_, w)| w.clone()).collect();
        let grid = build_grid(&waves, region_end, params.double);
        let parts: Vec<Resampled> = corrected
            .iter()
            .map(|(j, w)| resample(&grid, w, inputs[*j].spectrum, params.quality_mask))
            .collect();
        let combined = combine(grid, &parts, &provenance);

        let (rb, re) = regions[order.index()];
        merged.extend_from(&combined, |w| w >= rb && w < re);
        any_order = true;
        info!(%order, spectra = corrected.len(), "order co-added");
    }

    if !any_order {
        return Err(GrismoError::NoQualifyingSpectra(format!(
            "{} {}: {}",
            provenance.obset,
            provenance.grating,
            warnings.join("; ")
        )));
    }
    merged.sort_by_wavelength();
    Ok(CoaddOutcome {
        spectrum: merged,
        notes,
        warnings,
    })
}

#[cfg(test)]
mod coadd_test {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_bridge_bad_points() {
        let net = [1.0, 100.0, 3.0, 100.0, 100.0, 9.0, 5.0];
        let good = [true, false, true, false, false, true, true];
        let out = bridge_bad_points(&net, &good);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 6.0, 6.0, 9.0, 5.0]);
    }

    #[test]
    fn test_grid_extends_with_red_tail_and_doubles() {
        let a = vec![0.0, 10.0, 20.0, 30.0];
        let b = vec![5.0, 15.0, 25.0, 35.0, 45.0];
        let grid = build_grid(&[b.clone(), a.clone()], 100.0, false);
        assert_eq!(grid, vec![0.0, 10.0, 20.0, 30.0, 35.0, 45.0]);
        // already past the region end: no extension
        assert_eq!(build_grid(&[a.clone(), b.clone()], 25.0, false), a);

        let doubled = build_grid(&[a], 100.0, true);
        assert_eq!(doubled, vec![0.0, 5.0, 10.0, 15.0, 20.0, 25.0, 30.0]);
        assert!(build_grid(&[], 10.0, false).is_empty());
    }

    #[test]
    fn test_combine_weights_and_counts() {
        let provenance = CoaddProvenance {
            roots: vec![],
            target: "GD153".into(),
            grating: Grating::G102,
            obset: "ibbu01".into(),
            date: 55000.0,
        };
        let part = |net: f64, time: f64, good: bool| Resampled {
            net: vec![net; 2],
            back: vec![1.0; 2],
            gross: vec![net + 1.0; 2],
            var: vec![4.0; 2],
            time: vec![time; 2],
            good: vec![good, true],
        };
        let out = combine(
            vec![1.0, 2.0],
            &[part(10.0, 100.0, true), part(20.0, 300.0, false)],
            &provenance,
        );
        // first point: only the good spectrum
        assert_eq!(out.npts, vec![1, 2]);
        assert_abs_diff_eq!(out.net[0], 10.0);
        assert_abs_diff_eq!(out.stat_error[0], 2.0);
        // second point: time-weighted mean
        assert_abs_diff_eq!(out.net[1], 17.5);
        assert_abs_diff_eq!(out.gross[1], 16.0);
        assert_abs_diff_eq!(out.back[1], 1.0);
        assert_abs_diff_eq!(out.stdev[1], 5.0);
        assert_abs_diff_eq!(out.exposure_time[1], 400.0);

        // every spectrum bad: all of them are used, the count stays at zero
        let out = combine(
            vec![1.0, 2.0],
            &[part(10.0, 100.0, false), part(20.0, 100.0, false)],
            &provenance,
        );
        assert_eq!(out.npts[0], 0);
        assert_abs_diff_eq!(out.net[0], 15.0);
        assert_abs_diff_eq!(out.gross[0], 16.0);
    }
}
