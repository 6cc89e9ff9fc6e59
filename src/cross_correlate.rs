//! # Cross-correlation alignment
//!
//! Measures the sub-pixel shift between two spectra sampled on the same pixel grid.
//!
//! A fixed template is cut from the second spectrum, far enough from the ends to leave
//! room for `width` trial shifts; a window of the same length slides over the first
//! spectrum and the normalised correlation coefficient
//!
//! ```text
//! c(i) = Σ (s1 − m1)(s2 − m2) / (σ1 · σ2)
//! ```
//!
//! is computed at every trial shift. The integer maximum is refined with the vertex of
//! the parabola through it and its two neighbours.
//!
//! The returned offset `d` is such that `s1(x) ≈ s2(x − d)`: a positive offset means the
//! features of the first spectrum sit at larger pixel indices.

use tracing::debug;

use crate::constants::Pixel;
use crate::grismo_errors::GrismoError;
use crate::params::CrossCorrParams;

/// Located maximum of the correlation curve.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationPeak {
    /// Sub-pixel shift of the first spectrum relative to the second
    pub offset: Pixel,
    /// Correlation coefficient at every trial shift
    pub curve: Vec<f64>,
    /// Trial shift holding the integer maximum
    pub index: usize,
}

/// Offset of a correlation result, `0` with no curve when the correlation was rejected.
pub fn offset_or_zero(result: Result<CorrelationPeak, GrismoError>) -> (Pixel, Option<Vec<f64>>) {
    match result {
        Ok(peak) => (peak.offset, Some(peak.curve)),
        Err(_) => (0.0, None),
    }
}

fn centred(values: &[f64]) -> (Vec<f64>, f64) {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let diff: Vec<f64> = values.iter().map(|v| v - mean).collect();
    let sigma = diff.iter().map(|d| d * d).sum::<f64>().sqrt();
    (diff, sigma)
}

/// Cross-correlate `s1` against `s2`.
///
/// Return
/// ------
/// * [`GrismoError::SearchWindowTooSmall`] if no template is left once the shifts are
///   accounted for.
/// * [`GrismoError::ZeroVarianceTemplate`] if either window is flat.
/// * [`GrismoError::CorrelationPeakAtEdge`] if the maximum is the first or last shift.
pub fn cross_correlate(
    s1: &[f64],
    s2: &[f64],
    params: &CrossCorrParams,
) -> Result<CorrelationPeak, GrismoError> {
    if s1.len() != s2.len() {
        return Err(GrismoError::InvalidParameter(format!(
            "spectra of different lengths: {} and {}",
            s1.len(),
            s2.len()
        )));
    }
    let n = s1.len() as i64;
    let width = params.width;
    let half = (width / 2) as i64;
    let approx = params.approx_shift.round() as i64;

    let t_start = (half - approx).max(0);
    let t_end = (n - 1 - approx - half).min(n - 1);
    let nt = t_end - t_start + 1;
    if nt < 1 || width < 3 {
        return Err(GrismoError::SearchWindowTooSmall(format!(
            "{n} pixels cannot hold {width} shifts around {approx}"
        )));
    }

    let (diff2, sig2) = centred(&s2[t_start as usize..=t_end as usize]);
    let mut curve = Vec::with_capacity(width);
    for i in 0..width as i64 {
        let start = t_start - half + approx + i;
        let end = start + nt;
        if start < 0 || end > n {
            return Err(GrismoError::SearchWindowTooSmall(format!(
                "shift {} leaves the spectrum",
                i - half + approx
            )));
        }
        let (diff1, sig1) = centred(&s1[start as usize..end as usize]);
        if sig1 == 0.0 || sig2 == 0.0 {
            return Err(GrismoError::ZeroVarianceTemplate);
        }
        let c = diff1.iter().zip(&diff2).map(|(a, b)| a * b).sum::<f64>() / (sig1 * sig2);
        curve.push(c);
    }

    let index = curve
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        })
        .0;
    if index == 0 || index == width - 1 {
        return Err(GrismoError::CorrelationPeakAtEdge(index));
    }

    let (a, b, c) = (curve[index - 1], curve[index], curve[index + 1]);
    let denom = a + c - 2.0 * b;
    let vertex = if denom != 0.0 { (a - b) / denom - 0.5 } else { 0.0 };
    let offset = index as f64 + vertex - half as f64 + approx as f64;
    debug!(offset, index, peak = b, template = nt, "cross-correlation");

    Ok(CorrelationPeak {
        offset,
        curve,
        index,
    })
}
