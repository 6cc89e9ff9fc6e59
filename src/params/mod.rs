//! # Extraction and co-addition parameters
//!
//! This module defines the tunable parameter sets of the pipeline:
//!
//! - [`ExtractParams`]: trace search, extraction and background geometry of one exposure,
//! - [`CoaddParams`]: per-order wavelength regions and combination policy of one group,
//! - [`CrossCorrParams`]: search window of the cross-correlation alignment.
//!
//! Each set has grating-aware defaults, a fluent builder whose `build()` validates the
//! values, and an alternate [`Display`](std::fmt::Display) (`{:#}`) that prints an
//! annotated table.
//!
//! ## Resolution order
//!
//! A parameter value is resolved in three tiers, later tiers winning:
//!
//! 1. the defaults of the parameter set,
//! 2. matching rows of the [`KnownIssues`](crate::params::known_issues::KnownIssues) table,
//! 3. explicit caller overrides, given as `(ParamKey, f64)` pairs.
//!
//! [`resolve`] performs that lookup for a single key and reports whether the value was
//! overridden, so that dependent defaults (the background distances follow `bwidth`) can
//! be recomputed only when the caller did not pin them.
//!
//! ## Example
//!
//! ```rust,no_run
//! use grismo::constants::Grating;
//! use grismo::params::ExtractParams;
//!
//! let params = ExtractParams::builder(Grating::G102)
//!     .ywidth(15)
//!     .bwidth(9)
//!     .build()
//!     .unwrap();
//! assert_eq!(params.ubdist, 25.0 + 4.5);
//! println!("{params:#}");
//! ```

pub mod known_issues;

use std::cmp::Ordering::{Equal, Greater, Less};
use std::fmt;
use std::str::FromStr;

use crate::constants::{
    Angstrom, Degree, Grating, Pixel, SpectralOrder, DQ_COADD_MASK, DQ_REPAIR_MASK,
};
use crate::grismo_errors::GrismoError;

/// Name of a parameter that can be overridden by the known-issue table or the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKey {
    Ywidth,
    YOffset,
    Gwidth,
    Bwidth,
    Bmedian,
    Bmean1,
    Bmean2,
    Bdist,
    Ubdist,
    Lbdist,
    Yshift,
    WlOffset,
    IxShift,
    IyShift,
    /// Forced trace angle in degrees
    Slope,
    /// Direct-image x position
    Xc,
    /// Direct-image y position
    Yc,
    Xerr,
    Yerr,
    /// Forced target position on a direct image
    Xstar,
    Ystar,
    WlrangM1Low,
    WlrangM1High,
    WlrangP1Low,
    WlrangP1High,
    WlrangP2Low,
    WlrangP2High,
    /// Cross-correlation search width
    Width,
    Wbeg,
    Wend,
    Double,
}

impl ParamKey {
    pub fn name(&self) -> &'static str {
        match self {
            ParamKey::Ywidth => "ywidth",
            ParamKey::YOffset => "y_offset",
            ParamKey::Gwidth => "gwidth",
            ParamKey::Bwidth => "bwidth",
            ParamKey::Bmedian => "bmedian",
            ParamKey::Bmean1 => "bmean1",
            ParamKey::Bmean2 => "bmean2",
            ParamKey::Bdist => "bdist",
            ParamKey::Ubdist => "ubdist",
            ParamKey::Lbdist => "lbdist",
            ParamKey::Yshift => "yshift",
            ParamKey::WlOffset => "wl_offset",
            ParamKey::IxShift => "ix_shift",
            ParamKey::IyShift => "iy_shift",
            ParamKey::Slope => "slope",
            ParamKey::Xc => "xc",
            ParamKey::Yc => "yc",
            ParamKey::Xerr => "xerr",
            ParamKey::Yerr => "yerr",
            ParamKey::Xstar => "xstar",
            ParamKey::Ystar => "ystar",
            ParamKey::WlrangM1Low => "wlrang_m1_low",
            ParamKey::WlrangM1High => "wlrang_m1_high",
            ParamKey::WlrangP1Low => "wlrang_p1_low",
            ParamKey::WlrangP1High => "wlrang_p1_high",
            ParamKey::WlrangP2Low => "wlrang_p2_low",
            ParamKey::WlrangP2High => "wlrang_p2_high",
            ParamKey::Width => "width",
            ParamKey::Wbeg => "wbeg",
            ParamKey::Wend => "wend",
            ParamKey::Double => "double",
        }
    }

    const ALL: [ParamKey; 31] = [
        ParamKey::Ywidth,
        ParamKey::YOffset,
        ParamKey::Gwidth,
        ParamKey::Bwidth,
        ParamKey::Bmedian,
        ParamKey::Bmean1,
        ParamKey::Bmean2,
        ParamKey::Bdist,
        ParamKey::Ubdist,
        ParamKey::Lbdist,
        ParamKey::Yshift,
        ParamKey::WlOffset,
        ParamKey::IxShift,
        ParamKey::IyShift,
        ParamKey::Slope,
        ParamKey::Xc,
        ParamKey::Yc,
        ParamKey::Xerr,
        ParamKey::Yerr,
        ParamKey::Xstar,
        ParamKey::Ystar,
        ParamKey::WlrangM1Low,
        ParamKey::WlrangM1High,
        ParamKey::WlrangP1Low,
        ParamKey::WlrangP1High,
        ParamKey::WlrangP2Low,
        ParamKey::WlrangP2High,
        ParamKey::Width,
        ParamKey::Wbeg,
        ParamKey::Wend,
        ParamKey::Double,
    ];
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ParamKey {
    type Err = GrismoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        ParamKey::ALL
            .iter()
            .find(|k| k.name() == name)
            .copied()
            .ok_or_else(|| GrismoError::InvalidParameter(format!("unknown parameter '{s}'")))
    }
}

/// Tier a resolved parameter value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    Default,
    KnownIssue,
    Caller,
}

/// A parameter value together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub value: T,
    pub source: ParamSource,
}

impl<T> Resolved<T> {
    pub fn overridden(&self) -> bool {
        self.source != ParamSource::Default
    }
}

/// Resolve one parameter through the default → known issue → caller tiers.
///
/// `issues` holds the values of the known-issue rows that already matched the exposure, in
/// table order; the last one wins. The last caller override for `key` wins over all.
pub fn resolve(
    key: ParamKey,
    default: f64,
    issues: &[(ParamKey, f64)],
    caller: &[(ParamKey, f64)],
) -> Resolved<f64> {
    let pick = |list: &[(ParamKey, f64)]| {
        list.iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    };
    if let Some(value) = pick(caller) {
        Resolved {
            value,
            source: ParamSource::Caller,
        }
    } else if let Some(value) = pick(issues) {
        Resolved {
            value,
            source: ParamSource::KnownIssue,
        }
    } else {
        Resolved {
            value: default,
            source: ParamSource::Default,
        }
    }
}

/// Whether the background is removed before or after the flatfield division.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOrder {
    FlatFirst,
    BackgroundFirst,
}

impl fmt::Display for ProcessingOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingOrder::FlatFirst => f.write_str("flat_first"),
            ProcessingOrder::BackgroundFirst => f.write_str("bkg_first"),
        }
    }
}

impl FromStr for ProcessingOrder {
    type Err = GrismoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "flat_first" => Ok(ProcessingOrder::FlatFirst),
            "bkg_first" => Ok(ProcessingOrder::BackgroundFirst),
            other => Err(GrismoError::InvalidParameter(format!(
                "unknown processing order '{other}'"
            ))),
        }
    }
}

/// Wavelength interval, in Å, used to locate one spectral order.
///
/// The bounds are given for the order's physical wavelengths; they are multiplied by the
/// signed order number before being compared with a stitched wavelength array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderRange {
    pub low: Angstrom,
    pub high: Angstrom,
}

impl OrderRange {
    /// `(low, high)` in stitched-array units, ordered so that `low <= high`.
    pub fn stitched(&self, order: SpectralOrder) -> (Angstrom, Angstrom) {
        let n = order.number() as f64;
        let (a, b) = (self.low * n, self.high * n);
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Numeric helpers shared by the builders (NaN is never valid)
// -------------------------------------------------------------------------------------------------

#[inline]
fn gt0(x: f64) -> bool {
    x.partial_cmp(&0.0) == Some(Greater)
}

#[inline]
fn ge0(x: f64) -> bool {
    matches!(x.partial_cmp(&0.0), Some(Greater) | Some(Equal))
}

#[inline]
fn lt(a: f64, b: f64) -> bool {
    a.partial_cmp(&b) == Some(Less)
}

fn as_width(key: ParamKey, value: f64) -> Result<usize, GrismoError> {
    if !ge0(value) || value.fract() != 0.0 {
        return Err(GrismoError::InvalidParameter(format!(
            "{key} must be a non-negative integer, got {value}"
        )));
    }
    Ok(value as usize)
}

// -------------------------------------------------------------------------------------------------
// Extraction
// -------------------------------------------------------------------------------------------------

/// Parameters of the trace fit, background model and extraction of one exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractParams {
    pub grating: Grating,
    /// Height of the cross-dispersion search box (px)
    pub ywidth: usize,
    /// Offset added to the predicted trace (px)
    pub y_offset: Pixel,
    /// Height of the extraction box (px)
    pub gwidth: usize,
    /// Height of each background sampling box (px)
    pub bwidth: usize,
    /// Median-filter width applied to the background curves
    pub bmedian: usize,
    /// First boxcar width applied to the sky background
    pub bmean1: usize,
    /// Second boxcar width applied to the sky background
    pub bmean2: usize,
    /// Distance from the trace to the upper background box (px)
    pub ubdist: Pixel,
    /// Distance from the trace to the lower background box (px)
    pub lbdist: Pixel,
    /// Extra slope added to the predicted trace
    pub yshift: f64,
    /// Constant added to every wavelength (Å)
    pub wl_offset: Angstrom,
    /// Offset from the direct-image position to the zeroth order along x (px)
    pub ix_shift: Pixel,
    /// Offset from the direct-image position to the zeroth order along y (px)
    pub iy_shift: Pixel,
    /// Search ranges of the −1, +1 and +2 orders, indexed by [`SpectralOrder::index`]
    pub order_ranges: [OrderRange; 3],
    /// DQ bits repaired from horizontal neighbours before extraction
    pub repair_mask: u32,
    pub processing_order: ProcessingOrder,
    /// Forced trace angle (degrees); skips the multi-order fit
    pub slope: Option<Degree>,
    /// Retries of the profile search when the peak falls on the box edge
    pub max_profile_retries: usize,
    /// Forced direct-image position
    pub xc: Option<Pixel>,
    pub yc: Option<Pixel>,
    pub xerr: Pixel,
    pub yerr: Pixel,
    /// Forced target position used when locating the direct image
    pub xstar: Option<Pixel>,
    pub ystar: Option<Pixel>,
}

impl ExtractParams {
    /// Defaults of the given grating.
    pub fn for_grating(grating: Grating) -> Self {
        let bwidth = 13;
        let bdist = default_bdist(bwidth);
        let (ix_shift, iy_shift, order_ranges) = match grating {
            Grating::G102 => (
                252.0,
                4.0,
                [
                    OrderRange {
                        low: 8000.0,
                        high: 10000.0,
                    },
                    OrderRange {
                        low: 8800.0,
                        high: 11000.0,
                    },
                    OrderRange {
                        low: 8000.0,
                        high: 10800.0,
                    },
                ],
            ),
            Grating::G141 => (
                188.0,
                1.0,
                [
                    OrderRange {
                        low: 10800.0,
                        high: 16000.0,
                    },
                    OrderRange {
                        low: 10800.0,
                        high: 16000.0,
                    },
                    OrderRange {
                        low: 10000.0,
                        high: 13000.0,
                    },
                ],
            ),
        };
        ExtractParams {
            grating,
            ywidth: 11,
            y_offset: 0.0,
            gwidth: 6,
            bwidth,
            bmedian: 7,
            bmean1: 7,
            bmean2: 7,
            ubdist: bdist,
            lbdist: bdist,
            yshift: 0.0,
            wl_offset: 0.0,
            ix_shift,
            iy_shift,
            order_ranges,
            repair_mask: DQ_REPAIR_MASK,
            processing_order: ProcessingOrder::FlatFirst,
            slope: None,
            max_profile_retries: 1,
            xc: None,
            yc: None,
            xerr: 0.0,
            yerr: 0.0,
            xstar: None,
            ystar: None,
        }
    }

    pub fn builder(grating: Grating) -> ExtractParamsBuilder {
        ExtractParamsBuilder::new(grating)
    }

    pub fn order_range(&self, order: SpectralOrder) -> OrderRange {
        self.order_ranges[order.index()]
    }

    /// Set one parameter from its key. Keys that belong to other parameter sets are
    /// ignored and `false` is returned.
    pub fn set(&mut self, key: ParamKey, value: f64) -> Result<bool, GrismoError> {
        match key {
            ParamKey::Ywidth => self.ywidth = as_width(key, value)?,
            ParamKey::YOffset => self.y_offset = value,
            ParamKey::Gwidth => self.gwidth = as_width(key, value)?,
            ParamKey::Bwidth => self.bwidth = as_width(key, value)?,
            ParamKey::Bmedian => self.bmedian = as_width(key, value)?,
            ParamKey::Bmean1 => self.bmean1 = as_width(key, value)?,
            ParamKey::Bmean2 => self.bmean2 = as_width(key, value)?,
            ParamKey::Bdist => {
                self.ubdist = value;
                self.lbdist = value;
            }
            ParamKey::Ubdist => self.ubdist = value,
            ParamKey::Lbdist => self.lbdist = value,
            ParamKey::Yshift => self.yshift = value,
            ParamKey::WlOffset => self.wl_offset = value,
            ParamKey::IxShift => self.ix_shift = value,
            ParamKey::IyShift => self.iy_shift = value,
            ParamKey::Slope => self.slope = Some(value),
            ParamKey::Xc => self.xc = Some(value),
            ParamKey::Yc => self.yc = Some(value),
            ParamKey::Xerr => self.xerr = value,
            ParamKey::Yerr => self.yerr = value,
            ParamKey::Xstar => self.xstar = Some(value),
            ParamKey::Ystar => self.ystar = Some(value),
            ParamKey::WlrangM1Low => self.order_ranges[0].low = value,
            ParamKey::WlrangM1High => self.order_ranges[0].high = value,
            ParamKey::WlrangP1Low => self.order_ranges[1].low = value,
            ParamKey::WlrangP1High => self.order_ranges[1].high = value,
            ParamKey::WlrangP2Low => self.order_ranges[2].low = value,
            ParamKey::WlrangP2High => self.order_ranges[2].high = value,
            ParamKey::Width | ParamKey::Wbeg | ParamKey::Wend | ParamKey::Double => {
                return Ok(false)
            }
        }
        Ok(true)
    }

    /// Apply the known-issue values then the caller overrides, and recompute the background
    /// distances from `bwidth` unless they were pinned themselves.
    ///
    /// Returns the validated parameters and the keys that changed.
    pub fn with_overrides(
        &self,
        issues: &[(ParamKey, f64)],
        caller: &[(ParamKey, f64)],
    ) -> Result<(ExtractParams, Vec<ParamKey>), GrismoError> {
        let mut params = self.clone();
        let mut changed = Vec::new();
        for key in ParamKey::ALL {
            let default = params.current(key);
            let resolved = resolve(key, default.unwrap_or(f64::NAN), issues, caller);
            if resolved.overridden() && params.set(key, resolved.value)? {
                changed.push(key);
            }
        }
        let pinned = |k: ParamKey| changed.contains(&k);
        if pinned(ParamKey::Bwidth) && !pinned(ParamKey::Bdist) {
            let bdist = default_bdist(params.bwidth);
            if !pinned(ParamKey::Ubdist) {
                params.ubdist = bdist;
            }
            if !pinned(ParamKey::Lbdist) {
                params.lbdist = bdist;
            }
        }
        let params = ExtractParamsBuilder { params }.build()?;
        Ok((params, changed))
    }

    fn current(&self, key: ParamKey) -> Option<f64> {
        Some(match key {
            ParamKey::Ywidth => self.ywidth as f64,
            ParamKey::YOffset => self.y_offset,
            ParamKey::Gwidth => self.gwidth as f64,
            ParamKey::Bwidth => self.bwidth as f64,
            ParamKey::Bmedian => self.bmedian as f64,
            ParamKey::Bmean1 => self.bmean1 as f64,
            ParamKey::Bmean2 => self.bmean2 as f64,
            ParamKey::Bdist | ParamKey::Ubdist => self.ubdist,
            ParamKey::Lbdist => self.lbdist,
            ParamKey::Yshift => self.yshift,
            ParamKey::WlOffset => self.wl_offset,
            ParamKey::IxShift => self.ix_shift,
            ParamKey::IyShift => self.iy_shift,
            ParamKey::Slope => return self.slope,
            ParamKey::Xc => return self.xc,
            ParamKey::Yc => return self.yc,
            ParamKey::Xerr => self.xerr,
            ParamKey::Yerr => self.yerr,
            ParamKey::Xstar => return self.xstar,
            ParamKey::Ystar => return self.ystar,
            ParamKey::WlrangM1Low => self.order_ranges[0].low,
            ParamKey::WlrangM1High => self.order_ranges[0].high,
            ParamKey::WlrangP1Low => self.order_ranges[1].low,
            ParamKey::WlrangP1High => self.order_ranges[1].high,
            ParamKey::WlrangP2Low => self.order_ranges[2].low,
            ParamKey::WlrangP2High => self.order_ranges[2].high,
            ParamKey::Width | ParamKey::Wbeg | ParamKey::Wend | ParamKey::Double => return None,
        })
    }
}

fn default_bdist(bwidth: usize) -> Pixel {
    25.0 + bwidth as f64 / 2.0
}

/// Builder for [`ExtractParams`], with validation.
#[derive(Debug, Clone)]
pub struct ExtractParamsBuilder {
    params: ExtractParams,
}

impl ExtractParamsBuilder {
    pub fn new(grating: Grating) -> Self {
        Self {
            params: ExtractParams::for_grating(grating),
        }
    }

    pub fn ywidth(mut self, v: usize) -> Self {
        self.params.ywidth = v;
        self
    }

    pub fn y_offset(mut self, v: Pixel) -> Self {
        self.params.y_offset = v;
        self
    }

    pub fn gwidth(mut self, v: usize) -> Self {
        self.params.gwidth = v;
        self
    }

    /// Set the background box height; the distances follow unless set explicitly later.
    pub fn bwidth(mut self, v: usize) -> Self {
        self.params.bwidth = v;
        self.params.ubdist = default_bdist(v);
        self.params.lbdist = default_bdist(v);
        self
    }

    pub fn bmedian(mut self, v: usize) -> Self {
        self.params.bmedian = v;
        self
    }

    pub fn bmean(mut self, first: usize, second: usize) -> Self {
        self.params.bmean1 = first;
        self.params.bmean2 = second;
        self
    }

    pub fn bdist(mut self, upper: Pixel, lower: Pixel) -> Self {
        self.params.ubdist = upper;
        self.params.lbdist = lower;
        self
    }

    pub fn yshift(mut self, v: f64) -> Self {
        self.params.yshift = v;
        self
    }

    pub fn wl_offset(mut self, v: Angstrom) -> Self {
        self.params.wl_offset = v;
        self
    }

    pub fn zeroth_order_shift(mut self, ix: Pixel, iy: Pixel) -> Self {
        self.params.ix_shift = ix;
        self.params.iy_shift = iy;
        self
    }

    pub fn order_range(mut self, order: SpectralOrder, low: Angstrom, high: Angstrom) -> Self {
        self.params.order_ranges[order.index()] = OrderRange { low, high };
        self
    }

    pub fn repair_mask(mut self, v: u32) -> Self {
        self.params.repair_mask = v;
        self
    }

    pub fn processing_order(mut self, v: ProcessingOrder) -> Self {
        self.params.processing_order = v;
        self
    }

    pub fn slope(mut self, v: Degree) -> Self {
        self.params.slope = Some(v);
        self
    }

    pub fn max_profile_retries(mut self, v: usize) -> Self {
        self.params.max_profile_retries = v;
        self
    }

    pub fn direct_position(mut self, xc: Pixel, yc: Pixel) -> Self {
        self.params.xc = Some(xc);
        self.params.yc = Some(yc);
        self
    }

    /// Finalize the builder.
    ///
    /// Validation rules
    /// -----------------
    /// * `ywidth >= 5` – the profile search needs room for a three-pixel centroid and margins.
    /// * `gwidth >= 1`, `bwidth >= 1`.
    /// * `ubdist > 0`, `lbdist > 0`.
    /// * every order range satisfies `0 < low < high`.
    pub fn build(self) -> Result<ExtractParams, GrismoError> {
        let p = &self.params;

        if p.ywidth < 5 {
            return Err(GrismoError::SearchWindowTooSmall(format!(
                "ywidth = {} (minimum 5)",
                p.ywidth
            )));
        }
        if p.gwidth == 0 || p.bwidth == 0 {
            return Err(GrismoError::InvalidParameter(
                "gwidth and bwidth must be at least 1".into(),
            ));
        }
        if !gt0(p.ubdist) || !gt0(p.lbdist) {
            return Err(GrismoError::InvalidParameter(
                "background distances must be strictly positive".into(),
            ));
        }
        for (order, range) in SpectralOrder::ALL.iter().zip(p.order_ranges.iter()) {
            if !gt0(range.low) || !lt(range.low, range.high) {
                return Err(GrismoError::InvalidWavelengthRange(format!(
                    "order {order}: [{}, {}]",
                    range.low, range.high
                )));
            }
        }

        Ok(self.params)
    }
}

impl fmt::Display for ExtractParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            const PARAM_COL: usize = 44;
            writeln!(f, "Extraction Parameters ({})", self.grating)?;
            writeln!(f, "-----------------------------")?;

            macro_rules! line {
                ($fmt:expr, $val:expr, $comment:expr) => {{
                    let s = format!($fmt, $val);
                    let pad = if s.len() < PARAM_COL {
                        " ".repeat(PARAM_COL - s.len())
                    } else {
                        " ".to_string()
                    };
                    writeln!(f, "  {}{}# {}", s, pad, $comment)
                }};
            }

            writeln!(f, "[Trace]")?;
            line!("ywidth    = {} px", self.ywidth, "Profile search box height")?;
            line!("y_offset  = {:.2} px", self.y_offset, "Offset of the predicted trace")?;
            line!("yshift    = {:.4}", self.yshift, "Extra predicted trace slope")?;
            line!(
                "slope     = {}",
                self.slope
                    .map(|s| format!("{s:.3} deg"))
                    .unwrap_or_else(|| "fit".into()),
                "Forced trace angle"
            )?;
            line!(
                "ix/iy     = {}",
                format!("{:.1}, {:.1} px", self.ix_shift, self.iy_shift),
                "Direct image to zeroth order"
            )?;
            for order in SpectralOrder::ALL {
                let r = self.order_range(order);
                line!(
                    "order {}",
                    format!("{order} = [{:.0}, {:.0}] Å", r.low, r.high),
                    "Order search range"
                )?;
            }

            writeln!(f, "[Extraction / background]")?;
            line!("gwidth    = {} px", self.gwidth, "Extraction box height")?;
            line!("bwidth    = {} px", self.bwidth, "Background box height")?;
            line!(
                "ub/lbdist = {}",
                format!("{:.1}, {:.1} px", self.ubdist, self.lbdist),
                "Background box distances"
            )?;
            line!("bmedian   = {}", self.bmedian, "Background median width")?;
            line!(
                "bmean     = {}",
                format!("{}, {}", self.bmean1, self.bmean2),
                "Sky background boxcar widths"
            )?;
            line!("wl_offset = {:.2} Å", self.wl_offset, "Wavelength zero point")?;
            line!(
                "ordering  = {:?}",
                self.processing_order,
                "Flatfield vs background order"
            )?;

            Ok(())
        } else {
            write!(
                f,
                "ExtractParams({}, ywidth={}, gwidth={}, bwidth={}, bdist=({:.1},{:.1}), bmedian={}, wl_offset={:.1})",
                self.grating,
                self.ywidth,
                self.gwidth,
                self.bwidth,
                self.ubdist,
                self.lbdist,
                self.bmedian,
                self.wl_offset,
            )
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Cross-correlation
// -------------------------------------------------------------------------------------------------

/// Search window of the cross-correlation alignment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossCorrParams {
    /// Number of trial shifts
    pub width: usize,
    /// Expected shift at the centre of the window (px)
    pub approx_shift: Pixel,
}

impl Default for CrossCorrParams {
    fn default() -> Self {
        CrossCorrParams {
            width: 22,
            approx_shift: 0.0,
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Co-addition
// -------------------------------------------------------------------------------------------------

/// Parameters of the co-addition of one exposure group.
#[derive(Debug, Clone, PartialEq)]
pub struct CoaddParams {
    pub grating: Grating,
    /// Nominal first-order coverage start (Å)
    pub wbeg: Angstrom,
    /// Nominal first-order coverage end (Å)
    pub wend: Angstrom,
    /// Half-open stitched-wavelength regions kept from each order, indexed like
    /// [`SpectralOrder::ALL`]
    pub regions: [(Angstrom, Angstrom); 3],
    /// DQ bits that make a point unusable
    pub quality_mask: u32,
    /// Insert midpoints into the output grid
    pub double: bool,
    pub xcorr: CrossCorrParams,
    /// Restricted correlation window per order (stitched Å)
    pub xcorr_windows: [Option<(Angstrom, Angstrom)>; 3],
}

impl CoaddParams {
    pub fn for_grating(grating: Grating) -> Self {
        match grating {
            Grating::G102 => CoaddParams {
                grating,
                wbeg: 7500.0,
                wend: 11800.0,
                regions: [(-13500.0, -3800.0), (-3800.0, 13500.0), (13500.0, 27000.0)],
                quality_mask: DQ_COADD_MASK,
                double: false,
                xcorr: CrossCorrParams::default(),
                xcorr_windows: [None, None, Some((15500.0, 18000.0))],
            },
            Grating::G141 => CoaddParams {
                grating,
                wbeg: 10000.0,
                wend: 17500.0,
                regions: [(-19000.0, -5100.0), (-5100.0, 19000.0), (19000.0, 38000.0)],
                quality_mask: DQ_COADD_MASK,
                double: false,
                xcorr: CrossCorrParams::default(),
                xcorr_windows: [None, None, None],
            },
        }
    }

    pub fn builder(grating: Grating) -> CoaddParamsBuilder {
        CoaddParamsBuilder {
            params: CoaddParams::for_grating(grating),
        }
    }

    pub fn region(&self, order: SpectralOrder) -> (Angstrom, Angstrom) {
        self.regions[order.index()]
    }

    /// Apply known-issue values then caller overrides; non co-add keys are ignored.
    pub fn with_overrides(
        &self,
        issues: &[(ParamKey, f64)],
        caller: &[(ParamKey, f64)],
    ) -> Result<CoaddParams, GrismoError> {
        let mut builder = CoaddParamsBuilder {
            params: self.clone(),
        };
        let width = resolve(ParamKey::Width, self.xcorr.width as f64, issues, caller);
        let wbeg = resolve(ParamKey::Wbeg, self.wbeg, issues, caller);
        let wend = resolve(ParamKey::Wend, self.wend, issues, caller);
        let double = resolve(
            ParamKey::Double,
            if self.double { 1.0 } else { 0.0 },
            issues,
            caller,
        );
        builder = builder
            .width(as_width(ParamKey::Width, width.value)?)
            .coverage(wbeg.value, wend.value)
            .double(double.value != 0.0);
        builder.build()
    }
}

/// Builder for [`CoaddParams`], with validation.
#[derive(Debug, Clone)]
pub struct CoaddParamsBuilder {
    params: CoaddParams,
}

impl CoaddParamsBuilder {
    pub fn width(mut self, v: usize) -> Self {
        self.params.xcorr.width = v;
        self
    }

    pub fn approx_shift(mut self, v: Pixel) -> Self {
        self.params.xcorr.approx_shift = v;
        self
    }

    pub fn coverage(mut self, wbeg: Angstrom, wend: Angstrom) -> Self {
        self.params.wbeg = wbeg;
        self.params.wend = wend;
        self
    }

    pub fn region(mut self, order: SpectralOrder, begin: Angstrom, end: Angstrom) -> Self {
        self.params.regions[order.index()] = (begin, end);
        self
    }

    pub fn quality_mask(mut self, v: u32) -> Self {
        self.params.quality_mask = v;
        self
    }

    pub fn double(mut self, v: bool) -> Self {
        self.params.double = v;
        self
    }

    pub fn xcorr_window(mut self, order: SpectralOrder, window: Option<(Angstrom, Angstrom)>) -> Self {
        self.params.xcorr_windows[order.index()] = window;
        self
    }

    /// Finalize the builder.
    ///
    /// Validation rules
    /// -----------------
    /// * `width >= 3` – a parabolic refinement needs a point on each side of the peak.
    /// * `0 < wbeg < wend`.
    /// * every region satisfies `begin < end`.
    pub fn build(self) -> Result<CoaddParams, GrismoError> {
        let p = &self.params;
        if p.xcorr.width < 3 {
            return Err(GrismoError::SearchWindowTooSmall(format!(
                "cross-correlation width = {} (minimum 3)",
                p.xcorr.width
            )));
        }
        if !gt0(p.wbeg) || !lt(p.wbeg, p.wend) {
            return Err(GrismoError::InvalidWavelengthRange(format!(
                "coverage [{}, {}]",
                p.wbeg, p.wend
            )));
        }
        for (order, (b, e)) in SpectralOrder::ALL.iter().zip(p.regions.iter()) {
            if !lt(*b, *e) {
                return Err(GrismoError::InvalidWavelengthRange(format!(
                    "order {order} region [{b}, {e})"
                )));
            }
        }
        Ok(self.params)
    }
}

impl fmt::Display for CoaddParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            const PARAM_COL: usize = 44;
            writeln!(f, "Co-addition Parameters ({})", self.grating)?;
            writeln!(f, "------------------------------")?;

            macro_rules! line {
                ($fmt:expr, $val:expr, $comment:expr) => {{
                    let s = format!($fmt, $val);
                    let pad = if s.len() < PARAM_COL {
                        " ".repeat(PARAM_COL - s.len())
                    } else {
                        " ".to_string()
                    };
                    writeln!(f, "  {}{}# {}", s, pad, $comment)
                }};
            }

            line!(
                "coverage = {}",
                format!("[{:.0}, {:.0}] Å", self.wbeg, self.wend),
                "Nominal first-order coverage"
            )?;
            for order in SpectralOrder::ALL {
                let (b, e) = self.region(order);
                line!(
                    "region {}",
                    format!("{order} = [{b:.0}, {e:.0}) Å"),
                    "Kept stitched wavelengths"
                )?;
            }
            line!("width    = {}", self.xcorr.width, "Cross-correlation trial shifts")?;
            line!("mask     = {}", self.quality_mask, "Rejected DQ bits")?;
            line!("double   = {}", self.double, "Supersample the output grid")?;
            Ok(())
        } else {
            write!(
                f,
                "CoaddParams({}, coverage=[{:.0},{:.0}], width={}, double={})",
                self.grating, self.wbeg, self.wend, self.xcorr.width, self.double
            )
        }
    }
}

#[cfg(test)]
mod params_test {
    use super::*;

    #[test]
    fn test_defaults() {
        let p = ExtractParams::for_grating(Grating::G141);
        assert_eq!(p.ywidth, 11);
        assert_eq!(p.ubdist, 31.5);
        assert_eq!(p.ix_shift, 188.0);
        assert_eq!(
            p.order_range(SpectralOrder::Minus1).stitched(SpectralOrder::Minus1),
            (-16000.0, -10800.0)
        );
        assert_eq!(
            p.order_range(SpectralOrder::Plus2).stitched(SpectralOrder::Plus2),
            (20000.0, 26000.0)
        );
    }

    #[test]
    fn test_builder_validation() {
        assert!(matches!(
            ExtractParams::builder(Grating::G102).ywidth(3).build(),
            Err(GrismoError::SearchWindowTooSmall(_))
        ));
        assert!(matches!(
            ExtractParams::builder(Grating::G102)
                .order_range(SpectralOrder::Plus1, 11000.0, 8800.0)
                .build(),
            Err(GrismoError::InvalidWavelengthRange(_))
        ));
        assert!(matches!(
            CoaddParams::builder(Grating::G102).width(2).build(),
            Err(GrismoError::SearchWindowTooSmall(_))
        ));
        assert!(CoaddParams::builder(Grating::G141).double(true).build().is_ok());
    }

    #[test]
    fn test_three_tier_resolution() {
        let issues = [(ParamKey::Gwidth, 8.0), (ParamKey::Gwidth, 10.0)];
        let caller = [(ParamKey::Ywidth, 15.0)];

        let r = resolve(ParamKey::Gwidth, 6.0, &issues, &caller);
        assert_eq!(r.value, 10.0);
        assert_eq!(r.source, ParamSource::KnownIssue);

        let r = resolve(ParamKey::Ywidth, 11.0, &issues, &caller);
        assert_eq!(r.value, 15.0);
        assert!(r.overridden());

        let r = resolve(ParamKey::Bwidth, 13.0, &issues, &caller);
        assert_eq!(r.source, ParamSource::Default);
        assert!(!r.overridden());
    }

    #[test]
    fn test_bwidth_override_moves_distances() {
        let base = ExtractParams::for_grating(Grating::G102);
        let (p, changed) = base
            .with_overrides(&[(ParamKey::Bwidth, 9.0)], &[])
            .unwrap();
        assert_eq!(changed, vec![ParamKey::Bwidth]);
        assert_eq!(p.ubdist, 29.5);
        assert_eq!(p.lbdist, 29.5);

        let (p, _) = base
            .with_overrides(&[(ParamKey::Bwidth, 9.0)], &[(ParamKey::Ubdist, 40.0)])
            .unwrap();
        assert_eq!(p.ubdist, 40.0);
        assert_eq!(p.lbdist, 29.5);

        assert!(base.with_overrides(&[], &[(ParamKey::Gwidth, 2.5)]).is_err());
    }

    #[test]
    fn test_param_key_from_str_and_display() {
        assert_eq!("WL_OFFSET".parse::<ParamKey>().unwrap(), ParamKey::WlOffset);
        assert!("foo".parse::<ParamKey>().is_err());

        let table = format!("{:#}", ExtractParams::for_grating(Grating::G102));
        assert!(table.contains("gwidth    = 6 px"));
        let short = format!("{}", CoaddParams::for_grating(Grating::G141));
        assert!(short.starts_with("CoaddParams(G141"));
    }
}
