//! # Pipeline stages
//!
//! Drives the per-exposure extraction and the per-group co-addition over an
//! [`ExposureRepository`].
//!
//! ## Extraction
//!
//! For every used stare grism exposure:
//!
//! 1. known-issue image edits and parameter overrides are applied;
//! 2. the target position comes from a forced `xc`/`yc`, from the linked direct image
//!    (located once and cached on the imaging exposure) or from the exposure's own sky
//!    transform;
//! 3. the zeroth order is predicted from it and, if it lands on the detector, located
//!    with the [`positioner`](crate::positioner); otherwise, or if it cannot be found, the
//!    aXe dispersion solution is used;
//! 4. the scaled sky flat is subtracted, then the flatfield and the residual background
//!    are removed in the configured [`ProcessingOrder`], around the fitted trace;
//! 5. the box is extracted and the spectrum written.
//!
//! Every degradation is logged and recorded in the exposure notes. A failure stops only
//! the exposure it belongs to.
//!
//! ## Review
//!
//! The automatic centroid and trace can be inspected and replaced through a
//! [`FitReview`] implementation; [`AcceptAutomatic`] keeps them as they are.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use hifitime::Epoch;
use tracing::{debug, info, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::background::{fit_background, scale_sky_flat, sky_background, sky_image};
use crate::coadd::{coadd, CoaddInput, CoaddProvenance, CoaddedSpectrum};
use crate::constants::{Degree, Grating, Pixel, ZEROTH_ORDER_EDGE, ZEROTH_ORDER_MAX};
use crate::dispersion::{solve, SolutionKind};
use crate::exposure::repository::{ExposureFilter, ExposureRepository, GroupKey};
use crate::exposure::{DirectPosition, Exposure};
use crate::flatfield::{apply_flatfield, CalibrationSource};
use crate::grismo_errors::GrismoError;
use crate::params::known_issues::KnownIssues;
use crate::params::{CoaddParams, ExtractParams, ParamKey, ProcessingOrder};
use crate::positioner::{
    locate, locate_direct_image, Centroid, CentroidMethod, PositionReport, PositionerParams,
};
use crate::products::{load_extracted, save_coadded, save_extracted};
use crate::trace::extract::{
    extract_columns, BackgroundColumns, ExtractedSpectrum, ExtractionMetadata,
};
use crate::trace::{fit_trace, TraceFit, TraceInput};

/// Decision about an automatic zeroth-order centroid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CentroidChoice {
    Automatic,
    /// Use the estimate of another estimator
    Method(CentroidMethod),
    Manual(Pixel, Pixel),
    /// Treat the zeroth order as not found
    NotFound,
}

/// Decision about an automatic trace fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TraceChoice {
    Accept,
    /// Refit with the trace angle forced (degrees)
    ForceAngle(Degree),
}

/// Hook to inspect, and possibly replace, the automatic fits of an exposure.
pub trait FitReview: Send + Sync + fmt::Debug {
    fn review_centroid(&self, _root: &str, _report: &PositionReport) -> CentroidChoice {
        CentroidChoice::Automatic
    }

    fn review_trace(&self, _root: &str, _fit: &TraceFit) -> TraceChoice {
        TraceChoice::Accept
    }
}

/// Review that keeps every automatic fit.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAutomatic;

impl FitReview for AcceptAutomatic {}

/// Read-only inputs shared by every exposure of an extraction run.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionContext<'a> {
    pub calibration: &'a dyn CalibrationSource,
    pub issues: &'a KnownIssues,
    pub review: &'a dyn FitReview,
    pub positioner: &'a PositionerParams,
    /// Per-grating parameter defaults, [`ExtractParams::for_grating`] when absent
    pub defaults: &'a HashMap<Grating, ExtractParams>,
    /// Caller overrides, applied over the known-issue values
    pub overrides: &'a [(ParamKey, f64)],
    /// Where products are written, nothing is written when `None`
    pub output_dir: Option<&'a Utf8Path>,
}

impl ExtractionContext<'_> {
    fn base_params(&self, grating: Grating) -> ExtractParams {
        self.defaults
            .get(&grating)
            .cloned()
            .unwrap_or_else(|| ExtractParams::for_grating(grating))
    }
}

/// Everything learnt about one exposure by a successful extraction.
#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    /// Zeroth-order centroid, `None` when it was predicted off the detector
    pub centroid: Option<Centroid>,
    pub trace: TraceFit,
    pub spectrum: ExtractedSpectrum,
    pub path: Option<Utf8PathBuf>,
}

/// Roots handled by an extraction run.
#[derive(Debug, Default)]
pub struct ExtractionSummary {
    pub extracted: Vec<String>,
    /// Already extracted, or not a stare exposure
    pub skipped: Vec<String>,
    pub failed: Vec<(String, GrismoError)>,
}

/// Target position and its error on a grism exposure, from the best available source.
fn target_position(
    exposure: &Exposure,
    direct: Option<DirectPosition>,
    params: &ExtractParams,
    notes: &mut Vec<String>,
) -> Result<(Pixel, Pixel, Pixel, Pixel), GrismoError> {
    if let (Some(xc), Some(yc)) = (params.xc, params.yc) {
        if xc >= 0.0 && yc >= 0.0 {
            return Ok((xc, yc, params.xerr, params.yerr));
        }
        notes.push("forced direct-image position is negative, ignored".into());
    }
    if let Some(d) = direct {
        return Ok((d.xc, d.yc, d.xerr, d.yerr));
    }
    if exposure.direct_image.is_some() {
        notes.push("no result in locating the target on the direct image".into());
    }
    exposure
        .predicted_target_pixel()
        .map(|(x, y)| (x, y, 0.0, 0.0))
        .ok_or_else(|| {
            GrismoError::CentroidNotFound(format!(
                "{}: no direct image and no sky transform to predict the target",
                exposure.root
            ))
        })
}

fn apply_centroid_choice(
    root: &str,
    report: &PositionReport,
    choice: CentroidChoice,
    notes: &mut Vec<String>,
) -> Centroid {
    match choice {
        CentroidChoice::Automatic => report.automatic,
        CentroidChoice::Method(method) => report.centroid_from(method).unwrap_or_else(|| {
            notes.push(format!("{method} centroid requested but not available, automatic kept"));
            report.automatic
        }),
        CentroidChoice::Manual(x, y) => {
            info!(%root, x, y, "manual zeroth-order centroid");
            notes.push(format!("zeroth order set by hand to ({x:.2}, {y:.2})"));
            report.manual(x, y)
        }
        CentroidChoice::NotFound => Centroid::not_found(),
    }
}

fn off_detector(x: Pixel, y: Pixel) -> bool {
    x < ZEROTH_ORDER_EDGE || y < ZEROTH_ORDER_EDGE || x > ZEROTH_ORDER_MAX || y > ZEROTH_ORDER_MAX
}

/// Extract one stare grism exposure.
///
/// `direct` is the target position measured on the linked direct image, if any. Notes
/// gathered on the way are pushed to `notes`, including when an error is returned.
pub fn extract_exposure(
    exposure: &Exposure,
    direct: Option<DirectPosition>,
    ctx: &ExtractionContext,
    notes: &mut Vec<String>,
) -> Result<ExtractionOutcome, GrismoError> {
    let root = exposure.root.as_str();
    let grating = exposure.require_grating()?;
    info!(%root, %grating, "extracting");

    let mut planes = exposure.planes()?.clone();
    notes.extend(ctx.issues.apply_image_edits(exposure, &mut planes));
    let (issue_values, issue_notes) = ctx.issues.param_overrides(exposure);
    notes.extend(issue_notes);
    let (mut params, changed) = ctx
        .base_params(grating)
        .with_overrides(&issue_values, ctx.overrides)?;
    if !changed.is_empty() {
        debug!(%root, ?changed, "parameters overridden");
    }

    let (ncols, offset) = (planes.ncols(), exposure.subarray_offset);
    let (ix, iy, xerr, yerr) = target_position(exposure, direct, &params, notes)?;
    let (tx, ty) = (ix + xerr, iy + yerr);
    let predicted = (tx - params.ix_shift, ty - params.iy_shift);

    // zeroth order: locate it, or fall back to the aXe solution at the target position
    let centroid = if off_detector(predicted.0, predicted.1) {
        warn!(%root, x = predicted.0, y = predicted.1, "zeroth order predicted off the detector");
        notes.push(format!(
            "zeroth order predicted off the detector at ({:.1}, {:.1}), aXe solution used",
            predicted.0, predicted.1
        ));
        None
    } else {
        let report = locate(planes.sci.view(), predicted, exposure.planetary_nebula, ctx.positioner);
        let choice = ctx.review.review_centroid(root, &report);
        Some(apply_centroid_choice(root, &report, choice, notes))
    };
    let (kind, reference, zeroth) = match centroid {
        Some(c) if c.found => (SolutionKind::ZerothOrder, (c.x, c.y), (c.x, c.y)),
        Some(_) => {
            let err = GrismoError::CentroidNotFound(format!(
                "zeroth order near ({:.1}, {:.1})",
                predicted.0, predicted.1
            ));
            warn!(%root, "{err}, aXe solution used");
            notes.push(format!("{err}, aXe solution used"));
            (SolutionKind::Axe, (tx, ty), predicted)
        }
        None => (SolutionKind::Axe, (tx, ty), predicted),
    };
    let solution = solve(grating, kind, reference, offset, ncols, params.wl_offset)?;

    // sky
    let sky_flat = ctx.calibration.sky_flat(grating)?;
    let flat_view = sky_flat.readout(offset, planes.shape())?;
    let scaling = scale_sky_flat(planes.sci.view(), flat_view, params.gwidth)?;
    let sky = sky_image(planes.sci.view(), scaling.scaled_flat.view());
    let mut image = &planes.sci - &scaling.scaled_flat;

    let cube = ctx.calibration.flatfield_cube(grating)?;
    if params.processing_order == ProcessingOrder::FlatFirst {
        apply_flatfield(&mut image, &solution.wav1st, &cube, grating, offset)?;
    }

    // trace
    let input = TraceInput {
        image: image.view(),
        wave: &solution.wave,
        zeroth,
        axe: kind == SolutionKind::Axe,
        angle: solution.angle,
        planetary_nebula: exposure.planetary_nebula,
    };
    let mut trace = fit_trace(&input, &params)?;
    if let TraceChoice::ForceAngle(angle) = ctx.review.review_trace(root, &trace) {
        info!(%root, angle, "trace angle forced on review");
        notes.push(format!("trace angle forced to {angle:.4} deg"));
        params.slope = Some(angle);
        trace = fit_trace(&input, &params)?;
    }
    for note in &trace.notes {
        warn!(%root, "{note}");
    }
    notes.extend(trace.notes.iter().cloned());

    // background
    let model = fit_background(image.view(), &trace.yfit, &params)?;
    let sky_back = sky_background(sky.view(), &trace.yfit, &params);
    model.subtract(&mut image);
    if params.processing_order == ProcessingOrder::BackgroundFirst {
        apply_flatfield(&mut image, &solution.wav1st, &cube, grating, offset)?;
    }

    let sums = extract_columns(&mut image, &planes, &trace.yfit, params.gwidth, params.repair_mask)?;
    let background = BackgroundColumns {
        residual: model.extracted(params.gwidth),
        sky: sky_back,
        lower: model.lower.raw.clone(),
        upper: model.upper.raw.clone(),
    };
    let metadata = ExtractionMetadata {
        root: exposure.root.clone(),
        target: exposure.target.clone(),
        grating,
        direct_image: exposure.direct_image.clone(),
        xc: ix,
        yc: iy,
        xerr,
        yerr,
        zeroth,
        zeroth_found: kind == SolutionKind::ZerothOrder,
        solution: kind,
        avgbkg: scaling.avgbkg,
        flatfield: cube.name.clone(),
        sky_flat: sky_flat.name.clone(),
        trace_intercept: trace.intercept,
        trace_slope: trace.slope,
        angle: trace.angle,
        gwidth: params.gwidth,
        bwidth: params.bwidth,
        ubdist: params.ubdist,
        lbdist: params.lbdist,
        bmedian: params.bmedian,
        bmean1: params.bmean1,
        bmean2: params.bmean2,
        wl_offset: params.wl_offset,
        processing_order: params.processing_order,
    };
    let spectrum = ExtractedSpectrum::new(
        solution.wave.clone(),
        trace.yfit.clone(),
        sums,
        background,
        metadata,
    )?;

    let path = match ctx.output_dir {
        Some(dir) => Some(save_extracted(dir, &spectrum)?),
        None => None,
    };
    info!(%root, points = spectrum.len(), angle = trace.angle, "extracted");

    Ok(ExtractionOutcome {
        centroid,
        trace,
        spectrum,
        path,
    })
}

/// Locate the target on every direct image referenced by the selected grism exposures.
///
/// Positions already measured are kept. Failures are recorded on the imaging exposure.
pub fn locate_direct_images(repo: &mut ExposureRepository, roots: &[String], issues: &KnownIssues) {
    let mut direct_roots: Vec<String> = roots
        .iter()
        .filter_map(|r| repo.get(r).ok().and_then(|e| e.direct_image.clone()))
        .collect();
    direct_roots.sort();
    direct_roots.dedup();

    for root in direct_roots {
        let Ok(direct) = repo.get(&root) else {
            warn!(%root, "direct image not in the repository");
            continue;
        };
        if direct.direct_position.is_some() {
            continue;
        }
        let (values, _) = issues.param_overrides(direct);
        let pick = |key: ParamKey| values.iter().rev().find(|(k, _)| *k == key).map(|(_, v)| *v);
        let star = (pick(ParamKey::Xstar), pick(ParamKey::Ystar));

        let result = match (direct.planes(), direct.predicted_target_pixel()) {
            (Ok(planes), Some(predicted)) => locate_direct_image(planes, predicted, star),
            (Err(e), _) => Err(e),
            (_, None) => Err(GrismoError::CentroidNotFound(
                "no sky transform to predict the target".into(),
            )),
        };
        match result {
            Ok(position) => {
                debug!(%root, xc = position.xc, yc = position.yc, "target located on direct image");
                if let Ok(e) = repo.get_mut(&root) {
                    e.direct_position = Some(position);
                }
            }
            Err(err) => {
                warn!(%root, "{err}");
                repo.add_note(&root, err.to_string());
            }
        }
    }
}

fn needs_extraction(exposure: &Exposure, force: bool) -> bool {
    if force {
        return true;
    }
    let on_disk = exposure.extracted_path.as_ref().is_some_and(|p| p.exists());
    !(on_disk || exposure.spectrum.is_some())
}

/// Extract every used grism exposure selected by `filter`.
pub fn extract_all(
    repo: &mut ExposureRepository,
    filter: &ExposureFilter,
    force: bool,
    ctx: &ExtractionContext,
) -> ExtractionSummary {
    let mut summary = ExtractionSummary::default();
    repo.link_direct_images();

    let selection = filter
        .clone()
        .and(ExposureFilter::Used)
        .and(ExposureFilter::Grism(None));
    let mut roots = Vec::new();
    for root in repo.select(&selection) {
        let Ok(exposure) = repo.get(&root) else { continue };
        if !exposure.is_stare() {
            info!(%root, "scanned exposure, not extracted");
            repo.add_note(&root, "scan mode extraction is not supported");
            summary.skipped.push(root);
        } else if !needs_extraction(exposure, force) {
            info!(%root, "already extracted, skipping");
            summary.skipped.push(root);
        } else {
            roots.push(root);
        }
    }
    locate_direct_images(repo, &roots, ctx.issues);

    let jobs: Vec<(&Exposure, Option<DirectPosition>)> = roots
        .iter()
        .filter_map(|r| repo.get(r).ok())
        .map(|e| {
            let direct = e
                .direct_image
                .as_deref()
                .and_then(|d| repo.get(d).ok())
                .and_then(|d| d.direct_position);
            (e, direct)
        })
        .collect();

    let run = |&(exposure, direct): &(&Exposure, Option<DirectPosition>)| {
        let mut notes = Vec::new();
        let result = extract_exposure(exposure, direct, ctx, &mut notes);
        (exposure.root.clone(), notes, result)
    };
    #[cfg(feature = "parallel")]
    let results: Vec<_> = jobs.par_iter().map(run).collect();
    #[cfg(not(feature = "parallel"))]
    let results: Vec<_> = jobs.iter().map(run).collect();

    for (root, notes, result) in results {
        let Ok(exposure) = repo.get_mut(&root) else { continue };
        exposure.notes.extend(notes);
        match result {
            Ok(outcome) => {
                exposure.centroid = outcome.centroid;
                exposure.trace = Some(outcome.trace);
                exposure.spectrum = Some(outcome.spectrum);
                if outcome.path.is_some() {
                    exposure.extracted_path = outcome.path;
                }
                summary.extracted.push(root);
            }
            Err(err) => {
                warn!(%root, "extraction failed: {err}");
                exposure.add_note(format!("extraction failed: {err}"));
                summary.failed.push((root, err));
            }
        }
    }
    summary
}

/// Spectrum of an exposure, from memory or from its extracted product.
fn spectrum_of(exposure: &Exposure) -> Result<ExtractedSpectrum, GrismoError> {
    if let Some(spectrum) = &exposure.spectrum {
        return Ok(spectrum.clone());
    }
    match &exposure.extracted_path {
        Some(path) => load_extracted(path),
        None => Err(GrismoError::MissingImage(format!(
            "{}: no extracted spectrum",
            exposure.root
        ))),
    }
}

/// Co-add every (observation set, grating) group of used grism exposures selected by
/// `filter`.
///
/// A failed group is reported in the returned map and noted on its exposures; the other
/// groups still run.
pub fn coadd_all(
    repo: &mut ExposureRepository,
    filter: &ExposureFilter,
    defaults: &HashMap<Grating, CoaddParams>,
    issues: &KnownIssues,
    overrides: &[(ParamKey, f64)],
    output_dir: Option<&Utf8Path>,
) -> BTreeMap<GroupKey, Result<CoaddedSpectrum, GrismoError>> {
    let selection = filter
        .clone()
        .and(ExposureFilter::Used)
        .and(ExposureFilter::Grism(None));
    let mut results = BTreeMap::new();

    for (key, roots) in repo.groups(&selection) {
        info!(obset = %key.obset, grating = %key.grating, exposures = roots.len(), "co-adding group");
        let result = coadd_group(repo, &key, &roots, defaults, issues, overrides, output_dir);
        if let Err(err) = &result {
            warn!(obset = %key.obset, grating = %key.grating, "co-addition failed: {err}");
            for root in &roots {
                repo.add_note(root, format!("co-addition failed: {err}"));
            }
        }
        results.insert(key, result);
    }
    results
}

fn coadd_group(
    repo: &mut ExposureRepository,
    key: &GroupKey,
    roots: &[String],
    defaults: &HashMap<Grating, CoaddParams>,
    issues: &KnownIssues,
    overrides: &[(ParamKey, f64)],
    output_dir: Option<&Utf8Path>,
) -> Result<CoaddedSpectrum, GrismoError> {
    let mut spectra: Vec<(String, ExtractedSpectrum)> = Vec::new();
    for root in roots {
        match spectrum_of(repo.get(root)?) {
            Ok(spectrum) => spectra.push((root.clone(), spectrum)),
            Err(err) => {
                warn!(%root, "{err}, left out of the co-add");
                repo.add_note(root, format!("{err}, left out of the co-add"));
            }
        }
    }
    let Some((first_root, _)) = spectra.first() else {
        return Err(GrismoError::NoQualifyingSpectra(format!(
            "{} {}: no extracted spectrum",
            key.obset, key.grating
        )));
    };

    let first = repo.get(first_root)?;
    let (issue_values, _) = issues.param_overrides(first);
    let params = defaults
        .get(&key.grating)
        .cloned()
        .unwrap_or_else(|| CoaddParams::for_grating(key.grating))
        .with_overrides(&issue_values, overrides)?;
    let provenance = CoaddProvenance {
        roots: spectra.iter().map(|(r, _)| r.clone()).collect(),
        target: first.target.clone(),
        grating: key.grating,
        obset: key.obset.clone(),
        date: first.date,
    };

    let inputs: Vec<CoaddInput> = spectra
        .iter()
        .map(|(root, spectrum)| CoaddInput { root, spectrum })
        .collect();
    let outcome = coadd(&inputs, &params, provenance)?;
    for (root, note) in outcome.notes {
        repo.add_note(&root, note);
    }

    if let Some(dir) = output_dir {
        let path = save_coadded(dir, &outcome.spectrum, Epoch::now()?)?;
        for (root, _) in &spectra {
            if let Ok(e) = repo.get_mut(root) {
                e.coadded_path = Some(path.clone());
            }
        }
    }
    Ok(outcome.spectrum)
}
