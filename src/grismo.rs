//! # Grismo: calibration, known issues, and pipeline configuration
//!
//! This module defines the [`Grismo`](crate::grismo::Grismo) struct, the façade that wires together:
//!
//! 1. **Calibration data**: flatfield cubes and sky flats through a
//!    [`CalibrationSource`](crate::flatfield::CalibrationSource).
//! 2. **Known issues**: per-exposure corrections, parsed lazily from a file or text and cached.
//! 3. **Parameter defaults**: per-grating [`ExtractParams`] and [`CoaddParams`], plus caller
//!    overrides applied over every known-issue value.
//! 4. **Review hooks**: a [`FitReview`] consulted after centroiding and trace fitting.
//!
//! The known-issues table is read on first use via [`OnceCell`](once_cell::sync::OnceCell), then reused
//! by every extraction and co-addition run.
//!
//! ## Typical usage
//!
//! ```rust, no_run
//! use grismo::exposure::repository::{ExposureFilter, ExposureRepository};
//! use grismo::flatfield::InMemoryCalibration;
//! use grismo::grismo::Grismo;
//!
//! let grismo = Grismo::new(InMemoryCalibration::uniform())
//!     .with_known_issues_file("calibration/known_issues.txt")
//!     .with_output_dir("products");
//!
//! let mut repo = ExposureRepository::new();
//! // ... insert exposures ...
//! let summary = grismo.extract(&mut repo, &ExposureFilter::All, false).unwrap();
//! let coadds = grismo.coadd(&mut repo, &ExposureFilter::All).unwrap();
//! ```
//!
//! ## See also
//! ------------
//! * [`extract_all`](crate::pipeline::extract_all) – Per-exposure extraction driver.
//! * [`coadd_all`](crate::pipeline::coadd_all) – Per-group co-addition driver.
//! * [`KnownIssues`] – Known-issue table format.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use once_cell::sync::OnceCell;
use tracing::info;

use crate::coadd::CoaddedSpectrum;
use crate::constants::Grating;
use crate::exposure::repository::{ExposureFilter, ExposureRepository, GroupKey};
use crate::flatfield::CalibrationSource;
use crate::grismo_errors::GrismoError;
use crate::params::known_issues::KnownIssues;
use crate::params::{CoaddParams, ExtractParams, ParamKey};
use crate::pipeline::{
    coadd_all, extract_all, AcceptAutomatic, ExtractionContext, ExtractionSummary, FitReview,
};
use crate::positioner::PositionerParams;

#[derive(Debug, Clone)]
enum IssueSource {
    Empty,
    File(Utf8PathBuf),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Grismo {
    calibration: Arc<dyn CalibrationSource>,
    issue_source: IssueSource,
    known_issues: OnceCell<KnownIssues>,
    review: Arc<dyn FitReview>,
    positioner: PositionerParams,
    extract_defaults: HashMap<Grating, ExtractParams>,
    coadd_defaults: HashMap<Grating, CoaddParams>,
    overrides: Vec<(ParamKey, f64)>,
    output_dir: Option<Utf8PathBuf>,
}

impl Grismo {
    /// Construct a new [`Grismo`] context around a calibration source.
    ///
    /// No known issues are configured, every fit is accepted automatically, and nothing is
    /// written to disk until [`with_output_dir`](Grismo::with_output_dir) is called.
    ///
    /// Arguments
    /// -----------------
    /// * `calibration`: Provider of flatfield cubes and sky flats.
    pub fn new(calibration: impl CalibrationSource + 'static) -> Self {
        Grismo {
            calibration: Arc::new(calibration),
            issue_source: IssueSource::Empty,
            known_issues: OnceCell::new(),
            review: Arc::new(AcceptAutomatic),
            positioner: PositionerParams::default(),
            extract_defaults: HashMap::new(),
            coadd_defaults: HashMap::new(),
            overrides: Vec::new(),
            output_dir: None,
        }
    }

    /// Read known issues from `path` on first use.
    pub fn with_known_issues_file(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.issue_source = IssueSource::File(path.into());
        self.known_issues = OnceCell::new();
        self
    }

    /// Parse known issues from `text` on first use.
    pub fn with_known_issues_text(mut self, text: impl Into<String>) -> Self {
        self.issue_source = IssueSource::Text(text.into());
        self.known_issues = OnceCell::new();
        self
    }

    pub fn with_review(mut self, review: impl FitReview + 'static) -> Self {
        self.review = Arc::new(review);
        self
    }

    pub fn with_positioner(mut self, params: PositionerParams) -> Self {
        self.positioner = params;
        self
    }

    /// Replace the extraction defaults of `params.grating`.
    pub fn with_extract_params(mut self, params: ExtractParams) -> Self {
        self.extract_defaults.insert(params.grating, params);
        self
    }

    /// Replace the co-addition defaults of `params.grating`.
    pub fn with_coadd_params(mut self, params: CoaddParams) -> Self {
        self.coadd_defaults.insert(params.grating, params);
        self
    }

    /// Caller overrides, applied after the known-issue overrides of each exposure.
    pub fn with_overrides(mut self, overrides: Vec<(ParamKey, f64)>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn output_dir(&self) -> Option<&Utf8Path> {
        self.output_dir.as_deref()
    }

    pub fn calibration(&self) -> &dyn CalibrationSource {
        self.calibration.as_ref()
    }

    /// Get the known-issue table, reading it on the first call.
    ///
    /// Return
    /// ----------
    /// * The cached [`KnownIssues`], or a [`GrismoError`] if the file cannot be read or a
    ///   line is malformed. A failed read is retried on the next call.
    pub fn get_known_issues(&self) -> Result<&KnownIssues, GrismoError> {
        self.known_issues.get_or_try_init(|| {
            let issues = match &self.issue_source {
                IssueSource::Empty => KnownIssues::empty(),
                IssueSource::File(path) => KnownIssues::from_path(path)?,
                IssueSource::Text(text) => KnownIssues::parse(text)?,
            };
            info!(entries = issues.len(), "known issues loaded");
            Ok(issues)
        })
    }

    /// Extract every used stare grism exposure selected by `filter`.
    ///
    /// Exposures already extracted are skipped unless `force` is set. Per-exposure failures
    /// are reported in the summary and noted on the exposure; only a known-issue table that
    /// cannot be loaded fails the whole run.
    ///
    /// See also
    /// ------------
    /// * [`extract_all`](crate::pipeline::extract_all) – The per-exposure driver.
    pub fn extract(
        &self,
        repo: &mut ExposureRepository,
        filter: &ExposureFilter,
        force: bool,
    ) -> Result<ExtractionSummary, GrismoError> {
        let issues = self.get_known_issues()?;
        let ctx = ExtractionContext {
            calibration: self.calibration.as_ref(),
            issues,
            review: self.review.as_ref(),
            positioner: &self.positioner,
            defaults: &self.extract_defaults,
            overrides: &self.overrides,
            output_dir: self.output_dir.as_deref(),
        };
        Ok(extract_all(repo, filter, force, &ctx))
    }

    /// Co-add every (observation set, grating) group selected by `filter`.
    ///
    /// See also
    /// ------------
    /// * [`coadd_all`](crate::pipeline::coadd_all) – The per-group driver.
    pub fn coadd(
        &self,
        repo: &mut ExposureRepository,
        filter: &ExposureFilter,
    ) -> Result<BTreeMap<GroupKey, Result<CoaddedSpectrum, GrismoError>>, GrismoError> {
        let issues = self.get_known_issues()?;
        Ok(coadd_all(
            repo,
            filter,
            &self.coadd_defaults,
            issues,
            &self.overrides,
            self.output_dir.as_deref(),
        ))
    }
}
