use thiserror::Error;

#[derive(Error, Debug)]
pub enum GrismoError {
    #[error("Unknown grating or filter: {0}")]
    UnknownGrating(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid wavelength range: {0}")]
    InvalidWavelengthRange(String),

    #[error("Search window too small: {0}")]
    SearchWindowTooSmall(String),

    #[error("Exposure not found in repository: {0}")]
    ExposureNotFound(String),

    #[error("Exposure {0} has no image planes attached")]
    MissingImage(String),

    #[error("Missing calibration data: {0}")]
    MissingCalibration(String),

    #[error("Error while parsing the known-issue table: {0}")]
    KnownIssueParse(String),

    #[error("Centroid not found: {0}")]
    CentroidNotFound(String),

    #[error("Spectral order not found: {0}")]
    OrderNotFound(String),

    #[error("Cannot fit trace angle: {0}")]
    CannotFitTraceAngle(String),

    #[error("Maximum value of the cross-dispersion profile is not positive: {0}")]
    ProfileNotPositive(String),

    #[error("Least-squares system is singular: {0}")]
    SingularFit(String),

    #[error("Cross-correlation template has zero variance")]
    ZeroVarianceTemplate,

    #[error("Cross-correlation maximum at the edge of the search window (shift index {0})")]
    CorrelationPeakAtEdge(usize),

    #[error("Wavelength array is not monotonic at pixel {0}")]
    WavelengthNotMonotonic(usize),

    #[error("Insufficient background points: {lower} lower and {upper} upper of {total} passed")]
    InsufficientBackgroundPoints {
        lower: usize,
        upper: usize,
        total: usize,
    },

    #[error("Background fit diverged: mean absolute level {0:.3}")]
    BackgroundFitDiverged(f64),

    #[error("Cross-correlation offset {0:.3} px exceeds the allowed cap")]
    OffsetExceedsCap(f64),

    #[error("No emission line measured: {0}")]
    NoMeasuredLines(String),

    #[error("No spectrum qualifies for co-addition: {0}")]
    NoQualifyingSpectra(String),

    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV product error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Malformed product file: {0}")]
    MalformedProduct(String),

    #[error("Unable to timestamp the product: {0}")]
    Clock(#[from] hifitime::HifitimeError),
}

impl GrismoError {
    /// Whether the failure degrades the result (note + fallback) rather than dropping
    /// the exposure.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            GrismoError::CentroidNotFound(_)
                | GrismoError::OrderNotFound(_)
                | GrismoError::ZeroVarianceTemplate
                | GrismoError::CorrelationPeakAtEdge(_)
        )
    }
}

impl PartialEq for GrismoError {
    fn eq(&self, other: &Self) -> bool {
        use GrismoError::*;
        match (self, other) {
            (UnknownGrating(a), UnknownGrating(b))
            | (InvalidParameter(a), InvalidParameter(b))
            | (InvalidWavelengthRange(a), InvalidWavelengthRange(b))
            | (SearchWindowTooSmall(a), SearchWindowTooSmall(b))
            | (ExposureNotFound(a), ExposureNotFound(b))
            | (MissingImage(a), MissingImage(b))
            | (MissingCalibration(a), MissingCalibration(b))
            | (KnownIssueParse(a), KnownIssueParse(b))
            | (CentroidNotFound(a), CentroidNotFound(b))
            | (OrderNotFound(a), OrderNotFound(b))
            | (CannotFitTraceAngle(a), CannotFitTraceAngle(b))
            | (ProfileNotPositive(a), ProfileNotPositive(b))
            | (SingularFit(a), SingularFit(b))
            | (NoMeasuredLines(a), NoMeasuredLines(b))
            | (NoQualifyingSpectra(a), NoQualifyingSpectra(b))
            | (MalformedProduct(a), MalformedProduct(b)) => a == b,

            (ZeroVarianceTemplate, ZeroVarianceTemplate) => true,
            (WavelengthNotMonotonic(a), WavelengthNotMonotonic(b))
            | (CorrelationPeakAtEdge(a), CorrelationPeakAtEdge(b)) => a == b,
            (
                InsufficientBackgroundPoints {
                    lower: l1,
                    upper: u1,
                    total: t1,
                },
                InsufficientBackgroundPoints {
                    lower: l2,
                    upper: u2,
                    total: t2,
                },
            ) => l1 == l2 && u1 == u2 && t1 == t2,
            (BackgroundFitDiverged(a), BackgroundFitDiverged(b))
            | (OffsetExceedsCap(a), OffsetExceedsCap(b)) => a == b,

            // io, csv and clock errors are not comparable
            (IoError(_), IoError(_)) | (CsvError(_), CsvError(_)) | (Clock(_), Clock(_)) => false,

            _ => false,
        }
    }
}
