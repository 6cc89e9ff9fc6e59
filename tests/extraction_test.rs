mod common;

use approx::assert_relative_eq;
use camino::Utf8PathBuf;
use grismo::constants::{Degree, Filter, Grating};
use grismo::dispersion::SolutionKind;
use grismo::exposure::repository::{ExposureFilter, ExposureRepository, GroupKey};
use grismo::exposure::Exposure;
use grismo::flatfield::InMemoryCalibration;
use grismo::grismo::Grismo;
use grismo::grismo_errors::GrismoError;
use grismo::pipeline::{FitReview, TraceChoice};
use grismo::products::load_extracted;
use grismo::trace::TraceFit;

use crate::common::{
    continuum, grism_exposure, init_logging, synthetic_direct, synthetic_g102, wcs_at,
    SyntheticGrism, CONTINUUM, EXPOSURE_TIME, PROFILE_SUM, TARGET_DEC, TARGET_RA,
};

/// Target position on the direct image.
const TARGET: (f64, f64) = (520.0, 500.0);
/// Zeroth order of G102: 252 px left and 4 px below the target.
const ZEROTH: (f64, f64) = (268.0, 496.0);

fn visit(dir: Option<&str>) -> (ExposureRepository, Vec<SyntheticGrism>) {
    let mut repo = ExposureRepository::new();
    let direct = Exposure::new(
        "ibbu01a0q",
        Filter::Imaging("F098M".into()),
        "GD153",
        "ibbu01",
        55000.0,
    )
    .with_planes(synthetic_direct(TARGET, 1))
    .with_sky(wcs_at(TARGET), (TARGET_RA, TARGET_DEC));
    repo.insert(direct);

    let mut synthetic = Vec::new();
    for (k, root) in ["ibbu01a1q", "ibbu01a2q"].into_iter().enumerate() {
        let grism = synthetic_g102(ZEROTH, 10 + k as u64);
        let date = 55000.01 + 0.01 * k as f64;
        repo.insert(grism_exposure(root, "ibbu01", date, grism.planes.clone()));
        synthetic.push(grism);
    }
    if let Some(dir) = dir {
        let _ = std::fs::remove_dir_all(dir);
    }
    (repo, synthetic)
}

fn temp_dir(name: &str) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(std::env::temp_dir().join(name)).unwrap()
}

#[test]
fn test_extract_two_exposure_visit() {
    init_logging();
    let dir = temp_dir("grismo_extract_visit_test");
    let (mut repo, synthetic) = visit(Some(dir.as_str()));
    let grismo = Grismo::new(InMemoryCalibration::uniform()).with_output_dir(dir.clone());

    let summary = grismo.extract(&mut repo, &ExposureFilter::All, false).unwrap();
    assert_eq!(summary.extracted, vec!["ibbu01a1q", "ibbu01a2q"]);
    assert!(summary.failed.is_empty());

    // the target is found where the sky transform puts it
    let direct = repo.get("ibbu01a0q").unwrap().direct_position.unwrap();
    assert_relative_eq!(direct.xc, TARGET.0, epsilon = 0.1);
    assert_relative_eq!(direct.yc, TARGET.1, epsilon = 0.1);

    for (root, grism) in ["ibbu01a1q", "ibbu01a2q"].into_iter().zip(&synthetic) {
        let exposure = repo.get(root).unwrap();
        assert_eq!(exposure.direct_image.as_deref(), Some("ibbu01a0q"));

        let centroid = exposure.centroid.unwrap();
        assert!(centroid.found);
        assert_relative_eq!(centroid.x, ZEROTH.0, epsilon = 0.3);
        assert_relative_eq!(centroid.y, ZEROTH.1, epsilon = 0.3);

        let trace = exposure.trace.as_ref().unwrap();
        assert!(!trace.fixed_slope);
        assert!(trace.positions.len() >= 3);
        let line = grism.line_column;
        assert!((trace.y_at(line) - grism.trace[line as usize]).abs() < 0.5);

        let spectrum = exposure.spectrum.as_ref().unwrap();
        assert_eq!(spectrum.len(), 1014);
        assert!(spectrum.wavelength.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(spectrum.metadata.solution, SolutionKind::ZerothOrder);
        assert!(spectrum.metadata.zeroth_found);
        assert_eq!(spectrum.metadata.direct_image.as_deref(), Some("ibbu01a0q"));

        // continuum away from the line, then the line itself
        let flat: Vec<usize> = (0..spectrum.len())
            .filter(|&x| {
                let w = spectrum.wavelength[x];
                (8200.0..9000.0).contains(&w) && (x as f64 - line).abs() > 15.0
            })
            .collect();
        assert!(flat.len() > 20);
        for &x in &flat {
            assert_relative_eq!(
                spectrum.net[x],
                continuum(x, line) * PROFILE_SUM,
                max_relative = 0.05
            );
            assert_relative_eq!(spectrum.time[x], EXPOSURE_TIME, epsilon = 1e-9);
        }
        let peak = spectrum.net[line as usize];
        assert_relative_eq!(peak, 3.0 * CONTINUUM * PROFILE_SUM, max_relative = 0.1);

        // the product on disk reads back as the spectrum in memory
        let path = exposure.extracted_path.clone().unwrap();
        assert_eq!(path, dir.join(format!("{root}_x1d.csv")));
        let back = load_extracted(&path).unwrap();
        assert_eq!(back.net, spectrum.net);
        assert_eq!(back.wavelength, spectrum.wavelength);
    }

    // already extracted: skipped unless forced
    let again = grismo.extract(&mut repo, &ExposureFilter::All, false).unwrap();
    assert!(again.extracted.is_empty());
    assert_eq!(again.skipped.len(), 2);
    let forced = grismo
        .extract(&mut repo, &ExposureFilter::Root("ibbu01a1q".into()), true)
        .unwrap();
    assert_eq!(forced.extracted, vec!["ibbu01a1q"]);

    // co-addition of the visit
    let coadds = grismo.coadd(&mut repo, &ExposureFilter::All).unwrap();
    let key = GroupKey {
        obset: "ibbu01".into(),
        grating: Grating::G102,
    };
    let merged = coadds[&key].as_ref().unwrap();
    let first = repo.get("ibbu01a1q").unwrap().spectrum.clone().unwrap();
    for (k, &w) in merged.wave.iter().enumerate() {
        if (8200.0..10500.0).contains(&w) {
            assert_eq!(merged.npts[k], 2);
            let x = (0..first.len())
                .min_by(|&a, &b| {
                    (first.wavelength[a] - w)
                        .abs()
                        .total_cmp(&(first.wavelength[b] - w).abs())
                })
                .unwrap();
            assert_relative_eq!(merged.net[k], first.net[x], max_relative = 0.1);
        }
    }
    assert!(repo.get("ibbu01a2q").unwrap().coadded_path.is_some());

    std::fs::remove_dir_all(&dir).unwrap();
}

#[derive(Debug)]
struct ForceAngle(Degree);

impl FitReview for ForceAngle {
    fn review_trace(&self, _root: &str, _fit: &TraceFit) -> TraceChoice {
        TraceChoice::ForceAngle(self.0)
    }
}

#[test]
fn test_forced_trace_angle_on_review() {
    let (mut repo, synthetic) = visit(None);
    let grismo = Grismo::new(InMemoryCalibration::uniform()).with_review(ForceAngle(0.61));

    let summary = grismo
        .extract(&mut repo, &ExposureFilter::Root("ibbu01a1q".into()), false)
        .unwrap();
    assert_eq!(summary.extracted, vec!["ibbu01a1q"]);

    let exposure = repo.get("ibbu01a1q").unwrap();
    let trace = exposure.trace.as_ref().unwrap();
    assert!(trace.fixed_slope);
    assert!(trace.positions.is_empty());
    assert_relative_eq!(trace.angle, 0.61, epsilon = 0.01);
    let line = synthetic[0].line_column;
    assert!((trace.y_at(line) - synthetic[0].trace[line as usize]).abs() < 0.5);
    assert!(exposure.notes.iter().any(|n| n.contains("trace angle forced")));
    assert!(repo.get("ibbu01a2q").unwrap().spectrum.is_none());
}

#[test]
fn test_known_issues_reach_the_extraction() {
    let (mut repo, _) = visit(None);
    let grismo = Grismo::new(InMemoryCalibration::uniform()).with_known_issues_text(
        "root:ibbu01a2q  gwidth = 8 ! wider box for this one\n\
         root:ibbu01a2q  edit dq[0:2,0:1014] = 4\n",
    );
    let summary = grismo.extract(&mut repo, &ExposureFilter::All, false).unwrap();
    assert_eq!(summary.extracted.len(), 2);

    let first = repo.get("ibbu01a1q").unwrap();
    assert_eq!(first.spectrum.as_ref().unwrap().metadata.gwidth, 6);
    assert!(first.notes.iter().all(|n| !n.contains("known issue")));

    let second = repo.get("ibbu01a2q").unwrap();
    assert_eq!(second.spectrum.as_ref().unwrap().metadata.gwidth, 8);
    assert!(second.notes.iter().any(|n| n.contains("wider box for this one")));
    assert_eq!(
        second.notes.iter().filter(|n| n.starts_with("known issue")).count(),
        2
    );
}

#[test]
fn test_failures_and_skips_are_recorded() {
    init_logging();
    let mut repo = ExposureRepository::new();
    let blank = grism_exposure(
        "ibbu03a1q",
        "ibbu03",
        55100.0,
        common::planes(ndarray::Array2::zeros((1014, 1014))),
    );
    repo.insert(blank);
    let mut no_image = Exposure::new(
        "ibbu03a2q",
        Filter::Grism(Grating::G102),
        "GD153",
        "ibbu03",
        55100.1,
    );
    no_image.direct_image = Some("ibbu03a0q".into());
    repo.insert(no_image);
    let scanned = grism_exposure(
        "ibbu03a3q",
        "ibbu03",
        55100.2,
        common::planes(ndarray::Array2::zeros((4, 4))),
    )
    .scan_rate(0.5);
    repo.insert(scanned);

    let grismo = Grismo::new(InMemoryCalibration::uniform());
    let summary = grismo.extract(&mut repo, &ExposureFilter::All, false).unwrap();
    assert!(summary.extracted.is_empty());
    assert_eq!(summary.skipped, vec!["ibbu03a3q"]);
    assert_eq!(summary.failed.len(), 2);

    // no direct image and no sky transform: nowhere to look for the zeroth order
    let (root, err) = &summary.failed[0];
    assert_eq!(root, "ibbu03a1q");
    assert!(matches!(err, GrismoError::CentroidNotFound(_)));
    let (root, err) = &summary.failed[1];
    assert_eq!(root, "ibbu03a2q");
    assert!(matches!(err, GrismoError::MissingImage(_)));

    let notes = &repo.get("ibbu03a2q").unwrap().notes;
    assert!(notes.iter().any(|n| n.starts_with("extraction failed")));
    let notes = &repo.get("ibbu03a3q").unwrap().notes;
    assert_eq!(notes, &vec!["scan mode extraction is not supported".to_string()]);
}
