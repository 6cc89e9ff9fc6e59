//! # Spectrum products
//!
//! Extracted and co-added spectra are persisted as commented CSV files: a block of
//! `# key = value` lines carrying the metadata, followed by one CSV row per point.
//!
//! ```text
//! # grismo extracted spectrum
//! # root = ibbu01a1q
//! # grating = G102
//! ...
//! x,y_fit,wavelength,net,gross,background,dq,err,background_lower,background_upper,time
//! 0,512.3,-11982.1,...
//! ```
//!
//! Rows go through `csv` and `serde`; the metadata block is parsed with `nom`. Floating
//! values are written with their shortest round-trip representation, so reading an
//! extracted product back gives the spectrum that was written.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use hifitime::{Epoch, TimeScale};
use nom::{
    bytes::complete::take_while1,
    character::complete::{char, space0},
    combinator::rest,
    sequence::{delimited, preceded, separated_pair},
    IResult, Parser,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coadd::CoaddedSpectrum;
use crate::grismo_errors::GrismoError;
use crate::trace::extract::{ExtractedSpectrum, ExtractionMetadata};

const EXTRACTED_TITLE: &str = "grismo extracted spectrum";
const COADDED_TITLE: &str = "grismo co-added spectrum";

#[derive(Debug, Serialize, Deserialize)]
struct ExtractedRow {
    x: usize,
    y_fit: f64,
    wavelength: f64,
    net: f64,
    gross: f64,
    background: f64,
    dq: u32,
    err: f64,
    background_lower: f64,
    background_upper: f64,
    time: f64,
}

#[derive(Debug, Serialize)]
struct CoaddedRow {
    wave: f64,
    gross: f64,
    back: f64,
    net: f64,
    stdev: f64,
    stat_error: f64,
    error_mean: f64,
    npts: usize,
    exposure_time: f64,
}

/// File name of the extracted product of an exposure.
pub fn extracted_file_name(root: &str) -> String {
    format!("{root}_x1d.csv")
}

/// File name of the co-added product of a group.
pub fn coadded_file_name(target: &str, obset: &str, grating: impl std::fmt::Display) -> String {
    format!("{target}_{obset}_{grating}_coadd.csv")
}

fn metadata_pairs(m: &ExtractionMetadata) -> Vec<(&'static str, String)> {
    vec![
        ("root", m.root.clone()),
        ("target", m.target.clone()),
        ("grating", m.grating.to_string()),
        (
            "direct_image",
            m.direct_image.clone().unwrap_or_else(|| "none".into()),
        ),
        ("xc", m.xc.to_string()),
        ("yc", m.yc.to_string()),
        ("xerr", m.xerr.to_string()),
        ("yerr", m.yerr.to_string()),
        ("zeroth_x", m.zeroth.0.to_string()),
        ("zeroth_y", m.zeroth.1.to_string()),
        ("zeroth_found", m.zeroth_found.to_string()),
        ("solution", m.solution.to_string()),
        ("avgbkg", m.avgbkg.to_string()),
        ("flatfield", m.flatfield.clone()),
        ("sky_flat", m.sky_flat.clone()),
        ("trace_intercept", m.trace_intercept.to_string()),
        ("trace_slope", m.trace_slope.to_string()),
        ("angle", m.angle.to_string()),
        ("gwidth", m.gwidth.to_string()),
        ("bwidth", m.bwidth.to_string()),
        ("ubdist", m.ubdist.to_string()),
        ("lbdist", m.lbdist.to_string()),
        ("bmedian", m.bmedian.to_string()),
        ("bmean1", m.bmean1.to_string()),
        ("bmean2", m.bmean2.to_string()),
        ("wl_offset", m.wl_offset.to_string()),
        ("processing_order", m.processing_order.to_string()),
    ]
}

/// `# key = value`
fn comment_pair(input: &str) -> IResult<&str, (&str, &str)> {
    preceded(
        (char('#'), space0),
        separated_pair(
            take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
            delimited(space0, char('='), space0),
            rest,
        ),
    )
    .parse(input)
}

/// Metadata block of a commented CSV product.
fn parse_comments(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .take_while(|l| l.starts_with('#'))
        .filter_map(|l| comment_pair(l).ok())
        .map(|(_, (k, v))| (k.to_string(), v.trim_end().to_string()))
        .collect()
}

struct Fields(BTreeMap<String, String>);

impl Fields {
    fn raw(&self, key: &str) -> Result<&str, GrismoError> {
        self.0
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| GrismoError::MalformedProduct(format!("missing metadata '{key}'")))
    }

    fn get<T: FromStr>(&self, key: &str) -> Result<T, GrismoError> {
        let raw = self.raw(key)?;
        raw.parse()
            .map_err(|_| GrismoError::MalformedProduct(format!("bad value for '{key}': {raw}")))
    }
}

fn metadata_from(fields: &Fields) -> Result<ExtractionMetadata, GrismoError> {
    let direct_image = match fields.raw("direct_image")? {
        "none" => None,
        name => Some(name.to_string()),
    };
    Ok(ExtractionMetadata {
        root: fields.raw("root")?.to_string(),
        target: fields.raw("target")?.to_string(),
        grating: fields.raw("grating")?.parse()?,
        direct_image,
        xc: fields.get("xc")?,
        yc: fields.get("yc")?,
        xerr: fields.get("xerr")?,
        yerr: fields.get("yerr")?,
        zeroth: (fields.get("zeroth_x")?, fields.get("zeroth_y")?),
        zeroth_found: fields.get("zeroth_found")?,
        solution: fields.raw("solution")?.parse()?,
        avgbkg: fields.get("avgbkg")?,
        flatfield: fields.raw("flatfield")?.to_string(),
        sky_flat: fields.raw("sky_flat")?.to_string(),
        trace_intercept: fields.get("trace_intercept")?,
        trace_slope: fields.get("trace_slope")?,
        angle: fields.get("angle")?,
        gwidth: fields.get("gwidth")?,
        bwidth: fields.get("bwidth")?,
        ubdist: fields.get("ubdist")?,
        lbdist: fields.get("lbdist")?,
        bmedian: fields.get("bmedian")?,
        bmean1: fields.get("bmean1")?,
        bmean2: fields.get("bmean2")?,
        wl_offset: fields.get("wl_offset")?,
        processing_order: fields.raw("processing_order")?.parse()?,
    })
}

/// Write an extracted spectrum to `writer`.
pub fn write_extracted<W: Write>(mut writer: W, spectrum: &ExtractedSpectrum) -> Result<(), GrismoError> {
    writeln!(writer, "# {EXTRACTED_TITLE}")?;
    for (key, value) in metadata_pairs(&spectrum.metadata) {
        writeln!(writer, "# {key} = {value}")?;
    }

    let mut csv_writer = csv::Writer::from_writer(&mut writer);
    for i in 0..spectrum.len() {
        csv_writer.serialize(ExtractedRow {
            x: spectrum.x[i],
            y_fit: spectrum.y_fit[i],
            wavelength: spectrum.wavelength[i],
            net: spectrum.net[i],
            gross: spectrum.gross[i],
            background: spectrum.background[i],
            dq: spectrum.dq[i],
            err: spectrum.err[i],
            background_lower: spectrum.background_lower[i],
            background_upper: spectrum.background_upper[i],
            time: spectrum.time[i],
        })?;
    }
    csv_writer.flush()?;
    Ok(())
}

/// Read back a product written by [`write_extracted`].
pub fn read_extracted<R: Read>(mut reader: R) -> Result<ExtractedSpectrum, GrismoError> {
    let mut text = String::new();
    reader.read_to_string(&mut text)?;
    if !text.starts_with(&format!("# {EXTRACTED_TITLE}")) {
        return Err(GrismoError::MalformedProduct(
            "not an extracted spectrum".into(),
        ));
    }
    let metadata = metadata_from(&Fields(parse_comments(&text)))?;

    let mut csv_reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .from_reader(text.as_bytes());
    let rows = csv_reader
        .deserialize::<ExtractedRow>()
        .collect::<Result<Vec<_>, _>>()?;

    let column = |f: fn(&ExtractedRow) -> f64| rows.iter().map(f).collect::<Vec<_>>();
    Ok(ExtractedSpectrum {
        x: rows.iter().map(|r| r.x).collect(),
        y_fit: column(|r| r.y_fit),
        wavelength: column(|r| r.wavelength),
        net: column(|r| r.net),
        gross: column(|r| r.gross),
        background: column(|r| r.background),
        dq: rows.iter().map(|r| r.dq).collect(),
        err: column(|r| r.err),
        background_lower: column(|r| r.background_lower),
        background_upper: column(|r| r.background_upper),
        time: column(|r| r.time),
        metadata,
    })
}

/// Write a co-added spectrum to `writer`, stamped with `created`.
pub fn write_coadded<W: Write>(
    mut writer: W,
    spectrum: &CoaddedSpectrum,
    created: Epoch,
) -> Result<(), GrismoError> {
    let p = &spectrum.provenance;
    writeln!(writer, "# {COADDED_TITLE}")?;
    writeln!(writer, "# comment = Gross and Back columns have Flat Field applied.")?;
    writeln!(writer, "# created = {created}")?;
    writeln!(writer, "# target = {}", p.target)?;
    writeln!(writer, "# grating = {}", p.grating)?;
    writeln!(writer, "# obset = {}", p.obset)?;
    writeln!(
        writer,
        "# date = {}",
        Epoch::from_mjd_in_time_scale(p.date, TimeScale::UTC)
    )?;
    writeln!(writer, "# coadd_list = {}", p.roots.join(" "))?;

    let mut csv_writer = csv::Writer::from_writer(&mut writer);
    for i in 0..spectrum.len() {
        csv_writer.serialize(CoaddedRow {
            wave: spectrum.wave[i],
            gross: spectrum.gross[i],
            back: spectrum.back[i],
            net: spectrum.net[i],
            stdev: spectrum.stdev[i],
            stat_error: spectrum.stat_error[i],
            error_mean: spectrum.error_mean[i],
            npts: spectrum.npts[i],
            exposure_time: spectrum.exposure_time[i],
        })?;
    }
    csv_writer.flush()?;
    Ok(())
}

/// Write the extracted product of `spectrum` into `dir`, returning its path.
pub fn save_extracted(dir: &Utf8Path, spectrum: &ExtractedSpectrum) -> Result<Utf8PathBuf, GrismoError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(extracted_file_name(&spectrum.metadata.root));
    write_extracted(BufWriter::new(File::create(&path)?), spectrum)?;
    debug!(%path, points = spectrum.len(), "extracted product written");
    Ok(path)
}

pub fn load_extracted(path: &Utf8Path) -> Result<ExtractedSpectrum, GrismoError> {
    read_extracted(File::open(path)?)
}

/// Write the co-added product of `spectrum` into `dir`, returning its path.
pub fn save_coadded(
    dir: &Utf8Path,
    spectrum: &CoaddedSpectrum,
    created: Epoch,
) -> Result<Utf8PathBuf, GrismoError> {
    fs::create_dir_all(dir)?;
    let p = &spectrum.provenance;
    let path = dir.join(coadded_file_name(&p.target, &p.obset, p.grating));
    write_coadded(BufWriter::new(File::create(&path)?), spectrum, created)?;
    debug!(%path, points = spectrum.len(), "co-added product written");
    Ok(path)
}

#[cfg(test)]
mod products_test {
    use super::*;
    use crate::coadd::CoaddProvenance;
    use crate::constants::Grating;
    use crate::dispersion::SolutionKind;
    use crate::params::ProcessingOrder;

    fn metadata() -> ExtractionMetadata {
        ExtractionMetadata {
            root: "ibbu01a1q".into(),
            target: "GD153".into(),
            grating: Grating::G102,
            direct_image: Some("ibbu01a0q".into()),
            xc: 512.25,
            yc: 498.125,
            xerr: 0.0,
            yerr: 0.0,
            zeroth: (260.5, 494.0),
            zeroth_found: true,
            solution: SolutionKind::ZerothOrder,
            avgbkg: 1.0 / 3.0,
            flatfield: "uniform".into(),
            sky_flat: "sky = flat".into(),
            trace_intercept: 497.6,
            trace_slope: 0.0123,
            angle: 0.7047,
            gwidth: 6,
            bwidth: 13,
            ubdist: 31.0,
            lbdist: 31.0,
            bmedian: 7,
            bmean1: 7,
            bmean2: 7,
            wl_offset: 0.0,
            processing_order: ProcessingOrder::BackgroundFirst,
        }
    }

    fn spectrum() -> ExtractedSpectrum {
        ExtractedSpectrum {
            x: vec![0, 1, 2],
            y_fit: vec![497.6, 497.6123, 497.6246],
            wavelength: vec![-11000.0, 7000.125, 14000.25],
            net: vec![1.5, f64::NAN, -0.1],
            gross: vec![2.5, 3.0, 0.9],
            background: vec![1.0, 1.0, 1.0],
            dq: vec![0, 8, 512],
            err: vec![0.1, 0.2, 0.3],
            background_lower: vec![0.9, 0.9, 0.9],
            background_upper: vec![1.1, 1.1, 1.1],
            time: vec![400.0, 400.0, 399.5],
            metadata: metadata(),
        }
    }

    #[test]
    fn test_extracted_read_back() {
        let mut buffer = Vec::new();
        write_extracted(&mut buffer, &spectrum()).unwrap();
        let back = read_extracted(buffer.as_slice()).unwrap();

        let original = spectrum();
        assert_eq!(back.metadata, original.metadata);
        assert_eq!(back.x, original.x);
        assert_eq!(back.wavelength, original.wavelength);
        assert_eq!(back.dq, original.dq);
        assert_eq!(back.time, original.time);
        assert_eq!(back.net[0], 1.5);
        assert!(back.net[1].is_nan());
    }

    #[test]
    fn test_comment_parser() {
        assert_eq!(
            comment_pair("# sky_flat = sky = flat"),
            Ok(("", ("sky_flat", "sky = flat")))
        );
        assert!(comment_pair("x,y_fit").is_err());
    }

    #[test]
    fn test_missing_metadata_is_malformed() {
        let text = "# grismo extracted spectrum\n# root = a\nx,y_fit\n";
        let res = read_extracted(text.as_bytes());
        assert!(matches!(res, Err(GrismoError::MalformedProduct(_))));

        let res = read_extracted("x,y\n1,2\n".as_bytes());
        assert!(matches!(res, Err(GrismoError::MalformedProduct(_))));
    }

    #[test]
    fn test_coadded_provenance() {
        let spectrum = CoaddedSpectrum {
            wave: vec![8000.0, 8024.5],
            gross: vec![3.0, 3.5],
            back: vec![1.0, 1.0],
            net: vec![2.0, 2.5],
            stdev: vec![0.1, 0.2],
            stat_error: vec![0.05, 0.06],
            error_mean: vec![0.07, 0.08],
            npts: vec![2, 0],
            exposure_time: vec![800.0, 0.0],
            provenance: CoaddProvenance {
                roots: vec!["ibbu01a1q".into(), "ibbu01a2q".into()],
                target: "GD153".into(),
                grating: Grating::G102,
                obset: "ibbu01".into(),
                date: 55000.0,
            },
        };
        let created = Epoch::from_gregorian_utc_at_midnight(2024, 3, 1);
        let mut buffer = Vec::new();
        write_coadded(&mut buffer, &spectrum, created).unwrap();
        let text = String::from_utf8(buffer).unwrap();

        let comments = parse_comments(&text);
        assert_eq!(comments["coadd_list"], "ibbu01a1q ibbu01a2q");
        assert_eq!(comments["grating"], "G102");
        assert!(comments["comment"].contains("Flat Field"));
        assert!(comments["date"].starts_with("2009-06-18"));
        assert!(comments["created"].starts_with("2024-03-01"));
        assert!(text.contains("wave,gross,back,net,stdev,stat_error,error_mean,npts,exposure_time"));
        let rows: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[2].starts_with("8024.5,3.5,"));
        assert_eq!(
            coadded_file_name("GD153", "ibbu01", Grating::G102),
            "GD153_ibbu01_G102_coadd.csv"
        );
    }
}
