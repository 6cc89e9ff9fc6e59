//! # Known-issue override table
//!
//! Some exposures need hand-tuned parameters (a forced trace slope, a direct-image position
//! measured by eye, a wider extraction box) or small image repairs before they can be
//! reduced. These are collected in a line-oriented rules file:
//!
//! ```text
//! ! column:prefix   what                        ! reason
//! root:ibbu01a1q    xc = 332.0                  ! direct image saturated
//! target:GD153      gwidth = 8
//! obset:ic69        edit sci[500:510,200:210] = 0.0 ! persistence from previous visit
//! ```
//!
//! * Lines starting with `!` are comments; anything after a `!` on a rule line is the
//!   human-readable reason recorded in the exposure notes.
//! * `column` is one of `root`, `target` or `obset`; a rule applies to every exposure whose
//!   value in that column starts with `prefix`.
//! * `edit plane[y1:y2,x1:x2] = value` overwrites a half-open pixel block of the `sci`,
//!   `err` or `dq` plane.
//!
//! Parsing is done with `nom`; values are resolved by [`resolve`](crate::params::resolve).

use std::fs;

use camino::Utf8Path;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{map, map_res, opt, rest},
    number::complete::double,
    sequence::{delimited, preceded, separated_pair, terminated},
    IResult, Parser,
};

use crate::exposure::{Exposure, ImagePlanes};
use crate::grismo_errors::GrismoError;
use crate::params::ParamKey;

/// Metadata column a rule is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueColumn {
    Root,
    Target,
    Obset,
}

/// Image plane touched by an edit rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    Sci,
    Err,
    Dq,
}

/// Overwrite of a rectangular pixel block, `rows` and `cols` half-open.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageEdit {
    pub plane: Plane,
    pub rows: (usize, usize),
    pub cols: (usize, usize),
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IssueAction {
    Param { key: ParamKey, value: f64 },
    Edit(ImageEdit),
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnownIssue {
    pub column: IssueColumn,
    pub prefix: String,
    pub action: IssueAction,
    pub reason: Option<String>,
}

impl KnownIssue {
    pub fn applies_to(&self, exposure: &Exposure) -> bool {
        let value = match self.column {
            IssueColumn::Root => &exposure.root,
            IssueColumn::Target => &exposure.target,
            IssueColumn::Obset => &exposure.obset,
        };
        value.starts_with(self.prefix.as_str())
    }

    fn describe(&self) -> String {
        let what = match &self.action {
            IssueAction::Param { key, value } => format!("{key} = {value}"),
            IssueAction::Edit(e) => format!(
                "{:?}[{}:{},{}:{}] = {}",
                e.plane, e.rows.0, e.rows.1, e.cols.0, e.cols.1, e.value
            ),
        };
        match &self.reason {
            Some(reason) => format!("known issue: {what} ({reason})"),
            None => format!("known issue: {what}"),
        }
    }
}

/// Parsed known-issue table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnownIssues {
    issues: Vec<KnownIssue>,
}

fn parse_column(input: &str) -> IResult<&str, IssueColumn> {
    alt((
        map(tag("root"), |_| IssueColumn::Root),
        map(tag("target"), |_| IssueColumn::Target),
        map(tag("obset"), |_| IssueColumn::Obset),
    ))
    .parse(input)
}

fn parse_selector(input: &str) -> IResult<&str, (IssueColumn, &str)> {
    separated_pair(
        parse_column,
        char(':'),
        take_while1(|c: char| !c.is_whitespace()),
    )
    .parse(input)
}

fn parse_usize(input: &str) -> IResult<&str, usize> {
    map_res(
        delimited(multispace0, digit1, multispace0),
        str::parse::<usize>,
    )
    .parse(input)
}

fn parse_span(input: &str) -> IResult<&str, (usize, usize)> {
    separated_pair(parse_usize, char(':'), parse_usize).parse(input)
}

fn parse_plane(input: &str) -> IResult<&str, Plane> {
    alt((
        map(tag("sci"), |_| Plane::Sci),
        map(tag("err"), |_| Plane::Err),
        map(tag("dq"), |_| Plane::Dq),
    ))
    .parse(input)
}

fn parse_value(input: &str) -> IResult<&str, f64> {
    preceded((multispace0, char('='), multispace0), double).parse(input)
}

fn parse_edit(input: &str) -> IResult<&str, IssueAction> {
    map(
        (
            preceded(terminated(tag("edit"), multispace1), parse_plane),
            delimited(
                char('['),
                separated_pair(parse_span, char(','), parse_span),
                char(']'),
            ),
            parse_value,
        ),
        |(plane, (rows, cols), value)| {
            IssueAction::Edit(ImageEdit {
                plane,
                rows,
                cols,
                value,
            })
        },
    )
    .parse(input)
}

fn parse_param(input: &str) -> IResult<&str, (&str, f64)> {
    (
        take_while1(|c: char| c.is_alphanumeric() || c == '_'),
        parse_value,
    )
        .parse(input)
}

fn parse_rule(input: &str) -> IResult<&str, ((IssueColumn, &str), Option<IssueAction>, &str)> {
    (
        terminated(parse_selector, multispace1),
        opt(parse_edit),
        rest,
    )
        .parse(input)
}

/// Parse one rule line into a [`KnownIssue`].
fn parse_line(line: &str) -> Result<KnownIssue, GrismoError> {
    let fail = || GrismoError::KnownIssueParse(line.to_string());

    // split off the trailing reason
    let (body, reason) = match take_until::<_, _, nom::error::Error<&str>>("!").parse(line) {
        Ok((remain, body)) => (body, Some(remain[1..].trim().to_string())),
        Err(_) => (line, None),
    };
    let reason = reason.filter(|r| !r.is_empty());

    let ((column, prefix), edit, remain) = parse_rule(body.trim()).map_err(|_| fail())?.1;
    let action = match edit {
        Some(edit) if remain.trim().is_empty() => edit,
        Some(_) => return Err(fail()),
        None => {
            let (after, (name, value)) = parse_param(remain.trim()).map_err(|_| fail())?;
            if !after.trim().is_empty() {
                return Err(fail());
            }
            IssueAction::Param {
                key: name.parse()?,
                value,
            }
        }
    };

    Ok(KnownIssue {
        column,
        prefix: prefix.to_string(),
        action,
        reason,
    })
}

impl KnownIssues {
    pub fn empty() -> Self {
        KnownIssues::default()
    }

    /// Parse a whole rules file.
    pub fn parse(text: &str) -> Result<Self, GrismoError> {
        let issues = text
            .lines()
            .filter(|line| !line.trim().is_empty() && !line.trim_start().starts_with('!'))
            .map(parse_line)
            .collect::<Result<Vec<_>, GrismoError>>()?;
        Ok(KnownIssues { issues })
    }

    pub fn from_path(path: &Utf8Path) -> Result<Self, GrismoError> {
        let text = fs::read_to_string(path)?;
        KnownIssues::parse(&text)
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Rules that apply to `exposure`, in table order.
    pub fn matching<'a>(&'a self, exposure: &'a Exposure) -> impl Iterator<Item = &'a KnownIssue> {
        self.issues.iter().filter(move |i| i.applies_to(exposure))
    }

    /// Parameter values the table sets for `exposure`, with one note per rule.
    pub fn param_overrides(&self, exposure: &Exposure) -> (Vec<(ParamKey, f64)>, Vec<String>) {
        self.matching(exposure)
            .filter_map(|issue| match issue.action {
                IssueAction::Param { key, value } => Some(((key, value), issue.describe())),
                IssueAction::Edit(_) => None,
            })
            .unzip()
    }

    /// Apply every matching image edit to `planes` and return one note per edit.
    ///
    /// Blocks are clipped to the readout.
    pub fn apply_image_edits(&self, exposure: &Exposure, planes: &mut ImagePlanes) -> Vec<String> {
        let (nrows, ncols) = planes.shape();
        let mut notes = Vec::new();
        for issue in self.matching(exposure) {
            let IssueAction::Edit(edit) = &issue.action else {
                continue;
            };
            let (r0, r1) = (edit.rows.0.min(nrows), edit.rows.1.min(nrows));
            let (c0, c1) = (edit.cols.0.min(ncols), edit.cols.1.min(ncols));
            if r0 >= r1 || c0 >= c1 {
                continue;
            }
            let block = ndarray::s![r0..r1, c0..c1];
            match edit.plane {
                Plane::Sci => planes.sci.slice_mut(block).fill(edit.value),
                Plane::Err => planes.err.slice_mut(block).fill(edit.value),
                Plane::Dq => planes.dq.slice_mut(block).fill(edit.value.max(0.0) as u32),
            }
            notes.push(issue.describe());
        }
        notes
    }
}

#[cfg(test)]
mod known_issues_test {
    use super::*;
    use ndarray::Array2;

    const RULES: &str = "\
! test rules
root:ibbu01a1q   xc = 332.0 ! direct image saturated
root:ibbu01      yc=504.8
target:GD153     gwidth = 8
obset:ic69       edit sci[2:4, 1:3] = -1.5 ! persistence
obset:ic69       edit dq[0:1,0:10] = 16
";

    fn exposure(root: &str, target: &str, obset: &str) -> Exposure {
        Exposure::new(root, "G102".parse().unwrap(), target, obset, 0.0)
    }

    #[test]
    fn test_parse_rules() {
        let issues = KnownIssues::parse(RULES).unwrap();
        assert_eq!(issues.len(), 5);

        let first = &issues.issues[0];
        assert_eq!(first.column, IssueColumn::Root);
        assert_eq!(first.prefix, "ibbu01a1q");
        assert_eq!(
            first.action,
            IssueAction::Param {
                key: ParamKey::Xc,
                value: 332.0
            }
        );
        assert_eq!(first.reason.as_deref(), Some("direct image saturated"));

        assert_eq!(
            issues.issues[3].action,
            IssueAction::Edit(ImageEdit {
                plane: Plane::Sci,
                rows: (2, 4),
                cols: (1, 3),
                value: -1.5
            })
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            KnownIssues::parse("rootibbu xc = 1"),
            Err(GrismoError::KnownIssueParse(_))
        ));
        assert!(matches!(
            KnownIssues::parse("root:ibbu xc = abc"),
            Err(GrismoError::KnownIssueParse(_))
        ));
        assert!(matches!(
            KnownIssues::parse("root:ibbu nosuchparam = 1"),
            Err(GrismoError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_prefix_matching() {
        let issues = KnownIssues::parse(RULES).unwrap();

        let (values, notes) = issues.param_overrides(&exposure("ibbu01a1q", "GD153", "ibbu01"));
        assert_eq!(
            values,
            vec![
                (ParamKey::Xc, 332.0),
                (ParamKey::Yc, 504.8),
                (ParamKey::Gwidth, 8.0)
            ]
        );
        assert_eq!(notes.len(), 3);
        assert!(notes[0].contains("direct image saturated"));

        let (values, _) = issues.param_overrides(&exposure("ibbu02a1q", "GD71", "ibbu02"));
        assert!(values.is_empty());
    }

    #[test]
    fn test_image_edits() {
        let issues = KnownIssues::parse(RULES).unwrap();
        let mut planes = ImagePlanes::new(
            Array2::ones((5, 5)),
            Array2::ones((5, 5)),
            Array2::zeros((5, 5)),
            Array2::ones((5, 5)),
        )
        .unwrap();

        let notes = issues.apply_image_edits(&exposure("ic6901a1q", "GD153", "ic6901"), &mut planes);
        assert_eq!(notes.len(), 2);
        assert_eq!(planes.sci[[2, 1]], -1.5);
        assert_eq!(planes.sci[[3, 2]], -1.5);
        assert_eq!(planes.sci[[4, 2]], 1.0);
        assert_eq!(planes.sci[[2, 3]], 1.0);
        // clipped to the readout width
        assert!(planes.dq.row(0).iter().all(|&v| v == 16));
        assert_eq!(planes.dq[[1, 0]], 0);
    }
}
