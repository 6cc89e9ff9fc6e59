//! In-memory store of [`Exposure`] records keyed by root, plus the typed selection
//! filters the pipeline stages use to pick their inputs.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::constants::Grating;
use crate::exposure::Exposure;
use crate::grismo_errors::GrismoError;

/// Selection criterion over exposures.
#[derive(Debug, Clone, PartialEq)]
pub enum ExposureFilter {
    /// Every exposure
    All,
    /// Exposures whose `use` flag is set
    Used,
    /// Non-scanned exposures
    Stare,
    /// Scanned exposures
    Scan,
    /// Imaging (direct) exposures
    Imaging,
    /// Grism exposures, optionally restricted to one grating
    Grism(Option<Grating>),
    /// Observation set whose identifier starts with the payload
    Obset(String),
    /// Root starting with the payload
    Root(String),
    Target(String),
    /// Every sub-filter must match
    And(Vec<ExposureFilter>),
}

impl ExposureFilter {
    pub fn matches(&self, exposure: &Exposure) -> bool {
        match self {
            ExposureFilter::All => true,
            ExposureFilter::Used => exposure.use_exposure,
            ExposureFilter::Stare => exposure.is_stare(),
            ExposureFilter::Scan => !exposure.is_stare(),
            ExposureFilter::Imaging => !exposure.is_grism(),
            ExposureFilter::Grism(None) => exposure.is_grism(),
            ExposureFilter::Grism(Some(g)) => exposure.grating() == Some(*g),
            ExposureFilter::Obset(prefix) => exposure.obset.starts_with(prefix.as_str()),
            ExposureFilter::Root(prefix) => exposure.root.starts_with(prefix.as_str()),
            ExposureFilter::Target(name) => exposure.target == *name,
            ExposureFilter::And(filters) => filters.iter().all(|f| f.matches(exposure)),
        }
    }

    /// Combine with another filter.
    pub fn and(self, other: ExposureFilter) -> ExposureFilter {
        match self {
            ExposureFilter::And(mut filters) => {
                filters.push(other);
                ExposureFilter::And(filters)
            }
            first => ExposureFilter::And(vec![first, other]),
        }
    }
}

/// Key of a co-addition group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    pub obset: String,
    pub grating: Grating,
}

/// Exposures keyed by root identifier.
#[derive(Debug, Clone, Default)]
pub struct ExposureRepository {
    exposures: BTreeMap<String, Exposure>,
}

impl ExposureRepository {
    pub fn new() -> Self {
        ExposureRepository::default()
    }

    /// Insert or replace an exposure, returning the previous record with the same root.
    pub fn insert(&mut self, exposure: Exposure) -> Option<Exposure> {
        self.exposures.insert(exposure.root.clone(), exposure)
    }

    pub fn len(&self) -> usize {
        self.exposures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exposures.is_empty()
    }

    pub fn get(&self, root: &str) -> Result<&Exposure, GrismoError> {
        self.exposures
            .get(root)
            .ok_or_else(|| GrismoError::ExposureNotFound(root.to_string()))
    }

    pub fn get_mut(&mut self, root: &str) -> Result<&mut Exposure, GrismoError> {
        self.exposures
            .get_mut(root)
            .ok_or_else(|| GrismoError::ExposureNotFound(root.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Exposure> {
        self.exposures.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Exposure> {
        self.exposures.values_mut()
    }

    /// Roots of the exposures matching `filter`, in root order.
    pub fn select(&self, filter: &ExposureFilter) -> Vec<String> {
        self.exposures
            .values()
            .filter(|e| filter.matches(e))
            .map(|e| e.root.clone())
            .collect()
    }

    /// Record `note` on the exposure, ignoring unknown roots.
    pub fn add_note(&mut self, root: &str, note: impl Into<String>) {
        if let Some(exposure) = self.exposures.get_mut(root) {
            exposure.add_note(note);
        }
    }

    /// Associate every grism exposure lacking a direct image with the imaging exposure of
    /// the same observation set and dither position that is closest in time.
    ///
    /// Returns the number of links made.
    pub fn link_direct_images(&mut self) -> usize {
        let imaging: Vec<(String, String, (f64, f64), f64)> = self
            .exposures
            .values()
            .filter(|e| !e.is_grism())
            .map(|e| (e.root.clone(), e.obset.clone(), e.postarg, e.date))
            .collect();

        let mut linked = 0;
        for exposure in self.exposures.values_mut() {
            if !exposure.is_grism() || exposure.direct_image.is_some() {
                continue;
            }
            let closest = imaging
                .iter()
                .filter(|(_, obset, postarg, _)| {
                    *obset == exposure.obset && *postarg == exposure.postarg
                })
                .min_by(|a, b| {
                    (a.3 - exposure.date)
                        .abs()
                        .total_cmp(&(b.3 - exposure.date).abs())
                });
            if let Some((root, ..)) = closest {
                exposure.direct_image = Some(root.clone());
                linked += 1;
            }
        }
        linked
    }

    /// Grism exposures matching `filter`, grouped by observation set and grating.
    pub fn groups(&self, filter: &ExposureFilter) -> BTreeMap<GroupKey, Vec<String>> {
        self.exposures
            .values()
            .filter(|e| filter.matches(e))
            .filter_map(|e| {
                e.grating().map(|grating| {
                    (
                        GroupKey {
                            obset: e.obset.clone(),
                            grating,
                        },
                        e.root.clone(),
                    )
                })
            })
            .into_group_map()
            .into_iter()
            .collect()
    }
}
