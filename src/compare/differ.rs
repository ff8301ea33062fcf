use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::features::{FeatureMapping, FeatureValue};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffEntry {
    pub baseline: FeatureValue,
    pub target: FeatureValue,
    #[serde(rename = "match")]
    pub is_match: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DiffRecord {
    entries: BTreeMap<String, DiffEntry>,
}

impl DiffRecord {
    pub fn get(&self, metric: &str) -> Option<&DiffEntry> {
        self.entries.get(metric)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DiffEntry)> {
        self.entries.iter()
    }

    pub fn mismatches(&self) -> impl Iterator<Item = (&String, &DiffEntry)> {
        self.entries.iter().filter(|(_, e)| !e.is_match)
    }

    pub fn mismatch_count(&self) -> usize {
        self.mismatches().count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn mismatches_first(&self) -> Vec<(&String, &DiffEntry)> {
        let mut rows = self.entries.iter().collect::<Vec<_>>();
        rows.sort_by_key(|(_, entry)| entry.is_match);
        rows
    }
}

impl FromIterator<(String, DiffEntry)> for DiffRecord {
    fn from_iter<I: IntoIterator<Item = (String, DiffEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Compares two feature mappings over the union of their keys.
pub fn diff_features(
    baseline: &FeatureMapping,
    target: &FeatureMapping,
    ignore: &BTreeSet<String>,
) -> DiffRecord {
    let mut names = BTreeSet::new();
    names.extend(baseline.keys().cloned());
    names.extend(target.keys().cloned());

    names
        .into_iter()
        .filter(|name| !ignore.contains(name))
        .map(|name| {
            let baseline_value = baseline.value_or_unavailable(&name);
            let target_value = target.value_or_unavailable(&name);
            let is_match = baseline_value == target_value;
            (
                name,
                DiffEntry {
                    baseline: baseline_value,
                    target: target_value,
                    is_match,
                },
            )
        })
        .collect()
}
