// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;

use crate::engine::consts::{DATA_PROTECTION_FINALIZER, VOLUME_FINALIZER_PREFIX};

/// Object metadata shared by every record kept in the cluster store.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    pub name: String,
    /// Bumped by the store on every accepted write; an update carrying a
    /// stale value is rejected with a conflict.
    pub resource_version: u64,
    pub labels: BTreeMap<String, String>,
    pub finalizers: Finalizers,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(|v| v.as_str())
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.labels.insert(key.to_owned(), value.to_owned());
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// An ordered set of finalizer strings.
///
/// Insertion order is preserved so the record serializes the way it was
/// written; equality and containment are by value.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Finalizers(IndexSet<String>);

impl Finalizers {
    /// A list holding only the data-protection sentinel.
    pub fn data_protection() -> Finalizers {
        let mut finalizers = Finalizers::default();
        finalizers.add(DATA_PROTECTION_FINALIZER);
        finalizers
    }

    pub fn volume_finalizer(volume_id: &str) -> String {
        format!("{VOLUME_FINALIZER_PREFIX}{volume_id}")
    }

    /// Returns true if the finalizer was not already present.
    pub fn add(&mut self, finalizer: &str) -> bool {
        self.0.insert(finalizer.to_owned())
    }

    pub fn remove(&mut self, finalizer: &str) -> bool {
        self.0.shift_remove(finalizer)
    }

    pub fn contains(&self, finalizer: &str) -> bool {
        self.0.contains(finalizer)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    /// The volume IDs referenced by volume finalizers, in insertion order.
    pub fn volumes(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter_map(|f| f.strip_prefix(VOLUME_FINALIZER_PREFIX))
    }

    pub fn has_volumes(&self) -> bool {
        self.volumes().next().is_some()
    }

    /// A record may be removed from the store only when the data-protection
    /// sentinel is the sole finalizer.
    pub fn deletion_allowed(&self) -> bool {
        self.0.len() == 1 && self.contains(DATA_PROTECTION_FINALIZER)
    }
}

impl<'a> FromIterator<&'a str> for Finalizers {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Finalizers {
        Finalizers(iter.into_iter().map(|s| s.to_owned()).collect())
    }
}
