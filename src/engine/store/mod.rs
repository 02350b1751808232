// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The narrow view of the cluster object store the node agent needs.

use std::{collections::BTreeMap, sync::mpsc::Receiver};

use retry::{delay::Exponential, retry, OperationResult};

use crate::{
    engine::types::{Drive, EventReason, EventType, ObjectRef, Volume},
    node::errors::{DirectCsiResult, ErrorKind},
};

mod file;
mod memory;

pub use self::{file::FileStore, memory::MemoryStore};

/// A set of "key in (values)" requirements, all of which must hold.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LabelSelector(BTreeMap<String, Vec<String>>);

impl LabelSelector {
    pub fn new() -> LabelSelector {
        LabelSelector::default()
    }

    /// Require the label to hold one of values. An empty list places no
    /// restriction.
    pub fn with<I, S>(mut self, key: &str, values: I) -> LabelSelector
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values.into_iter().map(|v| v.into()).collect::<Vec<_>>();
        if !values.is_empty() {
            self.0.insert(key.to_owned(), values);
        }
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(key, values)| {
            labels
                .get(key)
                .map(|value| values.contains(value))
                .unwrap_or(false)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ListOptions {
    pub selector: LabelSelector,
    /// Maximum number of items per page; zero means no limit.
    pub limit: usize,
    /// Continuation token from the previous page; empty for the first.
    pub continue_token: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DriveList {
    pub items: Vec<Drive>,
    /// Empty on the last page.
    pub continue_token: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WatchEvent {
    Added(Drive),
    Modified(Drive),
    Deleted(Drive),
}

impl WatchEvent {
    pub fn drive(&self) -> &Drive {
        match self {
            WatchEvent::Added(drive) | WatchEvent::Modified(drive) | WatchEvent::Deleted(drive) => {
                drive
            }
        }
    }
}

/// Typed CRUD with list and watch over drive and volume records.
///
/// Writes are optimistic: an update whose resource version is stale fails
/// with a conflict. Deleting a record that still has finalizers only sets
/// its deletion timestamp; the record goes away once an update leaves it
/// with no finalizers.
pub trait Store: Send + Sync {
    fn list_drives(&self, options: &ListOptions) -> DirectCsiResult<DriveList>;

    fn get_drive(&self, name: &str) -> DirectCsiResult<Drive>;

    fn create_drive(&self, drive: &Drive) -> DirectCsiResult<Drive>;

    fn update_drive(&self, drive: &Drive) -> DirectCsiResult<Drive>;

    fn delete_drive(&self, name: &str) -> DirectCsiResult<()>;

    /// Events for every drive change from now on. The stream ends when
    /// the store is dropped.
    fn watch_drives(&self) -> DirectCsiResult<Receiver<WatchEvent>>;

    fn get_volume(&self, name: &str) -> DirectCsiResult<Volume>;

    fn update_volume(&self, volume: &Volume) -> DirectCsiResult<Volume>;

    /// Record an event object against a drive or volume.
    fn event(
        &self,
        object: &ObjectRef,
        event_type: EventType,
        reason: EventReason,
        message: &str,
    ) -> DirectCsiResult<()>;
}

/// Run f until it stops failing with a conflict, backing off exponentially
/// from 10ms for at most five attempts.
pub fn retry_on_conflict<T, F>(mut f: F) -> DirectCsiResult<T>
where
    F: FnMut() -> DirectCsiResult<T>,
{
    retry(
        Exponential::from_millis_with_factor(10, 2.0).take(4),
        || match f() {
            Ok(value) => OperationResult::Ok(value),
            Err(err) if err.kind() == ErrorKind::Conflict => {
                debug!("Retrying after conflict: {err}");
                OperationResult::Retry(err)
            }
            Err(err) => OperationResult::Err(err),
        },
    )
    .map_err(|e| e.error)
}

/// Fetch the named drive, apply f and write the result back, retrying on
/// conflict. Nothing is written if f reports no change.
pub fn update_drive_with<F>(store: &dyn Store, name: &str, mut f: F) -> DirectCsiResult<Drive>
where
    F: FnMut(&mut Drive) -> DirectCsiResult<bool>,
{
    retry_on_conflict(|| {
        let mut drive = store.get_drive(name)?;
        if f(&mut drive)? {
            store.update_drive(&drive)
        } else {
            Ok(drive)
        }
    })
}

/// As update_drive_with, for volumes.
pub fn update_volume_with<F>(store: &dyn Store, name: &str, mut f: F) -> DirectCsiResult<Volume>
where
    F: FnMut(&mut Volume) -> bool,
{
    retry_on_conflict(|| {
        let mut volume = store.get_volume(name)?;
        if f(&mut volume) {
            store.update_volume(&volume)
        } else {
            Ok(volume)
        }
    })
}
