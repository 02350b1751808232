// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{
        mpsc::{channel, Receiver, Sender},
        Mutex,
    },
};

use chrono::Utc;

use crate::{
    engine::{
        store::{DriveList, ListOptions, Store, WatchEvent},
        types::{Drive, EventReason, EventType, ObjectRef, RecordedEvent, Volume},
    },
    node::errors::{DirectCsiError, DirectCsiResult},
};

const LOCK_EXPECT_MSG: &str =
    "No code holding the store lock can panic; therefore the mutex can not be poisoned.";

#[derive(Debug, Default)]
struct State {
    drives: BTreeMap<String, Drive>,
    volumes: BTreeMap<String, Volume>,
    events: Vec<RecordedEvent>,
    resource_version: u64,
    watchers: Vec<Sender<WatchEvent>>,
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.resource_version += 1;
        self.resource_version
    }

    fn notify(&mut self, event: &WatchEvent) {
        self.watchers.retain(|w| w.send(event.clone()).is_ok());
    }
}

/// A thread safe in-process store with the same write semantics as the
/// cluster: resource versions, finalizer gated deletion and watches.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Seed the store with drives and volumes, bypassing version checks.
    pub fn with_objects(drives: Vec<Drive>, volumes: Vec<Volume>) -> MemoryStore {
        let store = MemoryStore::new();
        {
            let mut state = store.state.lock().expect(LOCK_EXPECT_MSG);
            for mut drive in drives {
                drive.metadata.resource_version = state.next_version();
                state.drives.insert(drive.metadata.name.clone(), drive);
            }
            for mut volume in volumes {
                volume.metadata.resource_version = state.next_version();
                state.volumes.insert(volume.metadata.name.clone(), volume);
            }
        }
        store
    }

    pub fn drives(&self) -> Vec<Drive> {
        let state = self.state.lock().expect(LOCK_EXPECT_MSG);
        state.drives.values().cloned().collect()
    }

    pub fn volumes(&self) -> Vec<Volume> {
        let state = self.state.lock().expect(LOCK_EXPECT_MSG);
        state.volumes.values().cloned().collect()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state.lock().expect(LOCK_EXPECT_MSG).events.clone()
    }

    pub fn create_volume(&self, volume: &Volume) -> DirectCsiResult<Volume> {
        let mut state = self.state.lock().expect(LOCK_EXPECT_MSG);
        if state.volumes.contains_key(volume.name()) {
            return Err(DirectCsiError::AlreadyExists(format!("volume {}", volume.name())));
        }
        let mut volume = volume.clone();
        volume.metadata.resource_version = state.next_version();
        state.volumes.insert(volume.name().to_owned(), volume.clone());
        Ok(volume)
    }
}

impl Store for MemoryStore {
    fn list_drives(&self, options: &ListOptions) -> DirectCsiResult<DriveList> {
        let state = self.state.lock().expect(LOCK_EXPECT_MSG);
        let start = if options.continue_token.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(options.continue_token.clone())
        };

        let mut items = Vec::new();
        let mut continue_token = String::new();
        for (name, drive) in state.drives.range((start, Bound::Unbounded)) {
            if !options.selector.matches(&drive.metadata.labels) {
                continue;
            }
            if options.limit != 0 && items.len() == options.limit {
                continue_token = items
                    .last()
                    .map(|d: &Drive| d.metadata.name.clone())
                    .unwrap_or_else(|| name.clone());
                break;
            }
            items.push(drive.clone());
        }
        Ok(DriveList {
            items,
            continue_token,
        })
    }

    fn get_drive(&self, name: &str) -> DirectCsiResult<Drive> {
        let state = self.state.lock().expect(LOCK_EXPECT_MSG);
        state
            .drives
            .get(name)
            .cloned()
            .ok_or_else(|| DirectCsiError::NotFound(format!("drive {name}")))
    }

    fn create_drive(&self, drive: &Drive) -> DirectCsiResult<Drive> {
        let mut state = self.state.lock().expect(LOCK_EXPECT_MSG);
        if state.drives.contains_key(drive.name()) {
            return Err(DirectCsiError::AlreadyExists(format!("drive {}", drive.name())));
        }
        let mut drive = drive.clone();
        drive.metadata.resource_version = state.next_version();
        drive.metadata.deletion_timestamp = None;
        state.drives.insert(drive.name().to_owned(), drive.clone());
        state.notify(&WatchEvent::Added(drive.clone()));
        Ok(drive)
    }

    fn update_drive(&self, drive: &Drive) -> DirectCsiResult<Drive> {
        let mut state = self.state.lock().expect(LOCK_EXPECT_MSG);
        let current = state
            .drives
            .get(drive.name())
            .ok_or_else(|| DirectCsiError::NotFound(format!("drive {}", drive.name())))?;
        if current.metadata.resource_version != drive.metadata.resource_version {
            return Err(DirectCsiError::Conflict(format!(
                "drive {} has been modified; resource version {} is stale",
                drive.name(),
                drive.metadata.resource_version
            )));
        }

        let mut drive = drive.clone();
        // The deletion timestamp can only be set through delete.
        drive.metadata.deletion_timestamp = current.metadata.deletion_timestamp;
        drive.metadata.resource_version = state.next_version();

        if drive.metadata.is_deleting() && drive.metadata.finalizers.is_empty() {
            state.drives.remove(drive.name());
            state.notify(&WatchEvent::Deleted(drive.clone()));
        } else {
            state.drives.insert(drive.name().to_owned(), drive.clone());
            state.notify(&WatchEvent::Modified(drive.clone()));
        }
        Ok(drive)
    }

    fn delete_drive(&self, name: &str) -> DirectCsiResult<()> {
        let mut state = self.state.lock().expect(LOCK_EXPECT_MSG);
        let mut drive = state
            .drives
            .get(name)
            .cloned()
            .ok_or_else(|| DirectCsiError::NotFound(format!("drive {name}")))?;

        if drive.metadata.finalizers.is_empty() {
            state.drives.remove(name);
            state.notify(&WatchEvent::Deleted(drive));
        } else if !drive.metadata.is_deleting() {
            drive.metadata.deletion_timestamp = Some(Utc::now());
            drive.metadata.resource_version = state.next_version();
            state.drives.insert(name.to_owned(), drive.clone());
            state.notify(&WatchEvent::Modified(drive));
        }
        Ok(())
    }

    fn watch_drives(&self) -> DirectCsiResult<Receiver<WatchEvent>> {
        let (sender, receiver) = channel();
        self.state
            .lock()
            .expect(LOCK_EXPECT_MSG)
            .watchers
            .push(sender);
        Ok(receiver)
    }

    fn get_volume(&self, name: &str) -> DirectCsiResult<Volume> {
        let state = self.state.lock().expect(LOCK_EXPECT_MSG);
        state
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| DirectCsiError::NotFound(format!("volume {name}")))
    }

    fn update_volume(&self, volume: &Volume) -> DirectCsiResult<Volume> {
        let mut state = self.state.lock().expect(LOCK_EXPECT_MSG);
        let current = state
            .volumes
            .get(volume.name())
            .ok_or_else(|| DirectCsiError::NotFound(format!("volume {}", volume.name())))?;
        if current.metadata.resource_version != volume.metadata.resource_version {
            return Err(DirectCsiError::Conflict(format!(
                "volume {} has been modified",
                volume.name()
            )));
        }
        let mut volume = volume.clone();
        volume.metadata.resource_version = state.next_version();
        state.volumes.insert(volume.name().to_owned(), volume.clone());
        Ok(volume)
    }

    fn event(
        &self,
        object: &ObjectRef,
        event_type: EventType,
        reason: EventReason,
        message: &str,
    ) -> DirectCsiResult<()> {
        match event_type {
            EventType::Normal => info!("{} {}: {}: {}", object.kind, object.name, reason, message),
            EventType::Warning => warn!("{} {}: {}: {}", object.kind, object.name, reason, message),
        }
        self.state
            .lock()
            .expect(LOCK_EXPECT_MSG)
            .events
            .push(RecordedEvent {
                object: object.clone(),
                event_type,
                reason,
                message: message.to_owned(),
            });
        Ok(())
    }
}
