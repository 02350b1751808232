// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A local cache of this node's drive records, kept fresh by a
//! list/watch reflector.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::RecvTimeoutError,
        Arc, RwLock,
    },
    time::{Duration, Instant},
};

use crate::{
    engine::{
        consts::{MAX_LIST_OBJECTS, NODE_LABEL},
        store::{LabelSelector, ListOptions, Store, WatchEvent},
        types::{Drive, DriveState},
    },
    node::errors::{DirectCsiError, DirectCsiResult},
};

const LOCK_EXPECT_MSG: &str =
    "No code holding the cache lock can panic; therefore the lock can not be poisoned.";

const WATCH_POLL: Duration = Duration::from_secs(1);

pub struct DriveIndexer {
    store: Arc<dyn Store>,
    node: String,
    cache: RwLock<HashMap<String, Drive>>,
}

impl DriveIndexer {
    pub fn new(store: Arc<dyn Store>, node: &str) -> DriveIndexer {
        DriveIndexer {
            store,
            node: node.to_owned(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn is_ours(&self, drive: &Drive) -> bool {
        drive.metadata.label(NODE_LABEL) == Some(self.node.as_str())
    }

    /// Replace the cache with a fresh listing of this node's drives.
    pub fn resync(&self) -> DirectCsiResult<()> {
        let mut options = ListOptions {
            selector: LabelSelector::new().with(NODE_LABEL, [self.node.as_str()]),
            limit: MAX_LIST_OBJECTS,
            continue_token: String::new(),
        };
        let mut fresh = HashMap::new();
        loop {
            let page = self.store.list_drives(&options)?;
            fresh.extend(
                page.items
                    .into_iter()
                    .map(|drive| (drive.name().to_owned(), drive)),
            );
            if page.continue_token.is_empty() {
                break;
            }
            options.continue_token = page.continue_token;
        }
        trace!("Resynced {} drives for node {}", fresh.len(), self.node);
        *self.cache.write().expect(LOCK_EXPECT_MSG) = fresh;
        Ok(())
    }

    /// Apply one watch event to the cache.
    pub fn apply(&self, event: &WatchEvent) {
        let drive = event.drive();
        let mut cache = self.cache.write().expect(LOCK_EXPECT_MSG);
        match event {
            WatchEvent::Deleted(_) => {
                cache.remove(drive.name());
            }
            // A relabelled drive that moved away from this node leaves.
            _ if !self.is_ours(drive) => {
                cache.remove(drive.name());
            }
            WatchEvent::Added(_) | WatchEvent::Modified(_) => {
                // A late watch event must not roll back a newer write.
                let stale = cache.get(drive.name()).is_some_and(|cached| {
                    cached.metadata.resource_version > drive.metadata.resource_version
                });
                if stale {
                    trace!(
                        "Ignoring stale version {} of drive {}",
                        drive.metadata.resource_version,
                        drive.name()
                    );
                } else {
                    cache.insert(drive.name().to_owned(), drive.clone());
                }
            }
        }
    }

    /// Record the result of a write made by this process without waiting
    /// for the watch to deliver it.
    pub fn observe(&self, drive: &Drive) {
        self.apply(&WatchEvent::Modified(drive.clone()));
    }

    pub fn forget(&self, name: &str) {
        self.cache.write().expect(LOCK_EXPECT_MSG).remove(name);
    }

    /// Watch the store and keep the cache current until should_exit is set,
    /// relisting every resync_period.
    pub fn run_reflector(
        &self,
        should_exit: &AtomicBool,
        resync_period: Duration,
    ) -> DirectCsiResult<()> {
        // Start watching before listing so nothing falls in between.
        let watch = self.store.watch_drives()?;
        self.resync()?;
        let mut last_resync = Instant::now();

        while !should_exit.load(Ordering::Relaxed) {
            match watch.recv_timeout(WATCH_POLL) {
                Ok(event) => self.apply(&event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DirectCsiError::Fatal("drive watch closed".into()));
                }
            }
            if last_resync.elapsed() >= resync_period {
                if let Err(err) = self.resync() {
                    warn!("Drive cache resync failed: {err}");
                }
                last_resync = Instant::now();
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Drive> {
        self.cache.read().expect(LOCK_EXPECT_MSG).get(name).cloned()
    }

    fn filter<P>(&self, predicate: P) -> Vec<Drive>
    where
        P: Fn(&Drive) -> bool,
    {
        let cache = self.cache.read().expect(LOCK_EXPECT_MSG);
        let mut drives = cache
            .values()
            .filter(|d| predicate(d))
            .cloned()
            .collect::<Vec<_>>();
        drives.sort_by(|a, b| a.name().cmp(b.name()));
        drives
    }

    pub fn list_all(&self) -> Vec<Drive> {
        self.filter(|_| true)
    }

    /// Drives in Ready or InUse.
    pub fn list_managed(&self) -> Vec<Drive> {
        self.filter(|d| d.is_managed())
    }

    /// Drives in Available, Unavailable, Released or Error.
    pub fn list_unmanaged(&self) -> Vec<Drive> {
        self.filter(|d| {
            matches!(
                d.state(),
                DriveState::Available
                    | DriveState::Unavailable
                    | DriveState::Released
                    | DriveState::Error
            )
        })
    }

    pub fn filter_by_fsuuid(&self, fsuuid: &str) -> Vec<Drive> {
        self.filter(|d| d.status.filesystem_uuid == fsuuid)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::engine::{store::MemoryStore, types::ObjectMeta};

    fn drive(name: &str, node: &str, state: DriveState, fsuuid: &str) -> Drive {
        let mut drive = Drive {
            metadata: ObjectMeta::new(name),
            ..Default::default()
        };
        drive.status.node_name = node.to_owned();
        drive.status.drive_status = state;
        drive.status.filesystem_uuid = fsuuid.to_owned();
        drive.set_standard_labels();
        drive
    }

    #[test]
    /// Only this node's drives are cached, across several list pages.
    fn test_resync_and_filters() {
        let mut drives = (0..45)
            .map(|i| drive(&format!("d{i:02}"), "n1", DriveState::Available, ""))
            .collect::<Vec<_>>();
        drives.push(drive("r1", "n1", DriveState::Ready, "u1"));
        drives.push(drive("r2", "n1", DriveState::InUse, "u2"));
        drives.push(drive("t1", "n1", DriveState::Terminating, "u3"));
        drives.push(drive("x1", "n2", DriveState::Ready, "u1"));
        let store = Arc::new(MemoryStore::with_objects(drives, Vec::new()));

        let indexer = DriveIndexer::new(store, "n1");
        indexer.resync().unwrap();
        assert_eq!(indexer.list_all().len(), 48);
        assert_eq!(
            indexer.list_managed().iter().map(|d| d.name()).collect::<Vec<_>>(),
            vec!["r1", "r2"]
        );
        assert_eq!(indexer.list_unmanaged().len(), 45);
        assert_eq!(indexer.filter_by_fsuuid("u1").len(), 1);
    }

    #[test]
    /// An older version arriving after a newer one leaves the cache alone.
    fn test_stale_versions_ignored() {
        let indexer = DriveIndexer::new(Arc::new(MemoryStore::new()), "n1");

        let mut newer = drive("a", "n1", DriveState::Ready, "u1");
        newer.metadata.resource_version = 7;
        indexer.observe(&newer);

        let mut older = drive("a", "n1", DriveState::Available, "");
        older.metadata.resource_version = 5;
        indexer.apply(&WatchEvent::Modified(older.clone()));
        assert_eq!(indexer.get("a").unwrap().state(), DriveState::Ready);

        indexer.observe(&older);
        assert_eq!(indexer.get("a").unwrap().metadata.resource_version, 7);

        let mut newest = drive("a", "n1", DriveState::InUse, "u1");
        newest.metadata.resource_version = 8;
        indexer.apply(&WatchEvent::Modified(newest));
        assert_eq!(indexer.get("a").unwrap().state(), DriveState::InUse);

        indexer.apply(&WatchEvent::Deleted(older));
        assert!(indexer.get("a").is_none());
    }

    #[test]
    /// The reflector picks up creations and deletions made in the store.
    fn test_reflector() {
        let store = Arc::new(MemoryStore::new());
        let indexer = Arc::new(DriveIndexer::new(store.clone(), "n1"));
        let should_exit = Arc::new(AtomicBool::new(false));

        let handle = {
            let indexer = Arc::clone(&indexer);
            let should_exit = Arc::clone(&should_exit);
            thread::spawn(move || {
                indexer.run_reflector(&should_exit, Duration::from_secs(60))
            })
        };

        // Give the reflector time to open its watch.
        thread::sleep(Duration::from_millis(100));
        store
            .create_drive(&drive("a", "n1", DriveState::Available, ""))
            .unwrap();
        store
            .create_drive(&drive("b", "n2", DriveState::Available, ""))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while indexer.get("a").is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(indexer.get("a").is_some());
        assert!(indexer.get("b").is_none());

        store.delete_drive("a").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while indexer.get("a").is_some() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(indexer.get("a").is_none());

        should_exit.store(true, Ordering::Relaxed);
        handle.join().unwrap().unwrap();
    }
}
