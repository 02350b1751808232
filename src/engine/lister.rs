// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Label-filtered, paginated listing of drive records delivered through a
//! channel.

use std::{
    sync::{
        mpsc::{sync_channel, Receiver, SyncSender},
        Arc,
    },
    thread,
};

use crate::{
    engine::{
        consts::{ACCESS_TIER_LABEL, MAX_LIST_OBJECTS, NODE_LABEL, PATH_LABEL},
        store::{LabelSelector, ListOptions, Store},
        types::{AccessTier, Drive, DriveState},
    },
    node::errors::{DirectCsiError, DirectCsiResult, ErrorKind},
};

#[derive(Clone)]
pub struct DriveLister {
    store: Arc<dyn Store>,
    nodes: Vec<String>,
    drive_names: Vec<String>,
    access_tiers: Vec<AccessTier>,
    statuses: Vec<DriveState>,
    drive_ids: Vec<String>,
    max_objects: usize,
    ignore_not_found: bool,
}

impl DriveLister {
    pub fn new(store: Arc<dyn Store>) -> DriveLister {
        DriveLister {
            store,
            nodes: Vec::new(),
            drive_names: Vec::new(),
            access_tiers: Vec::new(),
            statuses: Vec::new(),
            drive_ids: Vec::new(),
            max_objects: MAX_LIST_OBJECTS,
            ignore_not_found: false,
        }
    }

    pub fn nodes<I, S>(mut self, nodes: I) -> DriveLister
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Kernel names, matched against the path label.
    pub fn drive_names<I, S>(mut self, names: I) -> DriveLister
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.drive_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn access_tiers(mut self, tiers: Vec<AccessTier>) -> DriveLister {
        self.access_tiers = tiers;
        self
    }

    pub fn statuses(mut self, statuses: Vec<DriveState>) -> DriveLister {
        self.statuses = statuses;
        self
    }

    /// Record names. Those not seen while listing are fetched one by one.
    pub fn drive_ids<I, S>(mut self, ids: I) -> DriveLister
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.drive_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_objects(mut self, max_objects: usize) -> DriveLister {
        self.max_objects = max_objects;
        self
    }

    pub fn ignore_not_found(mut self, ignore: bool) -> DriveLister {
        self.ignore_not_found = ignore;
        self
    }

    fn selector(&self) -> LabelSelector {
        LabelSelector::new()
            .with(NODE_LABEL, self.nodes.iter().map(String::as_str))
            .with(PATH_LABEL, self.drive_names.iter().map(String::as_str))
            .with(
                ACCESS_TIER_LABEL,
                self.access_tiers.iter().map(|t| t.to_string()),
            )
    }

    fn get_only(&self) -> bool {
        self.nodes.is_empty()
            && self.drive_names.is_empty()
            && self.access_tiers.is_empty()
            && self.statuses.is_empty()
            && !self.drive_ids.is_empty()
    }

    /// Produce results on sender until the listing is exhausted, an error
    /// is sent, or the receiving end goes away.
    fn produce(mut self, sender: &SyncSender<DirectCsiResult<Drive>>) {
        if !self.get_only() {
            let mut options = ListOptions {
                selector: self.selector(),
                limit: self.max_objects,
                continue_token: String::new(),
            };
            loop {
                let page = match self.store.list_drives(&options) {
                    Ok(page) => page,
                    Err(err) if err.kind() == ErrorKind::NotFound && self.ignore_not_found => {
                        break;
                    }
                    Err(err) => {
                        let _ = sender.send(Err(err));
                        return;
                    }
                };

                for drive in page.items {
                    let len = self.drive_ids.len();
                    self.drive_ids.retain(|id| id != drive.name());
                    let requested = self.drive_ids.len() != len;
                    if (requested
                        || self.statuses.is_empty()
                        || self.statuses.contains(&drive.state()))
                        && sender.send(Ok(drive)).is_err()
                    {
                        return;
                    }
                }

                if page.continue_token.is_empty() {
                    break;
                }
                options.continue_token = page.continue_token;
            }
        }

        for id in std::mem::take(&mut self.drive_ids) {
            let result = match self.store.get_drive(&id) {
                Err(err) if err.kind() == ErrorKind::NotFound && self.ignore_not_found => {
                    continue;
                }
                Err(err) => {
                    let _ = sender.send(Err(err));
                    return;
                }
                Ok(drive) => Ok(drive),
            };
            if sender.send(result).is_err() {
                return;
            }
        }
    }

    /// Start listing in the background. Dropping the receiver stops any
    /// further fetches.
    pub fn list(self) -> DirectCsiResult<Receiver<DirectCsiResult<Drive>>> {
        let (sender, receiver) = sync_channel(0);
        thread::Builder::new()
            .name("drive-lister".into())
            .spawn(move || self.produce(&sender))
            .map_err(|e| DirectCsiError::from(e).chain("failed to start drive lister"))?;
        Ok(receiver)
    }

    /// Collect the whole listing, stopping at the first error.
    pub fn get(self) -> DirectCsiResult<Vec<Drive>> {
        self.list()?.into_iter().collect()
    }
}
