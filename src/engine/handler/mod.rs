// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reconciliation of device events and drive intent against the store.

use std::{collections::BTreeMap, sync::Arc};

use crate::engine::{
    indexer::DriveIndexer,
    store::Store,
    types::{AccessTier, EventReason, EventType, ObjectRef},
};

mod device;
mod drive;
pub mod ops;

pub use self::{
    device::{apply_device, new_drive_record, validate_drive},
    drive::device_pin_path,
    ops::FsOps,
};

/// Facts about this node stamped on every record it creates.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NodeConfig {
    pub node_id: String,
    pub access_tier: AccessTier,
    pub topology: BTreeMap<String, String>,
}

impl NodeConfig {
    pub fn new(node_id: &str) -> NodeConfig {
        NodeConfig {
            node_id: node_id.to_owned(),
            ..Default::default()
        }
    }
}

pub struct Handler {
    config: NodeConfig,
    indexer: Arc<DriveIndexer>,
    ops: FsOps,
}

impl Handler {
    pub fn new(config: NodeConfig, indexer: Arc<DriveIndexer>, ops: FsOps) -> Handler {
        Handler {
            config,
            indexer,
            ops,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn indexer(&self) -> &Arc<DriveIndexer> {
        &self.indexer
    }

    pub fn ops(&self) -> &FsOps {
        &self.ops
    }

    fn store(&self) -> &dyn Store {
        self.indexer.store().as_ref()
    }

    /// Record an event object. Failing to do so is logged and otherwise
    /// ignored.
    fn record_event(
        &self,
        object: ObjectRef,
        event_type: EventType,
        reason: EventReason,
        message: &str,
    ) {
        if let Err(err) = self.store().event(&object, event_type, reason, message) {
            warn!(
                "Failed to record {} event for {} {}: {}",
                reason, object.kind, object.name, err
            );
        }
    }
}
