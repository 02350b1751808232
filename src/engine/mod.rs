// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub use self::{
    handler::{FsOps, Handler, NodeConfig},
    indexer::DriveIndexer,
    lister::DriveLister,
    matcher::match_device,
    queue::EventQueue,
    repair::RepairCoordinator,
    store::{FileStore, MemoryStore, Store},
    sys::{probe::Prober, HostPaths},
};

pub mod consts;
pub mod handler;
pub mod indexer;
pub mod lister;
pub mod matcher;
pub mod queue;
pub mod repair;
pub mod store;
pub mod sys;
#[cfg(test)]
pub mod tests;
pub mod types;
