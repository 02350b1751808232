// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reconciling drive records whose intent changed.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::RecvTimeoutError,
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    engine::{store::WatchEvent, types::Drive, Handler},
    node::errors::{DirectCsiError, DirectCsiResult},
};

const WATCH_POLL: Duration = Duration::from_secs(1);

fn reconcile(handler: &Handler, drive: &Drive) {
    if let Err(err) = handler.reconcile_drive(drive) {
        warn!("Failed to reconcile drive {}: {}", drive.name(), err);
    }
}

/// Watch drive records and act on them until should_exit is set. Every
/// resync_period all of this node's drives are reconciled again so a
/// failed attempt is retried.
pub fn drive_controller(
    handler: Arc<Handler>,
    should_exit: Arc<AtomicBool>,
    resync_period: Duration,
) -> DirectCsiResult<()> {
    let watch = handler.indexer().store().watch_drives()?;
    let mut last_resync = Instant::now();

    for drive in handler.indexer().list_all() {
        reconcile(&handler, &drive);
    }

    while !should_exit.load(Ordering::Relaxed) {
        match watch.recv_timeout(WATCH_POLL) {
            Ok(WatchEvent::Added(drive) | WatchEvent::Modified(drive)) => {
                reconcile(&handler, &drive)
            }
            Ok(WatchEvent::Deleted(drive)) => {
                trace!("Drive {} was deleted", drive.name());
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(DirectCsiError::Fatal("drive watch closed".into()));
            }
        }
        if last_resync.elapsed() >= resync_period {
            for drive in handler.indexer().list_all() {
                reconcile(&handler, &drive);
            }
            last_resync = Instant::now();
        }
    }
    Ok(())
}
