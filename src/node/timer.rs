// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{task::spawn_blocking, time::interval};

use crate::{
    engine::{
        match_device,
        sys::udev::list_udev_devices,
        types::{Action, Device, DeviceEvent, DriveState, Verdict},
        EventQueue, Handler, Prober,
    },
    node::{errors::DirectCsiResult, processor::kernel_name},
};

/// The outcome of one walk over udev's block devices.
struct Walk {
    /// Devices a Sync event was queued for, as udev describes them.
    devices: Vec<Device>,
    /// False if some device could not be read.
    complete: bool,
}

/// Queue a Sync event for every block device udev knows about.
fn queue_sync_events(queue: &EventQueue, prober: &Prober) -> DirectCsiResult<Walk> {
    let mut walk = Walk {
        devices: Vec::new(),
        complete: true,
    };
    for (major, minor) in list_udev_devices(&prober.paths)? {
        let (name, udev) = match prober.udev_snapshot(major, minor) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                debug!("Skipping {major}:{minor} during sync: {err}");
                walk.complete = false;
                continue;
            }
        };
        if kernel_name(&udev).starts_with("loop") {
            continue;
        }
        walk.devices.push(Device::from_udev(&name, udev.clone()));
        queue.push(DeviceEvent::new(Action::Sync, udev));
    }
    Ok(walk)
}

/// Hand every cached drive that none of the present devices accounts
/// for to the lost path. Released and terminating drives are left alone.
/// Returns the number of drives handed over.
fn release_lost_drives(handler: &Handler, present: &[Device]) -> usize {
    let drives = handler.indexer().list_all();
    let mut seen = HashSet::new();
    for device in present {
        match match_device(device, &drives) {
            Verdict::NoMatch => {}
            Verdict::NoChange(drive) | Verdict::Changed(drive) => {
                seen.insert(drive.name().to_owned());
            }
            Verdict::TooManyMatches(matched) => {
                seen.extend(matched.iter().map(|d| d.name().to_owned()));
            }
        }
    }

    let mut lost = 0;
    for drive in drives.iter().filter(|d| {
        !seen.contains(d.name()) && !d.is_terminating() && d.state() != DriveState::Released
    }) {
        info!(
            "No device matches drive {} (last seen at {})",
            drive.name(),
            drive.status.path
        );
        if let Err(err) = handler.lost(drive) {
            warn!("Failed to mark drive {} lost: {err}", drive.name());
        }
        lost += 1;
    }
    lost
}

/// One sync pass. Lost drives are only looked for after a complete walk.
fn sync_pass(queue: &EventQueue, handler: &Handler, prober: &Prober) -> DirectCsiResult<()> {
    let walk = queue_sync_events(queue, prober)?;
    debug!("Queued {} sync events", walk.devices.len());
    if walk.complete {
        let lost = release_lost_drives(handler, &walk.devices);
        if lost > 0 {
            info!("{lost} drives have no device");
        }
    }
    Ok(())
}

/// Walk all devices every period until should_exit is set. The first
/// walk happens at once.
pub async fn sync_timer(
    queue: Arc<EventQueue>,
    handler: Arc<Handler>,
    prober: Prober,
    period: Duration,
    should_exit: Arc<AtomicBool>,
) -> DirectCsiResult<()> {
    let mut ticks = interval(period);
    loop {
        ticks.tick().await;
        if should_exit.load(Ordering::Relaxed) {
            return Ok(());
        }
        let queue = Arc::clone(&queue);
        let handler = Arc::clone(&handler);
        let prober = prober.clone();
        if let Err(err) = spawn_blocking(move || sync_pass(&queue, &handler, &prober)).await? {
            warn!("Failed to walk udev devices: {err}");
        }
    }
}
