// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The single consumer of the event queue.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    engine::{
        match_device,
        types::{Action, Device, DeviceEvent, UdevData},
        EventQueue, Handler, Prober,
    },
    node::errors::{DirectCsiError, DirectCsiResult, ErrorKind},
};

/// The kernel name of the device udev describes, such as "sdb" or "dm-0".
pub fn kernel_name(udev: &UdevData) -> String {
    match udev.path.strip_prefix("/dev/") {
        Some(name) if !name.is_empty() => name.to_owned(),
        _ => Path::new(&udev.devpath)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

/// Everything known about the device an event is about. None if the
/// device is one the agent never manages.
fn resolve_device(prober: &Prober, event: &DeviceEvent) -> DirectCsiResult<Option<Device>> {
    let name = kernel_name(&event.udev);
    if name.starts_with("loop") {
        return Ok(None);
    }
    if event.action == Action::Remove {
        return Ok(Some(Device::from_udev(&name, event.udev.clone())));
    }

    let (name, snapshot) = prober.udev_snapshot(event.udev.major, event.udev.minor)?;
    let mut udev = event.udev.clone();
    udev.merge(&snapshot)?;
    let device = prober.probe_full(&name, udev)?;
    Ok((!device.is_loop()).then_some(device))
}

fn process_event(handler: &Handler, prober: &Prober, event: &DeviceEvent) -> DirectCsiResult<()> {
    let Some(device) = resolve_device(prober, event)? else {
        return Ok(());
    };
    let verdict = match_device(&device, &handler.indexer().list_all());
    trace!("{} event for {}: {:?}", event.action, device, verdict);
    handler.handle_device(event.action, &device, verdict)
}

/// Decide what becomes of an event whose handling failed. Returns an
/// error only if the agent must stop.
fn dispose(queue: &EventQueue, event: DeviceEvent, err: DirectCsiError) -> DirectCsiResult<()> {
    match err.kind() {
        ErrorKind::MalformedUdev => {
            warn!("Dropping {} event for {}: {}", event.action, event.devpath, err);
            Ok(())
        }
        ErrorKind::Fatal => Err(err),
        _ => {
            if err.is_retryable() {
                debug!("{} event for {} failed: {}", event.action, event.devpath, err);
            } else {
                warn!("{} event for {} failed: {}", event.action, event.devpath, err);
            }
            queue.push_backoff(event);
            Ok(())
        }
    }
}

/// Pop and handle events until the queue is closed or should_exit is set.
pub fn process_events(
    queue: Arc<EventQueue>,
    handler: Arc<Handler>,
    prober: Prober,
    should_exit: Arc<AtomicBool>,
) -> DirectCsiResult<()> {
    while let Some(event) = queue.pop() {
        if should_exit.load(Ordering::Relaxed) {
            break;
        }
        if let Err(err) = process_event(&handler, &prober, &event) {
            dispose(&queue, event, err)?;
        }
    }
    info!("Event processor stopped");
    Ok(())
}
