// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Feeding kernel uevents into the event queue.

use std::sync::{atomic::AtomicBool, Arc};

use crate::{
    engine::{sys::netlink::UeventListener, EventQueue},
    node::{errors::DirectCsiResult, processor::kernel_name},
};

/// Listen for block device uevents until should_exit is set, queueing
/// every one that does not concern a loop device.
pub fn uevent_thread(queue: Arc<EventQueue>, should_exit: Arc<AtomicBool>) -> DirectCsiResult<()> {
    let listener = UeventListener::bind()?;
    info!("Listening for block device uevents");
    while let Some(event) = listener.next_event(&should_exit)? {
        if kernel_name(&event.udev).starts_with("loop") {
            trace!("Ignoring {} event for loop device {}", event.action, event.devpath);
            continue;
        }
        debug!("Received {} event for {}", event.action, event.devpath);
        queue.push(event);
    }
    Ok(())
}
