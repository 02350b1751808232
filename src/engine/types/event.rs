// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::time::{Duration, Instant};

use crate::engine::types::device::UdevData;

/// What happened to a device.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
    strum_macros::AsRefStr,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum Action {
    Add,
    Change,
    Remove,
    /// Synthesized by the periodic walker, never received from the kernel.
    Sync,
}

/// A device state transition waiting to be reconciled.
#[derive(Clone, Debug)]
pub struct DeviceEvent {
    pub action: Action,
    pub devpath: String,
    pub udev: UdevData,
    pub created: Instant,
    /// The delay applied the last time this event was re-queued after a
    /// failure. Zero for an event that has never failed.
    pub backoff: Duration,
}

impl DeviceEvent {
    pub fn new(action: Action, udev: UdevData) -> DeviceEvent {
        DeviceEvent {
            action,
            devpath: udev.devpath.clone(),
            udev,
            created: Instant::now(),
            backoff: Duration::ZERO,
        }
    }
}

/// Severity of an event object recorded against a cluster record.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, strum_macros::Display,
)]
pub enum EventType {
    Normal,
    Warning,
}

/// Reasons attached to event objects.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, strum_macros::Display,
)]
pub enum EventReason {
    DriveAdded,
    DriveLost,
    DriveMounted,
    DriveMountError,
    DriveFormatted,
    DriveReleased,
    DriveRepair,
    DriveHasMultipleMatches,
    DeviceNotFound,
}

/// The kind and name of the record an event object refers to.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ObjectRef {
    pub kind: String,
    pub name: String,
}

impl ObjectRef {
    pub fn drive(name: &str) -> ObjectRef {
        ObjectRef {
            kind: "Drive".to_owned(),
            name: name.to_owned(),
        }
    }

    pub fn volume(name: &str) -> ObjectRef {
        ObjectRef {
            kind: "Volume".to_owned(),
            name: name.to_owned(),
        }
    }
}

/// An event object, as recorded by the store.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RecordedEvent {
    pub object: ObjectRef,
    pub event_type: EventType,
    pub reason: EventReason,
    pub message: String,
}
