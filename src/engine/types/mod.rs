// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub use crate::engine::types::{
    device::{Device, MountPoint, UdevData, LVM2_MEMBER},
    drive::{
        drive_mount_target, legacy_mount_target, sanitize_drive_path, AccessTier, Condition,
        ConditionKind, Conditions, Drive, DriveSpec, DriveState, DriveStatus, RequestedFormat,
        MESSAGE_FORMATTED, MESSAGE_MOUNTED, MESSAGE_NOT_FORMATTED, MESSAGE_NOT_MOUNTED,
        REASON_ADDED, REASON_DRIVE_LOST, REASON_INITIALIZED, REASON_MOUNT_ERROR,
        REASON_NOT_ADDED, REASON_NOT_READY, REASON_READY,
    },
    event::{Action, DeviceEvent, EventReason, EventType, ObjectRef, RecordedEvent},
    meta::{Finalizers, ObjectMeta},
    volume::{Volume, VolumeCondition, VolumeConditionKind, VolumeConditions, VolumeStatus},
};

mod device;
mod drive;
mod event;
mod meta;
mod volume;

/// The outcome of comparing one observed device against the catalogue.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// No record describes this device.
    NoMatch,
    /// Exactly one record describes the device and it is up to date.
    NoChange(Drive),
    /// Exactly one record describes the device but some of its fields
    /// have drifted.
    Changed(Drive),
    /// Several records remain indistinguishable.
    TooManyMatches(Vec<Drive>),
}

impl Verdict {
    pub fn drive(&self) -> Option<&Drive> {
        match self {
            Verdict::NoChange(drive) | Verdict::Changed(drive) => Some(drive),
            _ => None,
        }
    }
}
