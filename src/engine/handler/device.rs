// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::Path;

use itertools::Itertools;
use uuid::Uuid;

use crate::{
    engine::{
        consts::{DRIVE_PATH_LABEL, MIN_SUPPORTED_DEVICE_SIZE, PROJECT_QUOTA_OPTION, XFS},
        handler::{Handler, NodeConfig},
        store::{update_drive_with, update_volume_with},
        types::{
            sanitize_drive_path, Action, ConditionKind, Device, Drive, DriveState, EventReason,
            EventType, Finalizers, MountPoint, ObjectMeta, ObjectRef, Verdict, MESSAGE_FORMATTED,
            MESSAGE_MOUNTED, MESSAGE_NOT_FORMATTED, MESSAGE_NOT_MOUNTED, REASON_ADDED,
            REASON_DRIVE_LOST, REASON_NOT_READY, REASON_READY,
        },
    },
    node::errors::{DirectCsiError, DirectCsiResult, ErrorKind},
};

/// Overwrite target with source unless the drive is managed and already
/// holds a value; a managed drive keeps identities it was adopted with.
fn protect<T>(target: &mut T, source: &T, managed: bool)
where
    T: Clone + Default + PartialEq,
{
    if !managed || *target == T::default() {
        *target = source.clone();
    }
}

/// Write everything the host reports about device into drive.
///
/// Applying the same device twice leaves the record as after the first
/// application.
pub fn apply_device(drive: &mut Drive, device: &Device, config: &NodeConfig) {
    let managed = drive.is_managed();
    let udev = &device.udev;
    let status = &mut drive.status;

    status.node_name.clone_from(&config.node_id);
    status.topology.clone_from(&config.topology);
    status.path = device.dev_path();
    status.major = device.major;
    status.minor = device.minor;
    status.root_partition.clone_from(&device.name);
    status.uevent_fsuuid.clone_from(&udev.uevent_fsuuid);
    status.logical_block_size = device.logical_block_size;
    status.dm_name.clone_from(&udev.dm_name);
    status.read_only = device.read_only;
    status.is_virtual = device.is_virtual;
    status.swap_on = device.swap_on;
    status.master.clone_from(&device.master);
    status.part_table_uuid.clone_from(&udev.part_table_uuid);
    status.part_table_type.clone_from(&udev.part_table_type);
    status.partitioned = device.partitioned();
    status.pci_path.clone_from(&udev.pci_path);
    status.wwid_with_extension.clone_from(&udev.wwid_with_extension);

    protect(
        &mut status.filesystem,
        &device.effective_fs_type().to_owned(),
        managed,
    );
    protect(&mut status.filesystem_uuid, &device.fs_uuid, managed);

    if !managed
        || status.partition_uuid.is_empty()
        || udev.partition == 0
        || status.partition_uuid.eq_ignore_ascii_case(&udev.part_uuid)
    {
        status.partition_uuid.clone_from(&udev.part_uuid);
    }
    protect(&mut status.dm_uuid, &udev.dm_uuid, managed);
    protect(&mut status.md_uuid, &udev.md_uuid, managed);
    protect(&mut status.partition_num, &udev.partition, managed);
    protect(
        &mut status.physical_block_size,
        &device.physical_block_size,
        managed,
    );
    protect(&mut status.model, &udev.model, managed);
    protect(&mut status.serial, &device.serial, managed);
    protect(&mut status.serial_long, &udev.serial_long, managed);
    protect(&mut status.uevent_serial, &udev.uevent_serial, managed);
    protect(&mut status.wwid, &udev.wwid, managed);
    protect(&mut status.vendor, &udev.vendor, managed);

    status.mountpoint = device.first_mount_point().to_owned();
    status.mount_options = device.first_mount_options().to_vec();

    status.total_capacity = device.size;
    if status.drive_status != DriveState::InUse {
        status.allocated_capacity = device.size.saturating_sub(device.free_capacity);
    }
    status.free_capacity = status
        .total_capacity
        .saturating_sub(status.allocated_capacity);

    match status.drive_status {
        DriveState::Available if device.is_unavailable() => {
            status.drive_status = DriveState::Unavailable;
        }
        DriveState::Unavailable if !device.is_unavailable() => {
            status.drive_status = DriveState::Available;
        }
        _ => {}
    }

    let mounted = !status.mountpoint.is_empty();
    if !status.conditions.is(ConditionKind::Mounted, mounted) {
        status.conditions.set(
            ConditionKind::Mounted,
            mounted,
            REASON_ADDED,
            if mounted {
                MESSAGE_MOUNTED
            } else {
                MESSAGE_NOT_MOUNTED
            },
        );
    }
    let formatted = !status.filesystem.is_empty();
    if !status.conditions.is(ConditionKind::Formatted, formatted) {
        status.conditions.set(
            ConditionKind::Formatted,
            formatted,
            REASON_ADDED,
            if formatted {
                MESSAGE_FORMATTED
            } else {
                MESSAGE_NOT_FORMATTED
            },
        );
    }

    drive.set_standard_labels();
}

/// Problems that stop a managed drive from serving volumes. Empty for a
/// healthy drive and for drives that are not managed.
pub fn validate_drive(drive: &Drive, device: &Device) -> Vec<String> {
    let mut problems = Vec::new();
    if !drive.is_managed() {
        return problems;
    }

    let canonical = drive.mount_target();
    let legacy = drive.legacy_mount_target();
    let ours = device.mount_points.iter().find(|m| {
        Path::new(&m.mount_point) == canonical || Path::new(&m.mount_point) == legacy
    });
    match ours {
        None if device.first_mount_point().is_empty() => {
            problems.push("the drive is not mounted".to_owned());
        }
        None => problems.push(format!(
            "Mountpoint mismatch - Expected {} found {}",
            canonical.display(),
            device.first_mount_point()
        )),
        Some(mount) if !mount.mount_options.iter().any(|o| o == "rw") => {
            problems.push(format!(
                "MountpointOptions mismatch - Expected rw found {:?}",
                mount.mount_options
            ));
        }
        Some(_) => {}
    }

    if device.size < MIN_SUPPORTED_DEVICE_SIZE {
        problems.push(format!(
            "the size of the drive is less than {MIN_SUPPORTED_DEVICE_SIZE}"
        ));
    }
    if device.read_only {
        problems.push("ReadOnly mismatch - Expected false found true".to_owned());
    }
    if device.hidden {
        problems.push("Hidden mismatch - Expected false found true".to_owned());
    }
    if device.swap_on {
        problems.push("SwapOn mismatch - Expected false found true".to_owned());
    }
    if !device.master.is_empty() {
        problems.push(format!(
            "Master mismatch - Expected \"\" found {}",
            device.master
        ));
    }
    if !device.holders.is_empty() {
        problems.push(format!("the device has holders: {:?}", device.holders));
    }
    problems
}

fn set_ready_condition(drive: &mut Drive, problems: &[String]) {
    if problems.is_empty() {
        drive
            .status
            .conditions
            .set(ConditionKind::Ready, true, REASON_READY, "");
    } else {
        drive.status.conditions.set(
            ConditionKind::Ready,
            false,
            REASON_NOT_READY,
            &problems.join("; "),
        );
    }
}

/// A fresh record describing device, named with a random UUID.
pub fn new_drive_record(device: &Device, config: &NodeConfig) -> Drive {
    let mut drive = Drive {
        metadata: ObjectMeta::new(&Uuid::new_v4().to_string()),
        ..Default::default()
    };
    drive.metadata.finalizers = Finalizers::data_protection();
    drive.status.access_tier = config.access_tier;
    drive.status.drive_status = if device.is_unavailable() {
        DriveState::Unavailable
    } else {
        DriveState::Available
    };
    apply_device(&mut drive, device, config);
    drive
}

impl Handler {
    /// Act on one device event according to the matcher's verdict.
    pub fn handle_device(
        &self,
        action: Action,
        device: &Device,
        verdict: Verdict,
    ) -> DirectCsiResult<()> {
        match (action, verdict) {
            (Action::Remove, Verdict::NoMatch) => {
                debug!("{device}: removed device has no drive record");
                Ok(())
            }
            (Action::Remove, Verdict::NoChange(drive) | Verdict::Changed(drive)) => {
                self.lost(&drive)
            }
            (_, Verdict::NoMatch) => self.create(device).map(|_| ()),
            (Action::Add, Verdict::TooManyMatches(drives)) => {
                warn!(
                    "{device}: ignoring add event matching {} drives",
                    drives.len()
                );
                Ok(())
            }
            (_, Verdict::TooManyMatches(drives)) => {
                let names = drives.iter().map(|d| d.name()).join(", ");
                for drive in &drives {
                    self.record_event(
                        ObjectRef::drive(drive.name()),
                        EventType::Warning,
                        EventReason::DriveHasMultipleMatches,
                        &format!("device {} matches drives {}", device.name, names),
                    );
                }
                Err(DirectCsiError::Msg(format!(
                    "{device} matches {} drives: {names}",
                    drives.len()
                )))
            }
            (Action::Add, _) | (_, Verdict::NoChange(_)) => Ok(()),
            (Action::Change | Action::Sync, Verdict::Changed(drive)) => {
                self.update(device, &drive).map(|_| ())
            }
        }
    }

    /// Create a record for a device nothing describes yet.
    pub fn create(&self, device: &Device) -> DirectCsiResult<Option<Drive>> {
        let drive = new_drive_record(device, &self.config);
        match self.store().create_drive(&drive) {
            Ok(created) => {
                info!(
                    "Created drive {} for {} in state {}",
                    created.name(),
                    device,
                    created.state()
                );
                self.indexer.observe(&created);
                self.record_event(
                    ObjectRef::drive(created.name()),
                    EventType::Normal,
                    EventReason::DriveAdded,
                    &format!("drive added for {}", device.dev_path()),
                );
                Ok(Some(created))
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                debug!("Drive {} already exists: {err}", drive.name());
                Ok(None)
            }
            Err(err) => Err(err.chain(format!("creating drive for {device}"))),
        }
    }

    /// Remount a managed drive that lost its mount while its filesystem
    /// stayed the same. Returns the device with its refreshed mounts.
    fn ensure_mounted(&self, device: &Device, drive: &Drive) -> Device {
        let mut device = device.clone();
        if !drive.is_managed()
            || drive.status.filesystem_uuid.is_empty()
            || (!device.fs_uuid.is_empty() && device.fs_uuid != drive.status.filesystem_uuid)
        {
            return device;
        }
        let canonical = drive.mount_target();
        let legacy = drive.legacy_mount_target();
        if device.mount_points.iter().any(|m| {
            Path::new(&m.mount_point) == canonical || Path::new(&m.mount_point) == legacy
        }) {
            return device;
        }

        info!("Remounting drive {} at {}", drive.name(), canonical.display());
        if let Err(err) = (self.ops.mount)(
            Path::new(&device.dev_path()),
            &canonical,
            XFS,
            &[],
            &[PROJECT_QUOTA_OPTION.to_owned()],
        ) {
            warn!("Failed to remount drive {}: {}", drive.name(), err);
            self.record_event(
                ObjectRef::drive(drive.name()),
                EventType::Warning,
                EventReason::DriveMountError,
                &err.to_string(),
            );
            return device;
        }

        match (self.ops.mounts)() {
            Ok(view) => {
                device.mount_points = view
                    .by_major_minor(device.major, device.minor)
                    .into_iter()
                    .filter(|e| e.root == "/")
                    .map(|e| MountPoint {
                        mount_point: e.mount_point.clone(),
                        mount_options: e.mount_options.clone(),
                    })
                    .collect();
            }
            Err(err) => warn!("Failed to re-read mounts: {err}"),
        }
        device
    }

    /// Bring the record up to date with the device.
    pub fn update(&self, device: &Device, drive: &Drive) -> DirectCsiResult<Drive> {
        let device = self.ensure_mounted(device, drive);
        let old_path = drive.status.path.clone();

        let updated = update_drive_with(self.store(), drive.name(), |current| {
            let before = current.clone();
            apply_device(current, &device, &self.config);
            let problems = validate_drive(current, &device);
            set_ready_condition(current, &problems);
            Ok(*current != before)
        })?;
        self.indexer.observe(&updated);
        debug!("Updated drive {} from {}", updated.name(), device);

        if updated.status.path != old_path {
            self.sync_volume_labels(&updated);
        }
        Ok(updated)
    }

    /// Point the drive path label of every volume on drive at its
    /// current path.
    fn sync_volume_labels(&self, drive: &Drive) {
        let label = sanitize_drive_path(&drive.status.path);
        for volume in drive.finalizers().volumes() {
            let result = update_volume_with(self.store(), volume, |v| {
                if v.metadata.label(DRIVE_PATH_LABEL) == Some(label.as_str()) {
                    false
                } else {
                    v.metadata.set_label(DRIVE_PATH_LABEL, &label);
                    true
                }
            });
            if let Err(err) = result {
                warn!("Failed to update drive path label of volume {volume}: {err}");
            }
        }
    }

    /// The device behind drive went away.
    pub fn lost(&self, drive: &Drive) -> DirectCsiResult<()> {
        let message = format!("device {} was removed", drive.status.path);
        match drive.state() {
            DriveState::Available | DriveState::Unavailable | DriveState::Error => {
                info!("Deleting drive {}: {}", drive.name(), message);
                match self.store().delete_drive(drive.name()) {
                    Err(err) if err.kind() != ErrorKind::NotFound => return Err(err),
                    _ => {}
                }
            }
            _ => {
                let updated = update_drive_with(self.store(), drive.name(), |current| {
                    let before = current.clone();
                    match current.state() {
                        DriveState::Ready => current.status.drive_status = DriveState::Released,
                        DriveState::InUse if !current.finalizers().has_volumes() => {
                            current.status.drive_status = DriveState::Released
                        }
                        _ => {}
                    }
                    current.status.conditions.set(
                        ConditionKind::Ready,
                        false,
                        REASON_DRIVE_LOST,
                        &message,
                    );
                    Ok(*current != before)
                })?;
                self.indexer.observe(&updated);
            }
        }
        self.record_event(
            ObjectRef::drive(drive.name()),
            EventType::Warning,
            EventReason::DriveLost,
            &message,
        );
        Ok(())
    }
}
