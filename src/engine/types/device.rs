// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt;

use crate::engine::consts::MIN_SUPPORTED_DEVICE_SIZE;

/// The filesystem type reported for LVM physical volumes.
pub const LVM2_MEMBER: &str = "LVM2_member";

/// Normalized udev properties of one block device.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UdevData {
    /// Kernel device path, e.g. "/devices/pci0000:00/.../block/sdb".
    pub devpath: String,
    /// Device node, e.g. "/dev/sdb". May be empty if udev did not report it.
    pub path: String,
    pub major: u32,
    pub minor: u32,
    pub partition: u32,
    pub wwid: String,
    pub wwid_with_extension: String,
    pub model: String,
    pub uevent_serial: String,
    pub serial_long: String,
    pub vendor: String,
    pub dm_name: String,
    pub dm_uuid: String,
    pub md_uuid: String,
    pub part_table_uuid: String,
    pub part_table_type: String,
    pub part_uuid: String,
    pub uevent_fsuuid: String,
    pub fs_type: String,
    pub pci_path: String,
}

/// One mount of a device, as seen in the mount view.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MountPoint {
    pub mount_point: String,
    pub mount_options: Vec<String>,
}

/// A block device as observed on the host. Built fresh for every event
/// or sync pass and never persisted.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Device {
    pub name: String,
    pub major: u32,
    pub minor: u32,
    pub is_virtual: bool,

    pub udev: UdevData,

    // sysfs
    pub size: u64,
    pub removable: bool,
    pub read_only: bool,
    pub hidden: bool,
    pub holders: Vec<String>,
    pub partitions: Vec<String>,
    pub master: String,

    // /dev
    pub physical_block_size: u64,
    pub logical_block_size: u64,
    pub serial: String,
    pub fs_type: String,
    pub fs_uuid: String,
    pub total_capacity: u64,
    pub free_capacity: u64,

    // mounts
    pub mount_points: Vec<MountPoint>,
    pub swap_on: bool,
    pub cdrom: bool,
}

impl Device {
    /// A skeleton device carrying only the udev facts, used when the
    /// device itself can no longer be probed.
    pub fn from_udev(name: &str, udev: UdevData) -> Device {
        Device {
            name: name.to_owned(),
            major: udev.major,
            minor: udev.minor,
            is_virtual: udev.devpath.contains("/virtual/"),
            fs_type: udev.fs_type.clone(),
            udev,
            ..Default::default()
        }
    }

    pub fn dev_path(&self) -> String {
        format!("/dev/{}", self.name)
    }

    pub fn partitioned(&self) -> bool {
        !self.partitions.is_empty()
    }

    pub fn first_mount_point(&self) -> &str {
        self.mount_points
            .first()
            .map(|m| m.mount_point.as_str())
            .unwrap_or("")
    }

    pub fn first_mount_options(&self) -> &[String] {
        self.mount_points
            .first()
            .map(|m| m.mount_options.as_slice())
            .unwrap_or(&[])
    }

    /// The filesystem type, preferring the probed value over the one
    /// udev reported.
    pub fn effective_fs_type(&self) -> &str {
        if self.fs_type.is_empty() {
            &self.udev.fs_type
        } else {
            &self.fs_type
        }
    }

    /// A device that can never be offered for adoption.
    pub fn is_unavailable(&self) -> bool {
        self.size < MIN_SUPPORTED_DEVICE_SIZE
            || self.swap_on
            || self.hidden
            || self.read_only
            || self.partitioned()
            || !self.master.is_empty()
            || !self.holders.is_empty()
            || !self.first_mount_point().is_empty()
            || self.effective_fs_type() == LVM2_MEMBER
            || self.cdrom
    }

    pub fn is_loop(&self) -> bool {
        self.name.starts_with("loop")
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy() -> Device {
        Device {
            name: "sdb".into(),
            major: 8,
            minor: 16,
            size: 5_368_709_120,
            ..Default::default()
        }
    }

    #[test]
    fn test_unavailable_predicate() {
        assert!(!healthy().is_unavailable());

        let mut small = healthy();
        small.size = MIN_SUPPORTED_DEVICE_SIZE - 1;
        assert!(small.is_unavailable());

        let mut lvm = healthy();
        lvm.udev.fs_type = LVM2_MEMBER.into();
        assert!(lvm.is_unavailable());

        let mut swap = healthy();
        swap.swap_on = true;
        assert!(swap.is_unavailable());

        let mut mounted = healthy();
        mounted.mount_points.push(MountPoint {
            mount_point: "/mnt".into(),
            mount_options: vec!["rw".into()],
        });
        assert!(mounted.is_unavailable());

        let mut held = healthy();
        held.holders.push("dm-0".into());
        assert!(held.is_unavailable());
    }
}
