// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Assemble a full picture of a block device from sysfs, the mount table,
//! procfs and the device node.

use std::{collections::HashSet, io, time::Duration};

use crate::{
    engine::{
        consts::PROBE_TIMEOUT,
        sys::{mount::MountView, udev::read_udev_map, HostPaths},
        types::{Device, MountPoint, UdevData},
    },
    node::errors::{DirectCsiError, DirectCsiResult},
};

pub mod dev;
pub mod ioctl;
pub mod procfs;
pub mod superblock;
pub mod sysfs;

pub use self::{
    dev::{probe_dev, DevInfo},
    procfs::{cdrom_devices, swap_devices},
    superblock::FsInfo,
    sysfs::{device_name, device_path, probe_sys, SysInfo},
};

/// Mount related facts about one device.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MountFacts {
    pub mount_points: Vec<MountPoint>,
    pub swap_on: bool,
    pub cdrom: bool,
}

/// Look the device up in an already built mount view and proc tables.
pub fn probe_mounts(
    view: &MountView,
    swaps: &HashSet<(u32, u32)>,
    cdroms: &HashSet<String>,
    name: &str,
    major: u32,
    minor: u32,
) -> MountFacts {
    MountFacts {
        mount_points: view
            .by_major_minor(major, minor)
            .into_iter()
            // Bind mounts of subdirectories are volumes, not the drive.
            .filter(|entry| entry.root == "/")
            .map(|entry| MountPoint {
                mount_point: entry.mount_point.clone(),
                mount_options: entry.mount_options.clone(),
            })
            .collect(),
        swap_on: swaps.contains(&(major, minor)),
        cdrom: cdroms.contains(name),
    }
}

/// Knobs for a full probe.
#[derive(Clone, Debug)]
pub struct Prober {
    pub paths: HostPaths,
    pub fs_timeout: Duration,
}

impl Default for Prober {
    fn default() -> Prober {
        Prober {
            paths: HostPaths::default(),
            fs_timeout: PROBE_TIMEOUT,
        }
    }
}

impl Prober {
    pub fn new(paths: HostPaths) -> Prober {
        Prober {
            paths,
            fs_timeout: PROBE_TIMEOUT,
        }
    }

    /// Resolve major:minor to its kernel name and udev database entry.
    pub fn udev_snapshot(&self, major: u32, minor: u32) -> DirectCsiResult<(String, UdevData)> {
        let name = device_name(&self.paths, major, minor)?;
        let map = read_udev_map(&self.paths, major, minor)?;
        let mut udev = UdevData::from_run_map(&map, major, minor)?;
        if udev.devpath.is_empty() {
            udev.devpath = device_path(&self.paths, major, minor)?;
        }
        if udev.path.is_empty() {
            udev.path = format!("/dev/{name}");
        }
        Ok((name, udev))
    }

    /// Build a complete Device for the named kernel device.
    pub fn probe_full(&self, name: &str, udev: UdevData) -> DirectCsiResult<Device> {
        let mut device = Device::from_udev(name, udev);

        let sys = probe_sys(&self.paths, name)?;
        device.size = sys.size;
        device.removable = sys.removable;
        device.read_only = sys.read_only;
        device.hidden = sys.hidden;
        device.holders = sys.holders;
        device.partitions = sys.partitions;
        device.master = sys.master;

        let view = MountView::read(&self.paths.mountinfo())?;
        let swaps = swap_devices(&self.paths.swaps())?;
        let cdroms = cdrom_devices(&self.paths.cdrom_info())?;
        let mounts = probe_mounts(&view, &swaps, &cdroms, name, device.major, device.minor);
        device.mount_points = mounts.mount_points;
        device.swap_on = mounts.swap_on;
        device.cdrom = mounts.cdrom;

        let probe_filesystem = !device.hidden && !device.cdrom;
        let info = probe_dev(&self.paths.dev_root, name, probe_filesystem, self.fs_timeout)
            .map_err(|err| match err {
                DirectCsiError::Io(ref e) if e.kind() == io::ErrorKind::NotFound => {
                    DirectCsiError::DeviceNotFound(device.dev_path())
                }
                err => err,
            })?;
        device.physical_block_size = info.physical_block_size;
        device.logical_block_size = info.logical_block_size;
        device.serial = info.serial;

        match info.fs {
            Some(fs) => {
                if !device.udev.uevent_fsuuid.is_empty() && device.udev.uevent_fsuuid != fs.uuid {
                    debug!(
                        "{}: udev reports filesystem UUID {} but the superblock holds {}",
                        device, device.udev.uevent_fsuuid, fs.uuid
                    );
                }
                device.fs_type = fs.fs_type;
                device.fs_uuid = fs.uuid;
                device.total_capacity = fs.total_capacity;
                device.free_capacity = fs.free_capacity;
            }
            None => {
                device.fs_type.clear();
                device.total_capacity = device.size;
                device.free_capacity = device.size;
            }
        }

        trace!("Probed {device}: {device:?}");
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{create_dir_all, write};

    use super::*;

    const MOUNTINFO: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
30 22 8:16 / /var/lib/direct-csi/mnt/abc rw,relatime shared:9 - xfs /var/lib/direct-csi/devices/abc rw,prjquota
31 22 8:16 /vol-1 /var/lib/kubelet/pods/x/mount rw,relatime shared:9 - xfs /var/lib/direct-csi/devices/abc rw,prjquota
";

    #[test]
    /// Volume bind mounts are not counted as mounts of the drive.
    fn test_probe_mounts() {
        let view = MountView::parse(MOUNTINFO).unwrap();
        let swaps = [(8, 32)].into_iter().collect();
        let cdroms = ["sr0".to_owned()].into_iter().collect();

        let facts = probe_mounts(&view, &swaps, &cdroms, "sdb", 8, 16);
        assert_eq!(facts.mount_points.len(), 1);
        assert_eq!(facts.mount_points[0].mount_point, "/var/lib/direct-csi/mnt/abc");
        assert!(!facts.swap_on);
        assert!(!facts.cdrom);

        let facts = probe_mounts(&view, &swaps, &cdroms, "sdc", 8, 32);
        assert!(facts.mount_points.is_empty());
        assert!(facts.swap_on);

        assert!(probe_mounts(&view, &swaps, &cdroms, "sr0", 11, 0).cdrom);
    }

    #[test]
    fn test_udev_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let prober = Prober::new(HostPaths::under(tmp.path()));
        let paths = &prober.paths;

        create_dir_all(&paths.udev_data_dir).unwrap();
        write(
            paths.udev_data_dir.join("b8:16"),
            "S:disk/by-id/wwn-0x5000\nE:ID_WWN=0x5000c500a0b1c2d3\nE:ID_MODEL=QEMU_HARDDISK\n",
        )
        .unwrap();
        create_dir_all(paths.sys_root.join("dev/block")).unwrap();
        std::os::unix::fs::symlink(
            "../../devices/pci0000:00/0000:00:05.0/block/sdb",
            paths.sys_root.join("dev/block/8:16"),
        )
        .unwrap();

        // The link dangles until the device directory exists.
        assert_matches!(
            prober.udev_snapshot(8, 16),
            Err(DirectCsiError::DeviceNotFound(_))
        );

        let target = paths.sys_root.join("devices/pci0000:00/0000:00:05.0/block/sdb");
        create_dir_all(&target).unwrap();
        write(target.join("uevent"), "MAJOR=8\nMINOR=16\nDEVNAME=sdb\n").unwrap();

        let (name, udev) = prober.udev_snapshot(8, 16).unwrap();
        assert_eq!(name, "sdb");
        assert_eq!(udev.devpath, "/devices/pci0000:00/0000:00:05.0/block/sdb");
        assert_eq!(udev.path, "/dev/sdb");
        assert_eq!(udev.wwid, "0x5000c500a0b1c2d3");
        assert_eq!((udev.major, udev.minor), (8, 16));
    }
}
