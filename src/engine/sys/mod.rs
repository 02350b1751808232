// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Host facing primitives: external binaries, mounts, device nodes, udev
//! state, device probing and the kernel uevent socket.

use std::path::{Path, PathBuf};

use crate::engine::consts::{HOST_DEV_ROOT, PROC_ROOT, SYS_ROOT, UDEV_DATA_DIR};

pub mod blockfile;
pub mod cmd;
pub mod mount;
pub mod netlink;
pub mod probe;
pub mod udev;

/// The roots of the host pseudo filesystems the agent reads.
///
/// Every reader takes one of these so tests can point it at a scratch
/// directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostPaths {
    pub sys_root: PathBuf,
    pub proc_root: PathBuf,
    pub dev_root: PathBuf,
    pub udev_data_dir: PathBuf,
}

impl Default for HostPaths {
    fn default() -> HostPaths {
        HostPaths {
            sys_root: PathBuf::from(SYS_ROOT),
            proc_root: PathBuf::from(PROC_ROOT),
            dev_root: PathBuf::from(HOST_DEV_ROOT),
            udev_data_dir: PathBuf::from(UDEV_DATA_DIR),
        }
    }
}

impl HostPaths {
    /// All roots placed under a single directory, laid out like a host.
    pub fn under(root: &Path) -> HostPaths {
        HostPaths {
            sys_root: root.join("sys"),
            proc_root: root.join("proc"),
            dev_root: root.join("dev"),
            udev_data_dir: root.join("run/udev/data"),
        }
    }

    pub fn mountinfo(&self) -> PathBuf {
        self.proc_root.join("1/mountinfo")
    }

    pub fn swaps(&self) -> PathBuf {
        self.proc_root.join("swaps")
    }

    pub fn cdrom_info(&self) -> PathBuf {
        self.proc_root.join("sys/dev/cdrom/info")
    }

    pub fn by_uuid(&self, fsuuid: &str) -> PathBuf {
        self.dev_root.join("disk/by-uuid").join(fsuuid)
    }
}
