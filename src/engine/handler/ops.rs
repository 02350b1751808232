// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The host operations the handler and the repair coordinator perform,
//! gathered into one value so they can be replaced wholesale.

use std::{
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Arc},
};

use crate::{
    engine::sys::{
        blockfile, cmd,
        cmd::RepairOptions,
        mount::{self, MountView, UnmountFlags},
        HostPaths,
    },
    node::errors::DirectCsiResult,
};

pub type MountFn =
    dyn Fn(&Path, &Path, &str, &[String], &[String]) -> DirectCsiResult<()> + Send + Sync;
pub type UnmountFn = dyn Fn(&Path, UnmountFlags) -> DirectCsiResult<()> + Send + Sync;
pub type FormatFn = dyn Fn(&Path, bool) -> DirectCsiResult<String> + Send + Sync;
pub type SetUuidFn = dyn Fn(&Path, &str) -> DirectCsiResult<()> + Send + Sync;
pub type RepairFn = dyn Fn(&Path, RepairOptions, &mut dyn FnMut(&str), &AtomicBool) -> DirectCsiResult<()>
    + Send
    + Sync;
pub type MakeBlockFileFn = dyn Fn(&Path, u32, u32) -> DirectCsiResult<()> + Send + Sync;
pub type DeviceNumberFn = dyn Fn(&Path) -> DirectCsiResult<(u32, u32)> + Send + Sync;
pub type StatfsFn = dyn Fn(&Path) -> DirectCsiResult<(u64, u64)> + Send + Sync;
pub type MountViewFn = dyn Fn() -> DirectCsiResult<MountView> + Send + Sync;
pub type ResolveFn = dyn Fn(&str) -> DirectCsiResult<PathBuf> + Send + Sync;

/// Every side effect on the host filesystem goes through one of these.
#[derive(Clone)]
pub struct FsOps {
    /// source, target, fstype, flags, super flags
    pub mount: Arc<MountFn>,
    pub unmount: Arc<UnmountFn>,
    /// device, force; returns the mkfs output
    pub format: Arc<FormatFn>,
    /// device, uuid
    pub set_uuid: Arc<SetUuidFn>,
    pub repair: Arc<RepairFn>,
    /// path, major, minor
    pub make_block_file: Arc<MakeBlockFileFn>,
    /// device node to major, minor
    pub device_number: Arc<DeviceNumberFn>,
    /// path; returns total and free bytes
    pub statfs: Arc<StatfsFn>,
    pub mounts: Arc<MountViewFn>,
    /// filesystem UUID to device node
    pub resolve_by_uuid: Arc<ResolveFn>,
}

impl FsOps {
    /// The real operations, reading host state below paths.
    pub fn host(paths: HostPaths) -> FsOps {
        let paths = Arc::new(paths);
        let mountinfo = paths.mountinfo();
        FsOps {
            mount: {
                let mountinfo = mountinfo.clone();
                Arc::new(
                    move |source: &Path,
                          target: &Path,
                          fstype: &str,
                          flags: &[String],
                          super_flags: &[String]| {
                        mount::mount(&mountinfo, source, target, fstype, flags, super_flags)
                    },
                )
            },
            unmount: {
                let mountinfo = mountinfo.clone();
                Arc::new(move |target: &Path, flags: UnmountFlags| {
                    mount::unmount(&mountinfo, target, flags)
                })
            },
            format: Arc::new(cmd::format_xfs),
            set_uuid: Arc::new(cmd::set_xfs_uuid),
            repair: Arc::new(cmd::xfs_repair),
            make_block_file: Arc::new(blockfile::make_block_file),
            device_number: Arc::new(blockfile::major_minor),
            statfs: Arc::new(mount::statfs),
            mounts: Arc::new(move || MountView::read(&mountinfo)),
            resolve_by_uuid: Arc::new(move |fsuuid: &str| blockfile::resolve_by_uuid(&paths, fsuuid)),
        }
    }
}
