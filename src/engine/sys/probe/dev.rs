// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
    time::Duration,
};

use crate::{
    engine::sys::probe::{
        ioctl::{block_sizes, nvme_serial, scsi_serial},
        superblock::{probe_fs, FsInfo},
    },
    node::errors::{DirectCsiError, DirectCsiResult},
};

/// Facts read from the device node itself.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DevInfo {
    pub physical_block_size: u64,
    pub logical_block_size: u64,
    pub serial: String,
    pub fs: Option<FsInfo>,
}

fn hardware_serial(name: &str, file: &File) -> String {
    let serial = if name.starts_with("nvme") {
        nvme_serial(file)
    } else {
        scsi_serial(file)
    };
    serial.unwrap_or_else(|err| {
        trace!("No hardware serial for {name}: {err}");
        String::new()
    })
}

/// Probe the filesystem on the device at path, giving up after timeout.
///
/// The probe runs on its own thread; a device that hangs on read leaves
/// that thread behind rather than the caller.
pub fn probe_fs_timed(path: &Path, timeout: Duration) -> DirectCsiResult<Option<FsInfo>> {
    let (sender, receiver) = mpsc::channel();
    let owned: PathBuf = path.to_owned();
    thread::Builder::new()
        .name("fs-probe".into())
        .spawn(move || {
            let result = File::open(&owned)
                .map_err(DirectCsiError::from)
                .and_then(|mut file| probe_fs(&mut file));
            // The receiver may have timed out and gone away.
            let _ = sender.send(result);
        })?;

    match receiver.recv_timeout(timeout) {
        Ok(Ok(info)) => Ok(Some(info)),
        Ok(Err(DirectCsiError::FsNotFound)) => Ok(None),
        Ok(Err(err)) => Err(err),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(DirectCsiError::Transient(format!(
            "filesystem probe of {} timed out after {:?}",
            path.display(),
            timeout
        ))),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(DirectCsiError::Msg(format!(
            "filesystem probe of {} exited without a result",
            path.display()
        ))),
    }
}

/// Read block sizes, serial number and filesystem of /dev/<name>.
///
/// Filesystem probing is skipped when probe_filesystem is false, e.g. for
/// hidden devices and CD-ROM drives.
pub fn probe_dev(
    dev_root: &Path,
    name: &str,
    probe_filesystem: bool,
    timeout: Duration,
) -> DirectCsiResult<DevInfo> {
    let path = dev_root.join(name);
    let file = File::open(&path)?;

    let (logical_block_size, physical_block_size) = block_sizes(&file)?;
    let serial = hardware_serial(name, &file);
    drop(file);

    let fs = if probe_filesystem {
        probe_fs_timed(&path, timeout)?
    } else {
        None
    };

    Ok(DevInfo {
        physical_block_size,
        logical_block_size,
        serial,
        fs,
    })
}
