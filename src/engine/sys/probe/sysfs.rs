// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    fs::{read_dir, read_link, read_to_string},
    io,
    path::Path,
};

use crate::{
    engine::{consts::SECTOR_SIZE, sys::HostPaths},
    node::errors::{DirectCsiError, DirectCsiResult},
};

/// Facts about a block device read from sysfs.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SysInfo {
    pub size: u64,
    pub removable: bool,
    pub read_only: bool,
    pub hidden: bool,
    pub holders: Vec<String>,
    pub partitions: Vec<String>,
    pub master: String,
}

// A device that vanished or a attribute the kernel refuses to report reads
// as empty.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::InvalidInput
    ) || matches!(err.raw_os_error(), Some(libc::ENODEV) | Some(libc::ENXIO))
}

fn read_first_line(path: &Path, required: bool) -> DirectCsiResult<String> {
    match read_to_string(path) {
        Ok(content) => Ok(content.lines().next().unwrap_or("").trim().to_owned()),
        Err(err) if !required && is_transient(&err) => Ok(String::new()),
        Err(err) => Err(err.into()),
    }
}

fn read_dir_names(path: &Path) -> DirectCsiResult<Vec<String>> {
    match read_dir(path) {
        Ok(entries) => {
            let mut names = entries
                .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
                .collect::<Result<Vec<_>, _>>()?;
            names.sort();
            Ok(names)
        }
        Err(err) if is_transient(&err) => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

fn flag(value: &str) -> bool {
    !value.is_empty() && value != "0"
}

/// Look up the kernel name of block device major:minor.
pub fn device_name(paths: &HostPaths, major: u32, minor: u32) -> DirectCsiResult<String> {
    let uevent = paths
        .sys_root
        .join(format!("dev/block/{major}:{minor}/uevent"));
    let content = read_to_string(&uevent).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            DirectCsiError::DeviceNotFound(format!("{major}:{minor}"))
        } else {
            err.into()
        }
    })?;
    content
        .lines()
        .find_map(|line| line.strip_prefix("DEVNAME="))
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            DirectCsiError::MalformedUdev(format!("{} has no DEVNAME", uevent.display()))
        })
}

/// The kernel device path of major:minor, as reported in uevents.
pub fn device_path(paths: &HostPaths, major: u32, minor: u32) -> DirectCsiResult<String> {
    let link = read_link(paths.sys_root.join(format!("dev/block/{major}:{minor}")))?;
    let link = link.to_string_lossy();
    let trimmed = link.trim_start_matches("../");
    Ok(format!("/{trimmed}"))
}

fn probe_master(paths: &HostPaths, holders: &[String]) -> DirectCsiResult<String> {
    for holder in holders {
        let uuid = read_first_line(
            &paths.sys_root.join(format!("class/block/{holder}/dm/uuid")),
            false,
        )?;
        if uuid.starts_with("mpath-") {
            return Ok(holder.clone());
        }
    }
    Ok(String::new())
}

/// Read size, flags, holders and partitions of the named device.
pub fn probe_sys(paths: &HostPaths, name: &str) -> DirectCsiResult<SysInfo> {
    let class = paths.sys_root.join("class/block").join(name);

    let size = match read_first_line(&class.join("size"), false)?.as_str() {
        "" => 0,
        sectors => sectors.parse::<u64>()? * SECTOR_SIZE,
    };
    let holders = read_dir_names(&class.join("holders"))?;
    let partitions = read_dir_names(&paths.sys_root.join("block").join(name))?
        .into_iter()
        .filter(|n| n.starts_with(name) && n != name)
        .collect();
    let master = probe_master(paths, &holders)?;

    Ok(SysInfo {
        size,
        removable: flag(&read_first_line(&class.join("removable"), false)?),
        read_only: flag(&read_first_line(&class.join("ro"), false)?),
        // Only some devices have this attribute.
        hidden: read_first_line(&class.join("hidden"), false).unwrap_or_default() == "1",
        holders,
        partitions,
        master,
    })
}
