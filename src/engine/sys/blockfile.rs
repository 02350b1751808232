// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    fs::{canonicalize, create_dir_all, remove_file},
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    sys::stat::{major, makedev, minor, mknod, stat, Mode, SFlag},
};

use crate::{
    engine::sys::HostPaths,
    node::errors::{DirectCsiError, DirectCsiResult},
};

/// The device number of the block or character device at path.
pub fn major_minor(path: &Path) -> DirectCsiResult<(u32, u32)> {
    let st = stat(path)?;
    let kind = SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT;
    if kind != SFlag::S_IFBLK && kind != SFlag::S_IFCHR {
        return Err(DirectCsiError::Msg(format!(
            "{} is not a device node",
            path.display()
        )));
    }
    Ok((
        u32::try_from(major(st.st_rdev))
            .map_err(|_| DirectCsiError::Msg("major number out of range".into()))?,
        u32::try_from(minor(st.st_rdev))
            .map_err(|_| DirectCsiError::Msg("minor number out of range".into()))?,
    ))
}

/// Make path a block special file for major:minor with mode 0666.
///
/// An existing node with the right device number is left in place; one
/// pointing elsewhere is replaced.
pub fn make_block_file(path: &Path, major_num: u32, minor_num: u32) -> DirectCsiResult<()> {
    match major_minor(path) {
        Ok(devno) if devno == (major_num, minor_num) => {
            trace!("{} already exists", path.display());
            return Ok(());
        }
        Ok(_) => {
            debug!(
                "Replacing {} with a node for {}:{}",
                path.display(),
                major_num,
                minor_num
            );
            remove_file(path)?;
        }
        Err(DirectCsiError::Nix(Errno::ENOENT)) => {}
        Err(DirectCsiError::Msg(_)) => remove_file(path)?,
        Err(err) => return Err(err),
    }

    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }

    match mknod(
        path,
        SFlag::S_IFBLK,
        Mode::from_bits_truncate(0o666),
        makedev(u64::from(major_num), u64::from(minor_num)),
    ) {
        Ok(()) => Ok(()),
        // Lost a race with another creator; accept it if it agrees.
        Err(Errno::EEXIST) if major_minor(path)? == (major_num, minor_num) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Resolve a filesystem UUID to the device node udev linked it to.
pub fn resolve_by_uuid(paths: &HostPaths, fsuuid: &str) -> DirectCsiResult<PathBuf> {
    let link = paths.by_uuid(fsuuid);
    canonicalize(&link).map_err(|err| {
        DirectCsiError::DeviceNotFound(format!("{}: {}", link.display(), err))
    })
}

#[cfg(test)]
mod tests {
    use std::{fs::File, os::unix::fs::symlink};

    use super::*;

    #[test]
    fn test_resolve_by_uuid() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = HostPaths::under(tmp.path());
        create_dir_all(paths.dev_root.join("disk/by-uuid")).unwrap();
        File::create(paths.dev_root.join("sdb")).unwrap();
        symlink("../../sdb", paths.by_uuid("abc")).unwrap();

        assert_eq!(
            resolve_by_uuid(&paths, "abc").unwrap(),
            canonicalize(paths.dev_root.join("sdb")).unwrap()
        );
        assert_matches!(
            resolve_by_uuid(&paths, "missing"),
            Err(DirectCsiError::DeviceNotFound(_))
        );
    }

    #[test]
    fn test_regular_file_is_not_a_device() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("file");
        File::create(&path).unwrap();
        assert_matches!(major_minor(&path), Err(DirectCsiError::Msg(_)));
        assert_matches!(
            major_minor(&tmp.path().join("nope")),
            Err(DirectCsiError::Nix(Errno::ENOENT))
        );
    }
}
