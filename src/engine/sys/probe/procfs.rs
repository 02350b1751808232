// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::HashSet,
    fs::read_to_string,
    io,
    path::{Path, PathBuf},
};

use crate::{engine::sys::blockfile::major_minor, node::errors::DirectCsiResult};

fn read_optional(path: &Path) -> DirectCsiResult<String> {
    match read_to_string(path) {
        Ok(content) => Ok(content),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err.into()),
    }
}

/// The file names listed in a /proc/swaps table, header skipped.
pub fn parse_swaps(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(PathBuf::from)
        .collect()
}

/// Device numbers of every block device with active swap.
pub fn swap_devices(swaps: &Path) -> DirectCsiResult<HashSet<(u32, u32)>> {
    let mut devices = HashSet::new();
    for filename in parse_swaps(&read_optional(swaps)?) {
        // Swap files and vanished devices are not block devices.
        if let Ok(devno) = major_minor(&filename) {
            devices.insert(devno);
        }
    }
    Ok(devices)
}

/// Kernel names of CD-ROM drives from the "drive name:" line.
pub fn parse_cdroms(content: &str) -> HashSet<String> {
    content
        .lines()
        .find_map(|line| line.split_once("drive name:").map(|(_, names)| names))
        .map(|names| names.split_whitespace().map(|s| s.to_owned()).collect())
        .unwrap_or_default()
}

pub fn cdrom_devices(info: &Path) -> DirectCsiResult<HashSet<String>> {
    Ok(parse_cdroms(&read_optional(info)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_swaps() {
        let content = "\
Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority
/dev/dm-1                               partition\t8388604\t\t0\t\t-2
/swapfile                               file\t\t1048572\t\t0\t\t-3
";
        assert_eq!(
            parse_swaps(content),
            vec![PathBuf::from("/dev/dm-1"), PathBuf::from("/swapfile")]
        );
        assert!(parse_swaps("Filename Type Size Used Priority\n").is_empty());
    }

    #[test]
    fn test_parse_cdroms() {
        let content = "\
CD-ROM information, Id: cdrom.c 3.20 2003/12/17

drive name:\t\tsr1\tsr0
drive speed:\t\t1\t1
";
        let names = parse_cdroms(content);
        assert_eq!(names.len(), 2);
        assert!(names.contains("sr0"));
        assert!(parse_cdroms("").is_empty());
    }

    #[test]
    fn test_missing_files() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(swap_devices(&tmp.path().join("swaps")).unwrap().is_empty());
        assert!(cdrom_devices(&tmp.path().join("info")).unwrap().is_empty());
    }
}
