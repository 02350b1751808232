// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reading udev's view of a block device, either from a uevent's
//! properties or from the snapshot udev keeps under /run/udev/data.

use std::{
    collections::HashMap,
    fs::{read_dir, read_to_string},
    io,
    sync::LazyLock,
};

use regex::Regex;

use crate::{
    engine::{sys::HostPaths, types::UdevData},
    node::errors::{DirectCsiError, DirectCsiResult},
};

static UDEV_DATA_FILE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^b(\d+):(\d+)$").ok());

/// Collect the "E:KEY=VALUE" properties of a udev database file.
pub fn parse_udev_data_file(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter_map(|line| line.strip_prefix("E:"))
        .map(|property| match property.split_once('=') {
            Some((key, value)) => (key.to_owned(), value.trim().to_owned()),
            None => (property.to_owned(), String::new()),
        })
        .collect()
}

/// Read the udev database entry of block device major:minor.
///
/// A missing entry is reported as DeviceNotFound.
pub fn read_udev_map(
    paths: &HostPaths,
    major: u32,
    minor: u32,
) -> DirectCsiResult<HashMap<String, String>> {
    let path = paths.udev_data_dir.join(format!("b{major}:{minor}"));
    match read_to_string(&path) {
        Ok(content) => Ok(parse_udev_data_file(&content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(DirectCsiError::DeviceNotFound(path.display().to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

/// The device numbers of every block device udev has a database entry for.
pub fn list_udev_devices(paths: &HostPaths) -> DirectCsiResult<Vec<(u32, u32)>> {
    let pattern = UDEV_DATA_FILE
        .as_ref()
        .ok_or_else(|| DirectCsiError::Msg("invalid udev data file pattern".into()))?;
    let mut devices = Vec::new();
    for entry in read_dir(&paths.udev_data_dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(captures) = pattern.captures(&name) {
            match (captures[1].parse(), captures[2].parse()) {
                (Ok(major), Ok(minor)) => devices.push((major, minor)),
                _ => trace!("Skipping udev data file {name}"),
            }
        }
    }
    devices.sort_unstable();
    Ok(devices)
}

/// Canonical form of an md UUID such as "8f3fcd1e:3e4d39fb:..." .
pub fn normalize_uuid(uuid: &str) -> String {
    let compact = uuid.replace([':', '-'], "");
    if compact.len() > 20 && compact.is_ascii() {
        format!(
            "{}-{}-{}-{}-{}",
            &compact[0..8],
            &compact[8..12],
            &compact[12..16],
            &compact[16..20],
            &compact[20..]
        )
    } else {
        uuid.to_owned()
    }
}

fn get(map: &HashMap<String, String>, key: &str) -> String {
    map.get(key).cloned().unwrap_or_default()
}

fn parse_number(map: &HashMap<String, String>, key: &str) -> DirectCsiResult<Option<u32>> {
    map.get(key)
        .map(|value| {
            value.parse::<u32>().map_err(|_| {
                DirectCsiError::MalformedUdev(format!("invalid {key} value \"{value}\""))
            })
        })
        .transpose()
}

fn device_node(devname: &str) -> String {
    if devname.is_empty() || devname.starts_with('/') {
        devname.to_owned()
    } else {
        format!("/dev/{devname}")
    }
}

impl UdevData {
    fn from_properties(map: &HashMap<String, String>) -> DirectCsiResult<UdevData> {
        Ok(UdevData {
            devpath: get(map, "DEVPATH"),
            path: device_node(&get(map, "DEVNAME")),
            major: 0,
            minor: 0,
            partition: parse_number(map, "ID_PART_ENTRY_NUMBER")?.unwrap_or(0),
            wwid: get(map, "ID_WWN"),
            wwid_with_extension: get(map, "ID_WWN_WITH_EXTENSION"),
            model: get(map, "ID_MODEL"),
            uevent_serial: get(map, "ID_SERIAL_SHORT"),
            serial_long: get(map, "ID_SERIAL"),
            vendor: get(map, "ID_VENDOR"),
            dm_name: get(map, "DM_NAME"),
            dm_uuid: get(map, "DM_UUID"),
            md_uuid: normalize_uuid(&get(map, "MD_UUID")),
            part_table_uuid: get(map, "ID_PART_TABLE_UUID"),
            part_table_type: get(map, "ID_PART_TABLE_TYPE"),
            part_uuid: get(map, "ID_PART_ENTRY_UUID"),
            uevent_fsuuid: get(map, "ID_FS_UUID"),
            fs_type: get(map, "ID_FS_TYPE"),
            pci_path: get(map, "ID_PATH"),
        })
    }

    /// Build from the properties of a uevent, which must name the device
    /// path and number.
    pub fn from_event_map(map: &HashMap<String, String>) -> DirectCsiResult<UdevData> {
        let mut data = UdevData::from_properties(map)?;
        if data.devpath.is_empty() {
            return Err(DirectCsiError::MalformedUdev("DEVPATH not found".into()));
        }
        data.major = parse_number(map, "MAJOR")?
            .ok_or_else(|| DirectCsiError::MalformedUdev("MAJOR not found".into()))?;
        data.minor = parse_number(map, "MINOR")?
            .ok_or_else(|| DirectCsiError::MalformedUdev("MINOR not found".into()))?;
        Ok(data)
    }

    /// Build from a /run/udev/data entry, whose device number comes from
    /// the file name.
    pub fn from_run_map(
        map: &HashMap<String, String>,
        major: u32,
        minor: u32,
    ) -> DirectCsiResult<UdevData> {
        let mut data = UdevData::from_properties(map)?;
        data.major = major;
        data.minor = minor;
        Ok(data)
    }

    /// Fill fields the event left empty from the database snapshot.
    ///
    /// Identity fields must agree; any other non-empty disagreement means
    /// the two describe different devices.
    pub fn merge(&mut self, snapshot: &UdevData) -> DirectCsiResult<()> {
        let mismatch = |key: &str, ours: &dyn std::fmt::Display, theirs: &dyn std::fmt::Display| {
            DirectCsiError::MalformedUdev(format!(
                "value mismatch for {}: {key} is {ours} in the event but {theirs} in udev data",
                self.devpath
            ))
        };

        if self.major != snapshot.major {
            return Err(mismatch("major", &self.major, &snapshot.major));
        }
        if self.minor != snapshot.minor {
            return Err(mismatch("minor", &self.minor, &snapshot.minor));
        }
        if self.partition != snapshot.partition {
            return Err(mismatch("partition", &self.partition, &snapshot.partition));
        }
        if !self.path.is_empty() && !snapshot.path.is_empty() && self.path != snapshot.path {
            return Err(mismatch("path", &self.path, &snapshot.path));
        }

        let fill = |key: &str, ours: &mut String, theirs: &str| -> DirectCsiResult<()> {
            if theirs.is_empty() {
                return Ok(());
            }
            if ours.is_empty() {
                theirs.clone_into(ours);
                Ok(())
            } else if ours != theirs {
                Err(DirectCsiError::MalformedUdev(format!(
                    "value mismatch: {key} is {ours} in the event but {theirs} in udev data"
                )))
            } else {
                Ok(())
            }
        };

        fill("path", &mut self.path, &snapshot.path)?;
        fill("WWID", &mut self.wwid, &snapshot.wwid)?;
        fill(
            "WWID with extension",
            &mut self.wwid_with_extension,
            &snapshot.wwid_with_extension,
        )?;
        fill("model", &mut self.model, &snapshot.model)?;
        fill("uevent serial", &mut self.uevent_serial, &snapshot.uevent_serial)?;
        fill("serial", &mut self.serial_long, &snapshot.serial_long)?;
        fill("vendor", &mut self.vendor, &snapshot.vendor)?;
        fill("DM name", &mut self.dm_name, &snapshot.dm_name)?;
        fill("DM UUID", &mut self.dm_uuid, &snapshot.dm_uuid)?;
        fill("MD UUID", &mut self.md_uuid, &snapshot.md_uuid)?;
        fill(
            "partition table UUID",
            &mut self.part_table_uuid,
            &snapshot.part_table_uuid,
        )?;
        fill(
            "partition table type",
            &mut self.part_table_type,
            &snapshot.part_table_type,
        )?;
        fill("partition UUID", &mut self.part_uuid, &snapshot.part_uuid)?;
        fill("FS UUID", &mut self.uevent_fsuuid, &snapshot.uevent_fsuuid)?;
        fill("FS type", &mut self.fs_type, &snapshot.fs_type)?;
        fill("PCI path", &mut self.pci_path, &snapshot.pci_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{create_dir_all, write};

    use super::*;

    const SDB: &str = "\
S:disk/by-id/wwn-0x5000c500a0b1c2d3
I:1647437042
E:ID_FS_UUID=d9877501-e1b5-4bac-b73f-178b29974ed5
E:ID_FS_TYPE=xfs
E:ID_MODEL=QEMU_HARDDISK
E:ID_SERIAL=QEMU_HARDDISK_QM00002
E:ID_SERIAL_SHORT=QM00002
E:ID_WWN=0x5000c500a0b1c2d3
E:ID_PATH=pci-0000:00:01.1-ata-1
E:MD_UUID=8f3fcd1e:3e4d39fb:4b1ab8c4:2a2c1f9a
E:ID_VENDOR=ATA
E:EMPTY
G:systemd
";

    #[test]
    fn test_parse_udev_data_file() {
        let map = parse_udev_data_file(SDB);
        assert_eq!(map.len(), 10);
        assert_eq!(map["ID_SERIAL_SHORT"], "QM00002");
        assert_eq!(map["EMPTY"], "");
        assert!(!map.contains_key("S:disk/by-id/wwn-0x5000c500a0b1c2d3"));
    }

    #[test]
    /// A snapshot maps onto the normalized record.
    fn test_from_run_map() {
        let data = UdevData::from_run_map(&parse_udev_data_file(SDB), 8, 16).unwrap();
        assert_eq!(data.major, 8);
        assert_eq!(data.uevent_fsuuid, "d9877501-e1b5-4bac-b73f-178b29974ed5");
        assert_eq!(data.uevent_serial, "QM00002");
        assert_eq!(data.serial_long, "QEMU_HARDDISK_QM00002");
        assert_eq!(data.pci_path, "pci-0000:00:01.1-ata-1");
        assert_eq!(data.md_uuid, "8f3fcd1e-3e4d-39fb-4b1a-b8c42a2c1f9a");
    }

    #[test]
    fn test_malformed_partition() {
        let mut map = parse_udev_data_file(SDB);
        map.insert("ID_PART_ENTRY_NUMBER".into(), "one".into());
        assert_matches!(
            UdevData::from_run_map(&map, 8, 16),
            Err(DirectCsiError::MalformedUdev(_))
        );
    }

    #[test]
    fn test_from_event_map_requires_identity() {
        let mut map = HashMap::new();
        map.insert("DEVPATH".to_owned(), "/devices/virtual/block/sdb".to_owned());
        map.insert("MAJOR".to_owned(), "8".to_owned());
        assert_matches!(
            UdevData::from_event_map(&map),
            Err(DirectCsiError::MalformedUdev(_))
        );
        map.insert("MINOR".to_owned(), "16".to_owned());
        map.insert("DEVNAME".to_owned(), "sdb".to_owned());
        let data = UdevData::from_event_map(&map).unwrap();
        assert_eq!(data.path, "/dev/sdb");
        assert_eq!((data.major, data.minor), (8, 16));
    }

    #[test]
    fn test_merge() {
        let snapshot = UdevData::from_run_map(&parse_udev_data_file(SDB), 8, 16).unwrap();
        let mut event = UdevData {
            devpath: "/devices/block/sdb".into(),
            path: "/dev/sdb".into(),
            major: 8,
            minor: 16,
            model: "QEMU_HARDDISK".into(),
            ..Default::default()
        };
        event.merge(&snapshot).unwrap();
        assert_eq!(event.wwid, "0x5000c500a0b1c2d3");
        assert_eq!(event.path, "/dev/sdb");

        let mut other = event.clone();
        other.vendor = "NVME".into();
        assert_matches!(other.merge(&snapshot), Err(DirectCsiError::MalformedUdev(_)));

        let mut wrong_minor = event.clone();
        wrong_minor.minor = 17;
        assert_matches!(
            wrong_minor.merge(&snapshot),
            Err(DirectCsiError::MalformedUdev(_))
        );
    }

    #[test]
    fn test_read_and_list() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = HostPaths::under(tmp.path());
        create_dir_all(&paths.udev_data_dir).unwrap();
        write(paths.udev_data_dir.join("b8:16"), SDB).unwrap();
        write(paths.udev_data_dir.join("b7:0"), "E:ID_FS_TYPE=squashfs\n").unwrap();
        write(paths.udev_data_dir.join("c4:1"), "").unwrap();
        write(paths.udev_data_dir.join("n3"), "").unwrap();

        assert_eq!(list_udev_devices(&paths).unwrap(), vec![(7, 0), (8, 16)]);
        assert_eq!(read_udev_map(&paths, 8, 16).unwrap()["ID_VENDOR"], "ATA");
        assert_matches!(
            read_udev_map(&paths, 8, 32),
            Err(DirectCsiError::DeviceNotFound(_))
        );
    }

    proptest! {
        #[test]
        /// Normalizing twice gives the same result as normalizing once.
        fn normalize_idempotent(s in "[0-9a-f:-]{0,40}") {
            let once = normalize_uuid(&s);
            prop_assert_eq!(normalize_uuid(&once), once.clone());
        }
    }
}
