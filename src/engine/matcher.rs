// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Decide which drive record, if any, describes an observed device.
//!
//! Stage one narrows the candidates with a priority ordered list of
//! identity predicates: hardware identifiers first, then software
//! identifiers, then sizes. Stage two falls back on the kernel assigned
//! major:minor and path, and is only reached when records are otherwise
//! indistinguishable.

use crate::engine::{
    consts::CAPACITY_TOLERANCE,
    types::{Device, Drive, DriveState, Verdict},
};

/// How one record compares with the device under one predicate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Outcome {
    /// Both sides carry the value and it agrees.
    Match,
    /// Neither side carries the value.
    Neutral,
    /// Only one side carries a value that may plausibly be absent.
    Consider,
    /// The values disagree, or a value that must be present is missing.
    Mismatch,
}

type Predicate = fn(&Drive, &Device) -> Outcome;

fn compare_str(drive: &str, device: &str, absence_plausible: bool) -> Outcome {
    match (drive.is_empty(), device.is_empty()) {
        (true, true) => Outcome::Neutral,
        (false, false) if drive == device => Outcome::Match,
        (false, false) => Outcome::Mismatch,
        _ if absence_plausible => Outcome::Consider,
        _ => Outcome::Mismatch,
    }
}

fn compare_size(drive: u64, device: u64, tolerance: u64) -> Outcome {
    match (drive == 0, device == 0) {
        (true, true) => Outcome::Neutral,
        (false, false) if drive.abs_diff(device) <= tolerance => Outcome::Match,
        (false, false) => Outcome::Mismatch,
        _ => Outcome::Consider,
    }
}

/// Strip the "naa." or "0x" scheme prefix some transports add to a WWID.
pub fn normalize_wwid(wwid: &str) -> &str {
    wwid.strip_prefix("naa.")
        .or_else(|| wwid.strip_prefix("0x"))
        .unwrap_or(wwid)
}

fn partition_number(drive: &Drive, device: &Device) -> Outcome {
    if drive.status.partition_num == device.udev.partition {
        Outcome::Match
    } else {
        Outcome::Mismatch
    }
}

fn uevent_serial(drive: &Drive, device: &Device) -> Outcome {
    compare_str(&drive.status.uevent_serial, &device.udev.uevent_serial, false)
}

fn wwid(drive: &Drive, device: &Device) -> Outcome {
    compare_str(
        normalize_wwid(&drive.status.wwid),
        normalize_wwid(&device.udev.wwid),
        false,
    )
}

fn model(drive: &Drive, device: &Device) -> Outcome {
    compare_str(&drive.status.model, &device.udev.model, false)
}

fn vendor(drive: &Drive, device: &Device) -> Outcome {
    compare_str(&drive.status.vendor, &device.udev.vendor, false)
}

fn part_table_uuid(drive: &Drive, device: &Device) -> Outcome {
    compare_str(
        &drive.status.part_table_uuid,
        &device.udev.part_table_uuid,
        false,
    )
}

fn partition_uuid(drive: &Drive, device: &Device) -> Outcome {
    // Older records stored partition UUIDs upper-cased.
    compare_str(
        &drive.status.partition_uuid.to_ascii_lowercase(),
        &device.udev.part_uuid.to_ascii_lowercase(),
        false,
    )
}

fn dm_uuid(drive: &Drive, device: &Device) -> Outcome {
    compare_str(&drive.status.dm_uuid, &device.udev.dm_uuid, false)
}

fn md_uuid(drive: &Drive, device: &Device) -> Outcome {
    compare_str(&drive.status.md_uuid, &device.udev.md_uuid, false)
}

fn filesystem_type(drive: &Drive, device: &Device) -> Outcome {
    compare_str(&drive.status.filesystem, device.effective_fs_type(), true)
}

fn uevent_fsuuid(drive: &Drive, device: &Device) -> Outcome {
    compare_str(
        &drive.status.uevent_fsuuid,
        &device.udev.uevent_fsuuid,
        true,
    )
}

fn fsuuid(drive: &Drive, device: &Device) -> Outcome {
    compare_str(&drive.status.filesystem_uuid, &device.fs_uuid, true)
}

// Serial numbers come from ioctls that fail on some transports.
fn serial(drive: &Drive, device: &Device) -> Outcome {
    compare_str(&drive.status.serial, &device.serial, true)
}

fn logical_block_size(drive: &Drive, device: &Device) -> Outcome {
    compare_size(
        drive.status.logical_block_size,
        device.logical_block_size,
        0,
    )
}

fn physical_block_size(drive: &Drive, device: &Device) -> Outcome {
    compare_size(
        drive.status.physical_block_size,
        device.physical_block_size,
        0,
    )
}

fn total_capacity(drive: &Drive, device: &Device) -> Outcome {
    compare_size(drive.status.total_capacity, device.size, CAPACITY_TOLERANCE)
}

// The allocation of an InUse drive counts volume reservations, not
// filesystem usage, so it says nothing about identity.
fn allocated_capacity(drive: &Drive, device: &Device) -> Outcome {
    if drive.state() == DriveState::InUse {
        return Outcome::Neutral;
    }
    compare_size(
        drive.status.allocated_capacity,
        device.total_capacity.saturating_sub(device.free_capacity),
        CAPACITY_TOLERANCE,
    )
}

const STAGE_ONE: [(&str, Predicate); 17] = [
    ("partition number", partition_number),
    ("uevent serial", uevent_serial),
    ("wwid", wwid),
    ("model", model),
    ("vendor", vendor),
    ("partition table uuid", part_table_uuid),
    ("partition uuid", partition_uuid),
    ("dm uuid", dm_uuid),
    ("md uuid", md_uuid),
    ("filesystem type", filesystem_type),
    ("uevent filesystem uuid", uevent_fsuuid),
    ("filesystem uuid", fsuuid),
    ("serial", serial),
    ("logical block size", logical_block_size),
    ("physical block size", physical_block_size),
    ("total capacity", total_capacity),
    ("allocated capacity", allocated_capacity),
];

fn same_major_minor(drive: &Drive, device: &Device) -> bool {
    drive.status.major == device.major && drive.status.minor == device.minor
}

fn same_path(drive: &Drive, device: &Device) -> bool {
    drive.status.path == device.dev_path()
}

const STAGE_TWO: [(&str, fn(&Drive, &Device) -> bool); 2] = [
    ("major:minor", same_major_minor),
    ("path", same_path),
];

/// The owner asked for the drive to be formatted and it has not been yet.
pub fn is_format_requested(drive: &Drive) -> bool {
    drive.spec.owned
        && drive.spec.requested_format.is_some()
        && drive.state() == DriveState::Available
}

/// True if any field the handler maintains from the device differs from
/// what the record holds.
pub fn is_changed(device: &Device, drive: &Drive) -> bool {
    let status = &drive.status;
    let udev = &device.udev;
    status.path != device.dev_path()
        || status.major != device.major
        || status.minor != device.minor
        || status.partition_num != udev.partition
        || status.wwid != udev.wwid
        || status.model != udev.model
        || status.uevent_serial != udev.uevent_serial
        || status.vendor != udev.vendor
        || status.dm_name != udev.dm_name
        || status.dm_uuid != udev.dm_uuid
        || status.md_uuid != udev.md_uuid
        || status.part_table_uuid != udev.part_table_uuid
        || status.part_table_type != udev.part_table_type
        || status.partition_uuid != udev.part_uuid
        || status.uevent_fsuuid != udev.uevent_fsuuid
        || status.pci_path != udev.pci_path
        || status.filesystem != device.effective_fs_type()
        || status.filesystem_uuid != device.fs_uuid
        || status.serial != device.serial
        || status.read_only != device.read_only
        || status.partitioned != device.partitioned()
        || status.swap_on != device.swap_on
        || status.master != device.master
        || status.total_capacity != device.size
        || status.mountpoint != device.first_mount_point()
        || status.mount_options.as_slice() != device.first_mount_options()
}

/// Find the record describing device among drives.
///
/// The verdict does not depend on the order of drives.
pub fn match_device(device: &Device, drives: &[Drive]) -> Verdict {
    let mut working = drives
        .iter()
        .filter(|d| !d.is_terminating())
        .collect::<Vec<_>>();
    let mut matched = false;
    let mut updated = false;

    for (name, predicate) in STAGE_ONE.iter() {
        if working.is_empty() {
            break;
        }
        let outcomes = working
            .iter()
            .map(|d| (*d, predicate(d, device)))
            .collect::<Vec<_>>();

        let hits = outcomes
            .iter()
            .filter(|(_, o)| *o == Outcome::Match)
            .map(|(d, _)| *d)
            .collect::<Vec<_>>();
        if !hits.is_empty() {
            working = hits;
            matched = true;
            continue;
        }

        let one_sided = outcomes.iter().any(|(_, o)| *o == Outcome::Consider);
        working = outcomes
            .into_iter()
            .filter(|(_, o)| matches!(o, Outcome::Neutral | Outcome::Consider))
            .map(|(d, _)| d)
            .collect();
        if matched && one_sided && working.len() == 1 {
            trace!("{device}: {name} present on one side only");
            updated = true;
        }
    }

    for (name, predicate) in STAGE_TWO.iter() {
        if working.len() <= 1 {
            break;
        }
        let hits = working
            .iter()
            .copied()
            .filter(|d| predicate(d, device))
            .collect::<Vec<_>>();
        if !hits.is_empty() {
            trace!("{device}: narrowed to {} records by {name}", hits.len());
            working = hits;
        }
    }

    match working.as_slice() {
        [] => Verdict::NoMatch,
        [drive] => {
            if updated || is_changed(device, drive) || is_format_requested(drive) {
                Verdict::Changed((*drive).clone())
            } else {
                Verdict::NoChange((*drive).clone())
            }
        }
        _ => {
            let mut all = working.into_iter().cloned().collect::<Vec<_>>();
            all.sort_by(|a, b| a.name().cmp(b.name()));
            Verdict::TooManyMatches(all)
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::{collection::vec, prelude::any, sample::select};

    use super::*;
    use crate::engine::types::{ObjectMeta, RequestedFormat, UdevData};

    fn device() -> Device {
        Device {
            name: "sdb".into(),
            major: 8,
            minor: 16,
            size: 5_368_709_120,
            logical_block_size: 512,
            physical_block_size: 512,
            serial: "QM00002".into(),
            total_capacity: 5_368_709_120,
            free_capacity: 5_368_709_120,
            udev: UdevData {
                devpath: "/devices/pci0000:00/0000:00:01.1/ata2/host1/target1:0:0/1:0:0:0/block/sdb"
                    .into(),
                path: "/dev/sdb".into(),
                major: 8,
                minor: 16,
                wwid: "naa.5000c500a0b1c2d3".into(),
                model: "QEMU_HARDDISK".into(),
                uevent_serial: "QM00002".into(),
                vendor: "ATA".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// A record exactly as the handler would have written it for device.
    fn record(name: &str, device: &Device) -> Drive {
        let mut drive = Drive {
            metadata: ObjectMeta::new(name),
            ..Default::default()
        };
        let status = &mut drive.status;
        status.path = device.dev_path();
        status.major = device.major;
        status.minor = device.minor;
        status.partition_num = device.udev.partition;
        status.wwid = device.udev.wwid.clone();
        status.model = device.udev.model.clone();
        status.uevent_serial = device.udev.uevent_serial.clone();
        status.vendor = device.udev.vendor.clone();
        status.serial = device.serial.clone();
        status.logical_block_size = device.logical_block_size;
        status.physical_block_size = device.physical_block_size;
        status.total_capacity = device.size;
        drive
    }

    #[test]
    fn test_no_candidates() {
        assert_eq!(match_device(&device(), &[]), Verdict::NoMatch);
    }

    #[test]
    fn test_exact_record_is_unchanged() {
        let dev = device();
        let drive = record("a", &dev);
        assert_eq!(match_device(&dev, &[drive.clone()]), Verdict::NoChange(drive));
    }

    #[test]
    /// A different hardware identity is not the same drive.
    fn test_other_drive_is_no_match() {
        let dev = device();
        let mut drive = record("a", &dev);
        drive.status.uevent_serial = "QM00003".into();
        drive.status.serial = "QM00003".into();
        assert_eq!(match_device(&dev, &[drive]), Verdict::NoMatch);
    }

    #[test]
    /// A device that gained a filesystem since the record was written still
    /// matches, and the verdict says the record needs updating.
    fn test_new_filesystem_is_changed() {
        let mut dev = device();
        let drive = record("a", &dev);
        dev.fs_type = "xfs".into();
        dev.fs_uuid = "d9877501-e1b5-4bac-b73f-178b29974ed5".into();
        assert_matches!(match_device(&dev, &[drive]), Verdict::Changed(d) if d.name() == "a");
    }

    #[test]
    fn test_path_drift_is_changed() {
        let dev = device();
        let mut drive = record("a", &dev);
        drive.status.path = "/dev/sdc".into();
        assert_matches!(match_device(&dev, &[drive]), Verdict::Changed(_));
    }

    #[test]
    fn test_format_request_is_changed() {
        let dev = device();
        let mut drive = record("a", &dev);
        drive.spec.owned = true;
        drive.spec.requested_format = Some(RequestedFormat {
            force: true,
            filesystem: "xfs".into(),
            mount_options: Vec::new(),
        });
        assert_matches!(match_device(&dev, &[drive]), Verdict::Changed(_));
    }

    #[test]
    fn test_terminating_is_skipped() {
        let dev = device();
        let mut drive = record("a", &dev);
        drive.status.drive_status = DriveState::Terminating;
        assert_eq!(match_device(&dev, &[drive]), Verdict::NoMatch);
    }

    #[test]
    /// Two virtual disks with no hardware identity are told apart by
    /// major:minor, and then by path.
    fn test_stage_two() {
        let mut dev = device();
        dev.serial.clear();
        dev.udev.uevent_serial.clear();
        dev.udev.wwid.clear();

        let here = record("here", &dev);
        let mut there = record("there", &dev);
        there.status.minor = 32;
        there.status.path = "/dev/sdc".into();
        assert_eq!(
            match_device(&dev, &[there.clone(), here.clone()]),
            Verdict::NoChange(here.clone())
        );

        let mut same_numbers = here.clone();
        same_numbers.metadata.name = "other".into();
        same_numbers.status.path = "/dev/sdc".into();
        assert_eq!(
            match_device(&dev, &[same_numbers.clone(), here.clone()]),
            Verdict::NoChange(here.clone())
        );

        let mut twin = here.clone();
        twin.metadata.name = "twin".into();
        assert_matches!(
            match_device(&dev, &[twin, here]),
            Verdict::TooManyMatches(all) if all.len() == 2
        );
    }

    #[test]
    fn test_wwid_prefixes() {
        assert_eq!(normalize_wwid("naa.5000c500"), "5000c500");
        assert_eq!(normalize_wwid("0x5000c500"), "5000c500");
        assert_eq!(normalize_wwid("eui.0025"), "eui.0025");
    }

    proptest! {
        #[test]
        /// The verdict does not depend on the order of the candidates.
        fn order_independence(
            picks in vec(select(vec![0usize, 1, 2, 3, 4, 5]), 0..6),
            seed in any::<u64>(),
        ) {
            let dev = device();
            let variants = |index: usize, n: usize| {
                let mut drive = record(&format!("d{n}"), &dev);
                match index {
                    0 => {}
                    1 => drive.status.serial = "OTHER".into(),
                    2 => drive.status.minor = 32,
                    3 => drive.status.filesystem_uuid = "d9877501-e1b5-4bac-b73f-178b29974ed5".into(),
                    4 => drive.status.drive_status = DriveState::Terminating,
                    _ => {
                        drive.status.wwid.clear();
                        drive.status.path = "/dev/sdc".into();
                    }
                }
                drive
            };
            let drives = picks
                .iter()
                .enumerate()
                .map(|(n, index)| variants(*index, n))
                .collect::<Vec<_>>();

            let mut shuffled = drives.clone();
            let len = shuffled.len();
            if len > 1 {
                let mut state = seed;
                for i in (1..len).rev() {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    let j = usize::try_from(state >> 33).unwrap() % (i + 1);
                    shuffled.swap(i, j);
                }
            }

            prop_assert_eq!(match_device(&dev, &drives), match_device(&dev, &shuffled));
        }

        #[test]
        /// WWIDs that differ only by a scheme prefix identify the same drive.
        fn wwid_equivalence(
            id in "[0-9a-f]{16}",
            drive_prefix in select(vec!["", "naa.", "0x"]),
            device_prefix in select(vec!["", "naa.", "0x"]),
        ) {
            let mut dev = device();
            dev.udev.wwid = format!("{device_prefix}{id}");
            let mut drive = record("a", &dev);
            drive.status.wwid = format!("{drive_prefix}{id}");
            prop_assert_eq!(wwid(&drive, &dev), Outcome::Match);
            prop_assert!(match_device(&dev, &[drive]).drive().is_some());
        }
    }
}
