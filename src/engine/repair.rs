// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Offline xfs_repair of a managed drive: unmount, repair, remount and
//! record the result.

use std::{path::Path, sync::atomic::AtomicBool};

use crate::{
    engine::{
        consts::{PROJECT_QUOTA_OPTION, XFS},
        handler::FsOps,
        store::{retry_on_conflict, Store},
        sys::{cmd::RepairOptions, mount::UnmountFlags},
        types::{
            ConditionKind, Drive, DriveState, EventReason, EventType, ObjectRef,
            REASON_MOUNT_ERROR, REASON_READY,
        },
    },
    node::errors::{DirectCsiError, DirectCsiResult, ErrorKind},
};

pub struct RepairCoordinator<'a> {
    store: &'a dyn Store,
    ops: &'a FsOps,
}

impl<'a> RepairCoordinator<'a> {
    pub fn new(store: &'a dyn Store, ops: &'a FsOps) -> RepairCoordinator<'a> {
        RepairCoordinator { store, ops }
    }

    fn event(&self, drive: &Drive, event_type: EventType, reason: EventReason, message: &str) {
        if let Err(err) = self
            .store
            .event(&ObjectRef::drive(drive.name()), event_type, reason, message)
        {
            warn!("Failed to record {reason} event for drive {}: {err}", drive.name());
        }
    }

    /// Repair the filesystem on drive and bring it back to Ready.
    ///
    /// Errors carry the failing stage in their kind: DeviceNotFound if the
    /// filesystem can not be located, StillMounted if it is in use
    /// elsewhere, RepairFailed if xfs_repair fails. Any other error means
    /// the drive could not be unmounted or remounted.
    pub fn repair(
        &self,
        drive: &Drive,
        opts: RepairOptions,
        cancel: &AtomicBool,
    ) -> DirectCsiResult<()> {
        let fsuuid = &drive.status.filesystem_uuid;
        let device = match (self.ops.resolve_by_uuid)(fsuuid) {
            Ok(device) => device,
            Err(err) => {
                self.event(
                    drive,
                    EventType::Warning,
                    EventReason::DeviceNotFound,
                    &format!(
                        "unable to find device by filesystem UUID {fsuuid}; run `udevadm trigger` on the node and retry"
                    ),
                );
                return Err(DirectCsiError::DeviceNotFound(format!(
                    "device with filesystem UUID {fsuuid}: {err}"
                )));
            }
        };

        let canonical = drive.mount_target();
        let legacy = drive.legacy_mount_target();
        // Mounts of the device the UUID names now, whatever the record says.
        let (major, minor) = (self.ops.device_number)(&device)?;
        let view = (self.ops.mounts)()?;
        let mounts = view.by_major_minor(major, minor);
        if mounts.iter().any(|m| {
            Path::new(&m.mount_point) != canonical && Path::new(&m.mount_point) != legacy
        }) {
            return Err(DirectCsiError::StillMounted(mounts.len()));
        }

        for mount in &mounts {
            info!("Unmounting {}", mount.mount_point);
            (self.ops.unmount)(Path::new(&mount.mount_point), UnmountFlags::default())?;
        }

        info!("Repairing drive {} on {}", drive.name(), device.display());
        let name = drive.name().to_owned();
        let mut sink = |line: &str| info!("{name}: {line}");
        if let Err(err) = (self.ops.repair)(&device, opts, &mut sink, cancel) {
            let err = match err {
                DirectCsiError::RepairFailed(_) => err,
                err => DirectCsiError::RepairFailed(err.to_string()),
            };
            self.record(drive, DriveState::Error, Some(&err))?;
            self.event(
                drive,
                EventType::Warning,
                EventReason::DriveRepair,
                &err.to_string(),
            );
            return Err(err);
        }

        let mounted = (self.ops.mount)(
            &device,
            &canonical,
            XFS,
            &[],
            &[PROJECT_QUOTA_OPTION.to_owned()],
        );
        match mounted {
            Ok(()) => {
                self.record(drive, DriveState::Ready, None)?;
                self.event(
                    drive,
                    EventType::Normal,
                    EventReason::DriveMounted,
                    &format!("drive repaired and mounted at {}", canonical.display()),
                );
                Ok(())
            }
            Err(err) => {
                self.record(drive, DriveState::Error, Some(&err))?;
                self.event(
                    drive,
                    EventType::Warning,
                    EventReason::DriveMountError,
                    &err.to_string(),
                );
                Err(err.chain(format!("failed to mount {}", canonical.display())))
            }
        }
    }

    fn record(
        &self,
        drive: &Drive,
        state: DriveState,
        error: Option<&DirectCsiError>,
    ) -> DirectCsiResult<()> {
        let target = drive.mount_target().to_string_lossy().into_owned();
        retry_on_conflict(|| {
            let mut current = self.store.get_drive(drive.name())?;
            current.status.drive_status = state;
            match error {
                None => {
                    current.status.mountpoint.clone_from(&target);
                    current
                        .status
                        .conditions
                        .set(ConditionKind::MountError, false, REASON_READY, "");
                }
                Some(err) => current.status.conditions.set(
                    ConditionKind::MountError,
                    true,
                    REASON_MOUNT_ERROR,
                    &err.to_string(),
                ),
            }
            self.store.update_drive(&current)
        })
        .map(|_| ())
        .map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                err.chain(format!("drive {} vanished during repair", drive.name()))
            } else {
                err
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::{
        consts::MOUNT_ROOT,
        handler::ops::fake::FakeFs,
        store::MemoryStore,
        types::{legacy_mount_target, ObjectMeta},
    };

    const FSUUID: &str = "d9877501-e1b5-4bac-b73f-178b29974ed5";

    fn setup() -> (Arc<MemoryStore>, FakeFs, Drive) {
        let mut drive = Drive {
            metadata: ObjectMeta::new("drive-1"),
            ..Default::default()
        };
        drive.status.node_name = "n1".into();
        drive.status.path = "/dev/sdb".into();
        drive.status.major = 8;
        drive.status.minor = 16;
        drive.status.filesystem_uuid = FSUUID.into();
        drive.status.drive_status = DriveState::Error;

        let store = Arc::new(MemoryStore::with_objects(vec![drive.clone()], Vec::new()));
        let fake = FakeFs::new();
        fake.add_device("/dev/sdb", 8, 16);
        fake.link_uuid(FSUUID, "/dev/sdb");
        (store, fake, drive)
    }

    #[test]
    /// An Error drive mounted at its target is unmounted, repaired,
    /// remounted and made Ready.
    fn test_repair() {
        let (store, fake, drive) = setup();
        let target = format!("{MOUNT_ROOT}/{FSUUID}");
        fake.add_mount("/dev/sdb", &target);
        fake.state.lock().unwrap().repair_output = vec!["Phase 1".into(), "done".into()];

        let ops = fake.ops();
        RepairCoordinator::new(store.as_ref(), &ops)
            .repair(&drive, RepairOptions::default(), &AtomicBool::new(false))
            .unwrap();

        assert_eq!(
            fake.calls(),
            vec![
                format!("unmount {target}"),
                "xfs_repair /dev/sdb".to_owned(),
                format!("mount /dev/sdb {target}"),
            ]
        );
        let drive = store.get_drive("drive-1").unwrap();
        assert_eq!(drive.state(), DriveState::Ready);
        assert!(drive
            .status
            .conditions
            .is(ConditionKind::MountError, false));
        assert_eq!(store.events()[0].reason, EventReason::DriveMounted);
    }

    #[test]
    /// Mounts at the canonical and legacy targets are tolerated together.
    fn test_canonical_and_legacy() {
        let (store, fake, drive) = setup();
        fake.add_mount("/dev/sdb", &format!("{MOUNT_ROOT}/{FSUUID}"));
        fake.add_mount("/dev/sdb", &legacy_mount_target(FSUUID).to_string_lossy());

        let ops = fake.ops();
        let opts = RepairOptions {
            force: true,
            disable_prefetch: true,
            dry_run: true,
        };
        RepairCoordinator::new(store.as_ref(), &ops)
            .repair(&drive, opts, &AtomicBool::new(false))
            .unwrap();
        assert!(fake.calls().contains(&"xfs_repair -n -f -P /dev/sdb".to_owned()));
    }

    #[test]
    /// The record still says 8:16 but the filesystem now lives on 8:32.
    /// The mount of 8:32 at the target is removed before repairing.
    fn test_renumbered_device() {
        let (store, fake, drive) = setup();
        let target = format!("{MOUNT_ROOT}/{FSUUID}");
        fake.add_device("/dev/sdc", 8, 32);
        fake.state.lock().unwrap().links = vec![(FSUUID.to_owned(), "/dev/sdc".into())];
        fake.add_mount("/dev/sdc", &target);

        let ops = fake.ops();
        RepairCoordinator::new(store.as_ref(), &ops)
            .repair(&drive, RepairOptions::default(), &AtomicBool::new(false))
            .unwrap();

        assert_eq!(
            fake.calls(),
            vec![
                format!("unmount {target}"),
                "xfs_repair /dev/sdc".to_owned(),
                format!("mount /dev/sdc {target}"),
            ]
        );
    }

    #[test]
    fn test_still_mounted() {
        let (store, fake, drive) = setup();
        fake.add_mount("/dev/sdb", &format!("{MOUNT_ROOT}/{FSUUID}"));
        fake.add_mount("/dev/sdb", "/mnt/a");
        fake.add_mount("/dev/sdb", "/mnt/b");

        let ops = fake.ops();
        assert_matches!(
            RepairCoordinator::new(store.as_ref(), &ops).repair(
                &drive,
                RepairOptions::default(),
                &AtomicBool::new(false)
            ),
            Err(DirectCsiError::StillMounted(3))
        );
        assert!(fake.calls().is_empty());
    }

    #[test]
    /// An unresolvable filesystem UUID is reported with a hint.
    fn test_device_not_found() {
        let (store, _, drive) = setup();
        let ops = FakeFs::new().ops();
        assert_matches!(
            RepairCoordinator::new(store.as_ref(), &ops).repair(
                &drive,
                RepairOptions::default(),
                &AtomicBool::new(false)
            ),
            Err(DirectCsiError::DeviceNotFound(_))
        );
        let events = store.events();
        assert_eq!(events[0].reason, EventReason::DeviceNotFound);
        assert!(events[0].message.contains("udevadm trigger"));
    }

    #[test]
    /// 1. A failed remount leaves the drive in Error with the reason.
    /// 2. A failed repair is not followed by a remount.
    fn test_failures() {
        let (store, fake, drive) = setup();
        fake.fail("mount");
        let ops = fake.ops();
        assert!(RepairCoordinator::new(store.as_ref(), &ops)
            .repair(&drive, RepairOptions::default(), &AtomicBool::new(false))
            .is_err());
        let updated = store.get_drive("drive-1").unwrap();
        assert_eq!(updated.state(), DriveState::Error);
        let condition = updated.status.conditions.get(ConditionKind::MountError);
        assert!(condition.status);
        assert_eq!(condition.reason, REASON_MOUNT_ERROR);

        let (store, fake, drive) = setup();
        fake.fail("repair");
        let ops = fake.ops();
        assert_matches!(
            RepairCoordinator::new(store.as_ref(), &ops).repair(
                &drive,
                RepairOptions::default(),
                &AtomicBool::new(false)
            ),
            Err(DirectCsiError::RepairFailed(_))
        );
        assert_eq!(fake.calls(), vec!["xfs_repair /dev/sdb".to_owned()]);
        assert_eq!(
            store.get_drive("drive-1").unwrap().state(),
            DriveState::Error
        );
    }
}
