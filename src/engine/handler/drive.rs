// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::{
    engine::{
        consts::{DEVICE_PIN_ROOT, PROJECT_QUOTA_OPTION, XFS},
        handler::Handler,
        store::{update_drive_with, update_volume_with},
        sys::mount::UnmountFlags,
        types::{
            drive_mount_target, ConditionKind, Drive, DriveState, EventReason, EventType,
            Finalizers, ObjectRef, VolumeConditionKind, MESSAGE_FORMATTED, MESSAGE_MOUNTED,
            MESSAGE_NOT_FORMATTED, MESSAGE_NOT_MOUNTED, REASON_ADDED, REASON_DRIVE_LOST,
        },
    },
    node::errors::{DirectCsiError, DirectCsiResult, ErrorKind},
};

/// Where the block special file pinning a drive by filesystem UUID lives.
pub fn device_pin_path(fsuuid: &str) -> PathBuf {
    [DEVICE_PIN_ROOT, fsuuid].iter().collect()
}

/// What own-and-format achieved, applied to the record in one write.
struct FormatOutcome {
    fsuuid: String,
    formatted: bool,
    mounted: bool,
    filesystem: String,
    mountpoint: String,
    mount_options: Vec<String>,
    free_capacity: Option<u64>,
    allocated_reset: bool,
    error: Option<DirectCsiError>,
}

impl Handler {
    /// React to a change in a drive record's intent.
    pub fn reconcile_drive(&self, drive: &Drive) -> DirectCsiResult<()> {
        if drive.status.node_name != self.config.node_id {
            return Ok(());
        }
        if drive.metadata.is_deleting() {
            return self.delete(drive);
        }
        match drive.state() {
            DriveState::Released => self.release(drive),
            DriveState::Available if drive.spec.owned || drive.spec.requested_format.is_some() => {
                self.own_and_format(drive)
            }
            _ => Ok(()),
        }
    }

    /// Keep the recorded filesystem UUID unless another managed drive on
    /// this node already uses it.
    fn allocate_fsuuid(&self, drive: &Drive) -> String {
        let current = &drive.status.filesystem_uuid;
        if current.is_empty()
            || self
                .indexer
                .list_managed()
                .iter()
                .any(|d| d.name() != drive.name() && &d.status.filesystem_uuid == current)
        {
            Uuid::new_v4().to_string()
        } else {
            current.clone()
        }
    }

    fn format_steps(&self, drive: &Drive, outcome: &mut FormatOutcome) -> DirectCsiResult<()> {
        let requested = drive.spec.requested_format.clone().unwrap_or_default();
        let device = PathBuf::from(&drive.status.path);
        let pin = device_pin_path(&outcome.fsuuid);
        let target = drive_mount_target(&outcome.fsuuid);

        if outcome.formatted && outcome.filesystem != XFS && !requested.force {
            return Err(DirectCsiError::FormatFailed(format!(
                "drive {} is formatted with {}; force is required to reformat it",
                drive.name(),
                outcome.filesystem
            )));
        }

        (self.ops.make_block_file)(&pin, drive.status.major, drive.status.minor)?;

        let needs_format = !outcome.formatted || requested.force;
        if outcome.mounted && (needs_format || outcome.mountpoint != target.to_string_lossy()) {
            (self.ops.unmount)(Path::new(&outcome.mountpoint), UnmountFlags::default())
                .map_err(|e| e.chain(format!("failed to unmount drive {}", drive.name())))?;
            outcome.mounted = false;
            outcome.mountpoint.clear();
        }

        if needs_format {
            let output = (self.ops.format)(&device, requested.force)?;
            trace!("mkfs output for {}: {}", drive.name(), output);
            (self.ops.set_uuid)(&device, &outcome.fsuuid)?;
            outcome.formatted = true;
            outcome.filesystem = XFS.to_owned();
            outcome.allocated_reset = true;
        } else if outcome.fsuuid != drive.status.filesystem_uuid {
            (self.ops.set_uuid)(&device, &outcome.fsuuid)?;
        }

        if !outcome.mounted {
            (self.ops.mount)(
                &pin,
                &target,
                XFS,
                &requested.mount_options,
                &[PROJECT_QUOTA_OPTION.to_owned()],
            )
            .map_err(|e| e.chain(format!("failed to mount drive {}", drive.name())))?;
            outcome.mounted = true;
            outcome.mountpoint = target.to_string_lossy().into_owned();
            outcome.mount_options = requested.mount_options.clone();
        }

        let (_, free) = (self.ops.statfs)(&target)?;
        outcome.free_capacity = Some(free);
        Ok(())
    }

    /// Take an Available drive under management: format it if needed and
    /// mount it at its canonical target.
    fn own_and_format(&self, drive: &Drive) -> DirectCsiResult<()> {
        info!("Owning and formatting drive {}", drive.name());
        let mut outcome = FormatOutcome {
            fsuuid: self.allocate_fsuuid(drive),
            formatted: !drive.status.filesystem.is_empty(),
            mounted: !drive.status.mountpoint.is_empty(),
            filesystem: drive.status.filesystem.clone(),
            mountpoint: drive.status.mountpoint.clone(),
            mount_options: drive.status.mount_options.clone(),
            free_capacity: None,
            allocated_reset: false,
            error: None,
        };
        if let Err(err) = self.format_steps(drive, &mut outcome) {
            warn!("Failed to own drive {}: {}", drive.name(), err);
            outcome.error = Some(err);
        }

        let updated = update_drive_with(self.store(), drive.name(), |current| {
            if current.state() != DriveState::Available {
                return Ok(false);
            }
            let before = current.clone();
            let status = &mut current.status;
            status.filesystem_uuid.clone_from(&outcome.fsuuid);
            status.filesystem.clone_from(&outcome.filesystem);
            status.mountpoint.clone_from(&outcome.mountpoint);
            status.mount_options.clone_from(&outcome.mount_options);
            if outcome.allocated_reset {
                status.allocated_capacity = 0;
            }
            if let Some(free) = outcome.free_capacity {
                status.free_capacity = free;
                status.allocated_capacity = status.total_capacity.saturating_sub(free);
            }

            let message = outcome
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default();
            status.conditions.set(
                ConditionKind::Owned,
                outcome.formatted && outcome.mounted && outcome.error.is_none(),
                REASON_ADDED,
                &message,
            );
            status.conditions.set(
                ConditionKind::Mounted,
                outcome.mounted,
                REASON_ADDED,
                if outcome.mounted {
                    MESSAGE_MOUNTED
                } else {
                    MESSAGE_NOT_MOUNTED
                },
            );
            status.conditions.set(
                ConditionKind::Formatted,
                outcome.formatted,
                REASON_ADDED,
                if outcome.formatted {
                    MESSAGE_FORMATTED
                } else {
                    MESSAGE_NOT_FORMATTED
                },
            );

            if outcome.error.is_none() {
                status.drive_status = DriveState::Ready;
                current.spec.requested_format = None;
                current.metadata.finalizers = Finalizers::data_protection();
            }
            Ok(*current != before)
        })?;
        self.indexer.observe(&updated);

        match outcome.error {
            None => {
                info!(
                    "Drive {} is ready at {}",
                    updated.name(),
                    updated.status.mountpoint
                );
                self.record_event(
                    ObjectRef::drive(updated.name()),
                    EventType::Normal,
                    EventReason::DriveFormatted,
                    &format!("drive formatted and mounted at {}", updated.status.mountpoint),
                );
                Ok(())
            }
            Some(err) => {
                self.record_event(
                    ObjectRef::drive(updated.name()),
                    EventType::Warning,
                    EventReason::DriveMountError,
                    &err.to_string(),
                );
                Err(err)
            }
        }
    }

    /// Unmount whichever of the canonical or legacy targets the drive
    /// occupies. A target that is not mounted is left alone.
    fn unmount_drive(&self, drive: &Drive, flags: UnmountFlags) -> DirectCsiResult<()> {
        if drive.status.filesystem_uuid.is_empty() {
            return Ok(());
        }
        let view = (self.ops.mounts)()?;
        for target in [drive.mount_target(), drive.legacy_mount_target()] {
            if view.is_mounted(&target) {
                debug!("Unmounting drive {} from {}", drive.name(), target.display());
                (self.ops.unmount)(&target, flags)?;
            }
        }
        Ok(())
    }

    /// Drive a record marked for deletion towards removal.
    fn delete(&self, drive: &Drive) -> DirectCsiResult<()> {
        let drive = if drive.is_terminating() {
            drive.clone()
        } else {
            let updated = update_drive_with(self.store(), drive.name(), |current| {
                if current.is_terminating() {
                    return Ok(false);
                }
                current.status.drive_status = DriveState::Terminating;
                Ok(true)
            })?;
            self.indexer.observe(&updated);
            updated
        };

        if drive.finalizers().is_empty() {
            return Ok(());
        }

        if drive.finalizers().has_volumes() {
            for volume in drive.finalizers().volumes() {
                let result = update_volume_with(self.store(), volume, |v| {
                    let ready = v.status.conditions.get(VolumeConditionKind::Ready);
                    if !ready.status && ready.reason == REASON_DRIVE_LOST {
                        return false;
                    }
                    v.status.conditions.set(
                        VolumeConditionKind::Ready,
                        false,
                        REASON_DRIVE_LOST,
                        &format!("drive {} is being deleted", drive.name()),
                    );
                    true
                });
                match result {
                    Ok(_) => self.record_event(
                        ObjectRef::volume(volume),
                        EventType::Warning,
                        EventReason::DriveLost,
                        &format!("drive {} is being deleted", drive.name()),
                    ),
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        debug!("Volume {volume} of drive {} is gone", drive.name());
                    }
                    Err(err) => return Err(err),
                }
            }
            info!(
                "Drive {} waits for its volumes to be released",
                drive.name()
            );
            return Ok(());
        }

        self.unmount_drive(&drive, UnmountFlags::force_detach())?;
        let result = update_drive_with(self.store(), drive.name(), |current| {
            current.metadata.finalizers.clear();
            Ok(true)
        });
        match result {
            Ok(_) | Err(DirectCsiError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        self.indexer.forget(drive.name());
        info!("Drive {} deleted", drive.name());
        Ok(())
    }

    /// Give a Released drive back: unmount it and remove its record.
    fn release(&self, drive: &Drive) -> DirectCsiResult<()> {
        if drive.finalizers().len() > 1 {
            return Err(DirectCsiError::Msg(format!(
                "drive {} can not be released while it has volumes",
                drive.name()
            )));
        }

        self.unmount_drive(drive, UnmountFlags::default())?;
        update_drive_with(self.store(), drive.name(), |current| {
            let status = &mut current.status;
            status
                .conditions
                .set(ConditionKind::Owned, false, REASON_ADDED, "");
            status
                .conditions
                .set(ConditionKind::Mounted, false, REASON_ADDED, MESSAGE_NOT_MOUNTED);
            status.mountpoint.clear();
            status.mount_options.clear();
            current.metadata.finalizers.clear();
            Ok(true)
        })?;

        match self.store().delete_drive(drive.name()) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        self.indexer.forget(drive.name());
        self.record_event(
            ObjectRef::drive(drive.name()),
            EventType::Normal,
            EventReason::DriveReleased,
            &format!("drive {} released", drive.status.path),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::{
        consts::MOUNT_ROOT,
        handler::{ops::fake::FakeFs, NodeConfig},
        indexer::DriveIndexer,
        store::{MemoryStore, Store},
        types::{ObjectMeta, RequestedFormat, Volume},
    };

    const FSUUID: &str = "d9877501-e1b5-4bac-b73f-178b29974ed5";

    fn available() -> Drive {
        let mut drive = Drive {
            metadata: ObjectMeta::new("drive-1"),
            ..Default::default()
        };
        drive.metadata.finalizers = Finalizers::data_protection();
        drive.status.node_name = "n1".into();
        drive.status.path = "/dev/sdb".into();
        drive.status.major = 202;
        drive.status.minor = 2;
        drive.status.total_capacity = 5_368_709_120;
        drive.status.drive_status = DriveState::Available;
        drive.set_standard_labels();
        drive
    }

    fn owned(mut drive: Drive) -> Drive {
        drive.spec.owned = true;
        drive.spec.requested_format = Some(RequestedFormat {
            force: true,
            filesystem: XFS.into(),
            mount_options: Vec::new(),
        });
        drive
    }

    fn setup(drives: Vec<Drive>, volumes: Vec<Volume>) -> (Arc<MemoryStore>, FakeFs, Handler) {
        let store = Arc::new(MemoryStore::with_objects(drives, volumes));
        let indexer = Arc::new(DriveIndexer::new(store.clone(), "n1"));
        indexer.resync().unwrap();
        let fake = FakeFs::new();
        let handler = Handler::new(NodeConfig::new("n1"), indexer, fake.ops());
        (store, fake, handler)
    }

    #[test]
    /// 1. An owned Available drive is formatted with a fresh UUID and
    ///    mounted at its canonical target.
    /// 2. A second pass leaves conditions and status unchanged.
    fn test_fresh_adoption() {
        let (store, fake, handler) = setup(vec![owned(available())], Vec::new());
        let drive = store.get_drive("drive-1").unwrap();
        handler.reconcile_drive(&drive).unwrap();

        let drive = store.get_drive("drive-1").unwrap();
        let fsuuid = drive.status.filesystem_uuid.clone();
        assert!(Uuid::parse_str(&fsuuid).is_ok());
        let target = format!("{MOUNT_ROOT}/{fsuuid}");
        assert_eq!(
            fake.calls(),
            vec![
                format!("mknod /var/lib/direct-csi/devices/{fsuuid} 202:2"),
                "mkfs.xfs -f -i maxpct=50 /dev/sdb".to_owned(),
                format!("xfs_admin -U {fsuuid} /dev/sdb"),
                format!("mount /var/lib/direct-csi/devices/{fsuuid} {target}"),
            ]
        );
        assert_eq!(drive.state(), DriveState::Ready);
        assert_eq!(drive.status.mountpoint, target);
        assert_eq!(drive.status.filesystem, XFS);
        assert_eq!(drive.status.free_capacity, 5_300_000_000);
        assert_eq!(drive.status.allocated_capacity, 68_709_120);
        assert!(drive.spec.requested_format.is_none());
        for (kind, message) in [
            (ConditionKind::Owned, ""),
            (ConditionKind::Mounted, MESSAGE_MOUNTED),
            (ConditionKind::Formatted, MESSAGE_FORMATTED),
        ] {
            let condition = drive.status.conditions.get(kind);
            assert!(condition.status);
            assert_eq!(condition.reason, REASON_ADDED);
            assert_eq!(condition.message, message);
        }
        assert_eq!(store.events()[0].reason, EventReason::DriveFormatted);

        let before = drive.clone();
        handler.reconcile_drive(&drive).unwrap();
        let after = store.get_drive("drive-1").unwrap();
        assert_eq!(after.status, before.status);
        assert_eq!(fake.calls().len(), 4);
    }

    #[test]
    /// A filesystem UUID already used by a managed drive is replaced.
    fn test_duplicate_fsuuid() {
        let mut other = available();
        other.metadata.name = "drive-0".into();
        other.status.drive_status = DriveState::Ready;
        other.status.filesystem_uuid = FSUUID.into();

        let mut drive = owned(available());
        drive.status.filesystem_uuid = FSUUID.into();

        let (store, fake, handler) = setup(vec![other, drive.clone()], Vec::new());
        handler.reconcile_drive(&drive).unwrap();

        let drive = store.get_drive("drive-1").unwrap();
        assert_ne!(drive.status.filesystem_uuid, FSUUID);
        assert!(fake
            .calls()
            .contains(&format!("xfs_admin -U {} /dev/sdb", drive.status.filesystem_uuid)));
        assert_eq!(handler.indexer().filter_by_fsuuid(FSUUID).len(), 1);
    }

    #[test]
    /// A failed format is recorded in the Owned condition and the drive
    /// stays Available.
    fn test_format_failure() {
        let (store, fake, handler) = setup(vec![owned(available())], Vec::new());
        fake.fail("format");
        let drive = store.get_drive("drive-1").unwrap();
        assert!(handler.reconcile_drive(&drive).is_err());

        let drive = store.get_drive("drive-1").unwrap();
        assert_eq!(drive.state(), DriveState::Available);
        let owned = drive.status.conditions.get(ConditionKind::Owned);
        assert!(!owned.status);
        assert!(owned.message.contains("injected format failure"));
        assert!(drive.spec.requested_format.is_some());
        assert!(drive.finalizers().deletion_allowed());
    }

    #[test]
    /// A drive holding another filesystem is not reformatted without force.
    fn test_foreign_filesystem() {
        let mut drive = owned(available());
        drive.spec.requested_format = Some(RequestedFormat::default());
        drive.status.filesystem = "ext4".into();
        let (store, fake, handler) = setup(vec![drive.clone()], Vec::new());

        assert_matches!(
            handler.reconcile_drive(&drive),
            Err(DirectCsiError::FormatFailed(_))
        );
        assert!(fake.calls().is_empty());
        assert_eq!(
            store.get_drive("drive-1").unwrap().state(),
            DriveState::Available
        );
    }

    #[test]
    /// 1. Deleting an InUse drive makes it Terminating and marks its
    ///    volume as lost.
    /// 2. The record and its finalizers survive.
    fn test_deletion_with_live_volume() {
        let mut drive = available();
        drive.status.drive_status = DriveState::InUse;
        drive.status.filesystem_uuid = FSUUID.into();
        drive
            .metadata
            .finalizers
            .add(&Finalizers::volume_finalizer("vol-id"));
        let volume = Volume {
            metadata: ObjectMeta::new("vol-id"),
            ..Default::default()
        };
        let (store, fake, handler) = setup(vec![drive], vec![volume]);

        store.delete_drive("drive-1").unwrap();
        let drive = store.get_drive("drive-1").unwrap();
        assert!(drive.metadata.is_deleting());
        handler.reconcile_drive(&drive).unwrap();

        let drive = store.get_drive("drive-1").unwrap();
        assert_eq!(drive.state(), DriveState::Terminating);
        assert_eq!(drive.finalizers().len(), 2);
        let volume = store.get_volume("vol-id").unwrap();
        let ready = volume.status.conditions.get(VolumeConditionKind::Ready);
        assert!(!ready.status);
        assert_eq!(ready.reason, REASON_DRIVE_LOST);
        assert!(fake.calls().is_empty());
    }

    #[test]
    /// Deleting a Ready drive unmounts it and removes the record.
    fn test_deletion() {
        let mut drive = available();
        drive.status.drive_status = DriveState::Ready;
        drive.status.filesystem_uuid = FSUUID.into();
        let (store, fake, handler) = setup(vec![drive], Vec::new());
        let target = format!("{MOUNT_ROOT}/{FSUUID}");
        fake.add_mount("/dev/sdb", &target);

        store.delete_drive("drive-1").unwrap();
        let drive = store.get_drive("drive-1").unwrap();
        handler.reconcile_drive(&drive).unwrap();

        assert_eq!(fake.calls(), vec![format!("unmount {target}")]);
        assert_matches!(
            store.get_drive("drive-1"),
            Err(DirectCsiError::NotFound(_))
        );
        assert!(handler.indexer().get("drive-1").is_none());
    }

    #[test]
    /// 1. A Released drive is unmounted and its record deleted.
    /// 2. A Released drive with volumes is refused.
    fn test_release() {
        let mut drive = available();
        drive.status.drive_status = DriveState::Released;
        drive.status.filesystem_uuid = FSUUID.into();
        let mut busy = drive.clone();
        busy.metadata.name = "drive-2".into();
        busy.metadata
            .finalizers
            .add(&Finalizers::volume_finalizer("vol-id"));
        let (store, fake, handler) = setup(vec![drive.clone(), busy.clone()], Vec::new());
        let target = format!("{MOUNT_ROOT}/{FSUUID}");
        fake.add_mount("/dev/sdb", &target);

        handler.reconcile_drive(&drive).unwrap();
        assert_eq!(fake.calls(), vec![format!("unmount {target}")]);
        assert_matches!(
            store.get_drive("drive-1"),
            Err(DirectCsiError::NotFound(_))
        );
        assert_eq!(store.events()[0].reason, EventReason::DriveReleased);

        assert!(handler.reconcile_drive(&busy).is_err());
        assert!(store.get_drive("drive-2").is_ok());
    }

    #[test]
    fn test_other_node_ignored() {
        let mut drive = owned(available());
        drive.status.node_name = "n2".into();
        let (_, fake, handler) = setup(vec![drive.clone()], Vec::new());
        handler.reconcile_drive(&drive).unwrap();
        assert!(fake.calls().is_empty());
    }
}
