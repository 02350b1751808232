// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{collections::BTreeMap, path::PathBuf};

use chrono::{DateTime, Utc};
use strum::VariantArray;

use crate::engine::{
    consts::{
        ACCESS_TIER_LABEL, CREATED_BY, CREATED_BY_LABEL, LEGACY_APP_ROOT_DIR, MOUNT_ROOT,
        NODE_LABEL, PATH_LABEL, VERSION, VERSION_LABEL,
    },
    types::meta::{Finalizers, ObjectMeta},
};

/// The lifecycle state of a drive record.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    Serialize,
    strum_macros::AsRefStr,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::VariantArray,
)]
pub enum DriveState {
    Unavailable,
    #[default]
    Available,
    Ready,
    InUse,
    Released,
    Terminating,
    Error,
}

impl DriveState {
    /// Ready and InUse drives are managed: formatted, mounted and owned.
    pub fn is_managed(self) -> bool {
        matches!(self, DriveState::Ready | DriveState::InUse)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    Serialize,
    strum_macros::AsRefStr,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum AccessTier {
    Warm,
    Hot,
    Cold,
    #[default]
    Unknown,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestedFormat {
    pub force: bool,
    pub filesystem: String,
    pub mount_options: Vec<String>,
}

/// Operator intent for the drive.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriveSpec {
    pub owned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_format: Option<RequestedFormat>,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    PartialEq,
    Serialize,
    strum_macros::AsRefStr,
    strum_macros::Display,
    strum_macros::VariantArray,
)]
pub enum ConditionKind {
    Owned,
    Mounted,
    Formatted,
    Initialized,
    Ready,
    MountError,
}

impl ConditionKind {
    fn index(self) -> usize {
        match self {
            ConditionKind::Owned => 0,
            ConditionKind::Mounted => 1,
            ConditionKind::Formatted => 2,
            ConditionKind::Initialized => 3,
            ConditionKind::Ready => 4,
            ConditionKind::MountError => 5,
        }
    }
}

pub const REASON_ADDED: &str = "Added";
pub const REASON_NOT_ADDED: &str = "NotAdded";
pub const REASON_INITIALIZED: &str = "Initialized";
pub const REASON_READY: &str = "Ready";
pub const REASON_NOT_READY: &str = "NotReady";
pub const REASON_DRIVE_LOST: &str = "DriveLost";
pub const REASON_MOUNT_ERROR: &str = "MountError";

pub const MESSAGE_MOUNTED: &str = "Mounted";
pub const MESSAGE_NOT_MOUNTED: &str = "NotMounted";
pub const MESSAGE_FORMATTED: &str = "Formatted";
pub const MESSAGE_NOT_FORMATTED: &str = "NotFormatted";

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    fn new(kind: ConditionKind, status: bool, reason: &str) -> Condition {
        Condition {
            kind,
            status,
            reason: reason.to_owned(),
            message: String::new(),
            last_transition_time: Utc::now(),
        }
    }
}

/// One slot per condition kind, addressed by kind.
///
/// Serialized as a list so the wire format is the usual condition array.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(from = "Vec<Condition>", into = "Vec<Condition>")]
pub struct Conditions([Condition; 6]);

impl Default for Conditions {
    fn default() -> Conditions {
        Conditions([
            Condition::new(ConditionKind::Owned, false, REASON_NOT_ADDED),
            Condition::new(ConditionKind::Mounted, false, REASON_NOT_ADDED),
            Condition::new(ConditionKind::Formatted, false, REASON_NOT_ADDED),
            Condition::new(ConditionKind::Initialized, true, REASON_INITIALIZED),
            Condition::new(ConditionKind::Ready, true, REASON_READY),
            Condition::new(ConditionKind::MountError, false, REASON_NOT_ADDED),
        ])
    }
}

impl From<Vec<Condition>> for Conditions {
    fn from(list: Vec<Condition>) -> Conditions {
        let mut conditions = Conditions::default();
        for condition in list {
            let index = condition.kind.index();
            conditions.0[index] = condition;
        }
        conditions
    }
}

impl From<Conditions> for Vec<Condition> {
    fn from(conditions: Conditions) -> Vec<Condition> {
        conditions.0.into_iter().collect()
    }
}

impl Conditions {
    pub fn get(&self, kind: ConditionKind) -> &Condition {
        &self.0[kind.index()]
    }

    pub fn is(&self, kind: ConditionKind, status: bool) -> bool {
        self.get(kind).status == status
    }

    /// Update the condition of the given kind. The transition time moves
    /// only when the truth value flips, so re-applying the same update
    /// leaves the record unchanged.
    pub fn set(&mut self, kind: ConditionKind, status: bool, reason: &str, message: &str) {
        let condition = &mut self.0[kind.index()];
        if condition.status != status {
            condition.last_transition_time = Utc::now();
        }
        condition.status = status;
        condition.reason = reason.to_owned();
        condition.message = message.to_owned();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn kinds() -> &'static [ConditionKind] {
        ConditionKind::VARIANTS
    }
}

/// Observed state of a drive, written by the node agent.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriveStatus {
    pub node_name: String,
    pub path: String,
    pub major: u32,
    pub minor: u32,
    pub root_partition: String,

    pub wwid: String,
    pub wwid_with_extension: String,
    pub vendor: String,
    pub model: String,
    pub serial: String,
    pub serial_long: String,
    pub uevent_serial: String,
    pub pci_path: String,
    pub dm_name: String,
    pub dm_uuid: String,
    pub md_uuid: String,

    pub filesystem_uuid: String,
    pub uevent_fsuuid: String,
    pub filesystem: String,
    pub partition_num: u32,
    pub partition_uuid: String,
    pub part_table_uuid: String,
    pub part_table_type: String,

    pub total_capacity: u64,
    pub free_capacity: u64,
    pub allocated_capacity: u64,
    pub physical_block_size: u64,
    pub logical_block_size: u64,

    pub mountpoint: String,
    pub mount_options: Vec<String>,
    pub swap_on: bool,
    pub partitioned: bool,
    pub read_only: bool,
    #[serde(rename = "virtual")]
    pub is_virtual: bool,
    pub master: String,

    pub access_tier: AccessTier,
    pub topology: BTreeMap<String, String>,
    pub drive_status: DriveState,
    pub conditions: Conditions,
}

/// The cluster record representing one physical device's managed state.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Drive {
    pub metadata: ObjectMeta,
    pub spec: DriveSpec,
    pub status: DriveStatus,
}

impl Drive {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn state(&self) -> DriveState {
        self.status.drive_status
    }

    pub fn finalizers(&self) -> &Finalizers {
        &self.metadata.finalizers
    }

    pub fn is_managed(&self) -> bool {
        self.status.drive_status.is_managed()
    }

    pub fn is_terminating(&self) -> bool {
        self.status.drive_status == DriveState::Terminating
    }

    /// Apply the labels every drive record carries.
    pub fn set_standard_labels(&mut self) {
        let node = self.status.node_name.clone();
        let path = sanitize_drive_path(&self.status.path);
        let tier = self.status.access_tier.to_string();
        self.metadata.set_label(NODE_LABEL, &node);
        self.metadata.set_label(PATH_LABEL, &path);
        self.metadata.set_label(ACCESS_TIER_LABEL, &tier);
        self.metadata.set_label(VERSION_LABEL, VERSION);
        self.metadata.set_label(CREATED_BY_LABEL, CREATED_BY);
    }

    /// The directory this drive is mounted at once owned.
    pub fn mount_target(&self) -> PathBuf {
        drive_mount_target(&self.status.filesystem_uuid)
    }

    /// The directory older releases mounted this drive at.
    pub fn legacy_mount_target(&self) -> PathBuf {
        legacy_mount_target(&self.status.filesystem_uuid)
    }

    /// True if the recorded mountpoint is the canonical or legacy target.
    pub fn has_valid_mountpoint(&self) -> bool {
        !self.status.filesystem_uuid.is_empty()
            && !self.status.mountpoint.is_empty()
            && (PathBuf::from(&self.status.mountpoint) == self.mount_target()
                || PathBuf::from(&self.status.mountpoint) == self.legacy_mount_target())
    }
}

pub fn drive_mount_target(fsuuid: &str) -> PathBuf {
    [MOUNT_ROOT, fsuuid].iter().collect()
}

pub fn legacy_mount_target(fsuuid: &str) -> PathBuf {
    [LEGACY_APP_ROOT_DIR, "mnt", fsuuid].iter().collect()
}

/// Label values may not contain '/'; the kernel name is used instead of
/// the full device path.
pub fn sanitize_drive_path(path: &str) -> String {
    path.trim_start_matches("/dev/").replace('/', "-")
}
