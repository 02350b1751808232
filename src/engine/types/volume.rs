// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use chrono::{DateTime, Utc};

use crate::engine::types::meta::ObjectMeta;

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, strum_macros::Display)]
pub enum VolumeConditionKind {
    Published,
    Staged,
    Ready,
}

impl VolumeConditionKind {
    fn index(self) -> usize {
        match self {
            VolumeConditionKind::Published => 0,
            VolumeConditionKind::Staged => 1,
            VolumeConditionKind::Ready => 2,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCondition {
    #[serde(rename = "type")]
    pub kind: VolumeConditionKind,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(from = "Vec<VolumeCondition>", into = "Vec<VolumeCondition>")]
pub struct VolumeConditions([VolumeCondition; 3]);

impl Default for VolumeConditions {
    fn default() -> VolumeConditions {
        let now = Utc::now();
        let make = |kind, status| VolumeCondition {
            kind,
            status,
            reason: String::new(),
            message: String::new(),
            last_transition_time: now,
        };
        VolumeConditions([
            make(VolumeConditionKind::Published, false),
            make(VolumeConditionKind::Staged, false),
            make(VolumeConditionKind::Ready, true),
        ])
    }
}

impl From<Vec<VolumeCondition>> for VolumeConditions {
    fn from(list: Vec<VolumeCondition>) -> VolumeConditions {
        let mut conditions = VolumeConditions::default();
        for condition in list {
            let index = condition.kind.index();
            conditions.0[index] = condition;
        }
        conditions
    }
}

impl From<VolumeConditions> for Vec<VolumeCondition> {
    fn from(conditions: VolumeConditions) -> Vec<VolumeCondition> {
        conditions.0.into_iter().collect()
    }
}

impl VolumeConditions {
    pub fn get(&self, kind: VolumeConditionKind) -> &VolumeCondition {
        &self.0[kind.index()]
    }

    pub fn set(&mut self, kind: VolumeConditionKind, status: bool, reason: &str, message: &str) {
        let condition = &mut self.0[kind.index()];
        if condition.status != status {
            condition.last_transition_time = Utc::now();
        }
        condition.status = status;
        condition.reason = reason.to_owned();
        condition.message = message.to_owned();
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumeStatus {
    pub node_name: String,
    pub drive_name: String,
    pub host_path: String,
    pub staging_path: String,
    pub container_path: String,
    pub total_capacity: u64,
    pub available_capacity: u64,
    pub used_capacity: u64,
    pub conditions: VolumeConditions,
}

/// A volume carved out of a drive. Only the fields the node agent reads
/// or writes are modelled.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Volume {
    pub metadata: ObjectMeta,
    pub status: VolumeStatus,
}

impl Volume {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}
