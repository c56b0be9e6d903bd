// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The [`LvmVolume`] resource: desired state for one logical volume.

use crate::meta::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Yes/no toggle used by several spec fields; serialized as the lower-case
/// strings the storage-class parameters use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum YesNo {
    Yes,
    #[default]
    No,
}

impl YesNo {
    pub fn is_yes(self) -> bool {
        matches!(self, YesNo::Yes)
    }
}

impl FromStr for YesNo {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "yes" => Ok(YesNo::Yes),
            "no" | "" => Ok(YesNo::No),
            other => Err(UnknownValue { field: "yes/no", value: other.to_string() }),
        }
    }
}

impl fmt::Display for YesNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            YesNo::Yes => f.write_str("yes"),
            YesNo::No => f.write_str("no"),
        }
    }
}

/// Error for enum fields parsed from free-form input.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("unrecognized {field} value {value:?}")]
pub struct UnknownValue {
    pub field: &'static str,
    pub value: String,
}

/// Logical volume layout requested through the storage class.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RaidType {
    #[default]
    Linear,
    Raid0,
    Raid1,
    Raid5,
    Raid6,
    Raid10,
}

impl FromStr for RaidType {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "linear" | "" => Ok(RaidType::Linear),
            "raid0" => Ok(RaidType::Raid0),
            "raid1" => Ok(RaidType::Raid1),
            "raid5" => Ok(RaidType::Raid5),
            "raid6" => Ok(RaidType::Raid6),
            "raid10" => Ok(RaidType::Raid10),
            other => {
                Err(UnknownValue { field: "raidtype", value: other.to_string() })
            }
        }
    }
}

impl fmt::Display for RaidType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RaidType::Linear => "linear",
            RaidType::Raid0 => "raid0",
            RaidType::Raid1 => "raid1",
            RaidType::Raid5 => "raid5",
            RaidType::Raid6 => "raid6",
            RaidType::Raid10 => "raid10",
        };
        f.write_str(s)
    }
}

/// RAID layout parameters; all zero/no for plain linear volumes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidConfig {
    #[serde(default)]
    pub raid_type: RaidType,
    #[serde(default)]
    pub mirrors: u32,
    #[serde(default)]
    pub stripe_count: u32,
    /// Stripe size in bytes; must be a power of two when set.
    #[serde(default)]
    pub stripe_size: u32,
    #[serde(default)]
    pub no_sync: YesNo,
    #[serde(default)]
    pub integrity: YesNo,
    /// Free-form tokens appended verbatim to `lvcreate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lv_create_options: Option<String>,
}

/// Spec of an [`LvmVolume`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    /// Node that realizes this volume. Immutable once set.
    #[serde(default)]
    pub owner_node_id: String,
    /// Volume group holding the logical volume. Empty until the agent picks
    /// one; immutable afterwards.
    #[serde(default)]
    pub vol_group: String,
    /// Regex the agent matches candidate volume groups against.
    #[serde(default)]
    pub vg_pattern: String,
    /// Requested capacity in bytes, base-10 string. May only grow.
    pub capacity: String,
    /// Whether the volume may be mounted at several paths on its node.
    #[serde(default)]
    pub shared: YesNo,
    /// Whether the volume is carved from the volume group's thin pool.
    #[serde(default)]
    pub thin_provision: YesNo,
    #[serde(default)]
    pub raid: RaidConfig,
}

impl VolumeInfo {
    /// Parses the capacity string. The spec stores capacities as strings to
    /// keep them opaque on the wire; anything unparseable is a structural
    /// bug surfaced by the caller.
    pub fn capacity_bytes(&self) -> Result<u64, std::num::ParseIntError> {
        self.capacity.trim().parse::<u64>()
    }
}

/// Provisioning state of a volume.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum VolState {
    #[default]
    Pending,
    Ready,
    Failed,
}

impl fmt::Display for VolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolState::Pending => "Pending",
            VolState::Ready => "Ready",
            VolState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Classified provisioning failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Internal,
    InsufficientCapacity,
}

impl ErrorCode {
    /// Whether the controller may delete the volume and retry it on another
    /// node. Anything other than an internal failure is worth a new
    /// placement.
    pub fn is_reschedulable(self) -> bool {
        !matches!(self, ErrorCode::Internal)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolStatus {
    #[serde(default)]
    pub state: VolState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VolumeError>,
}

/// A desired logical volume, scheduled onto `spec.owner_node_id` by the
/// controller and realized by that node's agent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LvmVolume {
    pub metadata: ObjectMeta,
    pub spec: VolumeInfo,
    #[serde(default)]
    pub status: VolStatus,
}

impl LvmVolume {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}
