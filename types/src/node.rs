// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The [`LvmNode`] inventory resource and the volume-group records it
//! carries.

use crate::meta::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One volume group as observed on a host. Enum-ish fields (`permission`,
/// `allocation_policy`) carry the fixed small-integer wire mapping, with
/// `-1` meaning undefined; the mapping tables live with the report decoder
/// in `lvm-utils`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroup {
    pub name: String,
    pub uuid: String,
    /// Total size in bytes.
    pub size: u64,
    /// Unallocated space in bytes.
    pub free: u64,
    pub lv_count: i32,
    pub pv_count: i32,
    /// Maximum number of logical volumes, 0 if unlimited.
    pub max_lv: i32,
    /// Maximum number of physical volumes, 0 if unlimited.
    pub max_pv: i32,
    pub snap_count: i32,
    pub missing_pv_count: i32,
    pub metadata_count: i32,
    pub metadata_used_count: i32,
    /// Size in bytes of the smallest metadata area.
    pub metadata_size: u64,
    /// Free metadata area space in bytes.
    pub metadata_free: u64,
    /// writable=0, read-only=1, undefined=-1.
    pub permission: i32,
    /// normal=0, contiguous=1, cling=2, anywhere=3, inherited=4,
    /// undefined=-1.
    pub allocation_policy: i32,
}

/// Inventory of one host's volume groups, kept current by that host's node
/// reporter and consumed by the scheduler and capacity view.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LvmNode {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub volume_groups: Vec<VolumeGroup>,
}

impl LvmNode {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// Projection of the orchestrator's own Node object: just enough identity
/// and labels for topology filtering and owner references.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub name: String,
    #[serde(default)]
    pub uid: Uuid,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}
