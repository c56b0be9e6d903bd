// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The [`LvmSnapshot`] resource: a point-in-time snapshot of an
//! [`LvmVolume`](crate::volume::LvmVolume).

use crate::meta::ObjectMeta;
use crate::SOURCE_VOLUME_LABEL_KEY;
use serde::{Deserialize, Serialize};

/// Spec of an [`LvmSnapshot`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Node holding the source volume; snapshots are always co-located.
    #[serde(default)]
    pub owner_node_id: String,
    /// Volume group of the source volume.
    #[serde(default)]
    pub vol_group: String,
    /// Snapshot capacity in bytes, base-10 string. Empty for snapshots of
    /// thin volumes, which borrow from the thin pool instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snap_size: Option<String>,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum SnapState {
    #[default]
    Pending,
    Ready,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapStatus {
    #[serde(default)]
    pub state: SnapState,
}

/// A desired snapshot. The source volume is recorded in the
/// `openebs.io/persistent-volume` label; while any snapshot references a
/// volume that volume can neither be resized nor deleted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LvmSnapshot {
    pub metadata: ObjectMeta,
    pub spec: SnapshotInfo,
    #[serde(default)]
    pub status: SnapStatus,
}

impl LvmSnapshot {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Name of the source volume, from the snapshot's label.
    pub fn source_volume(&self) -> Option<&str> {
        self.metadata
            .labels
            .get(SOURCE_VOLUME_LABEL_KEY)
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_volume_comes_from_label() {
        let mut snap = LvmSnapshot::default();
        assert_eq!(snap.source_volume(), None);
        snap.metadata
            .labels
            .insert(SOURCE_VOLUME_LABEL_KEY.to_string(), "pvc-1".to_string());
        assert_eq!(snap.source_volume(), Some("pvc-1"));
    }
}
