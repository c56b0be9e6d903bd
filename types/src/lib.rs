// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed resource model for the LVM driver.
//!
//! These types describe the desired-state objects shared by the
//! cluster-side controller and the per-node agent: [`LvmVolume`],
//! [`LvmSnapshot`] and [`LvmNode`], together with the minimal object
//! metadata (finalizers, owner references, deletion timestamps) that the
//! reconcilers operate on.

pub mod claim;
pub mod csi;
pub mod meta;
pub mod node;
pub mod snapshot;
pub mod volume;

pub use claim::{Claim, ClaimPhase};
pub use meta::{ObjectMeta, OwnerReference};
pub use node::{ClusterNode, LvmNode, VolumeGroup};
pub use snapshot::{LvmSnapshot, SnapState, SnapStatus, SnapshotInfo};
pub use volume::{
    ErrorCode, LvmVolume, RaidConfig, RaidType, VolState, VolStatus,
    VolumeError, VolumeInfo, YesNo,
};

/// Name of the CSI driver; volume IDs handed to the orchestrator are
/// scoped under this name.
pub const DRIVER_NAME: &str = "local.csi.openebs.io";

/// Finalizer held by the node agent on Ready volumes and snapshots. Its
/// presence blocks object deletion until the backing logical volume has
/// been destroyed.
pub const VOLUME_FINALIZER: &str = "lvm.openebs.io/finalizer";

/// Label recording the node that realized an object.
pub const NODE_LABEL_KEY: &str = "kubernetes.io/nodename";

/// Topology key published by `NodeGetInfo`.
pub const TOPOLOGY_KEY: &str = "openebs.io/nodename";

/// Label on an [`LvmSnapshot`] naming its source volume.
pub const SOURCE_VOLUME_LABEL_KEY: &str = "openebs.io/persistent-volume";

/// Volume-context key carrying the resolved volume group name back to the
/// orchestrator.
pub const VOL_GROUP_CONTEXT_KEY: &str = "openebs.io/volgroup";
