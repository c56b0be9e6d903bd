// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transport-free CSI surface types.
//!
//! The controller and node services speak these typed requests and
//! responses; the gRPC transport that carries them over the driver's Unix
//! socket is an external collaborator and marshals to and from these
//! shapes at the edge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// RPC status codes surfaced to the orchestrator's sidecars.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Code {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    ResourceExhausted,
    Aborted,
    DeadlineExceeded,
    Unimplemented,
    Unavailable,
    Internal,
}

/// A terminal RPC error: a status code plus a human-readable message.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl fmt::Display) -> Status {
        Status { code, message: message.to_string() }
    }

    pub fn invalid_argument(message: impl fmt::Display) -> Status {
        Status::new(Code::InvalidArgument, message)
    }

    pub fn not_found(message: impl fmt::Display) -> Status {
        Status::new(Code::NotFound, message)
    }

    pub fn already_exists(message: impl fmt::Display) -> Status {
        Status::new(Code::AlreadyExists, message)
    }

    pub fn failed_precondition(message: impl fmt::Display) -> Status {
        Status::new(Code::FailedPrecondition, message)
    }

    pub fn resource_exhausted(message: impl fmt::Display) -> Status {
        Status::new(Code::ResourceExhausted, message)
    }

    pub fn aborted(message: impl fmt::Display) -> Status {
        Status::new(Code::Aborted, message)
    }

    pub fn deadline_exceeded(message: impl fmt::Display) -> Status {
        Status::new(Code::DeadlineExceeded, message)
    }

    pub fn unimplemented() -> Status {
        Status::new(Code::Unimplemented, "not implemented")
    }

    pub fn internal(message: impl fmt::Display) -> Status {
        Status::new(Code::Internal, message)
    }
}

/// Topology constraint expressed as key-value segments.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub segments: BTreeMap<String, String>,
}

/// How a volume may be attached and used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

/// Capability requested for a volume: an access mode plus mount hints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    #[serde(default)]
    pub fs_type: String,
    #[serde(default)]
    pub mount_flags: Vec<String>,
}

impl VolumeCapability {
    pub fn single_node_writer() -> VolumeCapability {
        VolumeCapability {
            access_mode: AccessMode::SingleNodeWriter,
            fs_type: String::new(),
            mount_flags: Vec::new(),
        }
    }
}

/// Requested capacity window, in bytes.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct CapacityRange {
    pub required_bytes: i64,
    #[serde(default)]
    pub limit_bytes: i64,
}

/// Source to pre-populate a new volume from. Neither form is supported by
/// this driver; requests carrying one fail `Unimplemented`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentSource {
    Snapshot(String),
    Volume(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage-class parameters plus the metadata keys the external
    /// provisioner propagates (`csi.storage.k8s.io/pvc/...`).
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    pub content_source: Option<ContentSource>,
    /// Topology segments the volume must be accessible from; empty means
    /// any node.
    #[serde(default)]
    pub accessibility_requirements: Vec<Topology>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolumeResponse {
    pub volume_id: String,
    pub capacity_bytes: i64,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ControllerExpandVolumeRequest {
    pub volume_id: String,
    pub capacity_range: Option<CapacityRange>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerExpandVolumeResponse {
    pub capacity_bytes: i64,
    pub node_expansion_required: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub name: String,
    pub source_volume_id: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSnapshotResponse {
    /// `<source-volume>@<snapshot-name>`.
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub creation_time: DateTime<Utc>,
    pub ready_to_use: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeleteSnapshotRequest {
    pub snapshot_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetCapacityRequest {
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    pub accessible_topology: Option<Topology>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCapacityResponse {
    /// Largest single volume that can currently be provisioned in the
    /// addressed segment, in bytes.
    pub available_capacity: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: String,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesResponse {
    /// The capabilities echoed back when all of them are supported; empty
    /// otherwise.
    pub confirmed: Vec<VolumeCapability>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    ExpandVolume,
    CreateDeleteSnapshot,
    GetCapacity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeCapability {
    GetVolumeStats,
    ExpandVolume,
}

/// Identity and topology of the node service's host.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    /// 0 means no published limit.
    pub max_volumes_per_node: i64,
    pub accessible_topology: Topology,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    pub volume_id: String,
    pub target_path: String,
    pub fs_type: String,
    #[serde(default)]
    pub mount_flags: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: String,
    pub target_path: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeExpandVolumeRequest {
    pub volume_id: String,
    pub volume_path: String,
    pub capacity_range: Option<CapacityRange>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExpandVolumeResponse {
    pub capacity_bytes: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeGetVolumeStatsRequest {
    pub volume_id: String,
    pub volume_path: String,
}

/// Filesystem usage of a published volume.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct VolumeStats {
    pub available_bytes: i64,
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub available_inodes: i64,
    pub total_inodes: i64,
    pub used_inodes: i64,
}
