// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The controller-side provisioning pipeline.
//!
//! Serves the CSI controller RPCs. Creation runs the full state machine:
//! round the request, bracket the claim with leak protection, schedule a
//! node, record the Pending volume, poll until the owning agent settles
//! it, and either hand back the bound topology or delete the object and
//! report `ResourceExhausted` so the external provisioner retries onto
//! another node. All waits poll at one-second intervals; the transport's
//! deadline bounds them.

use crate::capacity::CapacityView;
use crate::leak::{InFlightGuard, LeakProtector, VolumeCleanup};
use crate::params::{SnapshotParams, VolumeParams};
use crate::scheduler::schedule;
use async_trait::async_trait;
use chrono::Utc;
use lvm_common::capacity::rounded_capacity;
use lvm_types::csi::{
    AccessMode, ControllerCapability, ControllerExpandVolumeRequest,
    ControllerExpandVolumeResponse, CreateSnapshotRequest,
    CreateSnapshotResponse, CreateVolumeRequest, CreateVolumeResponse,
    DeleteSnapshotRequest, DeleteVolumeRequest, GetCapacityRequest,
    GetCapacityResponse, Status, Topology,
    ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse,
    VolumeCapability,
};
use lvm_types::{
    LvmSnapshot, LvmVolume, ObjectMeta, SnapState, SnapshotInfo, VolState,
    VolumeInfo, SOURCE_VOLUME_LABEL_KEY, TOPOLOGY_KEY, VOL_GROUP_CONTEXT_KEY,
};
use lvm_store::{
    wait_until_destroyed, wait_until_processed, SharedStore, Store,
    StoreError,
};
use slog::{info, o, Logger};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Deadline for the volume teardown performed on behalf of a deleted
/// claim.
pub const LEAK_CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
enum DeleteVolumeError {
    #[error("volume {0} has active snapshots")]
    ActiveSnapshots(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Deletes a volume end-to-end: refuse while snapshots pin it, request
/// deletion, then wait for the owning agent to destroy the LV and release
/// the finalizer.
async fn delete_volume_flow(
    volumes: &dyn Store<LvmVolume>,
    snapshots: &dyn Store<LvmSnapshot>,
    volume_id: &str,
) -> Result<(), DeleteVolumeError> {
    let pinned = snapshots
        .list()
        .await?
        .iter()
        .any(|snap| snap.source_volume() == Some(volume_id));
    if pinned {
        return Err(DeleteVolumeError::ActiveSnapshots(volume_id.to_string()));
    }

    match volumes.get(volume_id).await {
        // Already gone: deletion is idempotent.
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) => return Err(err.into()),
        Ok(vol) => {
            if !vol.metadata.is_deleting() {
                volumes.delete(volume_id).await?;
            }
        }
    }

    wait_until_destroyed(volumes, volume_id).await?;
    Ok(())
}

/// The pipeline's volume teardown, packaged for the leak-protection
/// controller.
pub struct VolumeDeleter {
    volumes: SharedStore<LvmVolume>,
    snapshots: SharedStore<LvmSnapshot>,
}

impl VolumeDeleter {
    pub fn new(
        volumes: SharedStore<LvmVolume>,
        snapshots: SharedStore<LvmSnapshot>,
    ) -> Arc<VolumeDeleter> {
        Arc::new(VolumeDeleter { volumes, snapshots })
    }
}

#[async_trait]
impl VolumeCleanup for VolumeDeleter {
    async fn delete_volume(
        &self,
        volume_name: &str,
    ) -> Result<(), StoreError> {
        let flow = delete_volume_flow(
            self.volumes.as_ref(),
            self.snapshots.as_ref(),
            volume_name,
        );
        match tokio::time::timeout(LEAK_CLEANUP_TIMEOUT, flow).await {
            // The agent has not destroyed the LV yet; retry later.
            Err(_) => Err(StoreError::Unavailable(format!(
                "timed out waiting for volume {volume_name} to be destroyed"
            ))),
            Ok(Ok(())) => Ok(()),
            // Snapshots pinning a pre-bind volume take an operator to
            // untangle; surfaced as non-retryable.
            Ok(Err(DeleteVolumeError::ActiveSnapshots(name))) => {
                Err(StoreError::AlreadyExists {
                    kind: "lvmsnapshot",
                    name,
                })
            }
            Ok(Err(DeleteVolumeError::Store(err))) => Err(err),
        }
    }
}

pub struct ControllerService {
    log: Logger,
    volumes: SharedStore<LvmVolume>,
    snapshots: SharedStore<LvmSnapshot>,
    capacity: Arc<CapacityView>,
    leak: Arc<LeakProtector>,
    capabilities: Vec<ControllerCapability>,
}

impl ControllerService {
    pub fn new(
        log: &Logger,
        volumes: SharedStore<LvmVolume>,
        snapshots: SharedStore<LvmSnapshot>,
        capacity: Arc<CapacityView>,
        leak: Arc<LeakProtector>,
    ) -> Arc<ControllerService> {
        Arc::new(ControllerService {
            log: log.new(o!("component" => "ControllerService")),
            volumes,
            snapshots,
            capacity,
            leak,
            capabilities: vec![
                ControllerCapability::CreateDeleteVolume,
                ControllerCapability::ExpandVolume,
                ControllerCapability::CreateDeleteSnapshot,
                ControllerCapability::GetCapacity,
            ],
        })
    }

    pub fn controller_get_capabilities(&self) -> &[ControllerCapability] {
        &self.capabilities
    }

    fn supported_capabilities(caps: &[VolumeCapability]) -> bool {
        caps.iter()
            .all(|cap| cap.access_mode == AccessMode::SingleNodeWriter)
    }

    fn validate_create(req: &CreateVolumeRequest) -> Result<(), Status> {
        if req.name.is_empty() {
            return Err(Status::invalid_argument(
                "failed to handle create volume request: missing volume name",
            ));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "failed to handle create volume request: \
                 missing volume capabilities",
            ));
        }
        if !Self::supported_capabilities(&req.volume_capabilities) {
            return Err(Status::invalid_argument(
                "only SINGLE_NODE_WRITER access mode is supported",
            ));
        }
        if req.content_source.is_some() {
            // Restoring from a snapshot or cloning is not offered.
            return Err(Status::unimplemented());
        }
        Ok(())
    }

    fn volume_response(
        vol: &LvmVolume,
        capacity_bytes: u64,
    ) -> CreateVolumeResponse {
        CreateVolumeResponse {
            volume_id: vol.name().to_string(),
            capacity_bytes: capacity_bytes as i64,
            volume_context: BTreeMap::from([(
                VOL_GROUP_CONTEXT_KEY.to_string(),
                vol.spec.vol_group.clone(),
            )]),
            accessible_topology: vec![Topology {
                segments: BTreeMap::from([(
                    TOPOLOGY_KEY.to_string(),
                    vol.spec.owner_node_id.clone(),
                )]),
            }],
        }
    }

    async fn begin_leak_protection(
        &self,
        volume_id: &str,
        params: &VolumeParams,
    ) -> Result<Option<InFlightGuard>, Status> {
        if params.pvc_name.is_empty() || params.pvc_namespace.is_empty() {
            // The external provisioner was not configured to propagate
            // claim metadata; nothing to bracket.
            return Ok(None);
        }
        let guard = self
            .leak
            .begin_create_volume(
                volume_id,
                &params.pvc_namespace,
                &params.pvc_name,
            )
            .await?;
        Ok(Some(guard))
    }

    async fn candidate_nodes(
        &self,
        req: &CreateVolumeRequest,
    ) -> Result<Vec<lvm_types::LvmNode>, Status> {
        if req.accessibility_requirements.is_empty() {
            return self
                .capacity
                .candidate_nodes(None)
                .await
                .map_err(Status::internal);
        }
        let mut seen = BTreeMap::new();
        for topology in &req.accessibility_requirements {
            let nodes = self
                .capacity
                .candidate_nodes(Some(topology))
                .await
                .map_err(Status::internal)?;
            for node in nodes {
                seen.entry(node.name().to_string()).or_insert(node);
            }
        }
        Ok(seen.into_values().collect())
    }

    pub async fn create_volume(
        &self,
        req: &CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, Status> {
        Self::validate_create(req)?;
        let volume_id = req.name.to_lowercase();
        let params = VolumeParams::parse(&req.parameters)
            .map_err(Status::invalid_argument)?;

        let required = req
            .capacity_range
            .map(|range| range.required_bytes.max(0))
            .unwrap_or(0) as u64;
        let size = rounded_capacity(required);
        let capacity = size.to_string();

        match self.volumes.get(&volume_id).await {
            Ok(vol) if vol.metadata.is_deleting() => {
                // A previous incarnation is still being torn down; let it
                // finish and provision fresh.
                wait_until_destroyed(self.volumes.as_ref(), &volume_id)
                    .await
                    .map_err(Status::aborted)?;
            }
            Ok(vol) => {
                if vol.spec.capacity != capacity {
                    return Err(Status::already_exists(format!(
                        "volume {volume_id} already present with capacity {}",
                        vol.spec.capacity
                    )));
                }
                return Ok(Self::volume_response(&vol, size));
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(Status::internal(err)),
        }

        let _guard = self.begin_leak_protection(&volume_id, &params).await?;

        let candidates = self.candidate_nodes(req).await?;
        let volume_index =
            self.volumes.list().await.map_err(Status::internal)?;
        let order = schedule(
            params.scheduler,
            &params.vg_pattern,
            &candidates,
            &volume_index,
        );
        let Some(selected) = order.first() else {
            return Err(Status::internal(
                "scheduler failed, not able to select a node to create \
                 the PV",
            ));
        };
        info!(self.log, "scheduled volume";
            "volume" => &volume_id,
            "node" => selected,
            "pattern" => params.vg_pattern.as_str()
        );

        let vol = LvmVolume {
            metadata: ObjectMeta::new(self.volumes.namespace(), &volume_id),
            spec: VolumeInfo {
                owner_node_id: selected.clone(),
                // The agent resolves the concrete group from the pattern.
                vol_group: String::new(),
                vg_pattern: params.vg_pattern.as_str().to_string(),
                capacity,
                shared: params.shared,
                thin_provision: params.thin_provision,
                raid: params.raid.clone(),
            },
            status: Default::default(),
        };
        match self.volumes.create(vol).await {
            Ok(_) => {}
            // An external-provisioner retry raced us; wait on the winner.
            Err(StoreError::AlreadyExists { .. }) => {}
            Err(err) => return Err(Status::internal(err)),
        }

        let vol = wait_until_processed(self.volumes.as_ref(), &volume_id)
            .await
            .map_err(Status::aborted)?;
        match vol.status.state {
            VolState::Ready => Ok(Self::volume_response(&vol, size)),
            VolState::Failed => {
                let error = vol.status.error.clone().unwrap_or(
                    lvm_types::VolumeError {
                        code: lvm_types::ErrorCode::Internal,
                        message: "volume failed without a recorded error"
                            .to_string(),
                    },
                );
                if error.code.is_reschedulable() {
                    // Remove the failed placement so the provisioner's
                    // retry lands on a different node.
                    match self.volumes.delete(&volume_id).await {
                        Ok(()) => {}
                        Err(err) if err.is_not_found() => {}
                        Err(err) => return Err(Status::internal(err)),
                    }
                    wait_until_destroyed(self.volumes.as_ref(), &volume_id)
                        .await
                        .map_err(Status::aborted)?;
                    Err(Status::resource_exhausted(error.message))
                } else {
                    Err(Status::aborted(error.message))
                }
            }
            VolState::Pending => Err(Status::internal(
                "wait returned a volume still in Pending",
            )),
        }
    }

    pub async fn delete_volume(
        &self,
        req: &DeleteVolumeRequest,
    ) -> Result<(), Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "failed to handle delete volume request: missing volume id",
            ));
        }
        let volume_id = req.volume_id.to_lowercase();
        info!(self.log, "received request to delete volume";
            "volume" => &volume_id);

        delete_volume_flow(
            self.volumes.as_ref(),
            self.snapshots.as_ref(),
            &volume_id,
        )
        .await
        .map_err(|err| match err {
            DeleteVolumeError::ActiveSnapshots(_) => {
                Status::failed_precondition(err)
            }
            DeleteVolumeError::Store(err) => Status::internal(err),
        })
    }

    pub async fn expand_volume(
        &self,
        req: &ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "ControllerExpandVolume: no volumeID provided",
            ));
        }
        let volume_id = req.volume_id.to_lowercase();
        let required = req
            .capacity_range
            .map(|range| range.required_bytes.max(0))
            .unwrap_or(0) as u64;
        let updated = rounded_capacity(required);

        // Snapshots share extents with their source; growing the source
        // out from under them is refused.
        let pinned = self
            .snapshots
            .list()
            .await
            .map_err(Status::internal)?
            .iter()
            .any(|snap| snap.source_volume() == Some(volume_id.as_str()));
        if pinned {
            return Err(Status::failed_precondition(format!(
                "volume {volume_id} has active snapshots and cannot be \
                 resized"
            )));
        }

        let mut vol =
            self.volumes.get(&volume_id).await.map_err(|err| {
                if err.is_not_found() {
                    Status::not_found(format!(
                        "volume {volume_id} not found"
                    ))
                } else {
                    Status::internal(err)
                }
            })?;
        let current = vol
            .spec
            .capacity_bytes()
            .map_err(|err| Status::internal(err))?;

        if current >= updated {
            return Ok(ControllerExpandVolumeResponse {
                capacity_bytes: current as i64,
                node_expansion_required: false,
            });
        }

        vol.spec.capacity = updated.to_string();
        self.volumes.update(vol).await.map_err(Status::internal)?;
        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: updated as i64,
            node_expansion_required: true,
        })
    }

    pub async fn create_snapshot(
        &self,
        req: &CreateSnapshotRequest,
    ) -> Result<CreateSnapshotResponse, Status> {
        let snap_name = req.name.to_lowercase();
        let source_id = req.source_volume_id.to_lowercase();
        if snap_name.is_empty() || source_id.is_empty() {
            return Err(Status::invalid_argument(format!(
                "CreateSnapshot invalid request {source_id}: {snap_name}"
            )));
        }

        match self.snapshots.get(&snap_name).await {
            Ok(snap) => {
                if snap.source_volume() != Some(source_id.as_str()) {
                    return Err(Status::already_exists(format!(
                        "snapshot {snap_name} already exists for a \
                         different source volume"
                    )));
                }
                return Ok(CreateSnapshotResponse {
                    snapshot_id: format!("{source_id}@{snap_name}"),
                    source_volume_id: source_id,
                    creation_time: Utc::now(),
                    ready_to_use: snap.status.state == SnapState::Ready,
                });
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(Status::internal(err)),
        }

        let vol = self.volumes.get(&source_id).await.map_err(|err| {
            Status::internal(format!(
                "CreateSnapshot not able to get volume {source_id}: {err}"
            ))
        })?;
        let params = SnapshotParams::parse(&req.parameters)
            .map_err(Status::invalid_argument)?;
        let source_capacity = vol
            .spec
            .capacity_bytes()
            .map_err(|err| Status::internal(err))?;

        let snap_size = params
            .snapshot_capacity(
                source_capacity,
                vol.spec.thin_provision.is_yes(),
            )
            .map(|bytes| bytes.to_string());

        let mut snap = LvmSnapshot {
            metadata: ObjectMeta::new(
                self.snapshots.namespace(),
                &snap_name,
            ),
            spec: SnapshotInfo {
                owner_node_id: vol.spec.owner_node_id.clone(),
                vol_group: vol.spec.vol_group.clone(),
                snap_size,
            },
            status: Default::default(),
        };
        snap.metadata
            .labels
            .insert(SOURCE_VOLUME_LABEL_KEY.to_string(), source_id.clone());

        match self.snapshots.create(snap).await {
            Ok(_) => {}
            Err(StoreError::AlreadyExists { .. }) => {}
            Err(err) => return Err(Status::internal(err)),
        }
        info!(self.log, "provisioned snapshot";
            "snapshot" => &snap_name, "volume" => &source_id);

        let ready_to_use = self
            .snapshots
            .get(&snap_name)
            .await
            .map(|snap| snap.status.state == SnapState::Ready)
            .unwrap_or(false);
        Ok(CreateSnapshotResponse {
            snapshot_id: format!("{source_id}@{snap_name}"),
            source_volume_id: source_id,
            creation_time: Utc::now(),
            ready_to_use,
        })
    }

    pub async fn delete_snapshot(
        &self,
        req: &DeleteSnapshotRequest,
    ) -> Result<(), Status> {
        if req.snapshot_id.is_empty() {
            return Err(Status::invalid_argument(
                "DeleteSnapshot: missing snapshot id",
            ));
        }
        // Wire IDs are `<source-volume>@<snapshot-name>`.
        let snap_name = req
            .snapshot_id
            .rsplit_once('@')
            .map(|(_, name)| name)
            .unwrap_or(req.snapshot_id.as_str())
            .to_lowercase();

        match self.snapshots.delete(&snap_name).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(Status::internal(err)),
        }
    }

    pub async fn get_capacity(
        &self,
        req: &GetCapacityRequest,
    ) -> Result<GetCapacityResponse, Status> {
        let params = VolumeParams::parse(&req.parameters)
            .map_err(Status::invalid_argument)?;
        let available_capacity = self
            .capacity
            .available_capacity(
                req.accessible_topology.as_ref(),
                &params.vg_pattern,
            )
            .await
            .map_err(Status::internal)?;
        Ok(GetCapacityResponse { available_capacity })
    }

    pub async fn validate_volume_capabilities(
        &self,
        req: &ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID not provided"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "Volume capabilities not provided",
            ));
        }
        let volume_id = req.volume_id.to_lowercase();
        self.volumes.get(&volume_id).await.map_err(|err| {
            Status::not_found(format!("Get volume failed err {err}"))
        })?;

        let confirmed =
            if Self::supported_capabilities(&req.volume_capabilities) {
                req.volume_capabilities.clone()
            } else {
                Vec::new()
            };
        Ok(ValidateVolumeCapabilitiesResponse { confirmed })
    }

    pub fn list_volumes(&self) -> Result<(), Status> {
        Err(Status::unimplemented())
    }

    pub fn list_snapshots(&self) -> Result<(), Status> {
        Err(Status::unimplemented())
    }

    pub fn controller_publish_volume(&self) -> Result<(), Status> {
        Err(Status::unimplemented())
    }

    pub fn controller_unpublish_volume(&self) -> Result<(), Status> {
        Err(Status::unimplemented())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_single_node_writer_is_supported() {
        let single = vec![VolumeCapability::single_node_writer()];
        assert!(ControllerService::supported_capabilities(&single));

        let multi = vec![VolumeCapability {
            access_mode: AccessMode::MultiNodeMultiWriter,
            fs_type: String::new(),
            mount_flags: Vec::new(),
        }];
        assert!(!ControllerService::supported_capabilities(&multi));
    }

    #[test]
    fn create_requests_are_validated_up_front() {
        let mut req = CreateVolumeRequest::default();
        assert!(ControllerService::validate_create(&req).is_err());

        req.name = "pvc-1".to_string();
        assert!(ControllerService::validate_create(&req).is_err());

        req.volume_capabilities =
            vec![VolumeCapability::single_node_writer()];
        assert!(ControllerService::validate_create(&req).is_ok());

        req.content_source =
            Some(lvm_types::csi::ContentSource::Snapshot("s1".to_string()));
        let err = ControllerService::validate_create(&req).unwrap_err();
        assert_eq!(err.code, lvm_types::csi::Code::Unimplemented);
    }
}
