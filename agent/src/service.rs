// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-node CSI service.
//!
//! Publish, unpublish, expand and stats for volumes realized on this
//! host. Mount and filesystem plumbing is an external collaborator behind
//! the [`Mounter`] trait; this layer owns validation, the single-node
//! and shared-mount rules, and the device-path computation. Staging is
//! not part of this driver's contract.

use crate::backend::VolumeBackend;
use camino::{Utf8Path, Utf8PathBuf};
use lvm_common::{iolimit, settings::Settings};
use lvm_types::csi::{
    NodeCapability, NodeExpandVolumeRequest, NodeExpandVolumeResponse,
    NodeGetVolumeStatsRequest, NodeInfo, NodePublishVolumeRequest,
    NodeUnpublishVolumeRequest, Status, Topology, VolumeStats,
};
use lvm_types::{LvmVolume, TOPOLOGY_KEY};
use lvm_store::{ClusterNodeStore, SharedStore};
use lvm_utils::volume::device_mapper_path;
use async_trait::async_trait;
use slog::{debug, info, o, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::Arc;

#[derive(Clone, Debug, thiserror::Error)]
#[error("{operation} failed at {path}: {message}")]
pub struct MountError {
    pub operation: &'static str,
    pub path: Utf8PathBuf,
    pub message: String,
}

/// Mount and filesystem operations, implemented outside this workspace.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Formats (if needed) and mounts `device` at `target`.
    async fn mount(
        &self,
        device: &Utf8Path,
        target: &Utf8Path,
        fs_type: &str,
        mount_flags: &[String],
        read_only: bool,
    ) -> Result<(), MountError>;

    async fn unmount(&self, target: &Utf8Path) -> Result<(), MountError>;

    async fn stats(&self, path: &Utf8Path)
        -> Result<VolumeStats, MountError>;
}

pub struct NodeService {
    log: Logger,
    settings: Settings,
    volumes: SharedStore<LvmVolume>,
    cluster_nodes: Arc<dyn ClusterNodeStore>,
    backend: Arc<dyn VolumeBackend>,
    mounter: Arc<dyn Mounter>,
    /// Targets each volume is currently published at, for the shared-mount
    /// rule.
    published: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

impl NodeService {
    pub fn new(
        log: &Logger,
        settings: &Settings,
        volumes: SharedStore<LvmVolume>,
        cluster_nodes: Arc<dyn ClusterNodeStore>,
        backend: Arc<dyn VolumeBackend>,
        mounter: Arc<dyn Mounter>,
    ) -> NodeService {
        NodeService {
            log: log.new(o!("component" => "NodeService")),
            settings: settings.clone(),
            volumes,
            cluster_nodes,
            backend,
            mounter,
            published: Mutex::new(BTreeMap::new()),
        }
    }

    /// Identity and topology of this host. The driver's own topology key
    /// is always present; additional node labels are mirrored in when
    /// configured via `ALLOWED_TOPOLOGIES`.
    pub async fn node_get_info(&self) -> Result<NodeInfo, Status> {
        let mut segments = BTreeMap::new();
        segments.insert(
            TOPOLOGY_KEY.to_string(),
            self.settings.node_id.clone(),
        );

        if !self.settings.topology_keys.is_empty() {
            if let Ok(node) =
                self.cluster_nodes.get(&self.settings.node_id).await
            {
                for key in &self.settings.topology_keys {
                    if let Some(value) = node.labels.get(key) {
                        segments.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        Ok(NodeInfo {
            node_id: self.settings.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology: Topology { segments },
        })
    }

    pub fn node_get_capabilities(&self) -> Vec<NodeCapability> {
        vec![NodeCapability::GetVolumeStats, NodeCapability::ExpandVolume]
    }

    pub async fn node_publish_volume(
        &self,
        req: &NodePublishVolumeRequest,
    ) -> Result<(), Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("missing volume id"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("missing target path"));
        }
        let volume_id = req.volume_id.to_lowercase();

        let vol = self.volumes.get(&volume_id).await.map_err(|err| {
            if err.is_not_found() {
                Status::not_found(format!("volume {volume_id} not found"))
            } else {
                Status::internal(err)
            }
        })?;
        if vol.spec.owner_node_id != self.settings.node_id {
            return Err(Status::failed_precondition(format!(
                "volume {volume_id} belongs to node {}",
                vol.spec.owner_node_id
            )));
        }

        {
            let published = self.published.lock().unwrap();
            if let Some(targets) = published.get(&volume_id) {
                if targets.contains(&req.target_path) {
                    // Same target again; nothing to do.
                    return Ok(());
                }
                if !vol.spec.shared.is_yes() && !targets.is_empty() {
                    return Err(Status::failed_precondition(format!(
                        "volume {volume_id} is not a shared volume"
                    )));
                }
            }
        }

        let device = device_mapper_path(&vol.spec.vol_group, vol.name());
        self.mounter
            .mount(
                &device,
                Utf8Path::new(&req.target_path),
                &req.fs_type,
                &req.mount_flags,
                req.read_only,
            )
            .await
            .map_err(Status::internal)?;

        if iolimit::io_limits_enabled() {
            // The throttle itself is applied by the runtime integration;
            // record what it should use.
            debug!(self.log, "io limits for published volume";
                "volume" => &volume_id,
                "riops_per_gb" => iolimit::riops_per_gb(&vol.spec.vol_group),
                "wiops_per_gb" => iolimit::wiops_per_gb(&vol.spec.vol_group),
                "rbps_per_gb" => iolimit::rbps_per_gb(&vol.spec.vol_group),
                "wbps_per_gb" => iolimit::wbps_per_gb(&vol.spec.vol_group)
            );
        }

        self.published
            .lock()
            .unwrap()
            .entry(volume_id.clone())
            .or_default()
            .insert(req.target_path.clone());
        info!(self.log, "published volume";
            "volume" => &volume_id, "target" => &req.target_path);
        Ok(())
    }

    pub async fn node_unpublish_volume(
        &self,
        req: &NodeUnpublishVolumeRequest,
    ) -> Result<(), Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("missing volume id"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("missing target path"));
        }
        let volume_id = req.volume_id.to_lowercase();

        self.mounter
            .unmount(Utf8Path::new(&req.target_path))
            .await
            .map_err(Status::internal)?;

        let mut published = self.published.lock().unwrap();
        if let Some(targets) = published.get_mut(&volume_id) {
            targets.remove(&req.target_path);
            if targets.is_empty() {
                published.remove(&volume_id);
            }
        }
        info!(self.log, "unpublished volume";
            "volume" => &volume_id, "target" => &req.target_path);
        Ok(())
    }

    pub async fn node_expand_volume(
        &self,
        req: &NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("missing volume id"));
        }
        let volume_id = req.volume_id.to_lowercase();

        let vol = self.volumes.get(&volume_id).await.map_err(|err| {
            if err.is_not_found() {
                Status::not_found(format!("volume {volume_id} not found"))
            } else {
                Status::internal(err)
            }
        })?;

        // The controller already raised spec.capacity; grow the LV and the
        // filesystem to match.
        self.backend
            .resize_volume(&vol, true)
            .await
            .map_err(Status::internal)?;

        let capacity_bytes = vol
            .spec
            .capacity_bytes()
            .map_err(|err| Status::internal(err))?
            as i64;
        Ok(NodeExpandVolumeResponse { capacity_bytes })
    }

    pub async fn node_get_volume_stats(
        &self,
        req: &NodeGetVolumeStatsRequest,
    ) -> Result<VolumeStats, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("missing volume id"));
        }
        if req.volume_path.is_empty() {
            return Err(Status::invalid_argument("missing volume path"));
        }

        self.mounter
            .stats(Utf8Path::new(&req.volume_path))
            .await
            .map_err(Status::internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use lvm_common::capacity::GIB;
    use lvm_common::dev::test_logger;
    use lvm_store::memory::{MemClusterNodes, MemStore};
    use lvm_store::Store;
    use lvm_types::csi::Code;
    use lvm_types::{ObjectMeta, VolumeInfo, YesNo};

    #[derive(Default)]
    struct FakeMounter {
        mounts: Mutex<BTreeSet<String>>,
    }

    #[async_trait]
    impl Mounter for FakeMounter {
        async fn mount(
            &self,
            _device: &Utf8Path,
            target: &Utf8Path,
            _fs_type: &str,
            _mount_flags: &[String],
            _read_only: bool,
        ) -> Result<(), MountError> {
            self.mounts.lock().unwrap().insert(target.to_string());
            Ok(())
        }

        async fn unmount(
            &self,
            target: &Utf8Path,
        ) -> Result<(), MountError> {
            self.mounts.lock().unwrap().remove(target.as_str());
            Ok(())
        }

        async fn stats(
            &self,
            _path: &Utf8Path,
        ) -> Result<VolumeStats, MountError> {
            Ok(VolumeStats {
                available_bytes: GIB as i64 / 2,
                total_bytes: GIB as i64,
                used_bytes: GIB as i64 / 2,
                ..Default::default()
            })
        }
    }

    struct Harness {
        volumes: Arc<MemStore<LvmVolume>>,
        backend: Arc<FakeBackend>,
        mounter: Arc<FakeMounter>,
        service: NodeService,
    }

    fn harness() -> Harness {
        let volumes = Arc::new(MemStore::<LvmVolume>::new("openebs"));
        let backend = Arc::new(FakeBackend::new());
        backend.add_volume_group("lvmvg", 10 * GIB);
        let mounter = Arc::new(FakeMounter::default());
        let service = NodeService::new(
            &test_logger(),
            &Settings::new("openebs", "node-1"),
            Arc::clone(&volumes) as SharedStore<LvmVolume>,
            Arc::new(MemClusterNodes::new()) as Arc<dyn ClusterNodeStore>,
            Arc::clone(&backend) as Arc<dyn VolumeBackend>,
            Arc::clone(&mounter) as Arc<dyn Mounter>,
        );
        Harness { volumes, backend, mounter, service }
    }

    async fn ready_volume(h: &Harness, name: &str, shared: YesNo) {
        let vol = LvmVolume {
            metadata: ObjectMeta::new("openebs", name),
            spec: VolumeInfo {
                owner_node_id: "node-1".to_string(),
                vol_group: "lvmvg".to_string(),
                capacity: GIB.to_string(),
                shared,
                ..Default::default()
            },
            ..Default::default()
        };
        h.backend.create_volume(&vol).await.unwrap();
        h.volumes.create(vol).await.unwrap();
    }

    fn publish_req(volume: &str, target: &str) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: volume.to_string(),
            target_path: target.to_string(),
            fs_type: "ext4".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn node_info_publishes_the_topology_key() {
        let h = harness();
        let info = h.service.node_get_info().await.unwrap();
        assert_eq!(info.node_id, "node-1");
        assert_eq!(
            info.accessible_topology.segments[TOPOLOGY_KEY],
            "node-1"
        );
    }

    #[tokio::test]
    async fn publish_mounts_the_mapper_device_idempotently() {
        let h = harness();
        ready_volume(&h, "pvc-1", YesNo::No).await;

        let req = publish_req("pvc-1", "/var/lib/kubelet/pods/a/vol");
        h.service.node_publish_volume(&req).await.unwrap();
        h.service.node_publish_volume(&req).await.unwrap();

        let mounts = h.mounter.mounts.lock().unwrap();
        assert_eq!(mounts.len(), 1);
    }

    #[tokio::test]
    async fn unshared_volumes_refuse_a_second_target() {
        let h = harness();
        ready_volume(&h, "pvc-1", YesNo::No).await;

        h.service
            .node_publish_volume(&publish_req("pvc-1", "/target/a"))
            .await
            .unwrap();
        let err = h
            .service
            .node_publish_volume(&publish_req("pvc-1", "/target/b"))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn shared_volumes_mount_at_several_targets() {
        let h = harness();
        ready_volume(&h, "pvc-1", YesNo::Yes).await;

        h.service
            .node_publish_volume(&publish_req("pvc-1", "/target/a"))
            .await
            .unwrap();
        h.service
            .node_publish_volume(&publish_req("pvc-1", "/target/b"))
            .await
            .unwrap();
        assert_eq!(h.mounter.mounts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn volumes_of_other_nodes_are_not_published() {
        let h = harness();
        let mut vol = LvmVolume {
            metadata: ObjectMeta::new("openebs", "pvc-else"),
            ..Default::default()
        };
        vol.spec.owner_node_id = "node-2".to_string();
        h.volumes.create(vol).await.unwrap();

        let err = h
            .service
            .node_publish_volume(&publish_req("pvc-else", "/target/a"))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn unpublish_then_republish_round_trips() {
        let h = harness();
        ready_volume(&h, "pvc-1", YesNo::No).await;
        let req = publish_req("pvc-1", "/target/a");

        h.service.node_publish_volume(&req).await.unwrap();
        h.service
            .node_unpublish_volume(&NodeUnpublishVolumeRequest {
                volume_id: "pvc-1".to_string(),
                target_path: "/target/a".to_string(),
            })
            .await
            .unwrap();
        assert!(h.mounter.mounts.lock().unwrap().is_empty());

        // A fresh target is accepted after the unpublish.
        h.service
            .node_publish_volume(&publish_req("pvc-1", "/target/b"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expand_reports_the_spec_capacity() {
        let h = harness();
        ready_volume(&h, "pvc-1", YesNo::No).await;

        let resp = h
            .service
            .node_expand_volume(&NodeExpandVolumeRequest {
                volume_id: "pvc-1".to_string(),
                volume_path: "/target/a".to_string(),
                capacity_range: None,
            })
            .await
            .unwrap();
        assert_eq!(resp.capacity_bytes, GIB as i64);
    }

    #[tokio::test]
    async fn stats_come_from_the_mounter() {
        let h = harness();
        ready_volume(&h, "pvc-1", YesNo::No).await;

        let stats = h
            .service
            .node_get_volume_stats(&NodeGetVolumeStatsRequest {
                volume_id: "pvc-1".to_string(),
                volume_path: "/target/a".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(stats.total_bytes, GIB as i64);
    }
}
