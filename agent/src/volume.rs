// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciliation of [`LvmVolume`] objects owned by this node.
//!
//! The controller writes Spec and requests deletion; this loop owns
//! Status, the `node` label and the Ready-state finalizer, and it is the
//! only writer of those fields. Creation happens only after the object is
//! observed; destruction only after the object is marked for deletion with
//! the finalizer still present.

use crate::backend::{BackendError, VolumeBackend};
use crate::SyncError;
use lvm_common::settings::Settings;
use lvm_common::workqueue::WorkQueue;
use lvm_types::{
    LvmVolume, VolState, VolumeError, NODE_LABEL_KEY, VOLUME_FINALIZER,
};
use lvm_store::SharedStore;
use regex::Regex;
use slog::{debug, info, o, warn, Logger};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub struct VolumeReconciler {
    log: Logger,
    node_id: String,
    volumes: SharedStore<LvmVolume>,
    backend: Arc<dyn VolumeBackend>,
    queue: Arc<WorkQueue<String>>,
}

impl VolumeReconciler {
    pub fn new(
        log: &Logger,
        settings: &Settings,
        volumes: SharedStore<LvmVolume>,
        backend: Arc<dyn VolumeBackend>,
    ) -> Arc<VolumeReconciler> {
        Arc::new(VolumeReconciler {
            log: log.new(o!("component" => "VolumeReconciler")),
            node_id: settings.node_id.clone(),
            volumes,
            backend,
            queue: WorkQueue::new("volume"),
        })
    }

    /// Starts the watch pump and the worker. The task runs until aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self: Arc<Self>) {
        // Replay the current state before watching, the way an informer
        // syncs its cache before handlers run.
        match self.volumes.list().await {
            Ok(volumes) => {
                for vol in &volumes {
                    self.enqueue(vol);
                }
            }
            Err(err) => {
                warn!(self.log, "initial volume list failed"; "error" => %err);
            }
        }
        tokio::join!(self.event_pump(), self.worker());
    }

    /// Drops events for other nodes before they reach the queue.
    fn enqueue(&self, vol: &LvmVolume) {
        if vol.spec.owner_node_id != self.node_id {
            return;
        }
        self.queue.add(vol.metadata.key());
    }

    async fn event_pump(&self) {
        let mut events = self.volumes.watch();
        loop {
            match events.recv().await {
                Ok(event) => self.enqueue(event.object()),
                Err(RecvError::Lagged(missed)) => {
                    // Dropped events; resync everything we own.
                    warn!(
                        self.log,
                        "volume watch lagged, resyncing";
                        "missed" => missed
                    );
                    if let Ok(volumes) = self.volumes.list().await {
                        for vol in &volumes {
                            self.enqueue(vol);
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn worker(&self) {
        while let Some(key) = self.queue.next().await {
            match self.sync(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(err) => {
                    warn!(
                        self.log,
                        "volume sync failed, requeuing";
                        "volume" => &key,
                        "error" => %err
                    );
                    WorkQueue::requeue_rate_limited(&self.queue, key.clone());
                }
            }
            self.queue.done(&key);
        }
    }

    async fn sync(&self, key: &str) -> Result<(), SyncError> {
        let name = key.rsplit_once('/').map(|(_, n)| n).unwrap_or(key);
        let vol = match self.volumes.get(name).await {
            Ok(vol) => vol,
            // Already gone; nothing to converge.
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if vol.spec.owner_node_id != self.node_id {
            return Ok(());
        }
        self.sync_volume(vol).await
    }

    async fn sync_volume(&self, mut vol: LvmVolume) -> Result<(), SyncError> {
        if vol.metadata.is_deleting() {
            self.backend.destroy_volume(&vol).await?;
            info!(self.log, "destroyed volume"; "volume" => vol.name());
            // The LV is confirmed gone; releasing the finalizer lets the
            // object finish deleting.
            vol.metadata.remove_finalizer(VOLUME_FINALIZER);
            self.volumes.update(vol).await?;
            return Ok(());
        }

        match vol.status.state {
            VolState::Ready => {
                debug!(self.log, "volume already provisioned";
                    "volume" => vol.name());
                Ok(())
            }
            VolState::Failed => {
                // The controller owns rescheduling of failed volumes.
                warn!(
                    self.log,
                    "skipping volume already in failed state";
                    "volume" => vol.name(),
                    "error" => ?vol.status.error
                );
                Ok(())
            }
            VolState::Pending => self.provision(vol).await,
        }
    }

    async fn provision(&self, mut vol: LvmVolume) -> Result<(), SyncError> {
        // A volume group persisted by an earlier pass means a create may
        // already be underway on it; stick with it.
        if !vol.spec.vol_group.is_empty() {
            return match self.backend.create_volume(&vol).await {
                Ok(()) => self.mark_ready(vol).await,
                Err(err) => self.mark_failed(vol, err).await,
            };
        }

        let pattern = vol.spec.vg_pattern.clone();
        let re = match Regex::new(&pattern) {
            Ok(re) => re,
            Err(err) => {
                let err = BackendError::internal(format!(
                    "invalid vg pattern {pattern:?}: {err}"
                ));
                return self.mark_failed(vol, err).await;
            }
        };
        let capacity = match vol.spec.capacity_bytes() {
            Ok(capacity) => capacity,
            Err(err) => {
                let err = BackendError::internal(format!(
                    "invalid capacity {:?}: {err}",
                    vol.spec.capacity
                ));
                return self.mark_failed(vol, err).await;
            }
        };

        let groups = self.backend.list_volume_groups(true).await?;
        let mut candidates: Vec<_> = groups
            .into_iter()
            .filter(|vg| re.is_match(&vg.name))
            // Thin volumes overcommit the pool, so they skip the free
            // space filter.
            .filter(|vg| {
                vol.spec.thin_provision.is_yes() || vg.free >= capacity
            })
            .collect();
        // Smallest fit first, to limit fragmentation of the larger groups.
        candidates.sort_by_key(|vg| vg.free);

        if candidates.is_empty() {
            let err = BackendError::insufficient_capacity(format!(
                "no vg available to serve volume request having \
                 regex={pattern:?} & capacity={capacity}"
            ));
            return self.mark_failed(vol, err).await;
        }

        let mut last_err = None;
        for vg in candidates {
            // Persist the chosen group before creating so a crash between
            // the two steps is recovered onto the same group.
            vol.spec.vol_group = vg.name.clone();
            vol = self.volumes.update(vol).await?;
            match self.backend.create_volume(&vol).await {
                Ok(()) => return self.mark_ready(vol).await,
                Err(err) => {
                    warn!(
                        self.log,
                        "volume creation failed, trying next vg";
                        "volume" => vol.name(),
                        "vg" => &vg.name,
                        "error" => %err
                    );
                    last_err = Some(err);
                }
            }
        }

        let err = last_err.expect("candidate list was non-empty");
        self.mark_failed(vol, err).await
    }

    async fn mark_ready(&self, mut vol: LvmVolume) -> Result<(), SyncError> {
        if vol.metadata.has_finalizer(VOLUME_FINALIZER) {
            return Ok(());
        }
        vol.metadata
            .labels
            .insert(NODE_LABEL_KEY.to_string(), self.node_id.clone());
        // The finalizer rides the transition to Ready and nothing else;
        // Pending and Failed volumes stay freely deletable.
        vol.metadata.add_finalizer(VOLUME_FINALIZER);
        vol.status.state = VolState::Ready;
        vol.status.error = None;
        info!(self.log, "provisioned volume";
            "volume" => vol.name(), "vg" => &vol.spec.vol_group);
        self.volumes.update(vol).await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        mut vol: LvmVolume,
        err: BackendError,
    ) -> Result<(), SyncError> {
        warn!(self.log, "volume provisioning failed";
            "volume" => vol.name(), "error" => %err);
        vol.status.state = VolState::Failed;
        vol.status.error =
            Some(VolumeError { code: err.code, message: err.message });
        self.volumes.update(vol).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use lvm_common::capacity::GIB;
    use lvm_common::dev::{test_logger, wait_for};
    use lvm_store::memory::MemStore;
    use lvm_store::Store;
    use lvm_types::{ErrorCode, ObjectMeta, VolumeInfo, YesNo};
    use std::time::Duration;

    fn pending_volume(name: &str, capacity: u64, pattern: &str) -> LvmVolume {
        LvmVolume {
            metadata: ObjectMeta::new("openebs", name),
            spec: VolumeInfo {
                owner_node_id: "node-1".to_string(),
                vg_pattern: pattern.to_string(),
                capacity: capacity.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn reconciler(
        volumes: &Arc<MemStore<LvmVolume>>,
        backend: &Arc<FakeBackend>,
    ) -> Arc<VolumeReconciler> {
        VolumeReconciler::new(
            &test_logger(),
            &Settings::new("openebs", "node-1"),
            Arc::clone(volumes) as SharedStore<LvmVolume>,
            Arc::clone(backend) as Arc<dyn VolumeBackend>,
        )
    }

    #[tokio::test]
    async fn provisioning_picks_the_smallest_fitting_vg() {
        let volumes = Arc::new(MemStore::<LvmVolume>::new("openebs"));
        let backend = Arc::new(FakeBackend::new());
        backend.add_volume_group("vg-large", 10 * GIB);
        backend.add_volume_group("vg-small", 2 * GIB);
        backend.add_volume_group("other", 100 * GIB);
        let r = reconciler(&volumes, &backend);

        volumes
            .create(pending_volume("pvc-1", GIB, "^vg-"))
            .await
            .unwrap();
        r.sync("openebs/pvc-1").await.unwrap();

        let vol = volumes.get("pvc-1").await.unwrap();
        assert_eq!(vol.spec.vol_group, "vg-small");
        assert_eq!(vol.status.state, VolState::Ready);
        assert!(vol.metadata.has_finalizer(VOLUME_FINALIZER));
        assert_eq!(vol.metadata.labels[NODE_LABEL_KEY], "node-1");
        assert!(backend.has_volume("vg-small", "pvc-1"));
    }

    #[tokio::test]
    async fn thin_volumes_skip_the_capacity_filter() {
        let volumes = Arc::new(MemStore::<LvmVolume>::new("openebs"));
        let backend = Arc::new(FakeBackend::new());
        backend.add_volume_group("vg-thin", GIB);
        let r = reconciler(&volumes, &backend);

        let mut vol = pending_volume("pvc-1", 8 * GIB, "^vg-thin$");
        vol.spec.thin_provision = YesNo::Yes;
        volumes.create(vol).await.unwrap();
        r.sync("openebs/pvc-1").await.unwrap();

        let vol = volumes.get("pvc-1").await.unwrap();
        assert_eq!(vol.status.state, VolState::Ready);
        assert_eq!(vol.spec.vol_group, "vg-thin");
    }

    #[tokio::test]
    async fn no_fitting_vg_fails_with_insufficient_capacity() {
        let volumes = Arc::new(MemStore::<LvmVolume>::new("openebs"));
        let backend = Arc::new(FakeBackend::new());
        backend.add_volume_group("vg-small", GIB / 2);
        let r = reconciler(&volumes, &backend);

        volumes
            .create(pending_volume("pvc-1", 8 * GIB, "^vg-"))
            .await
            .unwrap();
        r.sync("openebs/pvc-1").await.unwrap();

        let vol = volumes.get("pvc-1").await.unwrap();
        assert_eq!(vol.status.state, VolState::Failed);
        let error = vol.status.error.unwrap();
        assert_eq!(error.code, ErrorCode::InsufficientCapacity);
        // Failed volumes stay freely deletable for rescheduling.
        assert!(vol.metadata.finalizers.is_empty());
    }

    #[tokio::test]
    async fn creation_failure_falls_through_to_the_next_vg() {
        let volumes = Arc::new(MemStore::<LvmVolume>::new("openebs"));
        let backend = Arc::new(FakeBackend::new());
        backend.add_volume_group("vg-a", 2 * GIB);
        backend.add_volume_group("vg-b", 10 * GIB);
        let r = reconciler(&volumes, &backend);

        volumes
            .create(pending_volume("pvc-1", GIB, "^vg-"))
            .await
            .unwrap();
        backend.fail_next_create(BackendError::insufficient_capacity(
            "vg-a filled up behind our back",
        ));
        r.sync("openebs/pvc-1").await.unwrap();

        let vol = volumes.get("pvc-1").await.unwrap();
        assert_eq!(vol.status.state, VolState::Ready);
        assert_eq!(vol.spec.vol_group, "vg-b");
    }

    #[tokio::test]
    async fn persisted_vol_group_is_reused_after_a_crash() {
        let volumes = Arc::new(MemStore::<LvmVolume>::new("openebs"));
        let backend = Arc::new(FakeBackend::new());
        backend.add_volume_group("vg-a", 2 * GIB);
        backend.add_volume_group("vg-b", 10 * GIB);
        let r = reconciler(&volumes, &backend);

        let mut vol = pending_volume("pvc-1", GIB, "^vg-");
        vol.spec.vol_group = "vg-b".to_string();
        volumes.create(vol).await.unwrap();
        r.sync("openebs/pvc-1").await.unwrap();

        let vol = volumes.get("pvc-1").await.unwrap();
        assert_eq!(vol.spec.vol_group, "vg-b");
        assert_eq!(vol.status.state, VolState::Ready);
    }

    #[tokio::test]
    async fn deletion_destroys_the_lv_then_releases_the_finalizer() {
        let volumes = Arc::new(MemStore::<LvmVolume>::new("openebs"));
        let backend = Arc::new(FakeBackend::new());
        backend.add_volume_group("vg-a", 10 * GIB);
        let r = reconciler(&volumes, &backend);

        volumes
            .create(pending_volume("pvc-1", GIB, "^vg-"))
            .await
            .unwrap();
        r.sync("openebs/pvc-1").await.unwrap();
        assert!(backend.has_volume("vg-a", "pvc-1"));

        volumes.delete("pvc-1").await.unwrap();
        r.sync("openebs/pvc-1").await.unwrap();

        assert!(!backend.has_volume("vg-a", "pvc-1"));
        assert!(volumes.get("pvc-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn watch_driven_loop_converges_owned_volumes_only() {
        let volumes = Arc::new(MemStore::<LvmVolume>::new("openebs"));
        let backend = Arc::new(FakeBackend::new());
        backend.add_volume_group("vg-a", 10 * GIB);
        let r = reconciler(&volumes, &backend);
        let handle = r.spawn();

        volumes
            .create(pending_volume("pvc-owned", GIB, "^vg-"))
            .await
            .unwrap();
        let mut foreign = pending_volume("pvc-foreign", GIB, "^vg-");
        foreign.spec.owner_node_id = "node-2".to_string();
        volumes.create(foreign).await.unwrap();

        wait_for("owned volume to become ready", Duration::from_secs(5), || {
            let volumes = Arc::clone(&volumes);
            async move {
                volumes.get("pvc-owned").await.unwrap().status.state
                    == VolState::Ready
            }
        })
        .await;

        let foreign = volumes.get("pvc-foreign").await.unwrap();
        assert_eq!(foreign.status.state, VolState::Pending);
        handle.abort();
    }
}
