// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciliation of [`LvmSnapshot`] objects owned by this node.

use crate::backend::VolumeBackend;
use crate::SyncError;
use lvm_common::settings::Settings;
use lvm_common::workqueue::WorkQueue;
use lvm_types::{
    LvmSnapshot, SnapState, NODE_LABEL_KEY, VOLUME_FINALIZER,
};
use lvm_store::SharedStore;
use slog::{debug, info, o, warn, Logger};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub struct SnapshotReconciler {
    log: Logger,
    node_id: String,
    snapshots: SharedStore<LvmSnapshot>,
    backend: Arc<dyn VolumeBackend>,
    queue: Arc<WorkQueue<String>>,
}

impl SnapshotReconciler {
    pub fn new(
        log: &Logger,
        settings: &Settings,
        snapshots: SharedStore<LvmSnapshot>,
        backend: Arc<dyn VolumeBackend>,
    ) -> Arc<SnapshotReconciler> {
        Arc::new(SnapshotReconciler {
            log: log.new(o!("component" => "SnapshotReconciler")),
            node_id: settings.node_id.clone(),
            snapshots,
            backend,
            queue: WorkQueue::new("snapshot"),
        })
    }

    /// Starts the watch pump and the worker. The task runs until aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self: Arc<Self>) {
        match self.snapshots.list().await {
            Ok(snaps) => {
                for snap in &snaps {
                    self.enqueue(snap);
                }
            }
            Err(err) => {
                warn!(self.log, "initial snapshot list failed";
                    "error" => %err);
            }
        }
        tokio::join!(self.event_pump(), self.worker());
    }

    fn enqueue(&self, snap: &LvmSnapshot) {
        if snap.spec.owner_node_id != self.node_id {
            return;
        }
        self.queue.add(snap.metadata.key());
    }

    async fn event_pump(&self) {
        let mut events = self.snapshots.watch();
        loop {
            match events.recv().await {
                Ok(event) => self.enqueue(event.object()),
                Err(RecvError::Lagged(missed)) => {
                    warn!(
                        self.log,
                        "snapshot watch lagged, resyncing";
                        "missed" => missed
                    );
                    if let Ok(snaps) = self.snapshots.list().await {
                        for snap in &snaps {
                            self.enqueue(snap);
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
                        "snapshot sync failed, requeuing";
                        "snapshot" => &key,
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
        let snap = match self.snapshots.get(name).await {
            Ok(snap) => snap,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if snap.spec.owner_node_id != self.node_id {
            return Ok(());
        }
        self.sync_snapshot(snap).await
    }

    async fn sync_snapshot(
        &self,
        mut snap: LvmSnapshot,
    ) -> Result<(), SyncError> {
        if snap.metadata.is_deleting() {
            // On a crash-recovery pass the LV may already be gone; skip
            // straight to releasing the finalizer so lvremove never runs
            // against a missing device.
            if self.backend.snapshot_exists(&snap).await? {
                self.backend.destroy_snapshot(&snap).await?;
                info!(self.log, "destroyed snapshot";
                    "snapshot" => snap.name());
            }
            snap.metadata.remove_finalizer(VOLUME_FINALIZER);
            self.snapshots.update(snap).await?;
            return Ok(());
        }

        match snap.status.state {
            SnapState::Ready => {
                debug!(self.log, "snapshot already provisioned";
                    "snapshot" => snap.name());
                Ok(())
            }
            SnapState::Pending => {
                self.backend.create_snapshot(&snap).await?;
                self.mark_ready(snap).await
            }
        }
    }

    async fn mark_ready(
        &self,
        mut snap: LvmSnapshot,
    ) -> Result<(), SyncError> {
        if snap.metadata.has_finalizer(VOLUME_FINALIZER) {
            return Ok(());
        }
        snap.metadata
            .labels
            .insert(NODE_LABEL_KEY.to_string(), self.node_id.clone());
        snap.metadata.add_finalizer(VOLUME_FINALIZER);
        snap.status.state = SnapState::Ready;
        info!(self.log, "provisioned snapshot";
            "snapshot" => snap.name(),
            "volume" => snap.source_volume().unwrap_or(""));
        self.snapshots.update(snap).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use lvm_common::dev::test_logger;
    use lvm_store::memory::MemStore;
    use lvm_store::Store;
    use lvm_types::{
        ObjectMeta, SnapshotInfo, SOURCE_VOLUME_LABEL_KEY,
    };

    fn pending_snapshot(name: &str, source: &str) -> LvmSnapshot {
        let mut snap = LvmSnapshot {
            metadata: ObjectMeta::new("openebs", name),
            spec: SnapshotInfo {
                owner_node_id: "node-1".to_string(),
                vol_group: "lvmvg".to_string(),
                snap_size: Some("1073741824".to_string()),
            },
            ..Default::default()
        };
        snap.metadata
            .labels
            .insert(SOURCE_VOLUME_LABEL_KEY.to_string(), source.to_string());
        snap
    }

    fn reconciler(
        snapshots: &Arc<MemStore<LvmSnapshot>>,
        backend: &Arc<FakeBackend>,
    ) -> Arc<SnapshotReconciler> {
        SnapshotReconciler::new(
            &test_logger(),
            &Settings::new("openebs", "node-1"),
            Arc::clone(snapshots) as SharedStore<LvmSnapshot>,
            Arc::clone(backend) as Arc<dyn VolumeBackend>,
        )
    }

    #[tokio::test]
    async fn pending_snapshots_are_created_and_marked_ready() {
        let snapshots = Arc::new(MemStore::<LvmSnapshot>::new("openebs"));
        let backend = Arc::new(FakeBackend::new());
        let r = reconciler(&snapshots, &backend);

        snapshots
            .create(pending_snapshot("snapshot-snap1", "pvc-1"))
            .await
            .unwrap();
        r.sync("openebs/snapshot-snap1").await.unwrap();

        let snap = snapshots.get("snapshot-snap1").await.unwrap();
        assert_eq!(snap.status.state, SnapState::Ready);
        assert!(snap.metadata.has_finalizer(VOLUME_FINALIZER));
        // The LV name drops the reserved prefix.
        assert!(backend.has_snapshot("lvmvg", "snap1"));
    }

    #[tokio::test]
    async fn deletion_removes_the_lv_and_the_finalizer() {
        let snapshots = Arc::new(MemStore::<LvmSnapshot>::new("openebs"));
        let backend = Arc::new(FakeBackend::new());
        let r = reconciler(&snapshots, &backend);

        snapshots
            .create(pending_snapshot("snap2", "pvc-1"))
            .await
            .unwrap();
        r.sync("openebs/snap2").await.unwrap();
        assert!(backend.has_snapshot("lvmvg", "snap2"));

        snapshots.delete("snap2").await.unwrap();
        r.sync("openebs/snap2").await.unwrap();

        assert!(!backend.has_snapshot("lvmvg", "snap2"));
        assert!(snapshots.get("snap2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn deleting_an_already_missing_lv_skips_lvremove() {
        let snapshots = Arc::new(MemStore::<LvmSnapshot>::new("openebs"));
        let backend = Arc::new(FakeBackend::new());
        let r = reconciler(&snapshots, &backend);

        // Ready snapshot whose LV the host already lost.
        snapshots
            .create(pending_snapshot("snap3", "pvc-1"))
            .await
            .unwrap();
        r.sync("openebs/snap3").await.unwrap();
        let snap = snapshots.get("snap3").await.unwrap();
        backend.destroy_snapshot(&snap).await.unwrap();

        snapshots.delete("snap3").await.unwrap();
        r.sync("openebs/snap3").await.unwrap();
        assert!(snapshots.get("snap3").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn snapshots_for_other_nodes_are_ignored() {
        let snapshots = Arc::new(MemStore::<LvmSnapshot>::new("openebs"));
        let backend = Arc::new(FakeBackend::new());
        let r = reconciler(&snapshots, &backend);

        let mut snap = pending_snapshot("snap4", "pvc-1");
        snap.spec.owner_node_id = "node-2".to_string();
        snapshots.create(snap).await.unwrap();
        r.sync("openebs/snap4").await.unwrap();

        let snap = snapshots.get("snap4").await.unwrap();
        assert_eq!(snap.status.state, SnapState::Pending);
        assert!(!backend.has_snapshot("lvmvg", "snap4"));
    }
}
