// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The node reporter: single writer of this host's [`LvmNode`] inventory.
//!
//! Scans the local volume groups on a timer (and on watch events for the
//! object itself) and writes through whenever the observed inventory or
//! the owner reference drifts from what is stored. The scheduler and the
//! controller's capacity view consume what this loop publishes.

use crate::backend::VolumeBackend;
use crate::SyncError;
use lvm_common::settings::Settings;
use lvm_common::workqueue::WorkQueue;
use lvm_types::{LvmNode, ObjectMeta, OwnerReference};
use lvm_store::{ClusterNodeStore, SharedStore, StoreError};
use slog::{info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// How often the host's volume groups are rescanned.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct NodeReporter {
    log: Logger,
    namespace: String,
    node_id: String,
    nodes: SharedStore<LvmNode>,
    cluster_nodes: Arc<dyn ClusterNodeStore>,
    backend: Arc<dyn VolumeBackend>,
    queue: Arc<WorkQueue<String>>,
    poll_interval: Duration,
}

impl NodeReporter {
    pub fn new(
        log: &Logger,
        settings: &Settings,
        nodes: SharedStore<LvmNode>,
        cluster_nodes: Arc<dyn ClusterNodeStore>,
        backend: Arc<dyn VolumeBackend>,
        poll_interval: Duration,
    ) -> Arc<NodeReporter> {
        Arc::new(NodeReporter {
            log: log.new(o!("component" => "NodeReporter")),
            namespace: settings.namespace.clone(),
            node_id: settings.node_id.clone(),
            nodes,
            cluster_nodes,
            backend,
            queue: WorkQueue::new("node"),
            poll_interval,
        })
    }

    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.node_id)
    }

    /// Starts the ticker, watch pump and worker. Runs until aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self: Arc<Self>) {
        tokio::join!(self.ticker(), self.event_pump(), self.worker());
    }

    async fn ticker(&self) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval
            .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.queue.add(self.key());
        }
    }

    fn enqueue(&self, node: &LvmNode) {
        // Acting on another host's object would make two writers of one
        // inventory.
        if node.metadata.namespace != self.namespace
            || node.metadata.name != self.node_id
        {
            warn!(self.log, "skipping lvm node object";
                "node" => node.metadata.key());
            return;
        }
        self.queue.add(node.metadata.key());
    }

    async fn event_pump(&self) {
        let mut events = self.nodes.watch();
        loop {
            match events.recv().await {
                Ok(event) => self.enqueue(event.object()),
                Err(RecvError::Lagged(_)) => self.queue.add(self.key()),
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
                        "node sync failed, requeuing";
                        "node" => &key,
                        "error" => %err
                    );
                    WorkQueue::requeue_rate_limited(&self.queue, key.clone());
                }
            }
            self.queue.done(&key);
        }
    }

    async fn sync(&self, key: &str) -> Result<(), SyncError> {
        let (namespace, name) = key.rsplit_once('/').unwrap_or(("", key));
        if namespace != self.namespace || name != self.node_id {
            return Ok(());
        }

        let volume_groups = self.backend.list_volume_groups(true).await?;

        let required_ref = self.owner_reference().await?;
        let node = match self.nodes.get(name).await {
            Ok(node) => Some(node),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        };

        let Some(mut node) = node else {
            let node = LvmNode {
                metadata: ObjectMeta {
                    owner_references: vec![required_ref],
                    ..ObjectMeta::new(&self.namespace, &self.node_id)
                },
                volume_groups,
            };
            match self.nodes.create(node).await {
                Ok(_) => {
                    info!(self.log, "created lvm node inventory";
                        "node" => &self.node_id);
                    return Ok(());
                }
                // Lost the creation race; the update path picks it up on
                // the next tick.
                Err(StoreError::AlreadyExists { .. }) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        };

        let mut update_required = ensure_owner_reference(
            &mut node.metadata.owner_references,
            &required_ref,
        );
        if node.volume_groups != volume_groups {
            node.volume_groups = volume_groups;
            update_required = true;
        }
        if !update_required {
            return Ok(());
        }

        info!(self.log, "updating lvm node inventory";
            "node" => &self.node_id);
        self.nodes.update(node).await?;
        Ok(())
    }

    /// Owner reference pointing at the orchestrator's Node of the same
    /// name, so removing the node from the cluster removes the inventory.
    async fn owner_reference(&self) -> Result<OwnerReference, SyncError> {
        let cluster_node = self.cluster_nodes.get(&self.node_id).await?;
        Ok(OwnerReference {
            name: cluster_node.name,
            uid: cluster_node.uid,
            controller: true,
        })
    }
}

/// Makes sure `refs` carries `required` with the controller flag set.
/// Returns whether anything changed.
fn ensure_owner_reference(
    refs: &mut Vec<OwnerReference>,
    required: &OwnerReference,
) -> bool {
    for existing in refs.iter_mut() {
        if existing.uid != required.uid {
            continue;
        }
        if existing.controller != required.controller {
            existing.controller = required.controller;
            return true;
        }
        return false;
    }
    refs.push(required.clone());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use lvm_common::capacity::GIB;
    use lvm_common::dev::test_logger;
    use lvm_store::memory::{MemClusterNodes, MemStore};
    use lvm_store::Store;
    use lvm_types::ClusterNode;
    use uuid::Uuid;

    struct Harness {
        nodes: Arc<MemStore<LvmNode>>,
        cluster: Arc<MemClusterNodes>,
        backend: Arc<FakeBackend>,
        reporter: Arc<NodeReporter>,
    }

    fn harness() -> Harness {
        let nodes = Arc::new(MemStore::<LvmNode>::new("openebs"));
        let cluster = Arc::new(MemClusterNodes::new());
        cluster.upsert(ClusterNode {
            name: "node-1".to_string(),
            uid: Uuid::new_v4(),
            ..Default::default()
        });
        let backend = Arc::new(FakeBackend::new());
        backend.add_volume_group("lvmvg", 10 * GIB);
        let reporter = NodeReporter::new(
            &test_logger(),
            &Settings::new("openebs", "node-1"),
            Arc::clone(&nodes) as SharedStore<LvmNode>,
            Arc::clone(&cluster) as Arc<dyn ClusterNodeStore>,
            Arc::clone(&backend) as Arc<dyn VolumeBackend>,
            DEFAULT_POLL_INTERVAL,
        );
        Harness { nodes, cluster, backend, reporter }
    }

    #[tokio::test]
    async fn first_scan_creates_the_inventory_with_an_owner_reference() {
        let h = harness();
        h.reporter.sync("openebs/node-1").await.unwrap();

        let node = h.nodes.get("node-1").await.unwrap();
        assert_eq!(node.volume_groups.len(), 1);
        assert_eq!(node.volume_groups[0].name, "lvmvg");
        let owner = &node.metadata.owner_references[0];
        assert_eq!(owner.name, "node-1");
        assert!(owner.controller);
    }

    #[tokio::test]
    async fn rescan_writes_through_only_on_diff() {
        let h = harness();
        h.reporter.sync("openebs/node-1").await.unwrap();
        let before = h.nodes.get("node-1").await.unwrap();

        // Nothing changed on the host; no write.
        h.reporter.sync("openebs/node-1").await.unwrap();
        let unchanged = h.nodes.get("node-1").await.unwrap();
        assert_eq!(unchanged.metadata.generation, before.metadata.generation);

        // Free space shifted; the inventory follows.
        h.backend.add_volume_group("lvmvg", 4 * GIB);
        h.reporter.sync("openebs/node-1").await.unwrap();
        let updated = h.nodes.get("node-1").await.unwrap();
        assert_eq!(updated.volume_groups[0].free, 4 * GIB);
        assert!(updated.metadata.generation > before.metadata.generation);
    }

    #[tokio::test]
    async fn foreign_keys_are_refused() {
        let h = harness();
        h.reporter.sync("openebs/node-2").await.unwrap();
        h.reporter.sync("other-namespace/node-1").await.unwrap();
        assert!(h.nodes.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_cluster_node_is_retried() {
        let h = harness();
        h.cluster.remove("node-1");
        assert!(h.reporter.sync("openebs/node-1").await.is_err());
    }

    #[test]
    fn owner_reference_is_added_or_repaired_in_place() {
        let required = OwnerReference {
            name: "node-1".to_string(),
            uid: Uuid::new_v4(),
            controller: true,
        };

        let mut refs = Vec::new();
        assert!(ensure_owner_reference(&mut refs, &required));
        assert_eq!(refs.len(), 1);

        // Same reference again: nothing to do.
        assert!(!ensure_owner_reference(&mut refs, &required));

        // Controller flag lost; repaired without duplicating.
        refs[0].controller = false;
        assert!(ensure_owner_reference(&mut refs, &required));
        assert_eq!(refs.len(), 1);
        assert!(refs[0].controller);
    }
}
