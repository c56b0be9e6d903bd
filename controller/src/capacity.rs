// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Topology-aware view over the published node inventories.
//!
//! Answers two questions for the pipeline: which nodes fall inside a
//! requested topology segment, and what is the largest single volume that
//! could be provisioned there. The capacity answer is deliberately a max
//! over nodes of the max matching group free space, not a sum: the
//! orchestrator uses it to decide whether one more volume of a given size
//! can fit anywhere.

use lvm_types::csi::Topology;
use lvm_types::{LvmNode, TOPOLOGY_KEY};
use lvm_store::{ClusterNodeStore, SharedStore, StoreError};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct CapacityView {
    nodes: SharedStore<LvmNode>,
    cluster_nodes: Arc<dyn ClusterNodeStore>,
    /// Node-label key used for segment filtering in addition to the
    /// driver's own topology key.
    index_label: String,
}

impl CapacityView {
    pub fn new(
        nodes: SharedStore<LvmNode>,
        cluster_nodes: Arc<dyn ClusterNodeStore>,
        index_label: &str,
    ) -> Arc<CapacityView> {
        Arc::new(CapacityView {
            nodes,
            cluster_nodes,
            index_label: index_label.to_string(),
        })
    }

    /// Node inventories whose host matches every requested segment. An
    /// absent or empty topology matches all nodes.
    pub async fn candidate_nodes(
        &self,
        topology: Option<&Topology>,
    ) -> Result<Vec<LvmNode>, StoreError> {
        let inventories = self.nodes.list().await?;
        let segments = match topology {
            Some(t) if !t.segments.is_empty() => &t.segments,
            _ => return Ok(inventories),
        };

        let labels: BTreeMap<String, BTreeMap<String, String>> = self
            .cluster_nodes
            .list()
            .await?
            .into_iter()
            .map(|node| (node.name, node.labels))
            .collect();

        Ok(inventories
            .into_iter()
            .filter(|inventory| {
                let name = inventory.name();
                segments.iter().all(|(key, value)| {
                    if key == TOPOLOGY_KEY || key == &self.index_label {
                        // The driver's key (and the configured index
                        // label) name the node directly.
                        if value == name {
                            return true;
                        }
                    }
                    labels
                        .get(name)
                        .and_then(|l| l.get(key))
                        .is_some_and(|v| v == value)
                })
            })
            .collect())
    }

    /// Largest provisionable volume, in bytes, for the given segment and
    /// volume-group pattern.
    pub async fn available_capacity(
        &self,
        topology: Option<&Topology>,
        pattern: &Regex,
    ) -> Result<i64, StoreError> {
        let candidates = self.candidate_nodes(topology).await?;
        let best = candidates
            .iter()
            .filter_map(|node| {
                node.volume_groups
                    .iter()
                    .filter(|vg| pattern.is_match(&vg.name))
                    .map(|vg| vg.free)
                    .max()
            })
            .max()
            .unwrap_or(0);
        Ok(best.min(i64::MAX as u64) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lvm_store::memory::{MemClusterNodes, MemStore};
    use lvm_store::Store;
    use lvm_types::{ClusterNode, ObjectMeta, VolumeGroup};

    async fn view() -> (Arc<CapacityView>, Arc<MemStore<LvmNode>>) {
        let nodes = Arc::new(MemStore::<LvmNode>::new("openebs"));
        let cluster = Arc::new(MemClusterNodes::new());
        for (name, zone) in [("node-a", "zone-1"), ("node-b", "zone-2")] {
            cluster.upsert(ClusterNode {
                name: name.to_string(),
                labels: BTreeMap::from([(
                    "topology.kubernetes.io/zone".to_string(),
                    zone.to_string(),
                )]),
                ..Default::default()
            });
        }
        let view = CapacityView::new(
            Arc::clone(&nodes) as SharedStore<LvmNode>,
            cluster as Arc<dyn ClusterNodeStore>,
            TOPOLOGY_KEY,
        );
        (view, nodes)
    }

    fn inventory(name: &str, groups: &[(&str, u64)]) -> LvmNode {
        LvmNode {
            metadata: ObjectMeta::new("openebs", name),
            volume_groups: groups
                .iter()
                .map(|(vg, free)| VolumeGroup {
                    name: vg.to_string(),
                    free: *free,
                    size: *free,
                    ..Default::default()
                })
                .collect(),
        }
    }

    fn segment(key: &str, value: &str) -> Topology {
        Topology {
            segments: BTreeMap::from([(key.to_string(), value.to_string())]),
        }
    }

    #[tokio::test]
    async fn capacity_is_max_over_nodes_not_a_sum() {
        let (view, nodes) = view().await;
        nodes
            .create(inventory("node-a", &[("lvmvg", 100), ("lvmvg-2", 700)]))
            .await
            .unwrap();
        nodes.create(inventory("node-b", &[("lvmvg", 400)])).await.unwrap();

        let pattern = Regex::new("^lvmvg").unwrap();
        let capacity =
            view.available_capacity(None, &pattern).await.unwrap();
        assert_eq!(capacity, 700);
    }

    #[tokio::test]
    async fn segments_filter_through_the_driver_topology_key() {
        let (view, nodes) = view().await;
        nodes.create(inventory("node-a", &[("lvmvg", 100)])).await.unwrap();
        nodes.create(inventory("node-b", &[("lvmvg", 400)])).await.unwrap();

        let pattern = Regex::new(".*").unwrap();
        let capacity = view
            .available_capacity(Some(&segment(TOPOLOGY_KEY, "node-a")), &pattern)
            .await
            .unwrap();
        assert_eq!(capacity, 100);
    }

    #[tokio::test]
    async fn segments_filter_through_mirrored_node_labels() {
        let (view, nodes) = view().await;
        nodes.create(inventory("node-a", &[("lvmvg", 100)])).await.unwrap();
        nodes.create(inventory("node-b", &[("lvmvg", 400)])).await.unwrap();

        let candidates = view
            .candidate_nodes(Some(&segment(
                "topology.kubernetes.io/zone",
                "zone-2",
            )))
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name(), "node-b");
    }

    #[tokio::test]
    async fn no_matching_group_means_zero_capacity() {
        let (view, nodes) = view().await;
        nodes.create(inventory("node-a", &[("ssd", 100)])).await.unwrap();

        let pattern = Regex::new("^lvmvg$").unwrap();
        assert_eq!(
            view.available_capacity(None, &pattern).await.unwrap(),
            0
        );
    }
}
