// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node ordering for new volumes.
//!
//! Pure: consumes the volume index and the published node inventories and
//! returns an ordered candidate list, best node first. It never filters by
//! whether the request actually fits; the owning agent discovers that and
//! fails the volume with a reschedulable error, which is what keeps this
//! function side-effect free.

use lvm_types::{LvmNode, LvmVolume};
use regex::Regex;
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SchedulerPolicy {
    /// Fewest provisioned volumes wins.
    VolumeWeighted,
    /// Lowest total provisioned capacity wins.
    CapacityWeighted,
    /// Largest free volume group wins.
    #[default]
    SpaceWeighted,
}

impl FromStr for SchedulerPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<SchedulerPolicy, ()> {
        match s {
            "VolumeWeighted" => Ok(SchedulerPolicy::VolumeWeighted),
            "CapacityWeighted" => Ok(SchedulerPolicy::CapacityWeighted),
            "SpaceWeighted" => Ok(SchedulerPolicy::SpaceWeighted),
            _ => Err(()),
        }
    }
}

/// Orders `candidates` for a new volume whose group must match `pattern`.
///
/// Every policy produces a numeric weight per node and the list sorts by
/// ascending (weight, name); the name tie-break keeps the order stable
/// across runs. Space weighting maps "most free space" onto the same
/// smallest-weight rule by scoring `i64::MAX - max_free`.
pub fn schedule(
    policy: SchedulerPolicy,
    pattern: &Regex,
    candidates: &[LvmNode],
    volumes: &[LvmVolume],
) -> Vec<String> {
    let weights: BTreeMap<String, i64> = match policy {
        SchedulerPolicy::VolumeWeighted => {
            volume_weights(pattern, candidates, volumes, |_| 1)
        }
        SchedulerPolicy::CapacityWeighted => {
            volume_weights(pattern, candidates, volumes, |vol| {
                vol.spec.capacity_bytes().unwrap_or(0) as i64
            })
        }
        SchedulerPolicy::SpaceWeighted => space_weights(pattern, candidates),
    };

    let mut ordered: Vec<(i64, String)> = weights
        .into_iter()
        .map(|(name, weight)| (weight, name))
        .collect();
    ordered.sort();
    ordered.into_iter().map(|(_, name)| name).collect()
}

/// Sums `weight_of` over each node's volumes whose resolved group matches
/// the pattern. Candidates with no matching volumes carry weight zero and
/// therefore sort first.
fn volume_weights(
    pattern: &Regex,
    candidates: &[LvmNode],
    volumes: &[LvmVolume],
    weight_of: impl Fn(&LvmVolume) -> i64,
) -> BTreeMap<String, i64> {
    let mut weights: BTreeMap<String, i64> = candidates
        .iter()
        .map(|node| (node.name().to_string(), 0))
        .collect();
    for vol in volumes {
        if !pattern.is_match(&vol.spec.vol_group) {
            continue;
        }
        if let Some(weight) = weights.get_mut(&vol.spec.owner_node_id) {
            *weight += weight_of(vol);
        }
    }
    weights
}

/// Scores each node by its largest matching volume group. Nodes without a
/// matching group cannot serve the request at all and are left out.
fn space_weights(
    pattern: &Regex,
    candidates: &[LvmNode],
) -> BTreeMap<String, i64> {
    let mut weights = BTreeMap::new();
    for node in candidates {
        let max_free = node
            .volume_groups
            .iter()
            .filter(|vg| pattern.is_match(&vg.name))
            .map(|vg| vg.free)
            .max();
        if let Some(max_free) = max_free {
            weights.insert(
                node.name().to_string(),
                i64::MAX - max_free.min(i64::MAX as u64) as i64,
            );
        }
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;
    use lvm_types::{ObjectMeta, VolumeGroup, VolumeInfo};

    fn node(name: &str, groups: &[(&str, u64)]) -> LvmNode {
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

    fn volume(name: &str, node: &str, vg: &str, capacity: u64) -> LvmVolume {
        LvmVolume {
            metadata: ObjectMeta::new("openebs", name),
            spec: VolumeInfo {
                owner_node_id: node.to_string(),
                vol_group: vg.to_string(),
                capacity: capacity.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn any() -> Regex {
        Regex::new("^lvmvg$").unwrap()
    }

    #[test]
    fn space_weighted_prefers_the_largest_free_group() {
        let nodes = [
            node("node-a", &[("lvmvg", 10), ("other", 500)]),
            node("node-b", &[("lvmvg", 100)]),
            node("node-c", &[("ssd", 1000)]),
        ];
        let order =
            schedule(SchedulerPolicy::SpaceWeighted, &any(), &nodes, &[]);
        // node-c has no matching group and drops out entirely.
        assert_eq!(order, vec!["node-b", "node-a"]);
    }

    #[test]
    fn volume_weighted_prefers_the_emptiest_node() {
        let nodes = [node("node-a", &[]), node("node-b", &[])];
        let volumes = [
            volume("v1", "node-a", "lvmvg", 10),
            volume("v2", "node-a", "lvmvg", 10),
            volume("v3", "node-b", "lvmvg", 10),
            // A volume in a non-matching group does not count.
            volume("v4", "node-b", "ssd", 10),
        ];
        let order = schedule(
            SchedulerPolicy::VolumeWeighted,
            &any(),
            &nodes,
            &volumes,
        );
        assert_eq!(order, vec!["node-b", "node-a"]);
    }

    #[test]
    fn capacity_weighted_sums_provisioned_bytes() {
        let nodes = [node("node-a", &[]), node("node-b", &[])];
        let volumes = [
            volume("v1", "node-a", "lvmvg", 100),
            volume("v2", "node-b", "lvmvg", 10),
            volume("v3", "node-b", "lvmvg", 10),
        ];
        let order = schedule(
            SchedulerPolicy::CapacityWeighted,
            &any(),
            &nodes,
            &volumes,
        );
        assert_eq!(order, vec!["node-b", "node-a"]);
    }

    #[test]
    fn ties_break_on_the_node_name() {
        let nodes = [
            node("node-c", &[("lvmvg", 50)]),
            node("node-a", &[("lvmvg", 50)]),
            node("node-b", &[("lvmvg", 50)]),
        ];
        let order =
            schedule(SchedulerPolicy::SpaceWeighted, &any(), &nodes, &[]);
        assert_eq!(order, vec!["node-a", "node-b", "node-c"]);
    }

    #[test]
    fn unknown_candidates_score_zero_under_volume_weighting() {
        let nodes = [node("fresh-node", &[])];
        let volumes = [volume("v1", "busy-node", "lvmvg", 10)];
        let order = schedule(
            SchedulerPolicy::VolumeWeighted,
            &any(),
            &nodes,
            &volumes,
        );
        assert_eq!(order, vec!["fresh-node"]);
    }
}
