// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process-wide runtime settings.
//!
//! Built once at startup from the environment and injected by reference
//! into the reconcilers; nothing re-reads the environment after start.

use serde::{Deserialize, Serialize};
use std::env;

pub const NAMESPACE_ENV: &str = "LVM_NAMESPACE";
pub const NODE_ID_ENV: &str = "OPENEBS_NODE_ID";
pub const NODE_DRIVER_ENV: &str = "OPENEBS_NODE_DRIVER";
pub const ANALYTICS_ENV: &str = "OPENEBS_IO_ENABLE_ANALYTICS";
pub const ALLOWED_TOPOLOGIES_ENV: &str = "ALLOWED_TOPOLOGIES";

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("required environment variable {0} is not set")]
    MissingEnv(&'static str),
}

/// Runtime identity and feature toggles shared by the controller and the
/// agent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Namespace holding the driver's custom resources.
    pub namespace: String,
    /// Identity of this host; empty on controller-only deployments.
    pub node_id: String,
    /// Extra node-label keys mirrored into the topology published by
    /// `NodeGetInfo`.
    pub topology_keys: Vec<String>,
    /// Whether anonymous usage reporting is enabled. The reporting sink
    /// itself lives outside this workspace.
    pub enable_analytics: bool,
}

impl Settings {
    pub fn new(namespace: &str, node_id: &str) -> Settings {
        Settings {
            namespace: namespace.to_string(),
            node_id: node_id.to_string(),
            ..Default::default()
        }
    }

    /// Reads settings from the environment. `LVM_NAMESPACE` is always
    /// required; `OPENEBS_NODE_ID` is required only when the process hosts
    /// the node driver (`OPENEBS_NODE_DRIVER` set).
    pub fn from_env() -> Result<Settings, SettingsError> {
        let namespace = env::var(NAMESPACE_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(SettingsError::MissingEnv(NAMESPACE_ENV))?;

        let node_id = env::var(NODE_ID_ENV).unwrap_or_default();
        let node_driver = env::var(NODE_DRIVER_ENV).unwrap_or_default();
        if node_id.is_empty() && !node_driver.is_empty() {
            return Err(SettingsError::MissingEnv(NODE_ID_ENV));
        }

        let topology_keys = env::var(ALLOWED_TOPOLOGIES_ENV)
            .map(|v| parse_topology_keys(&v))
            .unwrap_or_default();

        let enable_analytics =
            env::var(ANALYTICS_ENV).map(|v| v == "true").unwrap_or(false);

        Ok(Settings { namespace, node_id, topology_keys, enable_analytics })
    }

    pub fn with_topology_keys(mut self, keys: &[&str]) -> Settings {
        self.topology_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }
}

fn parse_topology_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from)
        .collect()
}
