// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-volume-group I/O rate limits.
//!
//! The tables are process-global: written exactly once at startup from the
//! agent's flags, then read under a shared lock whenever a volume is
//! published. Applying the limits to the container runtime's cgroup is an
//! external collaborator; this module only owns the configuration.

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum IoLimitError {
    #[error("malformed rate entry {0:?}, expected <vg-prefix>:<rate>")]
    MalformedEntry(String),
}

/// Raw configuration as handed over from flag parsing; each entry is a
/// `<vg-prefix>:<rate>` pair.
#[derive(Clone, Debug, Default)]
pub struct IoLimitConfig {
    pub container_runtime: String,
    pub riops_per_gb: Vec<String>,
    pub wiops_per_gb: Vec<String>,
    pub rbps_per_gb: Vec<String>,
    pub wbps_per_gb: Vec<String>,
}

#[derive(Debug, Default)]
struct Limits {
    container_runtime: String,
    riops: HashMap<String, u64>,
    wiops: HashMap<String, u64>,
    rbps: HashMap<String, u64>,
    wbps: HashMap<String, u64>,
}

static LIMITS: RwLock<Option<Limits>> = RwLock::new(None);

fn extract_rate_values(
    entries: &[String],
) -> Result<HashMap<String, u64>, IoLimitError> {
    let mut rates = HashMap::new();
    for entry in entries {
        let (key, value) = entry
            .split_once(':')
            .ok_or_else(|| IoLimitError::MalformedEntry(entry.clone()))?;
        let value = value
            .parse::<u64>()
            .map_err(|_| IoLimitError::MalformedEntry(entry.clone()))?;
        rates.insert(key.to_string(), value);
    }
    Ok(rates)
}

/// Installs the I/O-limit tables. The first successful call wins; later
/// calls are ignored so no code path can mutate the tables after startup.
pub fn set_io_limits(config: &IoLimitConfig) -> Result<(), IoLimitError> {
    let limits = Limits {
        container_runtime: config.container_runtime.clone(),
        riops: extract_rate_values(&config.riops_per_gb)?,
        wiops: extract_rate_values(&config.wiops_per_gb)?,
        rbps: extract_rate_values(&config.rbps_per_gb)?,
        wbps: extract_rate_values(&config.wbps_per_gb)?,
    };
    let mut guard = LIMITS.write().unwrap();
    if guard.is_none() {
        *guard = Some(limits);
    }
    Ok(())
}

pub fn io_limits_enabled() -> bool {
    LIMITS.read().unwrap().is_some()
}

pub fn container_runtime() -> Option<String> {
    LIMITS.read().unwrap().as_ref().map(|l| l.container_runtime.clone())
}

/// Looks up a rate for `vg_name`: an exact prefix key wins, otherwise the
/// first key contained in the name, otherwise zero (unlimited).
fn rate_for(rates: &HashMap<String, u64>, vg_name: &str) -> u64 {
    if let Some(rate) = rates.get(vg_name) {
        return *rate;
    }
    for (key, rate) in rates {
        if vg_name.contains(key.as_str()) {
            return *rate;
        }
    }
    0
}

pub fn riops_per_gb(vg_name: &str) -> u64 {
    LIMITS.read().unwrap().as_ref().map_or(0, |l| rate_for(&l.riops, vg_name))
}

pub fn wiops_per_gb(vg_name: &str) -> u64 {
    LIMITS.read().unwrap().as_ref().map_or(0, |l| rate_for(&l.wiops, vg_name))
}

pub fn rbps_per_gb(vg_name: &str) -> u64 {
    LIMITS.read().unwrap().as_ref().map_or(0, |l| rate_for(&l.rbps, vg_name))
}

pub fn wbps_per_gb(vg_name: &str) -> u64 {
    LIMITS.read().unwrap().as_ref().map_or(0, |l| rate_for(&l.wbps, vg_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_entries_parse_key_value_pairs() {
        let rates = extract_rate_values(&[
            "lvmvg:100".to_string(),
            "ssd:250".to_string(),
        ])
        .unwrap();
        assert_eq!(rates["lvmvg"], 100);
        assert_eq!(rates["ssd"], 250);

        assert!(extract_rate_values(&["lvmvg".to_string()]).is_err());
        assert!(extract_rate_values(&["lvmvg:ten".to_string()]).is_err());
    }

    #[test]
    fn lookup_prefers_exact_match_then_substring() {
        let rates = HashMap::from([
            ("lvmvg".to_string(), 100u64),
            ("lvmvg-fast".to_string(), 500u64),
        ]);
        assert_eq!(rate_for(&rates, "lvmvg-fast"), 500);
        assert_eq!(rate_for(&rates, "lvmvg-slow"), 100);
        assert_eq!(rate_for(&rates, "other"), 0);
    }
}
