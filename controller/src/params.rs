// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage-class and snapshot-class parameter parsing.

use crate::scheduler::SchedulerPolicy;
use lvm_common::capacity::{parse_quantity, rounded_capacity, QuantityError};
use lvm_common::case_insensitive_map;
use regex::Regex;
use lvm_types::{RaidConfig, YesNo};
use std::collections::HashMap;

#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum ParamsError {
    #[error("invalid volgroup/vgpattern param {pattern:?}: {reason}")]
    BadPattern { pattern: String, reason: String },

    #[error("invalid {key} param {value:?}: {reason}")]
    BadValue { key: &'static str, value: String, reason: String },

    #[error("invalid snapsize {0:?}: {1}")]
    BadSnapSize(String, QuantityError),

    #[error("snapSize percentage should be between 1 and 100, found {0:?}")]
    SnapSizePercentOutOfRange(String),

    #[error("absolute snapSize should be greater than 0, found {0:?}")]
    SnapSizeZero(String),
}

/// Supported storage-class settings. Keys are matched case-insensitively;
/// anything unrecognized is passed over so sidecar-injected parameters
/// don't fail validation.
#[derive(Clone, Debug)]
pub struct VolumeParams {
    /// Volume-group selection pattern. An explicit `volgroup` is
    /// translated to the anchored `^<name>$` form.
    pub vg_pattern: Regex,
    pub scheduler: SchedulerPolicy,
    pub shared: YesNo,
    pub thin_provision: YesNo,
    pub raid: RaidConfig,
    /// Claim metadata the external provisioner propagates when
    /// `--extra-create-metadata` is enabled; consumed by leak protection.
    pub pvc_name: String,
    pub pvc_namespace: String,
    pub pv_name: String,
}

fn parse_yes_no(
    m: &HashMap<String, String>,
    key: &'static str,
    default: YesNo,
) -> Result<YesNo, ParamsError> {
    match m.get(key) {
        None => Ok(default),
        Some(value) => {
            value.parse().map_err(|_| ParamsError::BadValue {
                key,
                value: value.clone(),
                reason: "expected yes or no".to_string(),
            })
        }
    }
}

fn parse_u32(
    m: &HashMap<String, String>,
    key: &'static str,
) -> Result<u32, ParamsError> {
    match m.get(key) {
        None => Ok(0),
        Some(value) => {
            value.parse().map_err(|err| ParamsError::BadValue {
                key,
                value: value.clone(),
                reason: format!("{err}"),
            })
        }
    }
}

impl VolumeParams {
    pub fn parse(
        params: &HashMap<String, String>,
    ) -> Result<VolumeParams, ParamsError> {
        let m = case_insensitive_map(params);

        // An explicit volgroup wins over any pattern, for backward
        // compatibility with classes written before patterns existed.
        let pattern = match m.get("volgroup") {
            Some(vg) => format!("^{vg}$"),
            None => m.get("vgpattern").cloned().unwrap_or_default(),
        };
        let vg_pattern = Regex::new(&pattern).map_err(|err| {
            ParamsError::BadPattern { pattern, reason: err.to_string() }
        })?;

        let scheduler = m
            .get("scheduler")
            .map(|s| s.parse().unwrap_or_default())
            .unwrap_or_default();

        let raid = RaidConfig {
            raid_type: match m.get("raidtype") {
                None => Default::default(),
                Some(value) => value.parse().map_err(|_| {
                    ParamsError::BadValue {
                        key: "raidtype",
                        value: value.clone(),
                        reason: "unrecognized raid type".to_string(),
                    }
                })?,
            },
            mirrors: parse_u32(&m, "mirrors")?,
            stripe_count: parse_u32(&m, "stripecount")?,
            stripe_size: parse_u32(&m, "stripesize")?,
            no_sync: parse_yes_no(&m, "nosync", YesNo::No)?,
            integrity: parse_yes_no(&m, "integrity", YesNo::No)?,
            lv_create_options: m.get("lvcreateoptions").cloned(),
        };

        Ok(VolumeParams {
            vg_pattern,
            scheduler,
            shared: parse_yes_no(&m, "shared", YesNo::No)?,
            thin_provision: parse_yes_no(&m, "thinprovision", YesNo::No)?,
            raid,
            pvc_name: m
                .get("csi.storage.k8s.io/pvc/name")
                .cloned()
                .unwrap_or_default(),
            pvc_namespace: m
                .get("csi.storage.k8s.io/pvc/namespace")
                .cloned()
                .unwrap_or_default(),
            pv_name: m
                .get("csi.storage.k8s.io/pv/name")
                .cloned()
                .unwrap_or_default(),
        })
    }
}

/// Requested snapshot sizing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SnapSize {
    /// Absolute byte count.
    Absolute(u64),
    /// Percentage of the source volume's capacity, 1 to 100.
    Percent(f64),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SnapshotParams {
    pub snap_size: Option<SnapSize>,
}

impl SnapshotParams {
    pub fn parse(
        params: &HashMap<String, String>,
    ) -> Result<SnapshotParams, ParamsError> {
        let m = case_insensitive_map(params);
        let Some(raw) = m.get("snapsize") else {
            return Ok(SnapshotParams::default());
        };

        if let Some(percent) = raw.strip_suffix('%') {
            let value: f64 = percent.trim().parse().map_err(|_| {
                ParamsError::SnapSizePercentOutOfRange(raw.clone())
            })?;
            if !(1.0..=100.0).contains(&value) {
                return Err(ParamsError::SnapSizePercentOutOfRange(
                    raw.clone(),
                ));
            }
            return Ok(SnapshotParams {
                snap_size: Some(SnapSize::Percent(value)),
            });
        }

        let bytes = parse_quantity(raw)
            .map_err(|err| ParamsError::BadSnapSize(raw.clone(), err))?;
        if bytes == 0 {
            return Err(ParamsError::SnapSizeZero(raw.clone()));
        }
        Ok(SnapshotParams { snap_size: Some(SnapSize::Absolute(bytes)) })
    }

    /// The snapshot capacity to record for a source of `source_capacity`
    /// bytes. `None` means a thin snapshot borrowing from the pool, which
    /// is the default for thin-provisioned sources with no explicit size.
    pub fn snapshot_capacity(
        &self,
        source_capacity: u64,
        source_is_thin: bool,
    ) -> Option<u64> {
        match self.snap_size {
            None => {
                if source_is_thin {
                    None
                } else {
                    // A full-size snapshot can never overflow and be
                    // dropped by LVM.
                    Some(source_capacity)
                }
            }
            Some(SnapSize::Absolute(bytes)) => {
                Some(rounded_capacity(bytes).min(source_capacity))
            }
            Some(SnapSize::Percent(percent)) => {
                let bytes = (source_capacity as f64 * percent / 100.0) as u64;
                Some(rounded_capacity(bytes).min(source_capacity))
            }
        }
    }
}
