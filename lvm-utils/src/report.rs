// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decoding of LVM's JSON reports.
//!
//! All listers invoke the reporting tools with `--reportformat json
//! --units b`; every value arrives as a string, byte sizes carry a
//! trailing `b`, and enum-ish fields are mapped onto the fixed
//! small-integer tables below with `-1` meaning undefined. The parser is
//! strict: unknown units and malformed numbers are errors, not guesses.

use crate::{execute, ExecutionError, LVS, PVS, PVSCAN, VGS};
use lvm_types::VolumeGroup;
use serde::Deserialize;
use std::collections::HashMap;

// Report field names, as emitted by `vgs`/`lvs`/`pvs -o ..._all`.
pub const VG_NAME: &str = "vg_name";
pub const VG_UUID: &str = "vg_uuid";
pub const VG_PV_COUNT: &str = "pv_count";
pub const VG_LV_COUNT: &str = "lv_count";
pub const VG_MAX_LV: &str = "max_lv";
pub const VG_MAX_PV: &str = "max_pv";
pub const VG_SNAP_COUNT: &str = "snap_count";
pub const VG_MISSING_PV_COUNT: &str = "vg_missing_pv_count";
pub const VG_MDA_COUNT: &str = "vg_mda_count";
pub const VG_MDA_USED_COUNT: &str = "vg_mda_used_count";
pub const VG_SIZE: &str = "vg_size";
pub const VG_FREE: &str = "vg_free";
pub const VG_MDA_SIZE: &str = "vg_mda_size";
pub const VG_MDA_FREE: &str = "vg_mda_free";
pub const VG_PERMISSIONS: &str = "vg_permissions";
pub const VG_ALLOCATION_POLICY: &str = "vg_allocation_policy";

pub const LV_NAME: &str = "lv_name";
pub const LV_FULL_NAME: &str = "lv_full_name";
pub const LV_UUID: &str = "lv_uuid";
pub const LV_PATH: &str = "lv_path";
pub const LV_DM_PATH: &str = "lv_dm_path";
pub const LV_ACTIVE: &str = "lv_active";
pub const LV_SIZE: &str = "lv_size";
pub const LV_METADATA_SIZE: &str = "lv_metadata_size";
pub const LV_SEGTYPE: &str = "segtype";
pub const LV_HOST: &str = "lv_host";
pub const LV_POOL: &str = "pool_lv";
pub const LV_PERMISSIONS: &str = "lv_permissions";
pub const LV_WHEN_FULL: &str = "lv_when_full";
pub const LV_HEALTH_STATUS: &str = "lv_health_status";
pub const RAID_SYNC_ACTION: &str = "raid_sync_action";
pub const LV_DATA_PERCENT: &str = "data_percent";
pub const LV_METADATA_PERCENT: &str = "metadata_percent";
pub const LV_SNAP_PERCENT: &str = "snap_percent";

pub const PV_NAME: &str = "pv_name";
pub const PV_UUID: &str = "pv_uuid";
pub const PV_IN_USE: &str = "pv_in_use";
pub const PV_ALLOCATABLE: &str = "pv_allocatable";
pub const PV_MISSING: &str = "pv_missing";
pub const PV_SIZE: &str = "pv_size";
pub const PV_FREE: &str = "pv_free";
pub const PV_USED: &str = "pv_used";
pub const PV_MDA_SIZE: &str = "pv_mda_size";
pub const PV_MDA_FREE: &str = "pv_mda_free";
pub const PV_DEV_SIZE: &str = "dev_size";

/// Segment type LVM reports for thin pools; metadata sizes are only
/// reported for these.
pub const SEGTYPE_THIN_POOL: &str = "thin-pool";

// Enum value tables. An entry's index is its wire value; anything not in
// the table maps to -1.
const LV_PERMISSIONS_VALUES: &[&str] =
    &["unknown", "writeable", "read-only", "read-only-override"];
const LV_WHEN_FULL_VALUES: &[&str] = &["error", "queue"];
const RAID_SYNC_ACTION_VALUES: &[&str] =
    &["idle", "frozen", "resync", "recover", "check", "repair"];
const LV_HEALTH_STATUS_VALUES: &[&str] =
    &["", "partial", "refresh needed", "mismatches exist"];
const VG_PERMISSIONS_VALUES: &[&str] = &["writeable", "read-only"];
const VG_ALLOCATION_POLICY_VALUES: &[&str] =
    &["normal", "contiguous", "cling", "anywhere", "inherited"];

#[derive(thiserror::Error, Debug)]
pub enum ReportError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("failed to decode LVM report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected exactly one LVM report, got {0}")]
    NotOneReport(usize),

    #[error("invalid format of {field}={value:?} for {entity}: {reason}")]
    BadField { entity: String, field: String, value: String, reason: String },

    #[error("failed to resolve device for lv path {path}: {err}")]
    ResolveDevice { path: String, err: std::io::Error },
}

/// One logical volume as reported by `lvs`, joined with the resolved
/// device-mapper device name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogicalVolume {
    pub name: String,
    /// `<vg>/<lv>` form.
    pub full_name: String,
    pub uuid: String,
    /// Size in bytes.
    pub size: u64,
    /// `/dev/<vg>/<lv>` path.
    pub path: String,
    /// `/dev/mapper/...` path with doubled hyphens.
    pub dm_path: String,
    /// Resolved device-mapper device, e.g. `dm-5`.
    pub device: String,
    pub vg_name: String,
    pub seg_type: String,
    /// unknown=0, writable=1, read-only=2, read-only-override=3,
    /// undefined=-1.
    pub permission: i32,
    /// error=0, queue=1, undefined=-1.
    pub when_full: i32,
    /// empty=0, partial=1, refresh-needed=2, mismatches-exist=3.
    pub health_status: i32,
    /// idle=0, frozen=1, resync=2, recover=3, check=4, repair=5,
    /// undefined=-1.
    pub raid_sync_action: i32,
    pub active_status: String,
    pub host: String,
    /// For thin volumes, the backing pool LV.
    pub pool_name: String,
    pub used_size_percent: f64,
    /// Metadata LV size in bytes; only thin pools report one.
    pub metadata_size: u64,
    pub metadata_used_percent: f64,
    pub snapshot_used_percent: f64,
}

/// One physical volume as reported by `pvs`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PhysicalVolume {
    pub name: String,
    pub uuid: String,
    /// Size in bytes.
    pub size: u64,
    /// Size of the underlying device in bytes.
    pub device_size: u64,
    /// Smallest metadata area on the device in bytes.
    pub metadata_size: u64,
    pub metadata_free: u64,
    pub free: u64,
    pub used: u64,
    pub allocatable: String,
    pub missing: String,
    pub in_use: String,
    pub vg_name: String,
}

fn enum_index(table: &[&str], value: &str) -> i32 {
    table
        .iter()
        .position(|v| *v == value)
        .map(|i| i as i32)
        .unwrap_or(-1)
}

type Fields = HashMap<String, String>;

fn field<'a>(m: &'a Fields, key: &str) -> &'a str {
    m.get(key).map(String::as_str).unwrap_or("")
}

fn parse_bytes(
    m: &Fields,
    key: &str,
    entity: &str,
) -> Result<u64, ReportError> {
    let raw = field(m, key);
    let trimmed = raw.to_lowercase();
    let trimmed = trimmed.strip_suffix('b').unwrap_or(&trimmed);
    trimmed.parse::<u64>().map_err(|e| ReportError::BadField {
        entity: entity.to_string(),
        field: key.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_count(
    m: &Fields,
    key: &str,
    entity: &str,
) -> Result<i32, ReportError> {
    let raw = field(m, key);
    raw.parse::<i32>().map_err(|e| ReportError::BadField {
        entity: entity.to_string(),
        field: key.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_percent(
    m: &Fields,
    key: &str,
    entity: &str,
) -> Result<f64, ReportError> {
    let raw = field(m, key);
    if raw.is_empty() {
        return Ok(0.0);
    }
    raw.parse::<f64>().map_err(|e| ReportError::BadField {
        entity: entity.to_string(),
        field: key.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Parses one `vgs` report entry.
pub fn parse_volume_group(m: &Fields) -> Result<VolumeGroup, ReportError> {
    let name = field(m, VG_NAME).to_string();
    Ok(VolumeGroup {
        uuid: field(m, VG_UUID).to_string(),
        size: parse_bytes(m, VG_SIZE, &name)?,
        free: parse_bytes(m, VG_FREE, &name)?,
        lv_count: parse_count(m, VG_LV_COUNT, &name)?,
        pv_count: parse_count(m, VG_PV_COUNT, &name)?,
        max_lv: parse_count(m, VG_MAX_LV, &name)?,
        max_pv: parse_count(m, VG_MAX_PV, &name)?,
        snap_count: parse_count(m, VG_SNAP_COUNT, &name)?,
        missing_pv_count: parse_count(m, VG_MISSING_PV_COUNT, &name)?,
        metadata_count: parse_count(m, VG_MDA_COUNT, &name)?,
        metadata_used_count: parse_count(m, VG_MDA_USED_COUNT, &name)?,
        metadata_size: parse_bytes(m, VG_MDA_SIZE, &name)?,
        metadata_free: parse_bytes(m, VG_MDA_FREE, &name)?,
        permission: enum_index(VG_PERMISSIONS_VALUES, field(m, VG_PERMISSIONS)),
        allocation_policy: enum_index(
            VG_ALLOCATION_POLICY_VALUES,
            field(m, VG_ALLOCATION_POLICY),
        ),
        name,
    })
}

/// Parses one `lvs` report entry. The `device` field is left empty; the
/// lister joins it from the resolved LV path afterwards.
pub fn parse_logical_volume(m: &Fields) -> Result<LogicalVolume, ReportError> {
    let name = field(m, LV_NAME).to_string();
    let seg_type = field(m, LV_SEGTYPE).to_string();
    // Metadata is only stored for thin pools; other LVs report an empty
    // string there.
    let metadata_size = if seg_type == SEGTYPE_THIN_POOL {
        parse_bytes(m, LV_METADATA_SIZE, &name)?
    } else {
        0
    };
    Ok(LogicalVolume {
        full_name: field(m, LV_FULL_NAME).to_string(),
        uuid: field(m, LV_UUID).to_string(),
        size: parse_bytes(m, LV_SIZE, &name)?,
        path: field(m, LV_PATH).to_string(),
        dm_path: field(m, LV_DM_PATH).to_string(),
        device: String::new(),
        vg_name: field(m, VG_NAME).to_string(),
        permission: enum_index(LV_PERMISSIONS_VALUES, field(m, LV_PERMISSIONS)),
        when_full: enum_index(LV_WHEN_FULL_VALUES, field(m, LV_WHEN_FULL)),
        health_status: enum_index(
            LV_HEALTH_STATUS_VALUES,
            field(m, LV_HEALTH_STATUS),
        ),
        raid_sync_action: enum_index(
            RAID_SYNC_ACTION_VALUES,
            field(m, RAID_SYNC_ACTION),
        ),
        active_status: field(m, LV_ACTIVE).to_string(),
        host: field(m, LV_HOST).to_string(),
        pool_name: field(m, LV_POOL).to_string(),
        used_size_percent: parse_percent(m, LV_DATA_PERCENT, &name)?,
        metadata_size,
        metadata_used_percent: parse_percent(m, LV_METADATA_PERCENT, &name)?,
        snapshot_used_percent: parse_percent(m, LV_SNAP_PERCENT, &name)?,
        seg_type,
        name,
    })
}

/// Parses one `pvs` report entry.
pub fn parse_physical_volume(
    m: &Fields,
) -> Result<PhysicalVolume, ReportError> {
    let name = field(m, PV_NAME).to_string();
    Ok(PhysicalVolume {
        uuid: field(m, PV_UUID).to_string(),
        size: parse_bytes(m, PV_SIZE, &name)?,
        device_size: parse_bytes(m, PV_DEV_SIZE, &name)?,
        metadata_size: parse_bytes(m, PV_MDA_SIZE, &name)?,
        metadata_free: parse_bytes(m, PV_MDA_FREE, &name)?,
        free: parse_bytes(m, PV_FREE, &name)?,
        used: parse_bytes(m, PV_USED, &name)?,
        allocatable: field(m, PV_ALLOCATABLE).to_string(),
        missing: field(m, PV_MISSING).to_string(),
        in_use: field(m, PV_IN_USE).to_string(),
        vg_name: field(m, VG_NAME).to_string(),
        name,
    })
}

#[derive(Deserialize)]
struct VgReport {
    report: Vec<VgReportEntry>,
}

#[derive(Deserialize)]
struct VgReportEntry {
    #[serde(default)]
    vg: Vec<Fields>,
}

#[derive(Deserialize)]
struct LvReport {
    report: Vec<LvReportEntry>,
}

#[derive(Deserialize)]
struct LvReportEntry {
    #[serde(default)]
    lv: Vec<Fields>,
}

#[derive(Deserialize)]
struct PvReport {
    report: Vec<PvReportEntry>,
}

#[derive(Deserialize)]
struct PvReportEntry {
    #[serde(default)]
    pv: Vec<Fields>,
}

/// Decodes the JSON output of `vgs`.
pub fn decode_vgs(raw: &[u8]) -> Result<Vec<VolumeGroup>, ReportError> {
    let report: VgReport = serde_json::from_slice(raw)?;
    if report.report.len() != 1 {
        return Err(ReportError::NotOneReport(report.report.len()));
    }
    report.report[0].vg.iter().map(parse_volume_group).collect()
}

/// Decodes the JSON output of `lvs`; device names are not yet resolved.
pub fn decode_lvs(raw: &[u8]) -> Result<Vec<LogicalVolume>, ReportError> {
    let report: LvReport = serde_json::from_slice(raw)?;
    if report.report.len() != 1 {
        return Err(ReportError::NotOneReport(report.report.len()));
    }
    report.report[0].lv.iter().map(parse_logical_volume).collect()
}

/// Decodes the JSON output of `pvs`.
pub fn decode_pvs(raw: &[u8]) -> Result<Vec<PhysicalVolume>, ReportError> {
    let report: PvReport = serde_json::from_slice(raw)?;
    if report.report.len() != 1 {
        return Err(ReportError::NotOneReport(report.report.len()));
    }
    report.report[0].pv.iter().map(parse_physical_volume).collect()
}

/// Resolves the device-mapper device backing an LV path by following its
/// symlink and keeping the final path component (e.g. `dm-5`).
pub fn lv_device_name(path: &str) -> Result<String, ReportError> {
    let resolved = std::fs::canonicalize(path).map_err(|err| {
        ReportError::ResolveDevice { path: path.to_string(), err }
    })?;
    Ok(resolved
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default())
}

/// Refreshes the LVM metadata daemon cache (`pvscan --cache`) so the
/// reporting tools observe device changes made outside this process.
pub fn reload_metadata_cache() -> Result<(), ReportError> {
    let mut command = std::process::Command::new(PVSCAN);
    command.arg("--cache");
    execute(&mut command)?;
    Ok(())
}

/// Lists the volume groups on this host. When `reload_cache` is set the
/// metadata cache is refreshed first.
pub fn list_volume_groups(
    reload_cache: bool,
) -> Result<Vec<VolumeGroup>, ReportError> {
    if reload_cache {
        reload_metadata_cache()?;
    }
    let mut command = std::process::Command::new(VGS);
    command.args([
        "--options",
        "vg_all",
        "--reportformat",
        "json",
        "--units",
        "b",
    ]);
    let output = execute(&mut command)?;
    decode_vgs(&output.stdout)
}

/// Lists the logical volumes on this host, each joined with its resolved
/// device-mapper device name.
pub fn list_logical_volumes() -> Result<Vec<LogicalVolume>, ReportError> {
    let mut command = std::process::Command::new(LVS);
    command.args([
        "--options",
        "lv_all,vg_name,segtype",
        "--reportformat",
        "json",
        "--units",
        "b",
    ]);
    let output = execute(&mut command)?;
    let mut lvs = decode_lvs(&output.stdout)?;
    for lv in &mut lvs {
        lv.device = lv_device_name(&lv.path)?;
    }
    Ok(lvs)
}

/// Lists the physical volumes on this host.
pub fn list_physical_volumes() -> Result<Vec<PhysicalVolume>, ReportError> {
    reload_metadata_cache()?;
    let mut command = std::process::Command::new(PVS);
    command.args([
        "--options",
        "pv_all,vg_name",
        "--reportformat",
        "json",
        "--units",
        "b",
    ]);
    let output = execute(&mut command)?;
    decode_pvs(&output.stdout)
}
