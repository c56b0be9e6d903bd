// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creating and destroying snapshot logical volumes.

use crate::volume::{dev_path, lv_exists, Error};
use crate::{execute, LVCREATE, LVREMOVE};
use lvm_types::LvmSnapshot;

/// Prefix reserved by LVM; stripped from snapshot object names before they
/// become LV names.
pub const SNAPSHOT_PREFIX: &str = "snapshot-";

/// The LV name for a snapshot object: names starting with `snapshot` are
/// reserved inside LVM, so a leading `snapshot-` is dropped.
pub fn snap_lv_name(snap_name: &str) -> &str {
    snap_name.strip_prefix(SNAPSHOT_PREFIX).unwrap_or(snap_name)
}

#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    #[error(transparent)]
    Volume(#[from] Error),

    #[error("snapshot {0} does not name its source volume")]
    MissingSourceVolume(String),
}

/// Assembles the `lvcreate --snapshot` argument list. Snapshots are
/// created read-only; a `--size` is passed only when the spec carries one,
/// since sizing a snapshot of a thin volume would detach it from the pool.
pub fn snapshot_create_args(
    snap: &LvmSnapshot,
    source_volume: &str,
) -> Vec<String> {
    let mut args = vec![
        "--snapshot".to_string(),
        "--name".to_string(),
        snap_lv_name(snap.name()).to_string(),
        "--permission".to_string(),
        "r".to_string(),
        dev_path(&snap.spec.vol_group, source_volume).to_string(),
    ];
    if let Some(size) = &snap.spec.snap_size {
        args.push("--size".to_string());
        args.push(format!("{size}b"));
    }
    args
}

/// Assembles the `lvremove` argument list for a snapshot.
pub fn snapshot_remove_args(snap: &LvmSnapshot) -> Vec<String> {
    vec![
        "-y".to_string(),
        dev_path(&snap.spec.vol_group, snap_lv_name(snap.name())).to_string(),
    ]
}

/// Whether the snapshot LV is present on this host.
pub fn snapshot_exists(snap: &LvmSnapshot) -> Result<bool, Error> {
    lv_exists(&snap.spec.vol_group, snap_lv_name(snap.name()))
}

/// Creates the snapshot LV for `snap` from its labelled source volume.
pub fn create_snapshot(snap: &LvmSnapshot) -> Result<(), SnapshotError> {
    let source = snap.source_volume().ok_or_else(|| {
        SnapshotError::MissingSourceVolume(snap.name().to_string())
    })?;

    let args = snapshot_create_args(snap, source);
    let mut command = std::process::Command::new(LVCREATE);
    command.args(&args);
    execute(&mut command).map_err(Error::from)?;
    Ok(())
}

/// Destroys the snapshot LV for `snap`. A snapshot the host already lacks
/// succeeds immediately, which keeps crash-recovery deletes from tripping
/// over `lvremove`.
pub fn destroy_snapshot(snap: &LvmSnapshot) -> Result<(), SnapshotError> {
    if !snapshot_exists(snap)? {
        return Ok(());
    }

    let mut command = std::process::Command::new(LVREMOVE);
    command.args(snapshot_remove_args(snap));
    execute(&mut command).map_err(Error::from)?;
    Ok(())
}
