// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seam between the reconcilers and the host LVM toolchain.
//!
//! Production code goes through [`HostLvm`], which shells out via
//! `lvm-utils`; tests inject [`fake::FakeBackend`]. Failures arrive
//! already classified so the reconcilers can populate `status.error`
//! without re-inspecting stderr.

use async_trait::async_trait;
use lvm_types::{ErrorCode, LvmSnapshot, LvmVolume, VolumeGroup};
use lvm_utils::report::ReportError;
use lvm_utils::snapshot::SnapshotError;

/// A classified failure from the host toolchain.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub code: ErrorCode,
    pub message: String,
}

impl BackendError {
    pub fn internal(message: impl std::fmt::Display) -> BackendError {
        BackendError { code: ErrorCode::Internal, message: message.to_string() }
    }

    pub fn insufficient_capacity(
        message: impl std::fmt::Display,
    ) -> BackendError {
        BackendError {
            code: ErrorCode::InsufficientCapacity,
            message: message.to_string(),
        }
    }
}

fn is_insufficient_space(err: &lvm_utils::volume::Error) -> bool {
    matches!(
        err,
        lvm_utils::volume::Error::Execution(exec)
            if exec.is_insufficient_space()
    )
}

impl From<lvm_utils::volume::Error> for BackendError {
    fn from(err: lvm_utils::volume::Error) -> BackendError {
        if is_insufficient_space(&err) {
            BackendError::insufficient_capacity(err)
        } else {
            BackendError::internal(err)
        }
    }
}

impl From<SnapshotError> for BackendError {
    fn from(err: SnapshotError) -> BackendError {
        let insufficient = match &err {
            SnapshotError::Volume(inner) => is_insufficient_space(inner),
            SnapshotError::MissingSourceVolume(_) => false,
        };
        if insufficient {
            BackendError::insufficient_capacity(err)
        } else {
            BackendError::internal(err)
        }
    }
}

impl From<ReportError> for BackendError {
    fn from(err: ReportError) -> BackendError {
        BackendError::internal(err)
    }
}

/// Host LVM operations the reconcilers depend on.
#[async_trait]
pub trait VolumeBackend: Send + Sync {
    async fn create_volume(&self, vol: &LvmVolume)
        -> Result<(), BackendError>;

    async fn destroy_volume(
        &self,
        vol: &LvmVolume,
    ) -> Result<(), BackendError>;

    async fn resize_volume(
        &self,
        vol: &LvmVolume,
        resize_fs: bool,
    ) -> Result<(), BackendError>;

    async fn create_snapshot(
        &self,
        snap: &LvmSnapshot,
    ) -> Result<(), BackendError>;

    async fn destroy_snapshot(
        &self,
        snap: &LvmSnapshot,
    ) -> Result<(), BackendError>;

    async fn snapshot_exists(
        &self,
        snap: &LvmSnapshot,
    ) -> Result<bool, BackendError>;

    async fn list_volume_groups(
        &self,
        reload_cache: bool,
    ) -> Result<Vec<VolumeGroup>, BackendError>;
}

/// Production backend driving the host's LVM binaries. The binaries block,
/// so every call is pushed onto the blocking pool.
pub struct HostLvm;

async fn blocking<T, F>(f: F) -> Result<T, BackendError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BackendError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| BackendError::internal(err))?
}

#[async_trait]
impl VolumeBackend for HostLvm {
    async fn create_volume(
        &self,
        vol: &LvmVolume,
    ) -> Result<(), BackendError> {
        let vol = vol.clone();
        blocking(move || {
            lvm_utils::volume::create_volume(&vol).map_err(Into::into)
        })
        .await
    }

    async fn destroy_volume(
        &self,
        vol: &LvmVolume,
    ) -> Result<(), BackendError> {
        let vol = vol.clone();
        blocking(move || {
            lvm_utils::volume::destroy_volume(&vol).map_err(Into::into)
        })
        .await
    }

    async fn resize_volume(
        &self,
        vol: &LvmVolume,
        resize_fs: bool,
    ) -> Result<(), BackendError> {
        let vol = vol.clone();
        blocking(move || {
            lvm_utils::volume::resize_volume(&vol, resize_fs)
                .map_err(Into::into)
        })
        .await
    }

    async fn create_snapshot(
        &self,
        snap: &LvmSnapshot,
    ) -> Result<(), BackendError> {
        let snap = snap.clone();
        blocking(move || {
            lvm_utils::snapshot::create_snapshot(&snap).map_err(Into::into)
        })
        .await
    }

    async fn destroy_snapshot(
        &self,
        snap: &LvmSnapshot,
    ) -> Result<(), BackendError> {
        let snap = snap.clone();
        blocking(move || {
            lvm_utils::snapshot::destroy_snapshot(&snap).map_err(Into::into)
        })
        .await
    }

    async fn snapshot_exists(
        &self,
        snap: &LvmSnapshot,
    ) -> Result<bool, BackendError> {
        let snap = snap.clone();
        blocking(move || {
            lvm_utils::snapshot::snapshot_exists(&snap).map_err(Into::into)
        })
        .await
    }

    async fn list_volume_groups(
        &self,
        reload_cache: bool,
    ) -> Result<Vec<VolumeGroup>, BackendError> {
        blocking(move || {
            lvm_utils::report::list_volume_groups(reload_cache)
                .map_err(Into::into)
        })
        .await
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod fake {
    //! An in-memory [`VolumeBackend`] for tests: tracks which LVs "exist",
    //! debits volume-group free space, and fails creation with
    //! `InsufficientCapacity` when a group runs out.

    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        volume_groups: BTreeMap<String, VolumeGroup>,
        volumes: BTreeSet<String>,
        snapshots: BTreeSet<String>,
        fail_next_create: Option<BackendError>,
    }

    #[derive(Default)]
    pub struct FakeBackend {
        state: Mutex<State>,
    }

    impl FakeBackend {
        pub fn new() -> FakeBackend {
            FakeBackend::default()
        }

        /// Registers a volume group with `free` bytes available.
        pub fn add_volume_group(&self, name: &str, free: u64) {
            let mut state = self.state.lock().unwrap();
            state.volume_groups.insert(
                name.to_string(),
                VolumeGroup {
                    name: name.to_string(),
                    uuid: format!("fake-{name}"),
                    size: free,
                    free,
                    pv_count: 1,
                    metadata_count: 1,
                    metadata_used_count: 1,
                    ..Default::default()
                },
            );
        }

        /// Arms a one-shot failure for the next `create_volume` call.
        pub fn fail_next_create(&self, err: BackendError) {
            self.state.lock().unwrap().fail_next_create = Some(err);
        }

        pub fn has_volume(&self, vg: &str, name: &str) -> bool {
            self.state
                .lock()
                .unwrap()
                .volumes
                .contains(&format!("{vg}/{name}"))
        }

        pub fn has_snapshot(&self, vg: &str, name: &str) -> bool {
            self.state
                .lock()
                .unwrap()
                .snapshots
                .contains(&format!("{vg}/{name}"))
        }

        fn capacity(vol: &LvmVolume) -> Result<u64, BackendError> {
            vol.spec
                .capacity_bytes()
                .map_err(|e| BackendError::internal(e))
        }
    }

    #[async_trait]
    impl VolumeBackend for FakeBackend {
        async fn create_volume(
            &self,
            vol: &LvmVolume,
        ) -> Result<(), BackendError> {
            let requested = Self::capacity(vol)?;
            let mut state = self.state.lock().unwrap();
            if let Some(err) = state.fail_next_create.take() {
                return Err(err);
            }
            let key = format!("{}/{}", vol.spec.vol_group, vol.name());
            if state.volumes.contains(&key) {
                return Ok(());
            }
            let Some(vg) = state.volume_groups.get_mut(&vol.spec.vol_group)
            else {
                return Err(BackendError::internal(format!(
                    "volume group {:?} not found",
                    vol.spec.vol_group
                )));
            };
            if !vol.spec.thin_provision.is_yes() && vg.free < requested {
                return Err(BackendError::insufficient_capacity(format!(
                    "Volume group {:?} has insufficient free space",
                    vg.name
                )));
            }
            vg.free = vg.free.saturating_sub(requested);
            vg.lv_count += 1;
            state.volumes.insert(key);
            Ok(())
        }

        async fn destroy_volume(
            &self,
            vol: &LvmVolume,
        ) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            let key = format!("{}/{}", vol.spec.vol_group, vol.name());
            state.volumes.remove(&key);
            Ok(())
        }

        async fn resize_volume(
            &self,
            vol: &LvmVolume,
            _resize_fs: bool,
        ) -> Result<(), BackendError> {
            let state = self.state.lock().unwrap();
            let key = format!("{}/{}", vol.spec.vol_group, vol.name());
            if !state.volumes.contains(&key) {
                return Err(BackendError::internal(format!(
                    "logical volume {key:?} not found"
                )));
            }
            Ok(())
        }

        async fn create_snapshot(
            &self,
            snap: &LvmSnapshot,
        ) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            let lv_name =
                lvm_utils::snapshot::snap_lv_name(snap.name()).to_string();
            state
                .snapshots
                .insert(format!("{}/{}", snap.spec.vol_group, lv_name));
            Ok(())
        }

        async fn destroy_snapshot(
            &self,
            snap: &LvmSnapshot,
        ) -> Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            let lv_name =
                lvm_utils::snapshot::snap_lv_name(snap.name()).to_string();
            state
                .snapshots
                .remove(&format!("{}/{}", snap.spec.vol_group, lv_name));
            Ok(())
        }

        async fn snapshot_exists(
            &self,
            snap: &LvmSnapshot,
        ) -> Result<bool, BackendError> {
            let state = self.state.lock().unwrap();
            let lv_name =
                lvm_utils::snapshot::snap_lv_name(snap.name()).to_string();
            Ok(state
                .snapshots
                .contains(&format!("{}/{}", snap.spec.vol_group, lv_name)))
        }

        async fn list_volume_groups(
            &self,
            _reload_cache: bool,
        ) -> Result<Vec<VolumeGroup>, BackendError> {
            let state = self.state.lock().unwrap();
            Ok(state.volume_groups.values().cloned().collect())
        }
    }
}
