// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-node agent.
//!
//! Three control loops run on every host: the node reporter keeps this
//! host's [`LvmNode`](lvm_types::LvmNode) inventory current, and the
//! volume and snapshot reconcilers realize desired state owned by this
//! node against the local LVM toolchain. A transport-free node service
//! carries the per-node CSI operations (publish, expand, stats) over the
//! same seams.
//!
//! Each loop follows the same shape: watch events are filtered by
//! ownership before they reach a deduplicating work queue, one worker
//! drains the queue, failures requeue with rate-limited back-off, and
//! every sync is written to be idempotent so a crash between any two steps
//! is recovered by the next pass.

pub mod backend;
pub mod reporter;
pub mod service;
pub mod snapshot;
pub mod volume;

pub use backend::{BackendError, HostLvm, VolumeBackend};

#[cfg(any(test, feature = "testing"))]
pub use backend::fake::FakeBackend;

/// A reconciliation pass that could not complete and should be retried
/// from the work queue. Terminal failures never surface here; they land in
/// the object's status instead.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] lvm_store::StoreError),

    #[error(transparent)]
    Backend(#[from] backend::BackendError),
}
