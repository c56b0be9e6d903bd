// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The API-store seam.
//!
//! Reconcilers and the controller pipeline never talk to the orchestrator
//! API directly; they go through the [`Store`] trait, which a production
//! client adapter implements against the real API server and
//! [`memory::MemStore`] implements in-process. The in-memory backend also
//! pins down the deletion semantics the rest of the system depends on:
//! deleting an object that holds finalizers marks it with a deletion
//! timestamp, and the update that clears the last finalizer of a marked
//! object purges it.

use async_trait::async_trait;
use lvm_types::{Claim, LvmNode, LvmSnapshot, LvmVolume, ObjectMeta, VolState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub mod memory;

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("conflicting write to {kind} {name:?}")]
    Conflict { kind: &'static str, name: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Conflicts and outages resolve themselves on retry; the other kinds
    /// do not.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Conflict { .. }
        )
    }
}

/// A change observed on a watched collection.
#[derive(Clone, Debug)]
pub enum WatchEvent<T> {
    /// The object was created or updated.
    Applied(T),
    /// The object was removed from the store.
    Deleted(T),
}

impl<T> WatchEvent<T> {
    pub fn object(&self) -> &T {
        match self {
            WatchEvent::Applied(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }
}

/// Implemented by every stored resource type.
pub trait ApiObject: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;
}

impl ApiObject for LvmVolume {
    const KIND: &'static str = "lvmvolume";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl ApiObject for LvmSnapshot {
    const KIND: &'static str = "lvmsnapshot";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl ApiObject for LvmNode {
    const KIND: &'static str = "lvmnode";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl ApiObject for Claim {
    const KIND: &'static str = "persistentvolumeclaim";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// A namespace-scoped collection of one resource type.
#[async_trait]
pub trait Store<T: ApiObject>: Send + Sync {
    fn namespace(&self) -> &str;

    async fn get(&self, name: &str) -> Result<T, StoreError>;

    async fn list(&self) -> Result<Vec<T>, StoreError>;

    async fn create(&self, obj: T) -> Result<T, StoreError>;

    async fn update(&self, obj: T) -> Result<T, StoreError>;

    /// Requests deletion. Objects holding finalizers are marked and kept
    /// until the finalizers clear; others are removed immediately.
    async fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// Subscribes to changes. Events may be dropped under backpressure;
    /// consumers requeue full syncs rather than relying on completeness.
    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>>;
}

pub type SharedStore<T> = Arc<dyn Store<T>>;

/// Read access to the orchestrator's own Node objects, for owner
/// references and topology labels.
#[async_trait]
pub trait ClusterNodeStore: Send + Sync {
    async fn get(
        &self,
        name: &str,
    ) -> Result<lvm_types::ClusterNode, StoreError>;

    async fn list(&self) -> Result<Vec<lvm_types::ClusterNode>, StoreError>;
}

/// Access to volume claims. Claims live in arbitrary user namespaces, so
/// unlike [`Store`] this trait is cluster-scoped and addresses objects by
/// namespace and name.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Claim, StoreError>;

    async fn update(&self, claim: Claim) -> Result<Claim, StoreError>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent<Claim>>;
}

/// Polls until the volume reaches a terminal provisioning state (Ready or
/// Failed). Ticks once per second; the caller bounds the wait with its own
/// deadline.
pub async fn wait_until_processed(
    store: &dyn Store<LvmVolume>,
    name: &str,
) -> Result<LvmVolume, StoreError> {
    loop {
        let vol = store.get(name).await?;
        match vol.status.state {
            VolState::Ready | VolState::Failed => return Ok(vol),
            VolState::Pending => {}
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Polls until the volume is gone from the store. Ticks once per second;
/// the caller bounds the wait with its own deadline.
pub async fn wait_until_destroyed(
    store: &dyn Store<LvmVolume>,
    name: &str,
) -> Result<(), StoreError> {
    loop {
        match store.get(name).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
