// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory store backend.
//!
//! Used as the injectable fake in every reconciler and pipeline test, and
//! as the reference for the deletion/finalizer semantics an external
//! client adapter must provide.

use crate::{
    ApiObject, ClaimStore, ClusterNodeStore, Store, StoreError, WatchEvent,
};
use async_trait::async_trait;
use chrono::Utc;
use lvm_types::{Claim, ClusterNode};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

const WATCH_CHANNEL_SIZE: usize = 256;

/// A single-namespace, single-type in-memory collection.
pub struct MemStore<T> {
    namespace: String,
    objects: Mutex<BTreeMap<String, T>>,
    tx: broadcast::Sender<WatchEvent<T>>,
}

impl<T: ApiObject> MemStore<T> {
    pub fn new(namespace: &str) -> MemStore<T> {
        let (tx, _) = broadcast::channel(WATCH_CHANNEL_SIZE);
        MemStore {
            namespace: namespace.to_string(),
            objects: Mutex::new(BTreeMap::new()),
            tx,
        }
    }

    fn emit(&self, event: WatchEvent<T>) {
        // Nobody listening is fine; reconcilers may not have started yet.
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl<T: ApiObject> Store<T> for MemStore<T> {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(&self, name: &str) -> Result<T, StoreError> {
        let objects = self.objects.lock().unwrap();
        objects.get(name).cloned().ok_or(StoreError::NotFound {
            kind: T::KIND,
            name: name.to_string(),
        })
    }

    async fn list(&self) -> Result<Vec<T>, StoreError> {
        let objects = self.objects.lock().unwrap();
        Ok(objects.values().cloned().collect())
    }

    async fn create(&self, mut obj: T) -> Result<T, StoreError> {
        let mut objects = self.objects.lock().unwrap();
        let name = obj.metadata().name.clone();
        if objects.contains_key(&name) {
            return Err(StoreError::AlreadyExists { kind: T::KIND, name });
        }
        {
            let meta = obj.metadata_mut();
            meta.namespace = self.namespace.clone();
            if meta.uid.is_nil() {
                meta.uid = Uuid::new_v4();
            }
            meta.generation = 1;
        }
        objects.insert(name, obj.clone());
        drop(objects);
        self.emit(WatchEvent::Applied(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, mut obj: T) -> Result<T, StoreError> {
        let mut objects = self.objects.lock().unwrap();
        let name = obj.metadata().name.clone();
        let Some(stored) = objects.get(&name) else {
            return Err(StoreError::NotFound { kind: T::KIND, name });
        };

        // A deletion mark can never be un-set by a writer that raced the
        // delete.
        let deletion_timestamp = obj
            .metadata()
            .deletion_timestamp
            .or(stored.metadata().deletion_timestamp);
        {
            let meta = obj.metadata_mut();
            meta.deletion_timestamp = deletion_timestamp;
            meta.generation = stored.metadata().generation + 1;
        }

        if obj.metadata().is_deleting() && obj.metadata().finalizers.is_empty()
        {
            objects.remove(&name);
            drop(objects);
            self.emit(WatchEvent::Deleted(obj.clone()));
        } else {
            objects.insert(name, obj.clone());
            drop(objects);
            self.emit(WatchEvent::Applied(obj.clone()));
        }
        Ok(obj)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().unwrap();
        let Some(stored) = objects.get_mut(name) else {
            return Err(StoreError::NotFound {
                kind: T::KIND,
                name: name.to_string(),
            });
        };

        if stored.metadata().finalizers.is_empty() {
            let obj = objects.remove(name).unwrap();
            drop(objects);
            self.emit(WatchEvent::Deleted(obj));
        } else {
            if stored.metadata().deletion_timestamp.is_none() {
                stored.metadata_mut().deletion_timestamp = Some(Utc::now());
            }
            let obj = stored.clone();
            drop(objects);
            self.emit(WatchEvent::Applied(obj));
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.tx.subscribe()
    }
}

/// In-memory projection of the orchestrator's Node objects.
#[derive(Default)]
pub struct MemClusterNodes {
    nodes: Mutex<BTreeMap<String, ClusterNode>>,
}

impl MemClusterNodes {
    pub fn new() -> MemClusterNodes {
        MemClusterNodes::default()
    }

    pub fn upsert(&self, node: ClusterNode) {
        self.nodes.lock().unwrap().insert(node.name.clone(), node);
    }

    pub fn remove(&self, name: &str) {
        self.nodes.lock().unwrap().remove(name);
    }
}

#[async_trait]
impl ClusterNodeStore for MemClusterNodes {
    async fn get(&self, name: &str) -> Result<ClusterNode, StoreError> {
        self.nodes.lock().unwrap().get(name).cloned().ok_or(
            StoreError::NotFound { kind: "node", name: name.to_string() },
        )
    }

    async fn list(&self) -> Result<Vec<ClusterNode>, StoreError> {
        Ok(self.nodes.lock().unwrap().values().cloned().collect())
    }
}

/// In-memory claim collection, keyed by `namespace/name`.
pub struct MemClaims {
    claims: Mutex<BTreeMap<String, Claim>>,
    tx: broadcast::Sender<WatchEvent<Claim>>,
}

impl Default for MemClaims {
    fn default() -> MemClaims {
        MemClaims::new()
    }
}

impl MemClaims {
    pub fn new() -> MemClaims {
        let (tx, _) = broadcast::channel(WATCH_CHANNEL_SIZE);
        MemClaims { claims: Mutex::new(BTreeMap::new()), tx }
    }

    fn emit(&self, event: WatchEvent<Claim>) {
        let _ = self.tx.send(event);
    }

    /// Creates a claim, standing in for the user-side apply.
    pub fn create(&self, mut claim: Claim) {
        if claim.metadata.uid.is_nil() {
            claim.metadata.uid = Uuid::new_v4();
        }
        claim.metadata.generation = 1;
        let key = claim.metadata.key();
        self.claims.lock().unwrap().insert(key, claim.clone());
        self.emit(WatchEvent::Applied(claim));
    }

    /// Requests deletion of a claim, standing in for the user deleting it.
    /// Finalizers hold the claim in Terminating, as the API server would.
    pub fn request_delete(&self, namespace: &str, name: &str) {
        let key = format!("{namespace}/{name}");
        let mut claims = self.claims.lock().unwrap();
        let Some(claim) = claims.get_mut(&key) else {
            return;
        };
        if claim.metadata.finalizers.is_empty() {
            let claim = claims.remove(&key).unwrap();
            drop(claims);
            self.emit(WatchEvent::Deleted(claim));
        } else {
            if claim.metadata.deletion_timestamp.is_none() {
                claim.metadata.deletion_timestamp = Some(Utc::now());
            }
            let claim = claim.clone();
            drop(claims);
            self.emit(WatchEvent::Applied(claim));
        }
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.claims
            .lock()
            .unwrap()
            .contains_key(&format!("{namespace}/{name}"))
    }
}

#[async_trait]
impl ClaimStore for MemClaims {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Claim, StoreError> {
        self.claims
            .lock()
            .unwrap()
            .get(&format!("{namespace}/{name}"))
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: Claim::KIND,
                name: format!("{namespace}/{name}"),
            })
    }

    async fn update(&self, mut claim: Claim) -> Result<Claim, StoreError> {
        let key = claim.metadata.key();
        let mut claims = self.claims.lock().unwrap();
        let Some(stored) = claims.get(&key) else {
            return Err(StoreError::NotFound { kind: Claim::KIND, name: key });
        };

        let deletion_timestamp = claim
            .metadata
            .deletion_timestamp
            .or(stored.metadata.deletion_timestamp);
        claim.metadata.deletion_timestamp = deletion_timestamp;
        claim.metadata.generation = stored.metadata.generation + 1;

        if claim.metadata.is_deleting()
            && claim.metadata.finalizers.is_empty()
        {
            claims.remove(&key);
            drop(claims);
            self.emit(WatchEvent::Deleted(claim.clone()));
        } else {
            claims.insert(key, claim.clone());
            drop(claims);
            self.emit(WatchEvent::Applied(claim.clone()));
        }
        Ok(claim)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<Claim>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lvm_types::{LvmVolume, ObjectMeta, VOLUME_FINALIZER};

    fn volume(name: &str) -> LvmVolume {
        LvmVolume {
            metadata: ObjectMeta::new("", name),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_assigns_identity_and_rejects_duplicates() {
        let store = MemStore::<LvmVolume>::new("openebs");
        let created = store.create(volume("pvc-1")).await.unwrap();
        assert!(!created.metadata.uid.is_nil());
        assert_eq!(created.metadata.namespace, "openebs");
        assert_eq!(created.metadata.generation, 1);

        let err = store.create(volume("pvc-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn delete_without_finalizers_removes_immediately() {
        let store = MemStore::<LvmVolume>::new("openebs");
        store.create(volume("pvc-1")).await.unwrap();
        store.delete("pvc-1").await.unwrap();
        assert!(store.get("pvc-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn finalizers_hold_a_deleted_object_until_cleared() {
        let store = MemStore::<LvmVolume>::new("openebs");
        let mut vol = store.create(volume("pvc-1")).await.unwrap();
        vol.metadata.add_finalizer(VOLUME_FINALIZER);
        let mut vol = store.update(vol).await.unwrap();

        store.delete("pvc-1").await.unwrap();
        let held = store.get("pvc-1").await.unwrap();
        assert!(held.metadata.is_deleting());

        // Clearing the finalizer on the marked object purges it.
        vol.metadata.deletion_timestamp = held.metadata.deletion_timestamp;
        vol.metadata.remove_finalizer(VOLUME_FINALIZER);
        store.update(vol).await.unwrap();
        assert!(store.get("pvc-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn deletion_mark_survives_racing_updates() {
        let store = MemStore::<LvmVolume>::new("openebs");
        let mut vol = store.create(volume("pvc-1")).await.unwrap();
        vol.metadata.add_finalizer(VOLUME_FINALIZER);
        let stale = store.update(vol).await.unwrap();

        store.delete("pvc-1").await.unwrap();

        // A writer holding the pre-delete copy cannot clear the mark.
        let updated = store.update(stale).await.unwrap();
        assert!(updated.metadata.is_deleting());
    }

    #[tokio::test]
    async fn claims_held_by_finalizers_stay_terminating() {
        let claims = MemClaims::new();
        let mut claim = Claim {
            metadata: ObjectMeta::new("default", "my-claim"),
            ..Default::default()
        };
        claim.metadata.add_finalizer("local.csi.openebs.io/csi-leak-protection");
        claims.create(claim);

        claims.request_delete("default", "my-claim");
        let held = claims.get("default", "my-claim").await.unwrap();
        assert!(held.metadata.is_deleting());

        let mut cleared = held.clone();
        cleared.metadata.finalizers.clear();
        claims.update(cleared).await.unwrap();
        assert!(!claims.contains("default", "my-claim"));
    }

    #[tokio::test]
    async fn watch_sees_applies_and_deletes() {
        let store = MemStore::<LvmVolume>::new("openebs");
        let mut watch = store.watch();

        store.create(volume("pvc-1")).await.unwrap();
        store.delete("pvc-1").await.unwrap();

        assert!(matches!(
            watch.recv().await.unwrap(),
            WatchEvent::Applied(_)
        ));
        assert!(matches!(
            watch.recv().await.unwrap(),
            WatchEvent::Deleted(_)
        ));
    }
}
