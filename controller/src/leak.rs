// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Claim-level leak protection.
//!
//! `CreateVolume` may have written an `LvmVolume` (and the agent may have
//! carved a real LV) before the persistent-volume object binds. If the
//! user deletes the claim inside that window nothing else would ever
//! clean up. This controller brackets every creation: a finalizer plus a
//! proposed-volume annotation go onto the claim before the volume object
//! is written, an in-flight set serializes creation against deletion, and
//! the claim watch tears the volume down end-to-end when an unbound claim
//! dies.

use async_trait::async_trait;
use futures::future;
use lvm_types::csi::Status;
use lvm_types::Claim;
use lvm_store::{ClaimStore, StoreError, WatchEvent};
use lvm_common::workqueue::WorkQueue;
use slog::{error, info, o, warn, Logger};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Finalizer held on claims with a creation in flight. `DRIVER_NAME`
/// scoped.
pub const LEAK_PROTECTION_FINALIZER: &str =
    "local.csi.openebs.io/csi-leak-protection";

/// Annotation recording the volume name proposed for a claim, so cleanup
/// knows what to delete.
pub const PROPOSED_VOLUME_ANNOTATION: &str =
    "local.csi.openebs.io/proposed-volume-name";

/// Claim workers; two keep one slow cleanup from starving the bound-claim
/// finalizer removal path.
const WORKERS: usize = 2;

/// Deletes a volume end-to-end, including waiting for the owning agent to
/// destroy the logical volume. Implemented by the provisioning pipeline.
#[async_trait]
pub trait VolumeCleanup: Send + Sync {
    async fn delete_volume(&self, volume_name: &str)
        -> Result<(), StoreError>;
}

type InFlight = Arc<Mutex<HashSet<String>>>;

/// Releases an in-flight claim slot on drop.
pub struct InFlightGuard {
    set: InFlight,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.key);
    }
}

#[derive(Debug, thiserror::Error)]
enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The claim's in-flight slot is held by a live creation; come back
    /// later.
    #[error("claim creation in progress")]
    Busy,
}

pub struct LeakProtector {
    log: Logger,
    claims: Arc<dyn ClaimStore>,
    cleanup: Arc<dyn VolumeCleanup>,
    in_flight: InFlight,
    queue: Arc<WorkQueue<String>>,
}

impl LeakProtector {
    pub fn new(
        log: &Logger,
        claims: Arc<dyn ClaimStore>,
        cleanup: Arc<dyn VolumeCleanup>,
    ) -> Arc<LeakProtector> {
        Arc::new(LeakProtector {
            log: log.new(o!("component" => "LeakProtector")),
            claims,
            cleanup,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            queue: WorkQueue::new("claim"),
        })
    }

    /// Starts the claim watch and workers. Runs until aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self: Arc<Self>) {
        match self.claims.list().await {
            Ok(claims) => {
                for claim in &claims {
                    self.enqueue(claim);
                }
            }
            Err(err) => {
                warn!(self.log, "initial claim list failed"; "error" => %err);
            }
        }
        let workers = future::join_all((0..WORKERS).map(|_| self.worker()));
        tokio::join!(self.event_pump(), workers);
    }

    fn enqueue(&self, claim: &Claim) {
        // Only claims we bracketed are interesting.
        if !claim.metadata.has_finalizer(LEAK_PROTECTION_FINALIZER) {
            return;
        }
        self.queue.add(claim.metadata.key());
    }

    async fn event_pump(&self) {
        let mut events = self.claims.watch();
        loop {
            match events.recv().await {
                Ok(WatchEvent::Applied(claim)) => self.enqueue(&claim),
                Ok(WatchEvent::Deleted(_)) => {}
                Err(RecvError::Lagged(_)) => {
                    if let Ok(claims) = self.claims.list().await {
                        for claim in &claims {
                            self.enqueue(claim);
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn worker(&self) {
        while let Some(key) = self.queue.next().await {
            match self.sync(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(err) => {
                    warn!(self.log, "claim sync failed, requeuing";
                        "claim" => &key, "error" => %err);
                    WorkQueue::requeue_rate_limited(&self.queue, key.clone());
                }
            }
            self.queue.done(&key);
        }
    }

    fn try_acquire(&self, key: &str) -> Option<InFlightGuard> {
        let mut set = self.in_flight.lock().unwrap();
        if !set.insert(key.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(&self.in_flight),
            key: key.to_string(),
        })
    }

    /// Brackets a volume creation for `claim_namespace/claim_name`.
    ///
    /// Refuses claims already marked for deletion and claims with another
    /// creation in flight; otherwise stamps the claim with the proposed
    /// volume name and the finalizer and returns a guard that must stay
    /// alive until the creation settles.
    pub async fn begin_create_volume(
        &self,
        volume_name: &str,
        claim_namespace: &str,
        claim_name: &str,
    ) -> Result<InFlightGuard, Status> {
        let key = format!("{claim_namespace}/{claim_name}");

        let mut claim = self
            .claims
            .get(claim_namespace, claim_name)
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    Status::failed_precondition(format!(
                        "claim {key} no longer exists"
                    ))
                } else {
                    Status::internal(err)
                }
            })?;
        if claim.metadata.is_deleting() {
            return Err(Status::failed_precondition(format!(
                "claim {key} is being deleted"
            )));
        }

        // Holding the slot guarantees the deletion path can never run
        // concurrently with this creation.
        let guard = self.try_acquire(&key).ok_or_else(|| {
            Status::aborted(format!("creation in progress for claim {key}"))
        })?;

        let mut changed = !claim
            .metadata
            .has_finalizer(LEAK_PROTECTION_FINALIZER);
        claim.metadata.add_finalizer(LEAK_PROTECTION_FINALIZER);
        let annotation = claim
            .metadata
            .annotations
            .insert(PROPOSED_VOLUME_ANNOTATION.to_string(), volume_name.to_string());
        changed |= annotation.as_deref() != Some(volume_name);

        if changed {
            self.claims
                .update(claim)
                .await
                .map_err(|err| Status::internal(err))?;
        }
        Ok(guard)
    }

    async fn sync(&self, key: &str) -> Result<(), SyncError> {
        let (namespace, name) = key.rsplit_once('/').unwrap_or(("", key));
        let mut claim = match self.claims.get(namespace, name).await {
            Ok(claim) => claim,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        if claim.is_bound() {
            // Once bound, the external provisioner owns cleanup; stand
            // down.
            if claim.metadata.remove_finalizer(LEAK_PROTECTION_FINALIZER) {
                self.claims.update(claim).await?;
            }
            return Ok(());
        }

        if !claim.metadata.is_deleting() {
            return Ok(());
        }

        // If the slot is held, a creation is still running; it will fail
        // or settle shortly and we retry with back-off.
        let Some(_guard) = self.try_acquire(key) else {
            return Err(SyncError::Busy);
        };

        if let Some(volume_name) =
            claim.metadata.annotations.get(PROPOSED_VOLUME_ANNOTATION).cloned()
        {
            match self.cleanup.delete_volume(&volume_name).await {
                Ok(()) => {
                    info!(self.log, "cleaned up volume for deleted claim";
                        "claim" => key, "volume" => &volume_name);
                }
                Err(err) if err.retryable() => return Err(err.into()),
                Err(err) => {
                    // Keep the finalizer: the claim stays Terminating
                    // until an operator resolves this.
                    error!(
                        self.log,
                        "volume cleanup for deleted claim failed";
                        "claim" => key,
                        "volume" => &volume_name,
                        "error" => %err
                    );
                    return Ok(());
                }
            }
        }

        claim.metadata.remove_finalizer(LEAK_PROTECTION_FINALIZER);
        self.claims.update(claim).await?;
        Ok(())
    }
}
