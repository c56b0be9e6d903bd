// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Projection of the orchestrator's volume claim object, as consumed by
//! the leak-protection controller.

use crate::meta::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Binding phase of a claim. Once a claim is `Bound` the external
/// provisioner owns volume cleanup and leak protection stands down.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum ClaimPhase {
    #[default]
    Pending,
    Bound,
    Lost,
}

/// A persistent volume claim, reduced to the fields leak protection needs:
/// identity, finalizers, annotations and binding phase.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub phase: ClaimPhase,
}

impl Claim {
    pub fn is_bound(&self) -> bool {
        matches!(self.phase, ClaimPhase::Bound)
    }
}
