// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared facilities for the LVM driver: capacity arithmetic, runtime
//! settings, the I/O-limit store and the rate-limited work queue used by
//! every reconciler.

use std::collections::HashMap;

pub mod capacity;
#[cfg(feature = "testing")]
pub mod dev;
pub mod iolimit;
pub mod settings;
pub mod workqueue;

/// Lower-cases the keys of a parameter map.
///
/// Storage-class parameter keys may be mistyped in ways schema validation
/// will not catch; since the documented keys are all lower-case, keys (not
/// values) are safely case-folded before lookup.
pub fn case_insensitive_map(
    params: &HashMap<String, String>,
) -> HashMap<String, String> {
    params
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.clone()))
        .collect()
}
