// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test support used across the workspace.

use slog::{o, Drain, Logger};
use std::future::Future;
use std::time::Duration;

/// Returns a logger that writes through the test harness's captured
/// stdout.
pub fn test_logger() -> Logger {
    let decorator =
        slog_term::PlainDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build();
    let drain = std::sync::Mutex::new(drain).fuse();
    Logger::root(drain, o!())
}

/// Polls `condition` every 10 ms until it returns true, panicking with
/// `what` if `timeout` elapses first. Intended for tests that wait on a
/// reconciler to converge.
pub async fn wait_for<F, Fut>(what: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out after {timeout:?} waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
