// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Stasis Contributors

//! Command handlers.

pub mod check;
pub mod dump;
pub mod ps;
pub mod restore;
pub mod run;

use tokio_util::sync::CancellationToken;

/// A cancellation token wired to Ctrl-C, so an in-flight dump or restore
/// tears the engine child down instead of orphaning it.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling operation");
            trigger.cancel();
        }
    });
    cancel
}
