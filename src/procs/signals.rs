// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::future::Future;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

/// Completes on SIGTERM, SIGINT or SIGHUP.
///
/// The handlers are installed by this call, not on first poll, so a signal arriving while the
///   services are still being spawned is not lost to the default disposition. Must be called
///   inside a runtime.
pub fn shutdown_signals() -> impl Future<Output = ()> {
    let signals = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::hangup()),
    );

    async move {
        match signals {
            (Ok(mut sigterm), Ok(mut sigint), Ok(mut sighup)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = sigint.recv() => info!("received SIGINT"),
                    _ = sighup.recv() => info!("received SIGHUP"),
                }
            }
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                error!("failed to install signal handlers: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("failed to wait for ctrl-c: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}
