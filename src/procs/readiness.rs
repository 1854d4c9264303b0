// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace};

use crate::error::ErrorKind;
use crate::Error;

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// A single readiness check against a service's declared address
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn check(&self, host: &str, port: u16) -> bool;
}

/// Ready means a TCP connection to the port succeeds
#[derive(Clone, Copy, Debug)]
pub struct TcpProbe {
    pub connect_timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn check(&self, host: &str, port: u16) -> bool {
        match timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                trace!(host, port, "connect failed: {}", e);
                false
            }
            Err(_) => false,
        }
    }
}

/// Polls a [`Probe`] on a fixed interval until it passes or time runs out
#[derive(Clone)]
pub struct ReadinessProbe {
    interval: Duration,
    probe: Arc<dyn Probe>,
}

impl ReadinessProbe {
    pub fn new(interval: Duration, probe: Arc<dyn Probe>) -> Self {
        Self { interval, probe }
    }

    pub fn tcp(interval: Duration, connect_timeout: Duration) -> Self {
        Self::new(interval, Arc::new(TcpProbe { connect_timeout }))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns how long the service took to become ready.
    ///
    /// The first check is immediate; a check in flight when the deadline passes still counts.
    pub async fn probe(
        &self,
        service: &str,
        host: &str,
        port: u16,
        limit: Duration,
    ) -> Result<Duration, Error> {
        let started = Instant::now();
        let deadline = started + limit;

        loop {
            if self.probe.check(host, port).await {
                let elapsed = started.elapsed();
                debug!(service, host, port, ?elapsed, "accepting connections");
                return Ok(elapsed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ErrorKind::ReadinessTimeout {
                    service: service.to_string(),
                    address: format!("{}:{}", host, port),
                    timeout: limit,
                }
                .into());
            }

            sleep(self.interval.min(deadline - now)).await;
        }
    }
}

impl std::fmt::Debug for ReadinessProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessProbe")
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Passes from the nth check on
    struct Countdown(AtomicUsize);

    #[async_trait]
    impl Probe for Countdown {
        async fn check(&self, _host: &str, _port: u16) -> bool {
            self.0.fetch_sub(1, Ordering::SeqCst) <= 1
        }
    }

    #[tokio::test]
    async fn ready_once_the_port_is_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = ReadinessProbe::tcp(Duration::from_millis(20), DEFAULT_CONNECT_TIMEOUT);
        probe
            .probe("api", "127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn times_out_naming_the_service() {
        // reserve a port, then close it
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let probe = ReadinessProbe::tcp(Duration::from_millis(20), DEFAULT_CONNECT_TIMEOUT);
        let err = probe
            .probe("api", "127.0.0.1", port, Duration::from_millis(200))
            .await
            .unwrap_err();

        match err.kind() {
            ErrorKind::ReadinessTimeout {
                service, timeout, ..
            } => {
                assert_eq!(service, "api");
                assert_eq!(*timeout, Duration::from_millis(200));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn retries_on_the_interval() {
        let countdown = Arc::new(Countdown(AtomicUsize::new(3)));
        let probe = ReadinessProbe::new(Duration::from_millis(10), countdown.clone());

        probe
            .probe("ui", "127.0.0.1", 8501, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(countdown.0.load(Ordering::SeqCst), 0);
    }
}
