// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ErrorKind;
use crate::procs::handle::{ExitEvent, ProcessHandle};
use crate::procs::logger::{OutputCollector, DEFAULT_LOG_BUFFER};
use crate::procs::readiness::{ReadinessProbe, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PROBE_INTERVAL};
use crate::procs::{ProcessState, SignalKind};
use crate::service::{validate_specs, ServiceSpec};
use crate::Error;

pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_SPAWN_FAILED: i32 = 3;
pub const EXIT_READINESS_TIMEOUT: i32 = 4;
pub const EXIT_UNEXPECTED_EXIT: i32 = 5;
pub const EXIT_FORCED_KILL: i32 = 6;

/// Session wide settings, per service settings live on [`ServiceSpec`]
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub probe_interval: Duration,
    pub connect_timeout: Duration,
    /// How long to wait for the reap after a forced kill
    pub kill_timeout: Duration,
    /// How long to wait for output to drain once a service is gone
    pub flush_timeout: Duration,
    pub log_buffer: usize,
    /// `PATH` style list used to resolve service programs
    pub search_path: Option<OsString>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            kill_timeout: Duration::from_secs(5),
            flush_timeout: Duration::from_secs(1),
            log_buffer: DEFAULT_LOG_BUFFER,
            search_path: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Initializing,
    AllReady,
    Degraded,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::AllReady => "all ready",
            Self::Degraded => "degraded",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Everything that can change a handle's state, applied in order by the supervisor loop
#[derive(Debug)]
pub enum Event {
    Ready { index: usize, elapsed: Duration },
    NotReady { index: usize, error: Error },
    Exited { index: usize, code: i32 },
}

impl From<ExitEvent> for Event {
    fn from(exit: ExitEvent) -> Self {
        Event::Exited {
            index: exit.index,
            code: exit.code,
        }
    }
}

/// Why the session ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShutdownCause {
    /// The external termination signal
    Interrupted,
    SpawnFailed { service: String, error: String },
    ReadinessTimeout { service: String, timeout: Duration },
    UnexpectedExit { service: String, code: i32 },
}

impl ShutdownCause {
    /// The service that brought the session down, if any
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::Interrupted => None,
            Self::SpawnFailed { service, .. }
            | Self::ReadinessTimeout { service, .. }
            | Self::UnexpectedExit { service, .. } => Some(service),
        }
    }
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted => f.write_str("termination requested"),
            Self::SpawnFailed { service, error } => {
                write!(f, "spawn failure of {}: {}", service, error)
            }
            Self::ReadinessTimeout { service, timeout } => {
                write!(f, "readiness timeout of {} after {:?}", service, timeout)
            }
            Self::UnexpectedExit { service, code } => {
                write!(f, "unexpected exit of {} with code {}", service, code)
            }
        }
    }
}

/// Final state of one service; `None` if it was never started
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceReport {
    pub name: String,
    pub pid: Option<u32>,
    pub state: Option<ProcessState>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    pub cause: ShutdownCause,
    pub reached_all_ready: bool,
    pub services: Vec<ServiceReport>,
}

impl SessionReport {
    pub fn service(&self, name: &str) -> Option<&ServiceReport> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn forced_kill(&self) -> bool {
        self.services
            .iter()
            .any(|s| s.state == Some(ProcessState::Killed))
    }

    /// Process exit code for the supervisor itself
    pub fn exit_code(&self) -> i32 {
        match self.cause {
            ShutdownCause::Interrupted if self.forced_kill() => EXIT_FORCED_KILL,
            ShutdownCause::Interrupted => EXIT_OK,
            ShutdownCause::SpawnFailed { .. } => EXIT_SPAWN_FAILED,
            ShutdownCause::ReadinessTimeout { .. } => EXIT_READINESS_TIMEOUT,
            ShutdownCause::UnexpectedExit { .. } => EXIT_UNEXPECTED_EXIT,
        }
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "stopped: {}", self.cause)?;
        for service in &self.services {
            match (service.pid, service.state) {
                (Some(pid), Some(state)) => {
                    writeln!(f, "  {:<16} pid {:<8} {}", service.name, pid, state)?
                }
                _ => writeln!(f, "  {:<16} {:<12} not started", service.name, "")?,
            }
        }
        Ok(())
    }
}

/// Launch and monitor a fixed set of services
///
/// Rules:
///   - every service starts, and becomes ready, or none stay running
///   - any service exiting takes the rest down, in reverse start order
///   - the external termination signal takes everything down
///   - every handle state change is applied here, from one event queue
pub struct Supervisor {
    specs: Vec<Arc<ServiceSpec>>,
    config: SupervisorConfig,
    probe: ReadinessProbe,
    collector: OutputCollector,
    status: watch::Sender<SessionStatus>,
}

impl Supervisor {
    /// Validates `specs`; nothing is started until [`Supervisor::run`]
    pub fn new(
        specs: Vec<ServiceSpec>,
        config: SupervisorConfig,
        collector: OutputCollector,
    ) -> Result<Self, Error> {
        validate_specs(&specs, config.search_path.as_deref())?;

        let probe = ReadinessProbe::tcp(config.probe_interval, config.connect_timeout);
        let (status, _) = watch::channel(SessionStatus::Initializing);

        Ok(Self {
            specs: specs.into_iter().map(Arc::new).collect(),
            config,
            probe,
            collector,
            status,
        })
    }

    /// Replace the TCP readiness check
    pub fn with_probe(mut self, probe: ReadinessProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn specs(&self) -> &[Arc<ServiceSpec>] {
        &self.specs
    }

    /// Run the session until a service fails or `shutdown` completes
    pub async fn run<F>(self, shutdown: F) -> SessionReport
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let (events_tx, mut events) = mpsc::unbounded_channel::<Event>();
        let mut handles: Vec<ProcessHandle> = Vec::with_capacity(self.specs.len());
        let mut probes: Vec<JoinHandle<()>> = Vec::with_capacity(self.specs.len());

        self.set_status(SessionStatus::Initializing);
        info!(services = self.specs.len(), "starting session");

        let (cause, reached_all_ready) =
            match self.start_all(&mut handles, &mut probes, &events_tx) {
                Err(cause) => (cause, false),
                Ok(()) => match self
                    .await_ready(&mut handles, &mut events, shutdown.as_mut())
                    .await
                {
                    Err(cause) => (cause, false),
                    Ok(()) => match self.announce_ready(&mut handles, shutdown.as_mut()).await {
                        Err(cause) => (cause, false),
                        Ok(()) => {
                            let cause = self
                                .monitor(&mut handles, &mut events, shutdown.as_mut())
                                .await;
                            (cause, true)
                        }
                    },
                },
            };

        self.stop_all(handles, probes, cause, reached_all_ready)
            .await
    }

    fn set_status(&self, status: SessionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(from = %previous, to = %status, "session status");
        }
    }

    /// Spawn every service in order, each one's readiness probe starting right after its spawn
    fn start_all(
        &self,
        handles: &mut Vec<ProcessHandle>,
        probes: &mut Vec<JoinHandle<()>>,
        events: &mpsc::UnboundedSender<Event>,
    ) -> Result<(), ShutdownCause> {
        for (index, spec) in self.specs.iter().enumerate() {
            let (mut handle, output) =
                match ProcessHandle::start(Arc::clone(spec), index, events.clone()) {
                    Ok(started) => started,
                    Err(e) => {
                        error!(service = %spec.name, "{}", e);
                        return Err(ShutdownCause::SpawnFailed {
                            service: spec.name.clone(),
                            error: e.to_string(),
                        });
                    }
                };

            handle.set_readers(self.collector.attach(&spec.name, output));
            probes.push(self.spawn_probe(index, Arc::clone(spec), events.clone()));
            handles.push(handle);
        }

        Ok(())
    }

    fn spawn_probe(
        &self,
        index: usize,
        spec: Arc<ServiceSpec>,
        events: mpsc::UnboundedSender<Event>,
    ) -> JoinHandle<()> {
        let probe = self.probe.clone();

        tokio::spawn(async move {
            let result = probe
                .probe(
                    &spec.name,
                    spec.probe_host(),
                    spec.port,
                    spec.readiness_timeout,
                )
                .await;

            let event = match result {
                Ok(elapsed) => Event::Ready { index, elapsed },
                Err(error) => Event::NotReady { index, error },
            };
            events.send(event).ok();
        })
    }

    async fn await_ready<F>(
        &self,
        handles: &mut [ProcessHandle],
        events: &mut mpsc::UnboundedReceiver<Event>,
        mut shutdown: Pin<&mut F>,
    ) -> Result<(), ShutdownCause>
    where
        F: Future<Output = ()>,
    {
        while !handles.iter().all(|h| h.state().is_up()) {
            tokio::select! {
                biased;
                _ = shutdown.as_mut() => {
                    info!("termination requested during startup");
                    return Err(ShutdownCause::Interrupted);
                }
                event = events.recv() => match event {
                    Some(Event::Ready { index, elapsed }) => {
                        let handle = &mut handles[index];
                        if handle.mark_ready() {
                            info!(service = %handle.name(), ?elapsed, "ready");
                        }
                    }
                    Some(Event::NotReady { index, error }) => {
                        let handle = &handles[index];
                        error!(service = %handle.name(), state = %handle.state(), "{}", error);
                        let timeout = match error.kind() {
                            ErrorKind::ReadinessTimeout { timeout, .. } => *timeout,
                            _ => handle.spec().readiness_timeout,
                        };
                        return Err(ShutdownCause::ReadinessTimeout {
                            service: handle.name().to_string(),
                            timeout,
                        });
                    }
                    Some(Event::Exited { index, code }) => {
                        let handle = &mut handles[index];
                        handle.record_exit(code);
                        error!(service = %handle.name(), code, "exited before becoming ready");
                        return Err(ShutdownCause::UnexpectedExit {
                            service: handle.name().to_string(),
                            code,
                        });
                    }
                    // all senders gone, nothing left to wait for
                    None => return Err(ShutdownCause::Interrupted),
                },
            }
        }

        Ok(())
    }

    /// Every service is up: confirm each exactly once, then mark them running.
    ///
    /// A stalled log sink never delays termination.
    async fn announce_ready<F>(
        &self,
        handles: &mut [ProcessHandle],
        mut shutdown: Pin<&mut F>,
    ) -> Result<(), ShutdownCause>
    where
        F: Future<Output = ()>,
    {
        for handle in handles.iter_mut() {
            let notice = format!("ready on {}", handle.spec().address());
            tokio::select! {
                biased;
                _ = shutdown.as_mut() => {
                    info!("termination requested while announcing readiness");
                    return Err(ShutdownCause::Interrupted);
                }
                _ = self.collector.notice(handle.name(), notice) => (),
            }
            handle.mark_running();
        }

        self.set_status(SessionStatus::AllReady);
        info!("all services ready");
        Ok(())
    }

    async fn monitor<F>(
        &self,
        handles: &mut [ProcessHandle],
        events: &mut mpsc::UnboundedReceiver<Event>,
        mut shutdown: Pin<&mut F>,
    ) -> ShutdownCause
    where
        F: Future<Output = ()>,
    {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.as_mut() => {
                    info!("termination requested");
                    return ShutdownCause::Interrupted;
                }
                event = events.recv() => match event {
                    Some(Event::Exited { index, code }) => {
                        let handle = &mut handles[index];
                        handle.record_exit(code);
                        self.set_status(SessionStatus::Degraded);
                        error!(service = %handle.name(), code, "exited unexpectedly");
                        return ShutdownCause::UnexpectedExit {
                            service: handle.name().to_string(),
                            code,
                        };
                    }
                    // late probe results, everything is already up
                    Some(Event::Ready { .. }) | Some(Event::NotReady { .. }) => (),
                    None => return ShutdownCause::Interrupted,
                },
            }
        }
    }

    /// Stop everything that is still alive, newest first, and report
    async fn stop_all(
        &self,
        mut handles: Vec<ProcessHandle>,
        probes: Vec<JoinHandle<()>>,
        cause: ShutdownCause,
        reached_all_ready: bool,
    ) -> SessionReport {
        probes.iter().for_each(JoinHandle::abort);
        self.set_status(SessionStatus::ShuttingDown);

        match cause.service() {
            Some(service) => error!(service, "shutting down: {}", cause),
            None => info!("shutting down: {}", cause),
        }
        for handle in &handles {
            info!(service = %handle.name(), pid = handle.pid(), state = %handle.state(), "state at shutdown");
        }

        // every group, even when its leader is gone, workers may be left in it
        for handle in handles.iter_mut().rev() {
            match handle.signal(SignalKind::Terminate) {
                Ok(true) => self.collector.try_notice(handle.name(), "terminating"),
                Ok(false) => (),
                // keep going, every handle gets visited
                Err(e) => warn!(service = %handle.name(), "{}", e),
            }
        }

        let kill_timeout = self.config.kill_timeout;
        join_all(handles.iter_mut().rev().map(|handle| {
            let grace = handle.spec().grace_period;
            handle.settle(grace, kill_timeout)
        }))
        .await;

        for handle in &handles {
            let notice = format!("stopped, {}", handle.state());
            self.collector.try_notice(handle.name(), notice);
        }

        let flush_timeout = self.config.flush_timeout;
        join_all(handles.iter_mut().map(|handle| handle.release(flush_timeout))).await;

        let services = self
            .specs
            .iter()
            .enumerate()
            .map(|(index, spec)| match handles.get(index) {
                Some(handle) => ServiceReport {
                    name: spec.name.clone(),
                    pid: Some(handle.pid()),
                    state: Some(handle.state()),
                },
                None => ServiceReport {
                    name: spec.name.clone(),
                    pid: None,
                    state: None,
                },
            })
            .collect();

        let report = SessionReport {
            cause,
            reached_all_ready,
            services,
        };

        self.set_status(SessionStatus::Stopped);
        for service in &report.services {
            match service.state {
                Some(state) => info!(service = %service.name, %state, "final state"),
                None => info!(service = %service.name, "never started"),
            }
        }
        info!(exit_code = report.exit_code(), "session stopped: {}", report.cause);

        report
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("specs", &self.specs)
            .field("config", &self.config)
            .field("status", &*self.status.borrow())
            .finish()
    }
}
