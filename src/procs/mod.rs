// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod handle;
mod launcher;
mod logger;
mod readiness;
mod signals;
mod supervisor;

pub use handle::{ExitEvent, ProcessHandle};
pub use launcher::{ProcessOutput, StdIoConf};
pub use logger::{
    drain, ConsoleSink, LogReceiver, LogRecord, LogSink, OutputCollector, StreamKind,
};
pub use readiness::{Probe, ReadinessProbe, TcpProbe};
pub use signals::shutdown_signals;
pub use supervisor::{
    Event, ServiceReport, SessionReport, SessionStatus, ShutdownCause, Supervisor,
    SupervisorConfig, EXIT_CONFIG, EXIT_FORCED_KILL, EXIT_OK, EXIT_READINESS_TIMEOUT,
    EXIT_SPAWN_FAILED, EXIT_UNEXPECTED_EXIT,
};

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::Signal;

/// Lifecycle of a single supervised process
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawned, not yet accepting connections
    Starting,
    /// Accepting connections on its port
    Ready,
    /// Ready, and the whole session is up
    Running,
    /// Terminated on its own or after a graceful request, with its exit code
    Exited(i32),
    /// Had to be forcibly killed
    Killed,
}

impl ProcessState {
    pub fn is_alive(self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Running)
    }

    pub fn is_up(self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => f.write_str("starting"),
            Self::Ready => f.write_str("ready"),
            Self::Running => f.write_str("running"),
            Self::Exited(code) => write!(f, "exited({})", code),
            Self::Killed => f.write_str("killed"),
        }
    }
}

/// Signals the supervisor sends to its services
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalKind {
    /// Graceful, SIGTERM
    Terminate,
    /// Forced, SIGKILL
    Kill,
}

impl From<SignalKind> for Signal {
    fn from(kind: SignalKind) -> Self {
        match kind {
            SignalKind::Terminate => Signal::SIGTERM,
            SignalKind::Kill => Signal::SIGKILL,
        }
    }
}

/// Shell convention: processes ended by a signal report `128 + signal`
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Whether `pid` is still a live process; a zombie waiting on its reaper is not
#[cfg(test)]
pub(crate) fn is_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // the state follows the parenthesized command name
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map_or(false, |rest| !rest.trim_start().starts_with('Z')),
        Err(_) => false,
    }
}
