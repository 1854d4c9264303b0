// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::procs::launcher::{self, ProcessOutput, StdIoConf};
use crate::procs::{exit_code, ProcessState, SignalKind};
use crate::service::ServiceSpec;
use crate::Error;

const GROUP_POLL: Duration = Duration::from_millis(50);

/// Posted by a handle's wait task once the OS reports the process gone
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitEvent {
    pub index: usize,
    pub code: i32,
}

/// Owns one running service process.
///
/// The OS child lives in a dedicated wait task; the handle keeps the pid, the state, and a watch
///   on the exit code. All state changes go through `&mut self`, i.e. through whoever owns the
///   handle, never through the wait task.
#[derive(Debug)]
pub struct ProcessHandle {
    spec: Arc<ServiceSpec>,
    index: usize,
    pid: u32,
    state: ProcessState,
    started_at: DateTime<Utc>,
    exit: watch::Receiver<Option<i32>>,
    /// Set once the kernel reports no process left in the group
    group_gone: bool,
    waiter: JoinHandle<()>,
    readers: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    /// Spawn the service and start waiting for it to exit.
    ///
    /// The exit is reported both on the handle's own watch and as an [`ExitEvent`] on `events`.
    pub fn start<E>(
        spec: Arc<ServiceSpec>,
        index: usize,
        events: mpsc::UnboundedSender<E>,
    ) -> Result<(Self, ProcessOutput), Error>
    where
        E: From<ExitEvent> + Send + 'static,
    {
        let (child, output) = launcher::launch(&spec, StdIoConf::default())?;
        let pid = child.id().ok_or_else(|| ErrorKind::Spawn {
            service: spec.name.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "process has no pid"),
        })?;

        let (exit_tx, exit) = watch::channel(None);
        let waiter = tokio::spawn(wait_for_child(
            Arc::clone(&spec),
            child,
            index,
            exit_tx,
            events,
        ));

        info!(service = %spec.name, pid, "started");

        Ok((
            Self {
                spec,
                index,
                pid,
                state: ProcessState::Starting,
                started_at: Utc::now(),
                exit,
                group_gone: false,
                waiter,
                readers: Vec::new(),
            },
            output,
        ))
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &Arc<ServiceSpec> {
        &self.spec
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The exit code, if the OS has already reported the process gone
    pub fn exited(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// Attach the tasks reading this process's output, see [`ProcessHandle::release`]
    pub fn set_readers(&mut self, readers: Vec<JoinHandle<()>>) {
        self.readers = readers;
    }

    /// `Starting -> Ready`, returns false if the handle was in any other state
    pub fn mark_ready(&mut self) -> bool {
        if self.state == ProcessState::Starting {
            self.state = ProcessState::Ready;
            true
        } else {
            false
        }
    }

    /// `Ready -> Running`, once the whole session is up
    pub fn mark_running(&mut self) {
        if self.state == ProcessState::Ready {
            self.state = ProcessState::Running;
        }
    }

    /// Apply an OS reported exit. A killed process stays `Killed`.
    pub fn record_exit(&mut self, code: i32) {
        if self.state.is_alive() {
            self.state = ProcessState::Exited(code);
        }
    }

    /// Deliver a signal to the service's process group.
    ///
    /// The group outlives its leader when the service forked workers, so an exited leader alone
    ///   does not make this a no-op. Returns `Ok(false)` once the group is empty.
    pub fn signal(&mut self, kind: SignalKind) -> Result<bool, Error> {
        if let Some(code) = self.exited() {
            self.record_exit(code);
        }
        if self.group_gone {
            return Ok(false);
        }

        // the child was started as the leader of its own group
        match killpg(self.pgid(), Signal::from(kind)) {
            Ok(()) => (),
            Err(Errno::ESRCH) => {
                self.group_gone = true;
                return Ok(false);
            }
            Err(source) => {
                return Err(ErrorKind::SignalDelivery {
                    service: self.spec.name.clone(),
                    source,
                }
                .into())
            }
        }

        info!(service = %self.spec.name, pid = self.pid, signal = ?kind, leader = %self.state, "signaled");
        if kind == SignalKind::Kill && self.state.is_alive() {
            self.state = ProcessState::Killed;
        }

        Ok(true)
    }

    /// True while any process is left in the service's group, zombies included
    pub fn group_alive(&mut self) -> bool {
        if self.group_gone {
            return false;
        }

        match killpg(self.pgid(), None::<Signal>) {
            Err(Errno::ESRCH) => {
                self.group_gone = true;
                false
            }
            _ => true,
        }
    }

    /// Wait for the OS to report the process gone, and record its exit code
    pub async fn wait_for_exit(&mut self) -> i32 {
        let code = self.exit_within(None).await.unwrap_or(-1);
        self.record_exit(code);
        code
    }

    /// Wait out the grace period of an already signaled group, escalating to `Kill`.
    ///
    /// The grace period covers the leader and every worker left in its group. `kill_timeout`
    ///   bounds the wait for the reap after `Kill`.
    pub async fn settle(&mut self, grace: Duration, kill_timeout: Duration) -> ProcessState {
        let deadline = Instant::now() + grace;

        if let Some(code) = self.exit_within(Some(grace)).await {
            self.record_exit(code);
            if self.group_empty_by(deadline).await {
                return self.state;
            }
        }

        warn!(service = %self.spec.name, pid = self.pid, ?grace, "still running after grace period, killing");
        if let Err(e) = self.signal(SignalKind::Kill) {
            warn!(service = %self.spec.name, "{}", e);
        }

        match self.exit_within(Some(kill_timeout)).await {
            Some(code) => self.record_exit(code),
            None => warn!(service = %self.spec.name, pid = self.pid, "not reaped after kill"),
        }
        if !self.group_empty_by(Instant::now() + kill_timeout).await {
            warn!(service = %self.spec.name, pid = self.pid, "process group not empty after kill");
        }

        self.state
    }

    /// Graceful stop: `Terminate`, then [`ProcessHandle::settle`]
    pub async fn stop(&mut self, grace: Duration, kill_timeout: Duration) -> ProcessState {
        if let Err(e) = self.signal(SignalKind::Terminate) {
            warn!(service = %self.spec.name, "{}", e);
        }

        self.settle(grace, kill_timeout).await
    }

    /// Wait for the output readers to drain what the process wrote before it exited
    pub async fn release(&mut self, limit: Duration) {
        let readers = std::mem::take(&mut self.readers);
        let aborts: Vec<_> = readers.iter().map(JoinHandle::abort_handle).collect();

        if timeout(limit, futures::future::join_all(readers)).await.is_err() {
            // a forked child may still hold the pipe open
            debug!(service = %self.spec.name, "output still open after exit, detaching");
            aborts.iter().for_each(|a| a.abort());
        }
    }

    fn pgid(&self) -> Pid {
        Pid::from_raw(self.pid as i32)
    }

    async fn group_empty_by(&mut self, deadline: Instant) -> bool {
        loop {
            if !self.group_alive() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(GROUP_POLL.min(deadline - now)).await;
        }
    }

    async fn exit_within(&self, limit: Option<Duration>) -> Option<i32> {
        let mut exit = self.exit.clone();
        let wait = async move {
            let code = match exit.wait_for(Option::is_some).await {
                Ok(code) => *code,
                // the wait task is gone, and with it the child
                Err(_) => Some(-1),
            };
            code
        };

        match limit {
            Some(limit) => timeout(limit, wait).await.unwrap_or(None),
            None => wait.await,
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // drops the child if it is still running, which kills it
        self.waiter.abort();
    }
}

async fn wait_for_child<E>(
    spec: Arc<ServiceSpec>,
    mut child: Child,
    index: usize,
    exit_tx: watch::Sender<Option<i32>>,
    events: mpsc::UnboundedSender<E>,
) where
    E: From<ExitEvent> + Send + 'static,
{
    let code = match child.wait().await {
        Ok(status) => exit_code(status),
        Err(e) => {
            warn!(service = %spec.name, "failed waiting for process: {}", e);
            -1
        }
    };

    debug!(service = %spec.name, code, "exited");
    exit_tx.send_replace(Some(code));

    // the supervisor may already be gone
    events.send(ExitEvent { index, code }.into()).ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn(spec: ServiceSpec) -> (ProcessHandle, mpsc::UnboundedReceiver<ExitEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (handle, _output) = ProcessHandle::start(Arc::new(spec), 0, tx).unwrap();
        (handle, rx)
    }

    #[tokio::test]
    async fn reports_exit_code_on_handle_and_queue() {
        let (mut handle, mut events) =
            spawn(ServiceSpec::new("short", vec!["sh", "-c", "exit 3"], 9001));
        assert_eq!(handle.state(), ProcessState::Starting);

        assert_eq!(handle.wait_for_exit().await, 3);
        assert_eq!(handle.state(), ProcessState::Exited(3));
        assert_eq!(events.recv().await, Some(ExitEvent { index: 0, code: 3 }));
    }

    #[tokio::test]
    async fn signal_after_exit_is_a_noop() {
        let (mut handle, _events) = spawn(ServiceSpec::new("short", vec!["true"], 9002));
        handle.wait_for_exit().await;

        assert!(!handle.signal(SignalKind::Terminate).unwrap());
        assert!(!handle.signal(SignalKind::Terminate).unwrap());
        assert_eq!(handle.state(), ProcessState::Exited(0));
    }

    #[tokio::test]
    async fn terminate_stops_within_grace() {
        let (mut handle, _events) = spawn(ServiceSpec::new("sleeper", vec!["sleep", "30"], 9003));

        let state = handle
            .stop(Duration::from_secs(5), Duration::from_secs(5))
            .await;
        // SIGTERM
        assert_eq!(state, ProcessState::Exited(128 + 15));
    }

    #[tokio::test]
    async fn escalates_to_kill_when_terminate_is_ignored() {
        let (mut handle, _events) = spawn(ServiceSpec::new(
            "stubborn",
            vec!["sh", "-c", "trap '' TERM; exec sleep 30"],
            9004,
        ));
        // give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let state = handle
            .stop(Duration::from_millis(300), Duration::from_secs(5))
            .await;
        assert_eq!(state, ProcessState::Killed);
        assert_eq!(handle.exited(), Some(128 + 9));
        assert!(!handle.signal(SignalKind::Kill).unwrap());
    }

    #[tokio::test]
    async fn ready_and_running_transitions() {
        let (mut handle, _events) = spawn(ServiceSpec::new("sleeper", vec!["sleep", "30"], 9005));

        handle.mark_running();
        assert_eq!(handle.state(), ProcessState::Starting);
        assert!(handle.mark_ready());
        assert!(!handle.mark_ready());
        handle.mark_running();
        assert_eq!(handle.state(), ProcessState::Running);

        handle
            .stop(Duration::from_secs(5), Duration::from_secs(5))
            .await;
        assert!(!handle.state().is_alive());
    }

    #[tokio::test]
    async fn signals_reach_workers_after_the_leader_exits() {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let (tx, _events) = mpsc::unbounded_channel::<ExitEvent>();
        let spec = ServiceSpec::new("forker", vec!["sh", "-c", "sleep 60 & echo $!"], 9006);
        let (mut handle, output) = ProcessHandle::start(Arc::new(spec), 0, tx).unwrap();

        let mut stdout = BufReader::new(output.stdout.unwrap());
        let mut line = String::new();
        stdout.read_line(&mut line).await.unwrap();
        let worker: u32 = line.trim().parse().unwrap();

        assert_eq!(handle.wait_for_exit().await, 0);
        assert!(handle.group_alive());
        assert!(crate::procs::is_running(worker));

        let state = handle
            .stop(Duration::from_secs(5), Duration::from_secs(5))
            .await;
        assert_eq!(state, ProcessState::Exited(0));
        assert!(!crate::procs::is_running(worker));
    }
}
