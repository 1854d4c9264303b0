// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::debug;

use crate::error::ErrorKind;
use crate::service::ServiceSpec;
use crate::Error;

pub struct StdIoConf {
    pub stdin: Stdio,
    pub stderr: Stdio,
    pub stdout: Stdio,
}

impl Default for StdIoConf {
    fn default() -> Self {
        StdIoConf {
            // services are never interactive
            stdin: Stdio::null(),
            // both streams go to the output collector
            stderr: Stdio::piped(),
            stdout: Stdio::piped(),
        }
    }
}

/// The captured output streams of a freshly started service
#[derive(Debug)]
pub struct ProcessOutput {
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

/// Launch the program for `spec`
///
/// Rules:
/// - the child gets its own process group, so signals reach anything it forks
/// - the child is killed if its handle is dropped
/// - only the spec's env is added, the rest is inherited
pub(crate) fn launch(spec: &ServiceSpec, stdio: StdIoConf) -> Result<(Child, ProcessOutput), Error> {
    let program = spec.program().ok_or_else(|| {
        Error::from(ErrorKind::Spawn {
            service: spec.name.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })
    })?;

    // paths are relative to the service's workdir, bare names go through PATH
    let program = if program.contains('/') {
        spec.workdir.join(program)
    } else {
        PathBuf::from(program)
    };

    let mut child = Command::new(&program)
        .args(spec.argv())
        .current_dir(&spec.workdir)
        .envs(&spec.env)
        .process_group(0)
        .kill_on_drop(true)
        .stdin(stdio.stdin)
        .stdout(stdio.stdout)
        .stderr(stdio.stderr)
        .spawn()
        .map_err(|source| ErrorKind::Spawn {
            service: spec.name.clone(),
            source,
        })?;

    debug!(service = %spec.name, pid = ?child.id(), program = %program.display(), "spawned");

    let output = ProcessOutput {
        stdout: child.stdout.take(),
        stderr: child.stderr.take(),
    };

    Ok((child, output))
}
