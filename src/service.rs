// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Static description of the services under supervision

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, ErrorKind};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// One long-running network service: what to run and where it should listen.
///
/// Arguments may reference `{host}`, `{port}` and `{name}`; they are expanded
///   from this spec when the command is built, see [`ServiceSpec::argv`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub command: Vec<String>,
    pub workdir: PathBuf,
    pub host: String,
    pub port: u16,
    pub readiness_timeout: Duration,
    pub grace_period: Duration,
    pub env: BTreeMap<String, String>,
}

impl ServiceSpec {
    pub fn new<I, S>(name: impl Into<String>, command: I, port: u16) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            command: command.into_iter().map(Into::into).collect(),
            workdir: PathBuf::from("."),
            host: DEFAULT_HOST.to_string(),
            port,
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            env: BTreeMap::new(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The program to execute, the first element of the command
    pub fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }

    /// Arguments after the program, with `{host}`, `{port}` and `{name}` expanded
    pub fn argv(&self) -> Vec<String> {
        let port = self.port.to_string();

        self.command
            .iter()
            .skip(1)
            .map(|arg| {
                arg.replace("{host}", &self.host)
                    .replace("{port}", &port)
                    .replace("{name}", &self.name)
            })
            .collect()
    }

    /// The address readiness checks should connect to.
    ///
    /// A service bound to every interface is reachable over loopback.
    pub fn probe_host(&self) -> &str {
        match self.host.as_str() {
            "0.0.0.0" | "" => "127.0.0.1",
            "::" | "[::]" => "::1",
            host => host,
        }
    }

    /// `host:port`, as it would be shown to an operator
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Locate the executable for this service.
    ///
    /// Programs containing a path separator are taken relative to the workdir, bare names are
    ///   looked up in `search_path` (a `PATH` style list).
    pub fn resolve_program(&self, search_path: Option<&OsStr>) -> Result<PathBuf, Error> {
        let program = self
            .program()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::config(format!("{}: command is empty", self.name)))?;

        which::which_in(program, search_path, &self.workdir).map_err(|e| {
            let place = if program.contains('/') {
                format!("in {}", self.workdir.display())
            } else {
                "on the search path".to_string()
            };
            Error::config(format!(
                "{}: no executable {} {}: {}",
                self.name, program, place, e
            ))
        })
    }
}

/// Checks a set of specs before anything is started.
///
/// Nothing has been spawned when this fails, so there is nothing to roll back.
pub fn validate_specs(specs: &[ServiceSpec], search_path: Option<&OsStr>) -> Result<(), Error> {
    if specs.is_empty() {
        return Err(Error::config("no services configured"));
    }

    let mut names: HashSet<&str> = HashSet::with_capacity(specs.len());
    let mut ports: HashMap<u16, &str> = HashMap::with_capacity(specs.len());

    for spec in specs {
        if spec.name.trim().is_empty() {
            return Err(Error::config("service name must not be empty"));
        }
        if !names.insert(spec.name.as_str()) {
            return Err(Error::config(format!(
                "service {} is defined more than once",
                spec.name
            )));
        }
        if spec.port == 0 {
            return Err(Error::config(format!(
                "{}: port must be between 1 and 65535",
                spec.name
            )));
        }
        if let Some(first) = ports.insert(spec.port, spec.name.as_str()) {
            return Err(ErrorKind::DuplicatePort {
                port: spec.port,
                first: first.to_string(),
                second: spec.name.clone(),
            }
            .into());
        }
        if !spec.workdir.is_dir() {
            return Err(Error::config(format!(
                "{}: working directory {} does not exist",
                spec.name,
                spec.workdir.display()
            )));
        }

        spec.resolve_program(search_path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn search_path() -> Option<std::ffi::OsString> {
        Some(std::ffi::OsString::from("/usr/bin:/bin"))
    }

    #[test]
    fn expands_placeholders() {
        let spec = ServiceSpec::new(
            "api",
            vec!["uvicorn", "main:app", "--host", "{host}", "--port={port}", "{name}"],
            8000,
        )
        .with_host("0.0.0.0");

        assert_eq!(spec.program(), Some("uvicorn"));
        assert_eq!(
            spec.argv(),
            vec!["main:app", "--host", "0.0.0.0", "--port=8000", "api"]
        );
    }

    #[test]
    fn unspecified_hosts_probe_loopback() {
        let spec = ServiceSpec::new("ui", vec!["sleep"], 8501).with_host("0.0.0.0");
        assert_eq!(spec.probe_host(), "127.0.0.1");

        let spec = spec.with_host("::");
        assert_eq!(spec.probe_host(), "::1");
        assert_eq!(spec.address(), "[::]:8501");

        let spec = spec.with_host("localhost");
        assert_eq!(spec.probe_host(), "localhost");
    }

    #[test]
    fn duplicate_ports_name_both_services() {
        let specs = vec![
            ServiceSpec::new("a", vec!["sleep", "1"], 8000),
            ServiceSpec::new("b", vec!["sleep", "1"], 8000),
        ];

        let err = validate_specs(&specs, search_path().as_deref()).unwrap_err();
        assert!(err.is_config());
        match err.kind() {
            ErrorKind::DuplicatePort {
                port,
                first,
                second,
            } => {
                assert_eq!(*port, 8000);
                assert_eq!(first, "a");
                assert_eq!(second, "b");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn rejects_duplicate_names_and_zero_ports() {
        let specs = vec![
            ServiceSpec::new("a", vec!["sleep"], 8000),
            ServiceSpec::new("a", vec!["sleep"], 8001),
        ];
        assert!(validate_specs(&specs, search_path().as_deref())
            .unwrap_err()
            .is_config());

        let specs = vec![ServiceSpec::new("a", vec!["sleep"], 0)];
        assert!(validate_specs(&specs, search_path().as_deref())
            .unwrap_err()
            .is_config());

        assert!(validate_specs(&[], search_path().as_deref())
            .unwrap_err()
            .is_config());
    }

    #[test]
    fn unresolvable_commands_are_config_errors() {
        let specs = vec![ServiceSpec::new(
            "a",
            vec!["definitely-not-a-real-program-name"],
            8000,
        )];
        assert!(validate_specs(&specs, search_path().as_deref())
            .unwrap_err()
            .is_config());

        let specs = vec![ServiceSpec::new("a", Vec::<String>::new(), 8000)];
        assert!(validate_specs(&specs, search_path().as_deref())
            .unwrap_err()
            .is_config());

        // nothing to search
        let specs = vec![ServiceSpec::new("a", vec!["sleep"], 8000)];
        assert!(validate_specs(&specs, None).unwrap_err().is_config());
    }

    #[test]
    fn resolves_bare_names_on_the_search_path() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("serve");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let spec = ServiceSpec::new("a", vec!["serve"], 8000);
        let dirs = std::ffi::OsString::from(format!("/no/such/dir:{}", dir.path().display()));
        let found = spec.resolve_program(Some(dirs.as_os_str())).unwrap();
        assert_eq!(found.file_name(), Some(OsStr::new("serve")));
        assert!(found.starts_with(dir.path()));

        let err = spec.resolve_program(search_path().as_deref()).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("search path"), "{}", err);
    }

    #[test]
    fn resolves_relative_programs_against_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("serve.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();

        let spec = ServiceSpec::new("a", vec!["./serve.sh"], 8000).with_workdir(dir.path());
        assert!(spec.resolve_program(None).is_err());

        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let found = spec.resolve_program(None).unwrap();
        assert_eq!(found.file_name(), Some(OsStr::new("serve.sh")));
        assert!(found.starts_with(dir.path()));
        validate_specs(&[spec], None).unwrap();
    }

    #[test]
    fn missing_workdir_is_rejected() {
        let spec = ServiceSpec::new("a", vec!["sleep"], 8000).with_workdir("/no/such/dir/here");
        assert!(validate_specs(&[spec], search_path().as_deref())
            .unwrap_err()
            .is_config());
    }
}
