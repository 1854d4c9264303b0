// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Resolves the configuration file, command line and environment into service specs
//!
//! Precedence, lowest first: built in defaults, the file's `[defaults]`, command line defaults,
//!   the service's own settings, then `LAUNCHRC_<NAME>_PORT` / `LAUNCHRC_<NAME>_HOST`.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::procs::SupervisorConfig;
use crate::service::{
    ServiceSpec, DEFAULT_GRACE_PERIOD, DEFAULT_HOST, DEFAULT_READINESS_TIMEOUT,
};
use crate::Error;

pub const DEFAULT_CONFIG_FILE: &str = "launchrc.toml";
pub const CONFIG_ENV: &str = "LAUNCHRC_CONFIG";
const ENV_PREFIX: &str = "LAUNCHRC_";

/// The on-disk format
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub supervisor: SupervisorSection,
    pub defaults: DefaultsSection,
    #[serde(rename = "service")]
    pub services: Vec<ServiceEntry>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorSection {
    pub probe_interval_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub kill_timeout_ms: Option<u64>,
    pub flush_timeout_ms: Option<u64>,
    pub log_buffer: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefaultsSection {
    pub host: Option<String>,
    pub workdir: Option<PathBuf>,
    pub readiness_timeout_ms: Option<u64>,
    pub grace_period_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceEntry {
    pub name: String,
    pub command: Vec<String>,
    pub port: u16,
    pub host: Option<String>,
    pub workdir: Option<PathBuf>,
    pub readiness_timeout_ms: Option<u64>,
    pub grace_period_ms: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl FileConfig {
    pub fn parse(contents: &str) -> Result<Self, Error> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;

        let config = Self::parse(&contents).map_err(|e| {
            Error::config(format!("failed to parse {}: {}", path.display(), source_of(&e)))
        })?;

        info!(path = %path.display(), services = config.services.len(), "loaded configuration");
        Ok(config)
    }
}

fn source_of(err: &Error) -> String {
    match std::error::Error::source(err) {
        Some(source) => source.to_string(),
        None => err.to_string(),
    }
}

/// Settings given on the command line
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub services: Vec<ServiceEntry>,
    pub readiness_timeout: Option<Duration>,
    pub grace_period: Option<Duration>,
    pub probe_interval: Option<Duration>,
    pub log_buffer: Option<usize>,
}

/// Everything the supervisor needs, fully resolved
#[derive(Clone, Debug)]
pub struct LaunchConfig {
    pub services: Vec<ServiceSpec>,
    pub supervisor: SupervisorConfig,
}

/// Merge file, command line and environment.
///
/// `base_dir` anchors relative workdirs from the file, `env` is the process environment; `PATH`
///   from it becomes the program search path.
pub fn resolve<I>(
    file: FileConfig,
    base_dir: &Path,
    overrides: Overrides,
    env: I,
) -> Result<LaunchConfig, Error>
where
    I: IntoIterator<Item = (String, String)>,
{
    let env: HashMap<String, String> = env.into_iter().collect();
    let defaults = &file.defaults;
    let from_ms = |ms: Option<u64>| ms.map(Duration::from_millis);

    let readiness_default = overrides
        .readiness_timeout
        .or_else(|| from_ms(defaults.readiness_timeout_ms))
        .unwrap_or(DEFAULT_READINESS_TIMEOUT);
    let grace_default = overrides
        .grace_period
        .or_else(|| from_ms(defaults.grace_period_ms))
        .unwrap_or(DEFAULT_GRACE_PERIOD);
    let host_default = defaults.host.as_deref().unwrap_or(DEFAULT_HOST);
    let workdir_default = defaults
        .workdir
        .as_ref()
        .map(|dir| base_dir.join(dir))
        .unwrap_or_else(|| base_dir.to_path_buf());

    let file_services = file.services.iter().map(|entry| (entry, base_dir));
    // command line paths are relative to where we were started
    let cli_services = overrides.services.iter().map(|entry| (entry, Path::new(".")));

    let mut services = Vec::with_capacity(file.services.len() + overrides.services.len());
    for (entry, anchor) in file_services.chain(cli_services) {
        let mut spec = ServiceSpec::new(entry.name.clone(), entry.command.clone(), entry.port)
            .with_host(entry.host.as_deref().unwrap_or(host_default))
            .with_workdir(
                entry
                    .workdir
                    .as_ref()
                    .map(|dir| anchor.join(dir))
                    .unwrap_or_else(|| workdir_default.clone()),
            )
            .with_readiness_timeout(from_ms(entry.readiness_timeout_ms).unwrap_or(readiness_default))
            .with_grace_period(from_ms(entry.grace_period_ms).unwrap_or(grace_default));
        spec.env = entry.env.clone();

        apply_env_overrides(&mut spec, &env)?;
        services.push(spec);
    }

    let section = &file.supervisor;
    let builtin = SupervisorConfig::default();
    let supervisor = SupervisorConfig {
        probe_interval: overrides
            .probe_interval
            .or_else(|| from_ms(section.probe_interval_ms))
            .unwrap_or(builtin.probe_interval),
        connect_timeout: from_ms(section.connect_timeout_ms).unwrap_or(builtin.connect_timeout),
        kill_timeout: from_ms(section.kill_timeout_ms).unwrap_or(builtin.kill_timeout),
        flush_timeout: from_ms(section.flush_timeout_ms).unwrap_or(builtin.flush_timeout),
        log_buffer: overrides
            .log_buffer
            .or(section.log_buffer)
            .unwrap_or(builtin.log_buffer),
        search_path: env.get("PATH").map(OsString::from),
    };

    Ok(LaunchConfig {
        services,
        supervisor,
    })
}

/// `api-server` reads `LAUNCHRC_API_SERVER_PORT` and `LAUNCHRC_API_SERVER_HOST`
pub fn env_key(service: &str, setting: &str) -> String {
    let name: String = service
        .chars()
        .map(|c| match c {
            'a'..='z' => c.to_ascii_uppercase(),
            'A'..='Z' | '0'..='9' => c,
            _ => '_',
        })
        .collect();

    format!("{}{}_{}", ENV_PREFIX, name, setting)
}

fn apply_env_overrides(spec: &mut ServiceSpec, env: &HashMap<String, String>) -> Result<(), Error> {
    let port_key = env_key(&spec.name, "PORT");
    if let Some(port) = env.get(&port_key) {
        spec.port = port.trim().parse().map_err(|_| {
            Error::config(format!("{}: {} is not a valid port: {}", spec.name, port_key, port))
        })?;
        debug!(service = %spec.name, port = spec.port, "port set from environment");
    }

    let host_key = env_key(&spec.name, "HOST");
    if let Some(host) = env.get(&host_key) {
        spec.host = host.trim().to_string();
        debug!(service = %spec.name, host = %spec.host, "host set from environment");
    }

    Ok(())
}

/// Parse `NAME[@HOST]:PORT=COMMAND ARGS...`
///
/// The command is split on whitespace, there is no shell quoting.
pub fn parse_service_arg(arg: &str) -> Result<ServiceEntry, Error> {
    let invalid = |why: &str| {
        Error::config(format!(
            "invalid service {:?}, {}; expected NAME[@HOST]:PORT=COMMAND",
            arg, why
        ))
    };

    let (binding, command) = arg.split_once('=').ok_or_else(|| invalid("missing '='"))?;
    let (name_host, port) = binding
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    let port: u16 = port.trim().parse().map_err(|_| invalid("bad port"))?;

    let (name, host) = match name_host.split_once('@') {
        Some((name, host)) => {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            (name, Some(host.to_string()))
        }
        None => (name_host, None),
    };

    let command: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    if name.trim().is_empty() {
        return Err(invalid("missing name"));
    }
    if command.is_empty() {
        return Err(invalid("missing command"));
    }

    Ok(ServiceEntry {
        name: name.trim().to_string(),
        command,
        port,
        host,
        workdir: None,
        readiness_timeout_ms: None,
        grace_period_ms: None,
        env: BTreeMap::new(),
    })
}

/// The file to read: explicit path, then `LAUNCHRC_CONFIG`, then `launchrc.toml` if present
pub fn config_path(explicit: Option<&str>, env_value: Option<String>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(PathBuf::from(path));
    }
    if let Some(path) = env_value {
        return Some(PathBuf::from(path));
    }

    let default = PathBuf::from(DEFAULT_CONFIG_FILE);
    if default.is_file() {
        Some(default)
    } else {
        None
    }
}
