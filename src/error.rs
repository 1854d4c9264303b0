// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("port {port} is used by both {first} and {second}")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },
    #[error("failed to spawn {service}: {source}")]
    Spawn {
        service: String,
        #[source]
        source: io::Error,
    },
    #[error("{service} did not accept connections on {address} within {timeout:?}")]
    ReadinessTimeout {
        service: String,
        address: String,
        timeout: Duration,
    },
    #[error("{service} exited unexpectedly with code {code}")]
    UnexpectedExit { service: String, code: i32 },
    #[error("failed to signal {service}: {source}")]
    SignalDelivery {
        service: String,
        #[source]
        source: nix::Error,
    },
    #[error("io error")]
    IoError(#[from] io::Error),
    #[error("nix error")]
    NixError(#[from] nix::Error),
    #[error("invalid configuration file")]
    TomlError(#[from] toml::de::Error),
    #[error("an error occured: {0}")]
    ErrorMsg(String),
    #[error("an error occured: {0}")]
    ErrorStr(&'static str),
}

#[derive(Error, Debug)]
#[error(transparent)]
pub struct Error(ErrorKind);

impl Error {
    fn from_kind(kind: ErrorKind) -> Self {
        Self(kind)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::Config(msg.into()))
    }

    /// True for failures detected while validating configuration, before any process exists
    pub fn is_config(&self) -> bool {
        matches!(
            self.0,
            ErrorKind::Config(_) | ErrorKind::DuplicatePort { .. } | ErrorKind::TomlError(_)
        )
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(err: E) -> Self {
        Self::from_kind(err.into())
    }
}

impl From<&'static str> for ErrorKind {
    fn from(err: &'static str) -> Self {
        ErrorKind::ErrorStr(err)
    }
}

impl From<String> for ErrorKind {
    fn from(err: String) -> Self {
        ErrorKind::ErrorMsg(err)
    }
}
