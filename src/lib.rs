// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Common library functions for launchrc
//!
//! A [`procs::Supervisor`] starts a fixed set of [`service::ServiceSpec`]s, waits until each one
//!   accepts connections on its port, and stops all of them together.

pub mod config;
mod error;
pub mod procs;
pub mod service;

pub use error::{Error, ErrorKind};
