// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{App, Arg, ArgMatches};
use tokio::runtime;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use launchrc::config::{self, FileConfig, LaunchConfig, Overrides};
use launchrc::procs::{
    drain, shutdown_signals, ConsoleSink, OutputCollector, Supervisor, EXIT_CONFIG, EXIT_OK,
};
use launchrc::service::validate_specs;
use launchrc::Error;

const CONFIG: &str = "config";
const SERVICE: &str = "service";
const READINESS_TIMEOUT: &str = "readiness-timeout";
const GRACE_PERIOD: &str = "grace-period";
const PROBE_INTERVAL: &str = "probe-interval";
const LOG_BUFFER: &str = "log-buffer";
const VERBOSE: &str = "verbose";
const CHECK: &str = "check";

trait SetupClapApp {
    fn setup_clap_app(self) -> Self;
    fn timing_opts(self) -> Self;
}

impl<'a, 'b> SetupClapApp for App<'a, 'b> {
    fn setup_clap_app(self) -> Self {
        self.version(env!("CARGO_PKG_VERSION"))
            .author(env!("CARGO_PKG_AUTHORS"))
    }

    fn timing_opts(self) -> Self {
        self.arg(millis_arg(
            READINESS_TIMEOUT,
            "default time for a service to accept connections",
        ))
        .arg(millis_arg(
            GRACE_PERIOD,
            "default time between terminate and kill",
        ))
        .arg(millis_arg(PROBE_INTERVAL, "time between readiness checks"))
    }
}

fn millis_arg(name: &'static str, help: &'static str) -> Arg<'static, 'static> {
    Arg::with_name(name)
        .long(name)
        .value_name("MILLIS")
        .validator(|i| {
            i.parse::<u64>()
                .map(|_| ())
                .map_err(|_| String::from("number was expected"))
        })
        .help(help)
        .takes_value(true)
}

fn main() {
    let args = App::new(env!("CARGO_PKG_NAME"))
        .setup_clap_app()
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name(CONFIG)
                .short("c")
                .long(CONFIG)
                .value_name("FILE")
                .help("configuration file, defaults to $LAUNCHRC_CONFIG or ./launchrc.toml")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(SERVICE)
                .short("s")
                .long(SERVICE)
                .value_name("NAME[@HOST]:PORT=COMMAND")
                .help("a service to run, in addition to those in the configuration file")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .timing_opts()
        .arg(
            Arg::with_name(LOG_BUFFER)
                .long(LOG_BUFFER)
                .value_name("LINES")
                .validator(|i| {
                    i.parse::<usize>()
                        .map(|_| ())
                        .map_err(|_| String::from("number was expected"))
                })
                .help("output lines buffered before lines are dropped")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(VERBOSE)
                .short("v")
                .long(VERBOSE)
                .multiple(true)
                .help("more supervisor logging, repeat for more"),
        )
        .arg(
            Arg::with_name(CHECK)
                .long(CHECK)
                .help("validate the configuration and print the services without starting them"),
        )
        .get_matches();

    init_logging(args.occurrences_of(VERBOSE));

    let launch = match load_config(&args) {
        Ok(launch) => launch,
        Err(e) => {
            error!("{}", e);
            eprintln!("launchrc: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    if args.is_present(CHECK) {
        std::process::exit(check(&launch));
    }

    let runtime = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to initialize Tokio Runtime");

    let code = runtime.block_on(run(launch));
    std::process::exit(code);
}

/// Supervisor diagnostics go to stderr, service output owns stdout
fn init_logging(verbosity: u64) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(args: &ArgMatches<'_>) -> Result<LaunchConfig, Error> {
    let env: Vec<(String, String)> = std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect();

    let path = config::config_path(
        args.value_of(CONFIG),
        std::env::var(config::CONFIG_ENV).ok(),
    );
    let (file, base_dir) = match path {
        Some(path) => {
            let file = FileConfig::load(&path)?;
            let base_dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (file, base_dir)
        }
        None => (FileConfig::default(), PathBuf::from(".")),
    };

    let services = args
        .values_of(SERVICE)
        .into_iter()
        .flatten()
        .map(config::parse_service_arg)
        .collect::<Result<Vec<_>, _>>()?;

    let overrides = Overrides {
        services,
        readiness_timeout: millis(args, READINESS_TIMEOUT),
        grace_period: millis(args, GRACE_PERIOD),
        probe_interval: millis(args, PROBE_INTERVAL),
        log_buffer: args.value_of(LOG_BUFFER).and_then(|v| v.parse().ok()),
    };

    config::resolve(file, &base_dir, overrides, env)
}

fn millis(args: &ArgMatches<'_>, name: &str) -> Option<Duration> {
    args.value_of(name)
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}

fn check(launch: &LaunchConfig) -> i32 {
    if let Err(e) = validate_specs(&launch.services, launch.supervisor.search_path.as_deref()) {
        eprintln!("launchrc: {}", e);
        return EXIT_CONFIG;
    }

    for spec in &launch.services {
        println!(
            "{:<16} {:<22} {} {}",
            spec.name,
            spec.address(),
            spec.program().unwrap_or_default(),
            spec.argv().join(" ")
        );
    }

    EXIT_OK
}

async fn run(launch: LaunchConfig) -> i32 {
    // before anything is spawned, a signal must never hit the default disposition
    let shutdown = shutdown_signals();

    let (collector, logs) = OutputCollector::new(launch.supervisor.log_buffer);
    let supervisor = match Supervisor::new(launch.services, launch.supervisor, collector) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!("{}", e);
            eprintln!("launchrc: {}", e);
            return EXIT_CONFIG;
        }
    };

    let sink = tokio::spawn(drain(logs, ConsoleSink::stdout()));

    // the supervisor, and with it the last log sender, is gone once run returns
    let report = supervisor.run(shutdown).await;
    if let Err(e) = sink.await {
        error!("log sink failed: {}", e);
    }

    eprint!("{}", report);
    report.exit_code()
}
