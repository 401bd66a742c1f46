//! Probe child process entry point.
//!
//! Spawned by the host to load one module in isolation:
//! `probe-server probe <module-path> <shell-id|_> <result-file>`.

use consort_plugin::probe::{run_probe_child, EXIT_USAGE};
use consort_plugin::DylibLoader;
use std::env;

fn main() {
    // stdout is never a result channel; logs go to stderr
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let code = match args.split_first() {
        Some((command, rest)) if command == "probe" => {
            tracing::debug!("Probe server probing {:?}", rest.first());
            run_probe_child(&DylibLoader::new(), rest)
        }
        _ => {
            tracing::error!("usage: probe-server probe <module-path> <shell-id|_> <result-file>");
            EXIT_USAGE
        }
    };
    std::process::exit(code);
}
