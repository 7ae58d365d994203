//! `latticed`: a last-writer-wins string store over the cluster core.
//!
//! Runs until stdin closes (the supervisor convention), then stops the node
//! cleanly. Exit codes: 0 clean stop, 2 unrecoverable storage corruption,
//! 3 fatal configuration error.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use lattice::cluster::ConstantDiscovery;
use lattice::config::Config;
use lattice::node::Node;
use lattice::{Error, ErrorKind, JsonCodec, Lww, telemetry};

#[derive(Parser)]
#[command(name = "latticed", about = "CRDT cluster storage node", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the listen address from the config.
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("latticed: {err}");
                return ExitCode::from(3);
            }
        },
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    let discovery = Arc::new(ConstantDiscovery::new(config.scheme()));
    let node = match Node::<String, Lww<String>>::start(&config, JsonCodec, discovery) {
        Ok(node) => node,
        Err(err) => {
            eprintln!("latticed: {err}");
            return exit_code_for(&err);
        }
    };

    // Block until the supervisor closes stdin, then stop.
    let mut sink = Vec::new();
    let _ = std::io::stdin().read_to_end(&mut sink);

    match node.stop() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("latticed: {err}");
            exit_code_for(&err)
        }
    }
}

fn exit_code_for(err: &Error) -> ExitCode {
    match err {
        Error::Config(_) => ExitCode::from(3),
        other if other.kind() == ErrorKind::Fatal => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}
