// outpost-cli/src/main.rs
// ============================================================================
// Module: Outpost CLI Entry Point
// Description: Command dispatcher for the Outpost server binary.
// Purpose: Serve the platform, generate keys, and check configuration.
// Dependencies: clap, outpost-comms, outpost-config, outpost-server, tokio
// ============================================================================

//! ## Overview
//! The `outpost` binary hosts the server and a pair of operator utilities.
//! Exit codes: 0 on success, 1 for startup failures (bad configuration,
//! unreadable keys, bind errors), 2 for fatal runtime errors.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::Subcommand;

use outpost_comms::PrivateKey;
use outpost_config::OutpostConfig;
use outpost_server::OutpostServer;

// ============================================================================
// SECTION: Exit Codes
// ============================================================================

/// Exit code for startup failures.
const EXIT_STARTUP_FAILURE: u8 = 1;
/// Exit code for fatal runtime errors.
const EXIT_FATAL_RUNTIME: u8 = 2;

// ============================================================================
// SECTION: Command Line
// ============================================================================

/// Outpost: fleet-scale endpoint investigation server.
#[derive(Debug, Parser)]
#[command(name = "outpost", version, about)]
struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    command: Command,
}

/// Top-level commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Runs the server until interrupted.
    Serve {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Generates a server RSA keypair as PEM files.
    Keygen {
        /// Output directory for `server.key.pem` and `server.pub.pem`.
        #[arg(long, default_value = "keys")]
        out: PathBuf,
    },
    /// Loads and validates the configuration, printing nothing on success.
    ConfigCheck {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(config.as_deref()),
        Command::Keygen { out } => keygen(&out),
        Command::ConfigCheck { config } => config_check(config.as_deref()),
    }
}

/// Runs the server.
fn serve(config_path: Option<&Path>) -> ExitCode {
    let config = match OutpostConfig::load(config_path) {
        Ok(config) => config,
        Err(err) => return startup_failure(&format!("configuration error: {err}")),
    };
    let server = match OutpostServer::from_config(config) {
        Ok(server) => server,
        Err(err) => return startup_failure(&format!("startup error: {err}")),
    };
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => return startup_failure(&format!("runtime error: {err}")),
    };
    match runtime.block_on(server.run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(outpost_server::ServerError::Bind(err)) => {
            startup_failure(&format!("bind error: {err}"))
        }
        Err(err) => {
            report(&format!("fatal runtime error: {err}"));
            ExitCode::from(EXIT_FATAL_RUNTIME)
        }
    }
}

/// Generates and writes a PEM keypair.
fn keygen(out: &Path) -> ExitCode {
    let key = match PrivateKey::generate() {
        Ok(key) => key,
        Err(err) => return startup_failure(&format!("key generation failed: {err}")),
    };
    let private_pem = match key.to_pem() {
        Ok(pem) => pem,
        Err(err) => return startup_failure(&format!("key encoding failed: {err}")),
    };
    let public_pem = match key.public_key().to_pem() {
        Ok(pem) => pem,
        Err(err) => return startup_failure(&format!("key encoding failed: {err}")),
    };
    if let Err(err) = fs::create_dir_all(out) {
        return startup_failure(&format!("cannot create {}: {err}", out.display()));
    }
    if let Err(err) = fs::write(out.join("server.key.pem"), private_pem) {
        return startup_failure(&format!("cannot write private key: {err}"));
    }
    if let Err(err) = fs::write(out.join("server.pub.pem"), public_pem) {
        return startup_failure(&format!("cannot write public key: {err}"));
    }
    ExitCode::SUCCESS
}

/// Validates the configuration file.
fn config_check(config_path: Option<&Path>) -> ExitCode {
    match OutpostConfig::load(config_path) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => startup_failure(&format!("configuration error: {err}")),
    }
}

/// Reports a startup failure and returns its exit code.
fn startup_failure(message: &str) -> ExitCode {
    report(message);
    ExitCode::from(EXIT_STARTUP_FAILURE)
}

/// Writes a message to stderr.
fn report(message: &str) {
    #[allow(clippy::print_stderr, reason = "operator-facing CLI diagnostics")]
    {
        eprintln!("outpost: {message}");
    }
}
