//! UpdateFX prepare CLI
//!
//! Entry point for the `ufx-prepare` command-line tool.

use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use ufx_prepare::signer::keystore::{change_password, DEFAULT_KDF_ITERATIONS};
use ufx_prepare::{
    read_index, render_index, verify, CliOverrides, GdiffEngine, PrepareConfig, PrepareError,
    PrepareJob, TerminalConsole, WorkingDir,
};

#[derive(Parser)]
#[command(name = "ufx-prepare")]
#[command(about = "Build and sign an UpdateFX update site", version)]
struct Cli {
    /// Base URL the patches will be served from (repeatable)
    #[arg(long = "url", value_name = "BASE")]
    urls: Vec<String>,

    /// First version whose jar is canonicalized and whose patch is gzipped
    #[arg(long, value_name = "VERSION", allow_negative_numbers = true)]
    gzip_from: Option<i64>,

    /// Print the contents of a signed index and exit
    #[arg(long, value_name = "PATH")]
    print_index: Option<PathBuf>,

    /// Change the keystore password and exit
    #[arg(long)]
    change_password: bool,

    /// Sign with a hardware wallet, optionally checking the expected public key
    #[arg(long, value_name = "PUBKEY_HEX", num_args = 0..=1, require_equals = true)]
    trezor: Option<Option<String>>,

    /// Only process this version, merging it into the existing index
    #[arg(long = "ver", value_name = "VERSION")]
    version: Option<u32>,

    /// Keystore key used for signing
    #[arg(long, value_name = "N")]
    key_index: Option<usize>,

    /// Command line of the hardware wallet bridge helper
    #[arg(long, value_name = "CMD")]
    device_bridge: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debuglog: bool,

    /// Working directory containing builds/ and site/
    working_dir: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debuglog);

    if let Some(path) = &cli.print_index {
        run_print_index(path);
        return;
    }

    let Some(working) = cli.working_dir.clone() else {
        eprintln!("Error: a working directory is required");
        process::exit(1);
    };

    if cli.change_password {
        run_change_password(working);
        return;
    }

    let overrides = CliOverrides {
        urls: cli.urls,
        gzip_from: cli.gzip_from,
        version: cli.version,
        hardware: cli.trezor,
        device_bridge: cli.device_bridge,
        key_index: cli.key_index,
    };
    if let Err(e) = run_prepare(working, overrides) {
        eprintln!("Error: {}", e);
        process::exit(e.exit_code());
    }
}

fn init_logging(debuglog: bool) {
    let default = if debuglog { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_prepare(working: PathBuf, overrides: CliOverrides) -> Result<(), PrepareError> {
    let config = PrepareConfig::resolve(working, overrides)?;
    debug!(?config.mode, urls = config.urls.len(), gzip_from = config.gzip_from, "resolved configuration");

    let console = TerminalConsole::new();
    let engine = GdiffEngine;
    PrepareJob::new(&config, &console, &engine).run()?;
    Ok(())
}

fn run_print_index(path: &Path) {
    let (signed, updates) = match read_index(path) {
        Ok(index) => index,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    print!("{}", render_index(&updates));
    match verify(&signed) {
        Ok(keys) => {
            for key in keys {
                println!("Signed by {}", key);
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(4);
        }
    }
}

fn run_change_password(working: PathBuf) {
    let working = WorkingDir::new(working);
    let kdf_iterations = match PrepareConfig::file_kdf_iterations(&working) {
        Ok(iterations) => iterations.unwrap_or(DEFAULT_KDF_ITERATIONS),
        Err(e) => exit_with(PrepareError::from(e)),
    };

    let console = TerminalConsole::new();
    if let Err(e) = change_password(&working.wallet(), &console, kdf_iterations) {
        exit_with(PrepareError::from(e));
    }
}

fn exit_with(e: PrepareError) -> ! {
    eprintln!("Error: {}", e);
    process::exit(e.exit_code())
}
