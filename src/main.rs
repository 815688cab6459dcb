//! ProcMux - scripted process multiplexing layer.
//!
//! Entry point that sets up a simulated driving target and drops into the
//! REPL where multiplexer and demultiplexed scripted processes can be
//! spun up against it.

use clap::Parser;

use procmux::host::{Debugger, SimSpec};
use procmux::ui::cli::run_cli;

/// ProcMux: scripted process multiplexer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Executable name for the simulated driving target
    #[arg(short, long, default_value = "a.out")]
    exe: String,

    /// Target triple of the simulated driving target
    #[arg(long, default_value = "x86_64-unknown-linux-gnu")]
    triple: String,

    /// Number of threads in the simulated driving process
    #[arg(long, default_value_t = 4)]
    threads: u64,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    // 1. Parse command line arguments
    let args = Args::parse();

    // 2. Initialize logger with verbosity level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        },
    ))
    .init();

    log::info!("ProcMux Core Initialized");
    log::debug!("Driving target: {} ({})", args.exe, args.triple);

    // 3. Register the driving target with the host's target registry
    let debugger = Debugger::new();
    let thread_ids: Vec<u64> = (1..=args.threads).collect();
    debugger.create_target(&args.exe, &args.triple, SimSpec::with_thread_ids(&thread_ids));
    debugger.select_target(0);

    println!(
        "[*] ProcMux v{} - driving target '{}' with {} threads",
        env!("CARGO_PKG_VERSION"),
        args.exe,
        args.threads
    );

    // 4. Run the REPL on the command thread
    run_cli(debugger)
}
