use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use scopeguard::defer;
use tracing::error;
use tracing_subscriber::EnvFilter;

use ringmark_core::config::{self, RunConfig};
use ringmark_core::runtime::loopback::{self, LoopbackAccel};
use ringmark_core::runtime::Communicator;
use ringmark_core::{crash, orchestrator, suite};

#[derive(Parser)]
#[command(name = "ringmark")]
#[command(version, disable_version_flag = true)]
#[command(
    about = "Distributed cluster connectivity and health diagnostic harness",
    long_about = None
)]
struct Cli {
    /// Print version information
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Run every probe in the registry
    #[arg(short = 'a', long)]
    all: bool,

    /// Message size with an optional B/k/M/G suffix
    #[arg(short = 'm', long, default_value = "512k")]
    msg_size: String,

    /// Per-rank file size with an optional B/k/M/G suffix
    #[arg(short = 'M', long, default_value = "4k")]
    file_size: String,

    /// Number of passes over the selected suite
    #[arg(short = 'n', long = "n-iters", default_value_t = 1)]
    n_iters: usize,

    /// Quiet mode: failures only
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Add a path to stat on every rank (repeatable)
    #[arg(short = 's', long = "stat", value_name = "PATH")]
    stat: Vec<PathBuf>,

    /// Add a path for the I/O probes to write under (repeatable)
    #[arg(short = 'w', long = "write", value_name = "PATH")]
    write: Vec<PathBuf>,

    /// Comma-separated probe names to run, in the given order
    #[arg(short = 't', long = "with-tests", value_name = "t1[,t2,...]")]
    with_tests: Option<String>,

    /// Display verbose output
    #[arg(short = 'V', long)]
    verbose: bool,

    /// Number of loopback ranks to run the battery across
    #[arg(long, default_value_t = 2)]
    ranks: usize,

    /// Watchdog deadline in seconds for hang-guarded exchanges (0 disables)
    #[arg(long, default_value_t = config::DEFAULT_HANG_TIMEOUT_SECS)]
    timeout: u64,
}

fn build_config(cli: &Cli) -> anyhow::Result<RunConfig> {
    let mut config = RunConfig {
        msg_size: config::parse_size(&cli.msg_size, "message")?,
        file_size: config::parse_size(&cli.file_size, "file")?,
        passes: cli.n_iters,
        quiet: cli.quiet,
        verbose: cli.verbose && !cli.quiet,
        hang_timeout_secs: cli.timeout,
        ..RunConfig::default()
    };

    for path in &cli.stat {
        config.push_stat_path(path.clone());
    }
    for path in &cli.write {
        config.push_io_path(path.clone());
    }

    if let Some(list) = &cli.with_tests {
        config.probe_list = Some(
            list.split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect(),
        );
    } else if cli.all {
        config.probe_list = Some(
            suite::REGISTRY
                .iter()
                .map(|probe| probe.name.to_string())
                .collect(),
        );
    }

    Ok(config)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(err) = crash::install(None) {
        error!(%err, "failed to install the crash handler");
        return ExitCode::FAILURE;
    }
    defer! {
        let _ = crash::restore();
    }

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "invalid arguments");
            return ExitCode::FAILURE;
        }
    };

    if cli.ranks == 0 {
        error!("--ranks must be at least 1");
        return ExitCode::FAILURE;
    }

    let accel_factory =
        || Box::new(LoopbackAccel::new()) as Box<dyn ringmark_core::runtime::Accelerator>;

    // A failed probe is fatal to the whole job: surface it through the
    // runtime's abnormal-termination path so no sibling rank is left
    // blocked in a barrier the failed rank will never reach.
    loopback::run_on(cli.ranks, |comm| {
        if let Err(err) = orchestrator::run(&comm, config.clone(), &accel_factory) {
            error!(rank = comm.rank(), %err, "diagnostic run failed");
            comm.abort(1);
        }
    });
    ExitCode::SUCCESS
}
