use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use rsc_client::RemoteSyscalls;
use rsc_proto::MachineInfo;
use starter::{Driver, JobOutcome, StarterConfig, StarterResult, config, logging};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "starter", version)]
struct Cli {
    /// Starter config file (YAML)
    #[arg(long, short)]
    config: PathBuf,
    /// Unix socket the job's authority listens on
    #[arg(long)]
    authority: PathBuf,
    /// Second authority socket, handed to the job as its syscall channel
    #[arg(long)]
    job_channel: Option<PathBuf>,
    /// UID domain reported with the machine info
    #[arg(long, default_value = "")]
    uid_domain: String,
    /// Filesystem domain reported with the machine info
    #[arg(long, default_value = "")]
    fs_domain: String,
}

fn run(cli: &Cli, config: &StarterConfig) -> StarterResult<JobOutcome> {
    let stream = UnixStream::connect(&cli.authority)?;
    let channel = cli
        .job_channel
        .as_ref()
        .map(UnixStream::connect)
        .transpose()?;
    let machine = MachineInfo {
        uid_domain: cli.uid_domain.clone(),
        fs_domain: cli.fs_domain.clone(),
        starter_addr: cli.authority.display().to_string(),
        full_hostname: config.this_host(),
        key: i32::try_from(std::process::id()).unwrap_or(0),
    };

    let mut driver = Driver::new(config);
    if let Some(channel) = &channel {
        driver = driver.with_channel(channel.as_fd());
    }
    driver.run_job(RemoteSyscalls::new(stream), &machine)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.log_level);

    match run(&cli, &config) {
        Ok(outcome) => {
            info!(state = %outcome.state, reason = outcome.reason, "starter done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "starter failed");
            ExitCode::FAILURE
        }
    }
}
