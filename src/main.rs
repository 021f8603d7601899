use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use backyard_backup::config::AppConfig;
use backyard_backup::error::BackupError;
use backyard_backup::logging;
use backyard_backup::pipeline::Pipeline;
use backyard_backup::scheduler::Scheduler;

/// Back up and restore databases to local disk or S3.
#[derive(Parser, Debug)]
#[command(name = "backyard-backup", version, about)]
struct Cli {
    /// Config file (default: ./config.yaml, ./config.yml, ~/.backyard-backup/config.yaml)
    #[arg(long, global = true, env = "BACKUP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dump the configured database and upload the artifact
    Backup,
    /// Download an artifact and restore it into the configured database
    Restore {
        /// Remote key printed by `backup`, e.g. orders_20240102_030405.sql.gz
        #[arg(short = 'f', long = "file")]
        file: String,
    },
    /// Run `backup` on every tick of `backup.schedule` until interrupted
    Schedule,
}

const SUCCESS: u8 = 0;
const FAILURE: u8 = 1;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match parse_args(std::env::args_os()) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(usage_exit_code(&e));
        }
    };

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _log_guard = match logging::init(&config.log) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let outcome = dispatch(cli.command, config).await;
    if let Err(e) = &outcome {
        error!(step = e.step(), error = %e, "command failed");
        eprintln!("Error: {e}");
    }
    ExitCode::from(outcome_code(&outcome))
}

fn parse_args<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::try_parse_from(args)
}

// `--help` and `--version` surface as errors that go to stdout.
fn usage_exit_code(e: &clap::Error) -> u8 {
    if e.use_stderr() { FAILURE } else { SUCCESS }
}

fn outcome_code(outcome: &Result<(), BackupError>) -> u8 {
    match outcome {
        Ok(()) => SUCCESS,
        Err(_) => FAILURE,
    }
}

async fn dispatch(command: Command, config: AppConfig) -> Result<(), BackupError> {
    match command {
        Command::Backup => {
            let report = Pipeline::new(&config)?.run_backup().await?;
            println!("{}", report.summary());
            println!("Stored as: {}", report.remote_key);
        }
        Command::Restore { file } => {
            let report = Pipeline::new(&config)?.run_restore(&file).await?;
            println!("Restore of {} completed in {:.2?}", report.remote_key, report.elapsed);
        }
        Command::Schedule => {
            let scheduler = Scheduler::from_config(config)?;
            scheduler
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!(error = %e, "failed to listen for ctrl-c");
                        std::future::pending::<()>().await;
                    }
                })
                .await?;
            info!("scheduler exited");
        }
    }
    Ok(())
}
