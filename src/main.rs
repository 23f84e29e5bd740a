use std::process::ExitCode;
use std::rc::Rc;

use chrono::Local;
use clap::Parser;

use nimbus_lib::cli::Cli;
use nimbus_lib::config::BackupConfig;
use nimbus_lib::jobs;
use nimbus_lib::orchestrator::{Orchestrator, RunOptions};
use nimbus_lib::report::{ReportDelivery, Sendmail};
use nimbus_lib::util::command::{CommandRunner, SystemCommandRunner};
use nimbus_lib::util::lock::RunLock;

/// Usage, configuration and lock errors, nothing was touched yet.
const EXIT_USAGE: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    if let Err(e) = env_logger.try_init() {
        eprintln!("Initialising the logger failed: {e}");
    }

    let commands: Rc<dyn CommandRunner> = Rc::new(SystemCommandRunner);

    let (job_name, job) = match jobs::resolve(&cli.backup, commands.clone()) {
        Ok(resolved) => resolved,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let config = match BackupConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!(target: "config", "{e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let _lock = match RunLock::acquire(&cli.lock_dir, job_name) {
        Ok(lock) => lock,
        Err(e) => {
            log::error!(target: "lock", "{e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let sendmail = Sendmail::with_program(&cli.sendmail, commands);
    let delivery: Option<&dyn ReportDelivery> = if cli.no_mail { None } else { Some(&sendmail) };

    let options = RunOptions {
        log_dir: Some(cli.log_dir),
        operator: cli.operator,
    };
    log::info!("Starting {job_name} backup");

    let mut orchestrator = Orchestrator::new(job_name, job.as_ref(), delivery, options);
    match orchestrator.run_with_config(&config, Local::now()) {
        Ok(summary) => {
            log::info!(
                "{job_name} backup finished: {} removed, {} kept, archive {}",
                summary.counters.deleted,
                summary.counters.kept,
                summary.context.archive_name.as_deref().unwrap_or("-")
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{job_name} backup failed: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}
