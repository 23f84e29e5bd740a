//! Sequencing of one backup run.
//!
//! ```text
//! Init -> ConfigLoaded -> DirectoriesVerified -> RetentionSwept
//!      -> JobExecuted -> Replicated -> Reported -> Done
//! ```
//!
//! Any fatal error moves the run to [Phase::Aborted]: the error is written to
//! the run report, the report is flushed, and nothing that already happened
//! is rolled back.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use derive_more::{Display, Error, From};

use crate::config::{BackupConfig, ConfigError};
use crate::jobs::{JobError, JobResult, JobRunner};
use crate::replication::{self, ReplicationError};
use crate::report::{self, MailMessage, ReportDelivery, RunReport};
use crate::util::retention::{RetentionCounters, RetentionSweeper, SweepError};

/// Phases of a run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    ConfigLoaded,
    DirectoriesVerified,
    RetentionSwept,
    JobExecuted,
    Replicated,
    Reported,
    Done,
    Aborted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Display, Error, From)]
/// Fatal errors of a run.
pub enum RunError {
    #[display("{_0}")]
    Config(ConfigError),
    #[display("retention sweep failed: {_0}")]
    Sweep(SweepError),
    #[display("backup job failed: {_0}")]
    Job(JobError),
    #[display("replication failed: {_0}")]
    Replication(ReplicationError),
}

impl RunError {
    /// Process exit code: 2 for configuration errors detected before any
    /// mutation, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunError::Config(_) => 2,
            _ => 1,
        }
    }
}

/// State of the one run of this process.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Canonical job name, e.g. `PostgreSQL`.
    pub job_name: &'static str,
    /// Captured once; every age and archive name derives from it.
    pub run_timestamp: DateTime<Local>,
    pub local_dir: PathBuf,
    /// Set by the job phase.
    pub archive_name: Option<String>,
}

/// Result of a completed run.
#[derive(Debug)]
pub struct RunSummary {
    pub context: RunContext,
    pub counters: RetentionCounters,
    pub copies: Vec<PathBuf>,
    pub report: RunReport,
    /// `false` when mail delivery was skipped or failed.
    pub mailed: bool,
}

/// Run-wide settings that don't come from the configuration file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Directory of the persisted run log, `None` keeps the report in memory.
    pub log_dir: Option<PathBuf>,
    /// Name written in the completion line.
    pub operator: String,
}

/// Drives a [JobRunner] through all phases of a run.
pub struct Orchestrator<'a> {
    job_name: &'static str,
    job: &'a dyn JobRunner,
    delivery: Option<&'a dyn ReportDelivery>,
    options: RunOptions,
    phase: Phase,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        job_name: &'static str,
        job: &'a dyn JobRunner,
        delivery: Option<&'a dyn ReportDelivery>,
        options: RunOptions,
    ) -> Self {
        Self {
            job_name,
            job,
            delivery,
            options,
            phase: Phase::Init,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        log::debug!(target: "orchestrator", "{} -> {phase}", self.phase);
        self.phase = phase;
    }

    /// Loads the configuration and runs all phases with `now` as run timestamp.
    pub fn run(&mut self, config_path: &Path, now: DateTime<Local>) -> Result<RunSummary, RunError> {
        match BackupConfig::load(config_path) {
            Ok(config) => self.run_with_config(&config, now),
            Err(e) => {
                self.enter(Phase::Aborted);
                Err(e.into())
            }
        }
    }

    /// Runs all phases on an already loaded configuration.
    pub fn run_with_config(
        &mut self,
        config: &BackupConfig,
        now: DateTime<Local>,
    ) -> Result<RunSummary, RunError> {
        let local = match config.local_directory() {
            Ok(local) => local,
            Err(e) => {
                self.enter(Phase::Aborted);
                return Err(e.into());
            }
        };
        self.enter(Phase::ConfigLoaded);
        log_configuration(config);

        let mut context = RunContext {
            job_name: self.job_name,
            run_timestamp: now,
            local_dir: local.target(),
            archive_name: None,
        };
        let mut report = self.open_report(&context);

        match self.execute(config, &mut context, &mut report) {
            Ok((counters, copies)) => {
                let mailed = self.deliver(config, &mut report);
                self.enter(Phase::Done);
                Ok(RunSummary {
                    context,
                    counters,
                    copies,
                    report,
                    mailed,
                })
            }
            Err(e) => {
                log::error!(target: "orchestrator", "Run aborted during {}: {e}", self.phase);
                report.close_section();
                report.line(format!("ERROR: run aborted: {e}"));
                report.flush();
                self.enter(Phase::Aborted);
                Err(e)
            }
        }
    }

    fn open_report(&self, context: &RunContext) -> RunReport {
        let subject = report::subject_line(context.job_name, &context.run_timestamp);
        let Some(log_dir) = &self.options.log_dir else {
            return RunReport::new(subject);
        };

        let path = report::log_file_path(log_dir, context.job_name);
        match RunReport::with_log_file(subject.clone(), &path) {
            Ok(report) => report,
            Err(e) => {
                log::warn!(target: "orchestrator", "Run log {} unavailable, keeping report in memory: {e}", path.display());
                RunReport::new(subject)
            }
        }
    }

    fn execute(
        &mut self,
        config: &BackupConfig,
        context: &mut RunContext,
        report: &mut RunReport,
    ) -> Result<(RetentionCounters, Vec<PathBuf>), RunError> {
        verify_directories(config, report);
        self.enter(Phase::DirectoriesVerified);

        report.section("Cleaning files according to set retention");
        let mut sweeper = RetentionSweeper::new(context.run_timestamp);
        let swept = sweeper.sweep(&config.directories, report);
        report.close_section();
        let counters = sweeper.counters();
        report.line(format!(
            "{} files exceeded the retention period and have been removed.",
            counters.deleted
        ));
        report.line(format!(
            "{} files are within the retention period and have been saved.",
            counters.kept
        ));
        report.blank();
        report.blank();
        swept?;
        self.enter(Phase::RetentionSwept);

        report.section("Performing backup operation");
        let JobResult {
            archive_file_name,
            job_log,
        } = self
            .job
            .run(&context.local_dir, &context.run_timestamp, &config.module_args)?;
        report.text_block(&job_log);
        report.close_section();
        context.archive_name = Some(archive_file_name.clone());
        self.enter(Phase::JobExecuted);

        report.section("Replicating backup archive");
        let copies = replication::replicate(
            &archive_file_name,
            &context.local_dir,
            &config.directories,
            report,
        )?;
        report.close_section();
        self.enter(Phase::Replicated);

        for listing in replication::inventory(&config.directories) {
            report.section(&format!("Files inventory of {} folder", listing.directory.display()));
            match listing.entries {
                Ok(entries) => entries.iter().for_each(|e| report.line(e.render())),
                Err(e) => report.line(format!("ERROR: listing failed: {e}")),
            }
            report.close_section();
        }
        report.blank();

        report.complete(&Local::now(), &self.options.operator);
        report.flush();
        self.enter(Phase::Reported);

        Ok((counters, copies))
    }

    /// Mails the report. Failure is logged, it does not fail the run.
    fn deliver(&self, config: &BackupConfig, report: &mut RunReport) -> bool {
        let Some(delivery) = self.delivery else {
            log::info!(target: "orchestrator", "Mail delivery disabled");
            return false;
        };

        let message = MailMessage {
            from: config.mail_sender.clone(),
            to: config.mail_recipients.to_vec(),
            subject: report.subject().to_string(),
            body: report.body().to_string(),
        };
        match delivery.deliver(&message) {
            Ok(()) => true,
            Err(e) => {
                log::error!(target: "report::mail", "Report delivery failed: {e}");
                false
            }
        }
    }
}

/// Creates missing backup directories. Failure only skips the directory.
fn verify_directories(config: &BackupConfig, report: &mut RunReport) {
    for directory in &config.directories {
        let target = directory.target();
        if target.is_dir() {
            continue;
        }
        match fs::create_dir_all(&target) {
            Ok(()) => log::info!(target: "orchestrator", "Created {}", target.display()),
            Err(e) => {
                log::warn!(target: "orchestrator", "{} could not be created: {e}", target.display());
                report.line(format!("WARNING: {} could not be created: {e}", target.display()));
            }
        }
    }
}

fn log_configuration(config: &BackupConfig) {
    for directory in &config.directories {
        log::info!(
            target: "config",
            "{}: {} ({}, retention {} days)",
            directory.name(),
            directory.target().display(),
            directory.role,
            directory.retention_days
        );
    }
    log::info!(target: "config", "Mail sender: {}", config.mail_sender);
    log::info!(target: "config", "Mail recipients: {}", config.mail_recipients.to_vec().join(", "));
    for (key, _) in config.module_args.iter() {
        log::debug!(target: "config", "Module argument: {key}");
    }
}
