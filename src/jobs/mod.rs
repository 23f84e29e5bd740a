//! Backup jobs producing one archive each.
//!
//! Currently the following jobs are implemented:
//!
//! - [Gitlab]: `gitlab-rake gitlab:backup:create` plus `gitlab.rb`.
//! - [MySql]: `mysqldump` of every configured database plus `my.cnf`.
//!   Also serves MariaDB.
//! - [Postgres]: `pg_dump` of every configured database, roles via
//!   `pg_dumpall --globals-only`, plus `pg_hba.conf` and `postgresql.conf`.
//! - [Jenkins]: archive of the Jenkins home directory.

mod archive;
pub mod gitlab;
pub mod jenkins;
pub mod mysql;
pub mod postgres;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;

use chrono::{DateTime, Local};
use derive_more::{Display, Error, From};

pub use archive::{archive_name, Staging};
pub use gitlab::Gitlab;
pub use jenkins::Jenkins;
pub use mysql::MySql;
pub use postgres::Postgres;

use crate::config::ModuleArgs;
use crate::util::command::{CommandError, CommandRunner};

/// Outcome of a successful job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    /// File name (not path) of the archive placed into the local directory.
    pub archive_file_name: String,
    /// Free-text log of the job, appended verbatim to the run report.
    pub job_log: String,
}

#[derive(Debug, Display, Error, From)]
/// Any failure of a job. The run treats all of them as fatal.
pub enum JobError {
    /// An external tool could not be run or exited unsuccessfully.
    #[display("{_0}")]
    Command(CommandError),
    /// Staging, archiving or moving the archive failed.
    #[display("{context}: {source}")]
    #[from(ignore)]
    Io {
        context: String,
        source: io::Error,
    },
    /// A file the job needs is missing.
    #[display("required file not found: {}", _0.display())]
    #[from(ignore)]
    MissingInput(#[error(ignore)] PathBuf),
    /// The job finished but its archive is not in the local directory.
    #[display("archive {} was not produced", _0.display())]
    #[from(ignore)]
    ArchiveMissing(#[error(ignore)] PathBuf),
}

impl JobError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| JobError::Io { context, source }
    }
}

/// Contract of every backup job.
///
/// - The archive name only depends on `timestamp`.
/// - On error no (partial) archive is left in `local_dir`.
/// - Scratch space is cleaned up on success and failure.
pub trait JobRunner {
    fn run(
        &self,
        local_dir: &Path,
        timestamp: &DateTime<Local>,
        args: &ModuleArgs,
    ) -> Result<JobResult, JobError>;
}

/// Known job types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Gitlab,
    Postgres,
    MySql,
    Jenkins,
}

/// Requested job type is not known.
#[derive(Debug, Display, Error)]
#[display("unknown backup job type: {_0} (expected one of gitlab, postgres, mysql, mariadb, jenkins)")]
pub struct UnknownJobType(#[error(ignore)] pub String);

impl FromStr for JobKind {
    type Err = UnknownJobType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gitlab" => Ok(Self::Gitlab),
            "postgres" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            "jenkins" => Ok(Self::Jenkins),
            _ => Err(UnknownJobType(s.to_string())),
        }
    }
}

impl JobKind {
    /// Canonical display name used in the report subject and log file name.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Gitlab => "Gitlab",
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::Jenkins => "Jenkins",
        }
    }

    /// Instantiates the job with the given command seam.
    pub fn runner(self, commands: Rc<dyn CommandRunner>) -> Box<dyn JobRunner> {
        match self {
            Self::Gitlab => Box::new(Gitlab::new(commands)),
            Self::Postgres => Box::new(Postgres::new(commands)),
            Self::MySql => Box::new(MySql::new(commands)),
            Self::Jenkins => Box::new(Jenkins::new(commands)),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Maps a job name (case-insensitive) to its canonical name and runner.
pub fn resolve(
    name: &str,
    commands: Rc<dyn CommandRunner>,
) -> Result<(&'static str, Box<dyn JobRunner>), UnknownJobType> {
    let kind: JobKind = name.parse()?;
    Ok((kind.display_name(), kind.runner(commands)))
}
