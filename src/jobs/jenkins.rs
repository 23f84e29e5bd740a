//! Backup of a Jenkins home directory using [Jenkins].

use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::{DateTime, Local};

use super::archive::{create_archive, place_archive, Staging};
use super::{archive_name, JobError, JobResult, JobRunner};
use crate::config::ModuleArgs;
use crate::util::command::CommandRunner;

const DEFAULT_HOME: &str = "/var/lib/jenkins";
const DEFAULT_EXCLUDES: [&str; 2] = ["workspace", "caches"];

/// Archives `jenkins_home` without the rebuildable directories listed in
/// `jenkins_exclude`.
pub struct Jenkins {
    commands: Rc<dyn CommandRunner>,
}

impl Jenkins {
    pub fn new(commands: Rc<dyn CommandRunner>) -> Self {
        Self { commands }
    }
}

impl JobRunner for Jenkins {
    fn run(
        &self,
        local_dir: &Path,
        timestamp: &DateTime<Local>,
        args: &ModuleArgs,
    ) -> Result<JobResult, JobError> {
        let home: PathBuf = args.path_or("jenkins_home", DEFAULT_HOME);
        let excludes = args.list_or("jenkins_exclude", &DEFAULT_EXCLUDES);
        if !home.is_dir() {
            return Err(JobError::MissingInput(home));
        }
        log::info!(target: "job::jenkins", "Archiving {} (excluding {})", home.display(), excludes.join(", "));

        let archive_file_name = archive_name("jenkins", timestamp);
        let staging = Staging::new("jenkins")?;
        let built = staging.path().join(&archive_file_name);

        let mut job_log = format!("Archiving {}\n", home.display());
        job_log.push_str(&create_archive(self.commands.as_ref(), &home, &built, &excludes)?);
        place_archive(&built, local_dir, &archive_file_name)?;
        log::info!(target: "job::jenkins", "Finished Jenkins backup {archive_file_name}");

        Ok(JobResult {
            archive_file_name,
            job_log,
        })
    }
}
