//! Backup of a GitLab omnibus installation using [Gitlab].
//!
//! Expects `gitlab_rails['backup_path']` in `gitlab.rb` to point at
//! `gitlab_backup_path` (default `/var/opt/gitlab/backups`).

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::{DateTime, Local};

use super::archive::{combined_output, Staging};
use super::{archive_name, JobError, JobResult, JobRunner};
use crate::config::ModuleArgs;
use crate::util::command::{CommandRunner, ExternalCommand};

const DEFAULT_BACKUP_PATH: &str = "/var/opt/gitlab/backups";
const DEFAULT_RAKE: &str = "/opt/gitlab/bin/gitlab-rake";
const DEFAULT_CONFIG: &str = "/etc/gitlab/gitlab.rb";

/// Runs `gitlab-rake gitlab:backup:create` and archives its output with `gitlab.rb`.
pub struct Gitlab {
    commands: Rc<dyn CommandRunner>,
}

impl Gitlab {
    pub fn new(commands: Rc<dyn CommandRunner>) -> Self {
        Self { commands }
    }
}

struct GitlabArgs {
    backup_path: PathBuf,
    rake: PathBuf,
    config: PathBuf,
}

impl From<&ModuleArgs> for GitlabArgs {
    fn from(args: &ModuleArgs) -> Self {
        Self {
            backup_path: args.path_or("gitlab_backup_path", DEFAULT_BACKUP_PATH),
            rake: args.path_or("gitlab_rake", DEFAULT_RAKE),
            config: args.path_or("gitlab_config", DEFAULT_CONFIG),
        }
    }
}

/// Empties the GitLab backup directory (creating it if missing) so the
/// archive only contains the backup of this run.
fn clear_backup_path(path: &Path) -> Result<(), JobError> {
    if !path.is_dir() {
        fs::create_dir_all(path).map_err(JobError::io(format!("creating {}", path.display())))?;
        log::info!(target: "job::gitlab", "Created {}", path.display());
        return Ok(());
    }

    let entries = fs::read_dir(path).map_err(JobError::io(format!("listing {}", path.display())))?;
    for entry in entries {
        let entry = entry.map_err(JobError::io(format!("listing {}", path.display())))?;
        let entry_path = entry.path();
        let removed = if entry_path.is_dir() {
            fs::remove_dir_all(&entry_path)
        } else {
            fs::remove_file(&entry_path)
        };
        removed.map_err(JobError::io(format!("removing {}", entry_path.display())))?;
    }
    Ok(())
}

/// Copies every regular file of `from` into `to`.
fn copy_files(from: &Path, to: &Path) -> Result<usize, JobError> {
    let mut copied = 0;
    let entries = fs::read_dir(from).map_err(JobError::io(format!("listing {}", from.display())))?;
    for entry in entries {
        let entry = entry.map_err(JobError::io(format!("listing {}", from.display())))?;
        let source = entry.path();
        if source.is_file() {
            fs::copy(&source, to.join(entry.file_name()))
                .map_err(JobError::io(format!("staging {}", source.display())))?;
            copied += 1;
        }
    }
    Ok(copied)
}

impl JobRunner for Gitlab {
    fn run(
        &self,
        local_dir: &Path,
        timestamp: &DateTime<Local>,
        args: &ModuleArgs,
    ) -> Result<JobResult, JobError> {
        let args = GitlabArgs::from(args);
        log::info!(target: "job::gitlab", "Using GitLab backup path {}", args.backup_path.display());

        clear_backup_path(&args.backup_path)?;

        let rake = ExternalCommand::new(&args.rake).arg("gitlab:backup:create");
        let output = self.commands.run(&rake)?.check(&rake)?;
        let mut job_log = combined_output(&output);

        let staging = Staging::new("gitlab")?;
        let staged = copy_files(&args.backup_path, &staging.payload())?;
        if staged == 0 {
            return Err(JobError::MissingInput(args.backup_path));
        }
        staging.stage_file(&args.config, "gitlab.rb")?;

        let archive_file_name = archive_name("gitlab", timestamp);
        job_log.push_str(&staging.archive_into(self.commands.as_ref(), local_dir, &archive_file_name)?);
        log::info!(target: "job::gitlab", "Finished GitLab backup {archive_file_name}");

        Ok(JobResult {
            archive_file_name,
            job_log,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::jobs::testing::FakeCommands;

    #[test]
    fn archives_rake_output_and_config() {
        let root = tempfile::tempdir().unwrap();
        let backups = root.path().join("gitlab-backups");
        let local = root.path().join("local");
        let config = root.path().join("gitlab.rb");
        fs::create_dir_all(&backups).unwrap();
        fs::create_dir_all(&local).unwrap();
        fs::write(&config, "external_url 'https://git.example.org'").unwrap();
        fs::write(backups.join("stale_gitlab_backup.tar"), "old").unwrap();

        // the fake rake writes nothing, so seed what gitlab-rake would produce
        struct SeedingRake {
            inner: FakeCommands,
            backups: PathBuf,
        }
        impl CommandRunner for SeedingRake {
            fn run(
                &self,
                command: &ExternalCommand,
            ) -> Result<crate::util::command::CommandOutput, crate::util::command::CommandError>
            {
                if command.program().ends_with("gitlab-rake") {
                    assert!(!self.backups.join("stale_gitlab_backup.tar").exists());
                    fs::write(self.backups.join("1760000000_gitlab_backup.tar"), "new").unwrap();
                }
                self.inner.run(command)
            }
            fn run_into(
                &self,
                command: &ExternalCommand,
                sink: &mut dyn std::io::Write,
            ) -> Result<crate::util::command::CommandOutput, crate::util::command::CommandError>
            {
                self.inner.run_into(command, sink)
            }
        }

        let commands = Rc::new(SeedingRake {
            inner: FakeCommands::default(),
            backups: backups.clone(),
        });
        let job = Gitlab::new(commands.clone());
        let args: ModuleArgs = serde_json::from_value(json!({
            "gitlab_backup_path": backups,
            "gitlab_rake": root.path().join("gitlab-rake"),
            "gitlab_config": config,
        }))
        .unwrap();
        let ts = Local::now();

        let result = job.run(&local, &ts, &args).unwrap();

        assert_eq!(result.archive_file_name, archive_name("gitlab", &ts));
        assert!(local.join(&result.archive_file_name).is_file());
        assert_eq!(fs::read_dir(&local).unwrap().count(), 1);
        assert!(result.job_log.contains("gitlab-rake done"));
        assert_eq!(
            commands.inner.programs().last().map(String::as_str),
            Some("tar")
        );
    }

    #[test]
    fn failing_rake_is_a_job_failure() {
        let root = tempfile::tempdir().unwrap();
        let local = root.path().join("local");
        fs::create_dir_all(&local).unwrap();
        let args: ModuleArgs = serde_json::from_value(json!({
            "gitlab_backup_path": root.path().join("backups"),
            "gitlab_rake": "gitlab-rake",
        }))
        .unwrap();

        let job = Gitlab::new(Rc::new(FakeCommands::failing("gitlab-rake")));
        let err = job.run(&local, &Local::now(), &args).unwrap_err();

        assert!(matches!(err, JobError::Command(_)));
        assert_eq!(fs::read_dir(&local).unwrap().count(), 0);
    }
}
