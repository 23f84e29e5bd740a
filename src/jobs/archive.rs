//! Scratch space and archive handling shared by all jobs.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;

use super::JobError;
use crate::util::command::{CommandOutput, CommandRunner, ExternalCommand};

const TAR: &str = "tar";

/// `<prefix>_<YYYY-MM-DD_HH-MM-SS>.tar.gz`, derived only from the run timestamp.
pub fn archive_name(prefix: &str, timestamp: &DateTime<Local>) -> String {
    format!("{prefix}_{}.tar.gz", timestamp.format("%Y-%m-%d_%H-%M-%S"))
}

/// Private scratch directory of a job, removed when dropped.
///
/// Layout: `payload/` holds what goes into the archive, the archive itself is
/// written next to it so it never contains itself.
#[derive(Debug)]
pub struct Staging {
    dir: TempDir,
}

impl Staging {
    pub fn new(job: &str) -> Result<Self, JobError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("nimbus-{job}-"))
            .tempdir()
            .map_err(JobError::io("creating scratch directory"))?;
        fs::create_dir(dir.path().join("payload"))
            .map_err(JobError::io("creating scratch payload directory"))?;
        log::debug!(target: "job", "Scratch directory {}", dir.path().display());

        Ok(Self { dir })
    }

    pub fn payload(&self) -> PathBuf {
        self.dir.path().join("payload")
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Copies `source` into the payload as `name`.
    pub fn stage_file(&self, source: &Path, name: &str) -> Result<(), JobError> {
        if !source.is_file() {
            return Err(JobError::MissingInput(source.to_path_buf()));
        }
        fs::copy(source, self.payload().join(name))
            .map_err(JobError::io(format!("staging {}", source.display())))?;
        Ok(())
    }

    /// Archives the payload and moves the archive into `local_dir`.
    pub fn archive_into(
        &self,
        commands: &dyn CommandRunner,
        local_dir: &Path,
        name: &str,
    ) -> Result<String, JobError> {
        let built = self.path().join(name);
        let log = create_archive(commands, &self.payload(), &built, &[])?;
        place_archive(&built, local_dir, name)?;
        Ok(log)
    }
}

/// Runs `tar -czf <archive> -C <source> .`, returning tar's output.
pub(super) fn create_archive(
    commands: &dyn CommandRunner,
    source: &Path,
    archive: &Path,
    excludes: &[String],
) -> Result<String, JobError> {
    let command = ExternalCommand::new(TAR)
        .arg("-czf")
        .arg(archive)
        .arg("-C")
        .arg(source)
        .args(excludes.iter().map(|e| format!("--exclude=./{e}")))
        .arg(".");

    log::info!(target: "job", "Creating archive {}", archive.display());
    let output = commands.run(&command)?.check(&command)?;
    if !archive.is_file() {
        return Err(JobError::ArchiveMissing(archive.to_path_buf()));
    }

    Ok(combined_output(&output))
}

/// Moves a finished archive into `local_dir` without ever exposing a
/// partially written file under its final name.
pub(super) fn place_archive(archive: &Path, local_dir: &Path, name: &str) -> Result<(), JobError> {
    let destination = local_dir.join(name);
    log::info!(target: "job", "Moving archive to {}", destination.display());

    if fs::rename(archive, &destination).is_ok() {
        return Ok(());
    }

    // different file system: copy beside the destination, then rename
    let partial = local_dir.join(format!("{name}.partial"));
    let copied = fs::copy(archive, &partial).and_then(|_| fs::rename(&partial, &destination));
    if let Err(e) = copied {
        let _ = fs::remove_file(&partial);
        return Err(JobError::Io {
            context: format!("moving archive to {}", destination.display()),
            source: e,
        });
    }
    let _ = fs::remove_file(archive);

    Ok(())
}

/// Streams the stdout of `command` gzip-compressed into `destination`.
///
/// The destination is removed again if the command fails.
pub(super) fn dump_gz(
    commands: &dyn CommandRunner,
    command: &ExternalCommand,
    destination: &Path,
) -> Result<CommandOutput, JobError> {
    let result = (|| -> Result<CommandOutput, JobError> {
        let file = File::create(destination)
            .map_err(JobError::io(format!("creating {}", destination.display())))?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        let output = commands.run_into(command, &mut encoder)?;
        encoder
            .finish()
            .map_err(JobError::io(format!("compressing {}", destination.display())))?;
        Ok(output.check(command)?)
    })();

    if result.is_err() {
        if let Err(e) = fs::remove_file(destination) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!(target: "job", "Removing failed dump {} failed: {e}", destination.display());
            }
        }
    }
    result
}

/// First existing file among `candidates`.
pub(super) fn first_existing(candidates: &[PathBuf]) -> Option<&PathBuf> {
    candidates.iter().find(|p| p.is_file())
}

pub(super) fn combined_output(output: &CommandOutput) -> String {
    let mut text = output.stdout.clone();
    if !output.stderr.trim().is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&output.stderr);
    }
    text
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use chrono::TimeZone;
    use flate2::read::GzDecoder;

    use super::*;
    use crate::jobs::testing::FakeCommands;

    #[test]
    fn archive_name_is_deterministic() {
        let ts = Local.with_ymd_and_hms(2026, 10, 19, 3, 4, 5).unwrap();
        assert_eq!(archive_name("mysql", &ts), "mysql_2026-10-19_03-04-05.tar.gz");
        assert_eq!(archive_name("mysql", &ts), archive_name("mysql", &ts));
    }

    #[test]
    fn staging_is_removed_on_drop() {
        let staging = Staging::new("test").unwrap();
        let path = staging.path().to_path_buf();
        assert!(staging.payload().is_dir());
        drop(staging);
        assert!(!path.exists());
    }

    #[test]
    fn places_archive_in_local_dir() {
        let local = tempfile::tempdir().unwrap();
        let staging = Staging::new("test").unwrap();
        let commands = FakeCommands::default();

        staging
            .archive_into(&commands, local.path(), "x_2026.tar.gz")
            .unwrap();

        assert!(local.path().join("x_2026.tar.gz").is_file());
        assert!(!staging.path().join("x_2026.tar.gz").exists());
        let args: Vec<String> = commands.seen.borrow()[0].get_args().collect();
        assert_eq!(args.last().map(String::as_str), Some("."));
    }

    #[test]
    fn failing_tar_leaves_nothing_behind() {
        let local = tempfile::tempdir().unwrap();
        let staging = Staging::new("test").unwrap();
        let commands = FakeCommands::failing("tar");

        let err = staging
            .archive_into(&commands, local.path(), "x.tar.gz")
            .unwrap_err();

        assert!(matches!(err, JobError::Command(_)));
        assert_eq!(fs::read_dir(local.path()).unwrap().count(), 0);
    }

    #[test]
    fn dump_is_gzip_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("db.sql.gz");
        let commands = FakeCommands::default();

        dump_gz(&commands, &ExternalCommand::new("mysqldump"), &dest).unwrap();

        let mut text = String::new();
        GzDecoder::new(File::open(&dest).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "-- dump\n");
    }

    #[test]
    fn failed_dump_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("db.sql.gz");
        let commands = FakeCommands::failing("mysqldump");

        let err = dump_gz(&commands, &ExternalCommand::new("mysqldump"), &dest).unwrap_err();
        assert!(matches!(err, JobError::Command(_)));
        assert!(!dest.exists());
    }
}
