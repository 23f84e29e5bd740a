use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use derive_more::{Display, Error};

use crate::config::BackupDirectory;
use crate::report::RunReport;

/// Number of removed and retained files of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionCounters {
    pub deleted: usize,
    pub kept: usize,
}

#[derive(Debug, Display, Error)]
pub enum SweepError {
    /// A file past retention could not be removed. The sweep stops here.
    #[display("{} could not be removed: {source}", path.display())]
    FileDeletionFailed { path: PathBuf, source: io::Error },
    /// Listing a directory failed midway.
    #[display("listing {} failed: {source}", path.display())]
    ListingFailed { path: PathBuf, source: io::Error },
}

/// Whole days between `modified` and `now`, rounded down.
pub fn age_in_days(now: &DateTime<Local>, modified: SystemTime) -> i64 {
    let modified: DateTime<Local> = modified.into();
    (*now - modified).num_days()
}

/// Deletes files older than their directory's retention.
///
/// All ages are measured against the single `now` of the run. Only regular
/// files directly inside a directory are considered. The first failed
/// deletion aborts the sweep; the counters keep what actually happened.
#[derive(Debug)]
pub struct RetentionSweeper {
    now: DateTime<Local>,
    counters: RetentionCounters,
}

impl RetentionSweeper {
    pub fn new(now: DateTime<Local>) -> Self {
        Self {
            now,
            counters: RetentionCounters::default(),
        }
    }

    pub fn counters(&self) -> RetentionCounters {
        self.counters
    }

    /// Sweeps every directory in order, logging removals into `report`.
    pub fn sweep(
        &mut self,
        directories: &[BackupDirectory],
        report: &mut RunReport,
    ) -> Result<RetentionCounters, SweepError> {
        for directory in directories {
            let target = directory.target();
            if !target.is_dir() {
                log::warn!(target: "retention", "Skipping missing directory {}", target.display());
                report.line(format!("WARNING: {} does not exist, skipped", target.display()));
                continue;
            }
            self.sweep_directory(&target, directory.retention_days, report)?;
        }

        Ok(self.counters)
    }

    fn sweep_directory(
        &mut self,
        dir: &Path,
        retention_days: u32,
        report: &mut RunReport,
    ) -> Result<(), SweepError> {
        log::debug!(target: "retention", "Sweeping {} (retention {retention_days} days)", dir.display());

        let listing_failed = |source| SweepError::ListingFailed {
            path: dir.to_path_buf(),
            source,
        };

        let mut entries = fs::read_dir(dir)
            .map_err(listing_failed)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(listing_failed)?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                // vanished between listing and stat
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(source) => return Err(SweepError::ListingFailed { path, source }),
            };
            if !metadata.is_file() {
                continue;
            }

            let modified = metadata
                .modified()
                .map_err(|source| SweepError::ListingFailed {
                    path: path.clone(),
                    source,
                })?;
            let age = age_in_days(&self.now, modified);

            if age > i64::from(retention_days) {
                if let Err(source) = fs::remove_file(&path) {
                    log::error!(target: "retention", "Removing {} failed: {source}", path.display());
                    report.line(format!("{} could not be removed: {source}", path.display()));
                    return Err(SweepError::FileDeletionFailed { path, source });
                }
                self.counters.deleted += 1;
                log::info!(target: "retention", "Removed {} ({age} days old)", path.display());
                report.line(format!("{} removed ({age} days old)", path.display()));
            } else {
                self.counters.kept += 1;
                log::trace!(target: "retention", "Keeping {} ({age} days old)", path.display());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use chrono::Duration;

    use super::*;
    use crate::config::{normalize_dir_path, Role};

    fn directory(root: &Path, name: &str, retention_days: u32) -> BackupDirectory {
        let dir = BackupDirectory {
            label: Some(name.to_string()),
            directory: Some(name.to_string()),
            path: normalize_dir_path(&root.display().to_string()),
            role: Role::Local,
            retention_days,
        };
        fs::create_dir_all(dir.target()).unwrap();
        dir
    }

    fn file_aged(dir: &Path, name: &str, now: &DateTime<Local>, age: Duration) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        file.set_modified((*now - age).into()).unwrap();
        path
    }

    #[test]
    fn age_rounds_down_to_whole_days() {
        let now = Local::now();
        let modified: SystemTime = (now - Duration::hours(47)).into();
        assert_eq!(age_in_days(&now, modified), 1);
        let modified: SystemTime = (now - Duration::hours(23)).into();
        assert_eq!(age_in_days(&now, modified), 0);
    }

    #[test]
    fn deletes_only_files_past_retention() {
        let root = tempfile::tempdir().unwrap();
        let now = Local::now();
        let dir = directory(root.path(), "local", 5);
        let target = dir.target();

        let old = file_aged(&target, "old.tar.gz", &now, Duration::days(10));
        let young = file_aged(&target, "young.tar.gz", &now, Duration::days(2));
        let edge = file_aged(&target, "edge.tar.gz", &now, Duration::days(5) + Duration::hours(1));

        let mut report = RunReport::new("test");
        let mut sweeper = RetentionSweeper::new(now);
        let counters = sweeper.sweep(&[dir], &mut report).unwrap();

        assert_eq!(counters, RetentionCounters { deleted: 1, kept: 2 });
        assert!(!old.exists());
        assert!(young.exists());
        assert!(edge.exists());
        assert!(report
            .text()
            .contains(&format!("{} removed (10 days old)", old.display())));
        assert!(!report.text().contains("young.tar.gz"));
    }

    #[test]
    fn zero_retention_keeps_todays_files() {
        let root = tempfile::tempdir().unwrap();
        let now = Local::now();
        let dir = directory(root.path(), "zero", 0);
        let target = dir.target();

        let today = file_aged(&target, "today", &now, Duration::hours(1));
        let yesterday = file_aged(&target, "yesterday", &now, Duration::hours(25));

        let mut report = RunReport::new("test");
        let counters = RetentionSweeper::new(now)
            .sweep(&[dir], &mut report)
            .unwrap();

        assert_eq!(counters, RetentionCounters { deleted: 1, kept: 1 });
        assert!(today.exists());
        assert!(!yesterday.exists());
    }

    #[test]
    fn counts_accumulate_across_directories_and_skip_subdirs() {
        let root = tempfile::tempdir().unwrap();
        let now = Local::now();
        let a = directory(root.path(), "a", 1);
        let b = directory(root.path(), "b", 1);
        file_aged(&a.target(), "x", &now, Duration::days(3));
        file_aged(&b.target(), "y", &now, Duration::days(3));
        file_aged(&b.target(), "z", &now, Duration::hours(2));
        fs::create_dir(b.target().join("nested")).unwrap();

        let mut report = RunReport::new("test");
        let counters = RetentionSweeper::new(now)
            .sweep(&[a, b.clone()], &mut report)
            .unwrap();

        assert_eq!(counters, RetentionCounters { deleted: 2, kept: 1 });
        assert!(b.target().join("nested").is_dir());
    }

    #[test]
    fn empty_and_missing_directories_are_not_errors() {
        let root = tempfile::tempdir().unwrap();
        let empty = directory(root.path(), "empty", 3);
        let missing = directory(root.path(), "missing", 3);
        fs::remove_dir(missing.target()).unwrap();

        let mut report = RunReport::new("test");
        let counters = RetentionSweeper::new(Local::now())
            .sweep(&[empty, missing], &mut report)
            .unwrap();

        assert_eq!(counters, RetentionCounters::default());
        assert!(report.text().contains("does not exist, skipped"));
    }

    #[cfg(unix)]
    #[test]
    fn failed_deletion_aborts_with_accurate_counters() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let now = Local::now();
        let dir = directory(root.path(), "locked", 1);
        let target = dir.target();
        let stuck = file_aged(&target, "stuck", &now, Duration::days(4));
        fs::set_permissions(&target, fs::Permissions::from_mode(0o555)).unwrap();

        // root ignores directory permissions, nothing to assert there
        let probe = target.join(".probe");
        if File::create(&probe).is_ok() {
            let _ = fs::remove_file(&probe);
            fs::set_permissions(&target, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let mut report = RunReport::new("test");
        let mut sweeper = RetentionSweeper::new(now);
        let err = sweeper.sweep(&[dir], &mut report).unwrap_err();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755)).unwrap();

        assert!(matches!(err, SweepError::FileDeletionFailed { .. }));
        assert_eq!(sweeper.counters().deleted, 0);
        assert!(stuck.exists());
        assert!(report.text().contains("could not be removed"));
    }
}
