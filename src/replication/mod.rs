//! Copies the archive to every remote directory and lists what each
//! directory holds afterwards.

use std::fs::{self, File, FileTimes};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use derive_more::{Display, Error};

use crate::config::BackupDirectory;
use crate::report::RunReport;

#[derive(Debug, Display, Error)]
pub enum ReplicationError {
    /// The job's archive is not in the local directory.
    #[display("archive {} does not exist", _0.display())]
    ArchiveMissing(#[error(ignore)] PathBuf),
    /// A destination is the archive itself; copying would truncate it.
    #[display("destination {} is the local archive", _0.display())]
    DestinationIsSource(#[error(ignore)] PathBuf),
    /// Copying to a destination failed. Replication stops at this destination.
    #[display("copying {} to {} failed: {source}", archive.display(), destination.display())]
    CopyFailed {
        archive: PathBuf,
        destination: PathBuf,
        source: io::Error,
    },
}

/// Copies `local_dir/archive_name` into every non-local directory, keeping
/// its modification time so later retention sweeps age it correctly.
///
/// Returns the paths of the copies. Stops at the first failing destination.
pub fn replicate(
    archive_name: &str,
    local_dir: &Path,
    directories: &[BackupDirectory],
    report: &mut RunReport,
) -> Result<Vec<PathBuf>, ReplicationError> {
    let archive = local_dir.join(archive_name);
    if !archive.is_file() {
        report.line(format!("ERROR: {} does not exist", archive.display()));
        return Err(ReplicationError::ArchiveMissing(archive));
    }

    let mut copies = Vec::new();
    for directory in directories.iter().filter(|d| !d.is_local()) {
        let destination = directory.target().join(archive_name);
        if same_file(&archive, &destination) {
            report.line(format!(
                "ERROR: {} is the local directory, not copying onto the archive",
                directory.target().display()
            ));
            return Err(ReplicationError::DestinationIsSource(destination));
        }
        log::info!(target: "replication", "Copying {} to {}", archive.display(), destination.display());

        if let Err(source) = copy_preserving_mtime(&archive, &destination) {
            let _ = fs::remove_file(&destination);
            report.line(format!(
                "ERROR: copying {archive_name} to {} failed: {source}",
                directory.target().display()
            ));
            return Err(ReplicationError::CopyFailed {
                archive,
                destination,
                source,
            });
        }

        report.line(format!("{archive_name} copied to {}", directory.target().display()));
        copies.push(destination);
    }

    if copies.is_empty() {
        report.line("No remote directories configured, nothing replicated.");
    }
    Ok(copies)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn copy_preserving_mtime(source: &Path, destination: &Path) -> io::Result<()> {
    let metadata = fs::metadata(source)?;
    fs::copy(source, destination)?;

    let mut times = FileTimes::new().set_modified(metadata.modified()?);
    if let Ok(accessed) = metadata.accessed() {
        times = times.set_accessed(accessed);
    }
    File::options()
        .write(true)
        .open(destination)?
        .set_times(times)
}

/// One file of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Local>,
}

impl InventoryEntry {
    /// `name<TAB>size<TAB>modified` with a human readable size.
    pub fn render(&self) -> String {
        format!(
            "{}\t{}\t{}",
            self.name,
            human_size(self.size),
            self.modified.format("%b %d %H:%M")
        )
    }
}

/// Listing of one backup directory.
#[derive(Debug)]
pub struct DirectoryInventory {
    pub directory: PathBuf,
    pub entries: io::Result<Vec<InventoryEntry>>,
}

/// Lists the regular files of every directory, sorted by name. Read only.
pub fn inventory(directories: &[BackupDirectory]) -> Vec<DirectoryInventory> {
    directories
        .iter()
        .map(|directory| {
            let target = directory.target();
            let entries = list_files(&target);
            if let Err(e) = &entries {
                log::warn!(target: "replication", "Listing {} failed: {e}", target.display());
            }
            DirectoryInventory {
                directory: target,
                entries,
            }
        })
        .collect()
}

fn list_files(dir: &Path) -> io::Result<Vec<InventoryEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        entries.push(InventoryEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            size: metadata.len(),
            modified: metadata.modified()?.into(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Size in the style of `ls -h`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["K", "M", "G", "T", "P"];

    if bytes < 1024 {
        return bytes.to_string();
    }
    let mut size = bytes as f64;
    let mut unit = "";
    for next in UNITS {
        if size < 1024.0 {
            break;
        }
        size /= 1024.0;
        unit = next;
    }
    if size < 10.0 {
        format!("{size:.1}{unit}")
    } else {
        format!("{size:.0}{unit}")
    }
}
