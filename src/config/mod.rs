//! Backup configuration: directories, retention, mail settings and the
//! opaque per-job arguments.
//!
//! The file is JSON. Files ending in `.toml` are read with the same schema.

mod args;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use derive_more::{Display, Error};

pub use args::ModuleArgs;

const DEFAULT_RETENTION_DAYS: u32 = 3;
const DEFAULT_MAIL_ACCOUNT: &str = "root";

#[derive(Debug, Display, Error)]
/// Errors while loading or validating the configuration.
pub enum ConfigError {
    /// The configuration file does not exist.
    #[display("configuration file not found: {}", _0.display())]
    NotFound(#[error(ignore)] PathBuf),
    /// The configuration file exists but can't be read.
    #[display("reading the configuration file {} failed: {source}", path.display())]
    Unreadable { path: PathBuf, source: io::Error },
    /// The content is not valid structured data.
    #[display("configuration file {} is malformed: {reason}", path.display())]
    Malformed {
        path: PathBuf,
        #[error(ignore)]
        reason: String,
    },
    /// A backup directory entry has no (or an empty) `path`.
    #[display("backup directory #{_0} has no path")]
    MissingPath(#[error(ignore)] usize),
    /// `retention_days` is not a non-negative integer.
    #[display("backup directory #{index} has an invalid retention_days: {value}")]
    InvalidRetention {
        index: usize,
        #[error(ignore)]
        value: String,
    },
    /// Zero or several directories have `type = "local"`.
    #[display("exactly one backup directory must be of type 'local', found {_0}")]
    NoLocalDirectoryConfigured(#[error(ignore)] usize),
    /// A remote directory resolves to the local directory.
    #[display("backup directory #{index} points at the local directory {}", target.display())]
    RemoteIsLocal {
        #[error(ignore)]
        index: usize,
        #[error(ignore)]
        target: PathBuf,
    },
}

/// Role of a backup directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Staging area the job writes its archive into.
    Local,
    /// Destination receiving a copy of the archive.
    Remote,
}

impl Role {
    fn from_type(kind: Option<&str>) -> Self {
        match kind {
            Some(kind) if kind.trim().eq_ignore_ascii_case("local") => Role::Local,
            _ => Role::Remote,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Local => f.write_str("local"),
            Role::Remote => f.write_str("remote"),
        }
    }
}

/// One configured backup location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupDirectory {
    pub label: Option<String>,
    /// Sub directory below [path](Self::path) holding the backups.
    pub directory: Option<String>,
    /// Base path, always ending with exactly one separator.
    pub path: String,
    pub role: Role,
    pub retention_days: u32,
}

impl BackupDirectory {
    /// Directory that is swept and receives archives.
    pub fn target(&self) -> PathBuf {
        match self.directory.as_deref().or(self.label.as_deref()) {
            Some(sub) if !sub.is_empty() => Path::new(&self.path).join(sub),
            _ => PathBuf::from(&self.path),
        }
    }

    /// Human readable name used in the report.
    pub fn name(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| self.target().display().to_string())
    }

    pub fn is_local(&self) -> bool {
        self.role == Role::Local
    }
}

/// Appends exactly one trailing separator, collapsing any existing ones.
pub fn normalize_dir_path(path: &str) -> String {
    let trimmed = path.trim_end_matches(['/', MAIN_SEPARATOR]);
    format!("{trimmed}{MAIN_SEPARATOR}")
}

/// Mail recipients given either as a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(untagged)]
pub enum Recipients {
    One(String),
    Many(Vec<String>),
}

impl Default for Recipients {
    fn default() -> Self {
        Recipients::One(DEFAULT_MAIL_ACCOUNT.to_string())
    }
}

impl Recipients {
    /// Flattened list, splitting comma separated strings.
    pub fn to_vec(&self) -> Vec<String> {
        let split = |s: &str| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect::<Vec<_>>()
        };
        match self {
            Recipients::One(s) => split(s),
            Recipients::Many(list) => list.iter().flat_map(|s| split(s)).collect(),
        }
    }
}

/// Validated, normalized backup configuration. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub directories: Vec<BackupDirectory>,
    pub mail_sender: String,
    pub mail_recipients: Recipients,
    pub module_args: ModuleArgs,
}

#[derive(Debug, serde::Deserialize)]
struct RawConfig {
    #[serde(default)]
    backup_directories: Vec<RawDirectory>,
    #[serde(default = "default_mail_sender")]
    mail_sender: String,
    #[serde(default)]
    mail_recipients: Recipients,
    #[serde(default)]
    module_args: ModuleArgs,
}

fn default_mail_sender() -> String {
    DEFAULT_MAIL_ACCOUNT.to_string()
}

#[derive(Debug, serde::Deserialize)]
struct RawDirectory {
    directory: Option<String>,
    path: Option<String>,
    label: Option<String>,
    retention_days: Option<RawRetention>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
enum RawRetention {
    Number(i64),
    Text(String),
}

impl RawRetention {
    fn days(&self, index: usize) -> Result<u32, ConfigError> {
        let invalid = |value: String| ConfigError::InvalidRetention { index, value };
        match self {
            RawRetention::Number(n) => u32::try_from(*n).map_err(|_| invalid(n.to_string())),
            RawRetention::Text(s) => s.trim().parse().map_err(|_| invalid(s.clone())),
        }
    }
}

impl BackupConfig {
    /// Reads, parses and validates the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let raw: RawConfig = if is_toml {
            toml::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        }
        .map_err(|reason| ConfigError::Malformed {
            path: path.to_path_buf(),
            reason,
        })?;

        log::debug!(target: "config", "Loaded {}", path.display());
        Self::from_raw(raw)
    }

    /// Parses configuration from a JSON string.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let raw = serde_json::from_str(content).map_err(|e| ConfigError::Malformed {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let directories = raw
            .backup_directories
            .into_iter()
            .enumerate()
            .map(|(index, dir)| {
                let path = dir
                    .path
                    .filter(|p| !p.trim().is_empty())
                    .ok_or(ConfigError::MissingPath(index))?;
                let retention_days = dir
                    .retention_days
                    .map(|r| r.days(index))
                    .transpose()?
                    .unwrap_or(DEFAULT_RETENTION_DAYS);

                Ok(BackupDirectory {
                    label: dir.label,
                    directory: dir.directory,
                    path: normalize_dir_path(&path),
                    role: Role::from_type(dir.kind.as_deref()),
                    retention_days,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let config = Self {
            directories,
            mail_sender: raw.mail_sender,
            mail_recipients: raw.mail_recipients,
            module_args: raw.module_args,
        };
        let local_target = config.local_directory()?.target();
        if let Some(index) = config
            .directories
            .iter()
            .position(|d| !d.is_local() && d.target() == local_target)
        {
            return Err(ConfigError::RemoteIsLocal {
                index,
                target: local_target,
            });
        }

        Ok(config)
    }

    /// The single directory with role [Role::Local].
    pub fn local_directory(&self) -> Result<&BackupDirectory, ConfigError> {
        let mut locals = self.directories.iter().filter(|d| d.is_local());
        match (locals.next(), locals.count()) {
            (Some(local), 0) => Ok(local),
            (None, _) => Err(ConfigError::NoLocalDirectoryConfigured(0)),
            (Some(_), more) => Err(ConfigError::NoLocalDirectoryConfigured(more + 1)),
        }
    }

    /// All directories except the local one, in configuration order.
    pub fn remote_directories(&self) -> impl Iterator<Item = &BackupDirectory> {
        self.directories.iter().filter(|d| !d.is_local())
    }
}
