use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Backup job to run: gitlab, postgres, mysql (or mariadb), jenkins.
    #[arg(long, short = 'b')]
    pub backup: String,

    /// Backup configuration file (JSON, or TOML with a `.toml` extension).
    #[arg(long, short = 'c')]
    pub config: PathBuf,

    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Directory of the persisted run reports.
    #[arg(long, default_value = "/var/log/nimbus")]
    pub log_dir: PathBuf,

    /// Directory of the per-job lock files.
    #[arg(long, default_value = "/run/lock")]
    pub lock_dir: PathBuf,

    /// Mail relay the report is piped into.
    #[arg(long, default_value = "/usr/sbin/sendmail")]
    pub sendmail: PathBuf,

    /// Don't mail the run report.
    #[arg(long)]
    pub no_mail: bool,

    /// Name written into the completion line of the report.
    #[arg(long, env = "USER", default_value = "root")]
    pub operator: String,
}
