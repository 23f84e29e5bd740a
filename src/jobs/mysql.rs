//! Backup of MySQL / MariaDB databases using [MySql].

use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::{DateTime, Local};

use super::archive::{dump_gz, first_existing, Staging};
use super::{archive_name, JobError, JobResult, JobRunner};
use crate::config::ModuleArgs;
use crate::util::command::{CommandRunner, ExternalCommand};

const CONFIG_CANDIDATES: [&str; 2] = ["/etc/my.cnf", "/etc/mysql/my.cnf"];

/// Dumps every database of `db_list` with `mysqldump` and archives the
/// compressed dumps together with `my.cnf`.
pub struct MySql {
    commands: Rc<dyn CommandRunner>,
}

impl MySql {
    pub fn new(commands: Rc<dyn CommandRunner>) -> Self {
        Self { commands }
    }
}

struct MySqlArgs {
    user: String,
    password: String,
    host: String,
    port: u16,
    databases: Vec<String>,
    mysqldump: PathBuf,
    config: Option<PathBuf>,
}

impl From<&ModuleArgs> for MySqlArgs {
    fn from(args: &ModuleArgs) -> Self {
        Self {
            user: args.str_or("mysql_user", "root"),
            password: args.str_or("mysql_password", ""),
            host: args.str_or("mysql_host", "localhost"),
            port: args.port_or("mysql_port", 3306),
            databases: args.list_or("db_list", &["mysql"]),
            mysqldump: args.path_or("mysqldump", "mysqldump"),
            config: args.str("mysql_config").map(PathBuf::from),
        }
    }
}

impl MySqlArgs {
    fn dump_command(&self, database: &str) -> ExternalCommand {
        ExternalCommand::new(&self.mysqldump)
            .arg("-h")
            .arg(&self.host)
            .arg("-P")
            .arg(self.port.to_string())
            .arg(format!("--user={}", self.user))
            .arg(format!("--password={}", self.password))
            .arg("--single-transaction")
            .arg(database)
    }

    fn config_file(&self) -> Option<PathBuf> {
        match &self.config {
            Some(config) => Some(config.clone()),
            None => {
                let candidates: Vec<PathBuf> = CONFIG_CANDIDATES.iter().map(PathBuf::from).collect();
                first_existing(&candidates).cloned()
            }
        }
    }
}

impl JobRunner for MySql {
    fn run(
        &self,
        local_dir: &Path,
        timestamp: &DateTime<Local>,
        args: &ModuleArgs,
    ) -> Result<JobResult, JobError> {
        let args = MySqlArgs::from(args);
        let stamp = timestamp.format("%Y-%m-%d_%H-%M-%S").to_string();
        let staging = Staging::new("mysql")?;
        let mut job_log = String::new();

        for database in &args.databases {
            log::info!(target: "job::mysql", "Create database dump of {database}");
            job_log.push_str(&format!("Running {database} backup...\n"));

            let dump = staging.payload().join(format!("{database}-{stamp}.sql.gz"));
            let output = dump_gz(self.commands.as_ref(), &args.dump_command(database), &dump)?;
            job_log.push_str(&output.stderr);
            job_log.push('\n');
        }

        match args.config_file() {
            Some(config) => staging.stage_file(&config, "my.cnf")?,
            None => {
                log::warn!(target: "job::mysql", "No my.cnf found, archiving dumps only");
                job_log.push_str("WARNING: my.cnf not found, not included in the archive\n");
            }
        }

        let archive_file_name = archive_name("mysql", timestamp);
        job_log.push_str(&staging.archive_into(self.commands.as_ref(), local_dir, &archive_file_name)?);
        log::info!(target: "job::mysql", "Finished database dump {archive_file_name}");

        Ok(JobResult {
            archive_file_name,
            job_log,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::*;
    use crate::jobs::testing::FakeCommands;

    fn args(value: serde_json::Value) -> ModuleArgs {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn dumps_each_database() {
        let root = tempfile::tempdir().unwrap();
        let config = root.path().join("my.cnf");
        fs::write(&config, "[mysqld]\n").unwrap();
        let commands = Rc::new(FakeCommands::default());
        let job = MySql::new(commands.clone());
        let ts = Local::now();

        let result = job
            .run(
                root.path(),
                &ts,
                &args(json!({
                    "db_list": ["app", "auth"],
                    "mysql_password": "secret",
                    "mysql_config": config,
                })),
            )
            .unwrap();

        assert_eq!(result.archive_file_name, archive_name("mysql", &ts));
        assert!(root.path().join(&result.archive_file_name).is_file());
        assert_eq!(
            commands.programs(),
            vec!["mysqldump", "mysqldump", "tar"]
        );
        let first: Vec<String> = commands.seen.borrow()[0].get_args().collect();
        assert!(first.contains(&"--password=secret".to_string()));
        assert_eq!(first.last().map(String::as_str), Some("app"));
        assert!(result.job_log.contains("Running auth backup..."));
    }

    #[test]
    fn same_timestamp_same_name() {
        let root = tempfile::tempdir().unwrap();
        let config = root.path().join("my.cnf");
        fs::write(&config, "[client]\n").unwrap();
        let ts = Local::now();

        let run = || {
            let local = tempfile::tempdir().unwrap();
            MySql::new(Rc::new(FakeCommands::default()))
                .run(local.path(), &ts, &args(json!({"mysql_config": config})))
                .unwrap()
                .archive_file_name
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn configured_but_missing_config_fails() {
        let local = tempfile::tempdir().unwrap();
        let err = MySql::new(Rc::new(FakeCommands::default()))
            .run(
                local.path(),
                &Local::now(),
                &args(json!({"mysql_config": "/nonexistent/my.cnf"})),
            )
            .unwrap_err();
        assert!(matches!(err, JobError::MissingInput(_)));
        assert_eq!(fs::read_dir(local.path()).unwrap().count(), 0);
    }

    #[test]
    fn failed_dump_aborts_without_archive() {
        let local = tempfile::tempdir().unwrap();
        let commands = Rc::new(FakeCommands::failing("mysqldump"));
        let job = MySql::new(commands.clone());

        let err = job.run(local.path(), &Local::now(), &args(json!({}))).unwrap_err();

        assert!(matches!(err, JobError::Command(_)));
        assert_eq!(fs::read_dir(local.path()).unwrap().count(), 0);
        assert!(!commands.programs().contains(&"tar".to_string()));
    }
}
