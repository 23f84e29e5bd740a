//! Backup of PostgreSQL databases using [Postgres].

use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::{DateTime, Local};

use super::archive::{dump_gz, Staging};
use super::{archive_name, JobError, JobResult, JobRunner};
use crate::config::ModuleArgs;
use crate::util::command::{CommandRunner, ExternalCommand};

/// Dumps every database of `db_list` with `pg_dump`, the roles with
/// `pg_dumpall --globals-only` and archives them with the server config.
pub struct Postgres {
    commands: Rc<dyn CommandRunner>,
}

impl Postgres {
    pub fn new(commands: Rc<dyn CommandRunner>) -> Self {
        Self { commands }
    }
}

struct PostgresArgs {
    version: String,
    pg_dump: PathBuf,
    pg_dumpall: PathBuf,
    user: String,
    password: String,
    host: String,
    port: u16,
    databases: Vec<String>,
    config_dir: Option<PathBuf>,
}

impl From<&ModuleArgs> for PostgresArgs {
    fn from(args: &ModuleArgs) -> Self {
        let version = args.str_or("pg_ver", "9.4");
        Self {
            pg_dump: args.path_or("pg_dump", format!("/usr/pgsql-{version}/bin/pg_dump")),
            pg_dumpall: args.path_or("pg_dumpall", format!("/usr/pgsql-{version}/bin/pg_dumpall")),
            user: args.str_or("pg_user", "postgres"),
            password: args.str_or("pg_password", ""),
            host: args.str_or("pg_host", "localhost"),
            port: args.port_or("pg_port", 5432),
            databases: args.list_or("db_list", &["postgres"]),
            config_dir: args.str("pg_config_dir").map(PathBuf::from),
            version,
        }
    }
}

impl PostgresArgs {
    /// The password never appears on the command line, only in `PGPASSWORD`.
    fn with_password(&self, command: ExternalCommand) -> ExternalCommand {
        if self.password.is_empty() {
            command
        } else {
            command.env("PGPASSWORD", &self.password)
        }
    }

    fn dump_command(&self, database: &str) -> ExternalCommand {
        self.with_password(
            ExternalCommand::new(&self.pg_dump)
                .arg("-h")
                .arg(&self.host)
                .arg("-p")
                .arg(self.port.to_string())
                .arg("-U")
                .arg(&self.user)
                .arg("-w")
                .arg(database),
        )
    }

    fn dumpall_command(&self) -> ExternalCommand {
        self.with_password(
            ExternalCommand::new(&self.pg_dumpall)
                .arg("-h")
                .arg(&self.host)
                .arg("-p")
                .arg(self.port.to_string())
                .arg("-U")
                .arg(&self.user)
                .arg("-w")
                .arg("--globals-only"),
        )
    }

    /// Data directory holding `pg_hba.conf` and `postgresql.conf`.
    fn config_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.config_dir {
            return Some(dir.clone());
        }
        [
            PathBuf::from(format!("/var/lib/pgsql/{}/data", self.version)),
            PathBuf::from("/var/lib/pgsql/data"),
        ]
        .into_iter()
        .find(|dir| dir.join("pg_hba.conf").is_file())
    }
}

impl JobRunner for Postgres {
    fn run(
        &self,
        local_dir: &Path,
        timestamp: &DateTime<Local>,
        args: &ModuleArgs,
    ) -> Result<JobResult, JobError> {
        let args = PostgresArgs::from(args);
        log::info!(
            target: "job::postgres",
            "Using pg_dump {} and pg_dumpall {}",
            args.pg_dump.display(),
            args.pg_dumpall.display()
        );

        let stamp = timestamp.format("%Y-%m-%d_%H-%M-%S").to_string();
        let staging = Staging::new("postgres")?;
        let commands = self.commands.as_ref();
        let mut job_log = String::new();

        for database in &args.databases {
            log::info!(target: "job::postgres", "Create database dump of {database}");
            job_log.push_str(&format!("Running {database} backup:\n"));

            let dump = staging.payload().join(format!("{database}-{stamp}.sql.gz"));
            let output = dump_gz(commands, &args.dump_command(database), &dump)?;
            job_log.push_str(&output.stderr);
            job_log.push('\n');
        }

        job_log.push_str("Running roles backup:\n");
        let roles = staging.payload().join(format!("pg_roles-{stamp}.sql.gz"));
        let output = dump_gz(commands, &args.dumpall_command(), &roles)?;
        job_log.push_str(&output.stderr);
        job_log.push('\n');

        match args.config_dir() {
            Some(dir) => {
                staging.stage_file(&dir.join("pg_hba.conf"), "pg_hba.conf")?;
                staging.stage_file(&dir.join("postgresql.conf"), "postgresql.conf")?;
            }
            None => {
                log::warn!(target: "job::postgres", "No PostgreSQL data directory found, archiving dumps only");
                job_log.push_str("WARNING: pg_hba.conf/postgresql.conf not found, not included in the archive\n");
            }
        }

        let archive_file_name = archive_name("postgres", timestamp);
        job_log.push_str(&staging.archive_into(commands, local_dir, &archive_file_name)?);
        log::info!(target: "job::postgres", "Finished database dump {archive_file_name}");

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
    fn binaries_default_to_versioned_paths() {
        let args = PostgresArgs::from(&args(json!({"pg_ver": "12"})));
        assert_eq!(args.pg_dump, PathBuf::from("/usr/pgsql-12/bin/pg_dump"));
        assert_eq!(args.pg_dumpall, PathBuf::from("/usr/pgsql-12/bin/pg_dumpall"));
        assert_eq!(args.databases, vec!["postgres"]);
    }

    #[test]
    fn password_is_passed_through_environment() {
        let args = PostgresArgs::from(&args(json!({"pg_password": "p@ss/w:rd", "pg_port": 5433})));
        let dump = args.dump_command("app");

        let cmd: Vec<String> = dump.get_args().collect();
        assert_eq!(
            cmd,
            vec!["-h", "localhost", "-p", "5433", "-U", "postgres", "-w", "app"]
        );
        assert_eq!(dump.get_env("PGPASSWORD"), Some("p@ss/w:rd"));
        assert!(!dump.to_string().contains("ss/w:rd"));
        assert_eq!(args.dumpall_command().get_env("PGPASSWORD"), Some("p@ss/w:rd"));
    }

    #[test]
    fn empty_password_sets_no_environment() {
        let args = PostgresArgs::from(&args(json!({})));
        assert_eq!(args.dump_command("postgres").get_env("PGPASSWORD"), None);
    }

    #[test]
    fn dumps_databases_roles_and_config() {
        let root = tempfile::tempdir().unwrap();
        let data = root.path().join("data");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("pg_hba.conf"), "local all all peer\n").unwrap();
        fs::write(data.join("postgresql.conf"), "port = 5432\n").unwrap();
        let local = root.path().join("local");
        fs::create_dir_all(&local).unwrap();

        let commands = Rc::new(FakeCommands::default());
        let ts = Local::now();
        let result = Postgres::new(commands.clone())
            .run(
                &local,
                &ts,
                &args(json!({
                    "pg_dump": "pg_dump",
                    "pg_dumpall": "pg_dumpall",
                    "db_list": ["app"],
                    "pg_config_dir": data,
                })),
            )
            .unwrap();

        assert_eq!(commands.programs(), vec!["pg_dump", "pg_dumpall", "tar"]);
        assert_eq!(result.archive_file_name, archive_name("postgres", &ts));
        assert!(local.join(&result.archive_file_name).is_file());
        assert!(result.job_log.contains("Running roles backup:"));
    }

    #[test]
    fn failing_dumpall_is_a_job_failure() {
        let local = tempfile::tempdir().unwrap();
        let commands = Rc::new(FakeCommands::failing("pg_dumpall"));

        let err = Postgres::new(commands)
            .run(
                local.path(),
                &Local::now(),
                &args(json!({"pg_dump": "pg_dump", "pg_dumpall": "pg_dumpall"})),
            )
            .unwrap_err();

        assert!(matches!(err, JobError::Command(_)));
        assert_eq!(fs::read_dir(local.path()).unwrap().count(), 0);
    }
}
