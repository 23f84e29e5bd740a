//! Delivery of the run report through the local mail relay.

use std::path::PathBuf;
use std::rc::Rc;

use derive_more::{Display, Error, From};

use crate::util::command::{CommandError, CommandRunner, ExternalCommand};

const DEFAULT_SENDMAIL: &str = "/usr/sbin/sendmail";

/// Plain-text mail carrying the run report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl MailMessage {
    /// RFC 5322 rendering with the headers `sendmail -t` reads recipients from.
    pub fn to_rfc5322(&self) -> String {
        let mut message = String::new();
        message.push_str(&format!("From: {}\n", self.from));
        message.push_str(&format!("To: {}\n", self.to.join(", ")));
        message.push_str(&format!("Subject: {}\n", self.subject));
        message.push_str("MIME-Version: 1.0\n");
        message.push_str("Content-Type: text/plain; charset=utf-8\n");
        message.push('\n');
        message.push_str(&self.body);
        if !message.ends_with('\n') {
            message.push('\n');
        }
        message
    }
}

#[derive(Debug, Display, Error, From)]
pub enum MailError {
    #[display("report has no recipients")]
    NoRecipients,
    #[from]
    #[display("handing the report to the mail relay failed: {_0}")]
    Relay(CommandError),
}

/// Something that can deliver a [MailMessage].
pub trait ReportDelivery {
    fn deliver(&self, message: &MailMessage) -> Result<(), MailError>;
}

/// Delivery by piping the message into `sendmail -t -i`.
pub struct Sendmail {
    program: PathBuf,
    commands: Rc<dyn CommandRunner>,
}

impl Sendmail {
    pub fn new(commands: Rc<dyn CommandRunner>) -> Self {
        Self::with_program(DEFAULT_SENDMAIL, commands)
    }

    pub fn with_program(program: impl Into<PathBuf>, commands: Rc<dyn CommandRunner>) -> Self {
        Self {
            program: program.into(),
            commands,
        }
    }
}

impl ReportDelivery for Sendmail {
    fn deliver(&self, message: &MailMessage) -> Result<(), MailError> {
        if message.to.is_empty() {
            return Err(MailError::NoRecipients);
        }

        let command = ExternalCommand::new(&self.program)
            .args(["-t", "-i", "-f"])
            .arg(&message.from)
            .stdin(message.to_rfc5322());

        self.commands.run(&command)?.check(&command)?;
        log::info!(target: "report::mail", "Report mailed to {}", message.to.join(", "));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::Write;

    use super::*;
    use crate::util::command::CommandOutput;

    #[derive(Default)]
    struct Recorder {
        seen: RefCell<Vec<ExternalCommand>>,
        fail: bool,
    }

    impl CommandRunner for Recorder {
        fn run(&self, command: &ExternalCommand) -> Result<CommandOutput, CommandError> {
            self.seen.borrow_mut().push(command.clone());
            Ok(CommandOutput {
                status: Some(if self.fail { 75 } else { 0 }),
                success: !self.fail,
                stdout: String::new(),
                stderr: if self.fail { "relay down".into() } else { String::new() },
            })
        }

        fn run_into(
            &self,
            command: &ExternalCommand,
            _sink: &mut dyn Write,
        ) -> Result<CommandOutput, CommandError> {
            self.run(command)
        }
    }

    fn message() -> MailMessage {
        MailMessage {
            from: "root".into(),
            to: vec!["ops@example.org".into(), "dba@example.org".into()],
            subject: "MySQL Backup Report - Mon October 19, 2026".into(),
            body: "report body".into(),
        }
    }

    #[test]
    fn renders_headers_and_body() {
        let text = message().to_rfc5322();
        assert!(text.starts_with("From: root\nTo: ops@example.org, dba@example.org\n"));
        assert!(text.contains("Subject: MySQL Backup Report - Mon October 19, 2026\n"));
        assert!(text.ends_with("\n\nreport body\n"));
    }

    #[test]
    fn pipes_message_into_sendmail() {
        let recorder = Rc::new(Recorder::default());
        let sendmail = Sendmail::with_program("/usr/sbin/sendmail", recorder.clone());

        sendmail.deliver(&message()).unwrap();

        let seen = recorder.seen.borrow();
        assert_eq!(seen.len(), 1);
        let args: Vec<_> = seen[0].get_args().collect();
        assert_eq!(args, vec!["-t", "-i", "-f", "root"]);
        let stdin = String::from_utf8(seen[0].get_stdin().unwrap().to_vec()).unwrap();
        assert!(stdin.contains("report body"));
    }

    #[test]
    fn relay_failure_is_reported() {
        let recorder = Rc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let err = Sendmail::new(recorder).deliver(&message()).unwrap_err();
        assert!(matches!(err, MailError::Relay(CommandError::Failed { .. })));
    }

    #[test]
    fn refuses_empty_recipient_list() {
        let recorder = Rc::new(Recorder::default());
        let mut msg = message();
        msg.to.clear();
        let err = Sendmail::new(recorder.clone()).deliver(&msg).unwrap_err();
        assert!(matches!(err, MailError::NoRecipients));
        assert!(recorder.seen.borrow().is_empty());
    }
}
