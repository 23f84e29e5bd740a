//! The run report: an append-only text log delivered as the mail body.
//!
//! Every appended line is mirrored into the per-job log file (truncated at
//! run start) so partial progress survives an aborted run.

pub mod mail;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

pub use mail::{MailError, MailMessage, ReportDelivery, Sendmail};

const RULE: &str = "============================================================";

/// Date format used in the subject and completion line, e.g. `Mon October 19, 2026`.
pub const DISPLAY_DATE_FORMAT: &str = "%a %B %d, %Y";

/// `<JobName> Backup Report - <display date>`
pub fn subject_line(job_name: &str, timestamp: &DateTime<Local>) -> String {
    format!(
        "{job_name} Backup Report - {}",
        timestamp.format(DISPLAY_DATE_FORMAT)
    )
}

/// Location of the persisted run log of a job type.
pub fn log_file_path(log_dir: &Path, job_name: &str) -> PathBuf {
    log_dir.join(format!("{}_backup.log", job_name.to_lowercase()))
}

#[derive(Debug)]
pub struct RunReport {
    subject: String,
    text: String,
    sections: Vec<String>,
    open_section: bool,
    log_file: Option<(PathBuf, File)>,
}

impl RunReport {
    /// In-memory report starting with the subject header.
    pub fn new(subject: impl Into<String>) -> Self {
        let mut report = Self {
            subject: subject.into(),
            text: String::new(),
            sections: Vec::new(),
            open_section: false,
            log_file: None,
        };
        let header = format!("Subject: {}\n\n\n", report.subject);
        report.append(&header);
        report
    }

    /// Report mirrored into `path`, which is created (with parents) or truncated.
    pub fn with_log_file(subject: impl Into<String>, path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut report = Self::new(subject);
        file.write_all(report.text.as_bytes())?;
        report.log_file = Some((path.to_path_buf(), file));
        Ok(report)
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Full report text, subject header included.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Titles of the sections in the order they were opened.
    pub fn sections(&self) -> &[String] {
        &self.sections
    }

    /// Opens a titled section, closing a still open one.
    pub fn section(&mut self, title: &str) {
        self.close_section();
        self.sections.push(title.to_string());
        self.append(&format!("{title}:\n{RULE}\n"));
        self.open_section = true;
    }

    pub fn close_section(&mut self) {
        if self.open_section {
            self.open_section = false;
            self.append(&format!("{RULE}\n\n"));
        }
    }

    /// Appends one line; a trailing newline is added.
    pub fn line(&mut self, line: impl AsRef<str>) {
        let mut line = line.as_ref().trim_end_matches('\n').to_string();
        line.push('\n');
        self.append(&line);
    }

    /// Appends raw text verbatim (tool output), ensuring it ends with a newline.
    pub fn text_block(&mut self, block: &str) {
        if block.is_empty() {
            return;
        }
        self.append(block);
        if !block.ends_with('\n') {
            self.append("\n");
        }
    }

    pub fn blank(&mut self) {
        self.append("\n");
    }

    /// `Backup Script completed at <time> on <date> by <operator>.`
    pub fn complete(&mut self, completed_at: &DateTime<Local>, operator: &str) {
        self.close_section();
        self.sections.push("completion".to_string());
        self.line(format!(
            "Backup Script completed at {} on {} by {operator}.",
            completed_at.format("%H:%M:%S"),
            completed_at.format(DISPLAY_DATE_FORMAT),
        ));
    }

    /// Mail body: the report without its `Subject:` header.
    pub fn body(&self) -> &str {
        let header_len = format!("Subject: {}\n\n\n", self.subject).len();
        self.text.get(header_len..).unwrap_or(&self.text)
    }

    /// Flushes the mirrored log file.
    pub fn flush(&mut self) {
        if let Some((path, file)) = &mut self.log_file {
            if let Err(e) = file.flush() {
                log::warn!(target: "report", "Flushing run log {} failed: {e}", path.display());
            }
        }
    }

    fn append(&mut self, text: &str) {
        self.text.push_str(text);

        if let Some((path, file)) = &mut self.log_file {
            if let Err(e) = file.write_all(text.as_bytes()) {
                log::warn!(target: "report", "Writing run log {} failed, keeping report in memory only: {e}", path.display());
                self.log_file = None;
            }
        }
    }
}
