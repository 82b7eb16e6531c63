use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Append-only, timestamped, human-readable outage journal.
///
/// One line per event: `<RFC3339>: <message> [<k1>=<v1>+<k2>=<v2>]`.
/// Append failures are logged locally and never propagate.
pub struct OutageLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl OutageLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening outage log at {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn append(&self, message: &str, details: &[(&str, String)]) {
        let joined = details
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("+");
        let line = format!(
            "{}: {} [{}]\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            message,
            joined
        );

        let mut guard = self.file.lock().unwrap();
        match guard.as_mut() {
            Some(file) => {
                if let Err(err) = file.write_all(line.as_bytes()) {
                    tracing::error!(error=%err, path=%self.path.display(), "appending to outage log");
                }
            }
            None => {
                tracing::error!(path=%self.path.display(), "outage log already closed; dropping entry");
            }
        }
    }

    pub fn close(&self) {
        let mut guard = self.file.lock().unwrap();
        if let Some(file) = guard.take() {
            if let Err(err) = file.sync_all() {
                tracing::error!(error=%err, path=%self.path.display(), "closing outage log");
            }
        }
    }

    /// Close and remove the journal file.
    pub fn cleanup(&self) -> Result<()> {
        self.close();
        fs::remove_file(&self.path)
            .with_context(|| format!("removing outage log at {}", self.path.display()))
    }
}
