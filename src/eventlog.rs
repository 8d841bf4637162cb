//! Event-log sink.
//!
//! The accounting database consuming dispense/denial rows is an external
//! collaborator behind [`EventSink`]; the daemon itself owns the local
//! fallback log, a line-per-event file that survives database outages and is
//! what the operators grep first.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;

/// Where dispense and denial events go.
pub trait EventSink: Send + Sync {
    fn log_event(&self, kind: &str, msg: &str);
}

/// Appends `timestamp|KIND|msg` lines to the configured fail log.
#[derive(Debug)]
pub struct FileEventLog {
    file: Mutex<File>,
}

impl FileEventLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl EventSink for FileEventLog {
    fn log_event(&self, kind: &str, msg: &str) {
        let line = format!(
            "{}|{kind}|{msg}\n",
            Local::now().format("%Y-%m-%dT%H:%M:%S%.3f")
        );
        let mut file = self.file.lock().expect("event log mutex poisoned");
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|()| file.flush()) {
            log::error!("failed to write event {kind} {msg}: {e}");
        }
    }
}
