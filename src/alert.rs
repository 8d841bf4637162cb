//! Operator alerting for receive timeouts.
//!
//! The watchdog hands the alert hook the tail of the log file; the production
//! hook posts it to the configured mail gateway. Alert delivery must never
//! take the link worker down, so every failure is logged and swallowed.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use reqwest::blocking::Client;

const ALERT_SUBJECT: &str = "Kaffeemaschine receive timeout";
const ALERT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Receive-timeout alert hook.
pub trait Alerter: Send + Sync {
    fn alert_response_timeout(&self, log_tail: &str);
}

/// Posts the alert to a mail-gateway endpoint as JSON.
#[derive(Debug)]
pub struct HttpAlerter {
    client: Client,
    url: String,
}

impl HttpAlerter {
    pub fn new(url: String) -> Result<Self> {
        let client = Client::builder().timeout(ALERT_HTTP_TIMEOUT).build()?;
        Ok(Self { client, url })
    }
}

impl Alerter for HttpAlerter {
    fn alert_response_timeout(&self, log_tail: &str) {
        let body = format!("No data received on the MDB line.\n\nlog tail:\n{log_tail}");
        let payload = serde_json::json!({
            "subject": ALERT_SUBJECT,
            "body": body,
        });
        match self.client.post(&self.url).json(&payload).send() {
            Ok(response) if response.status().is_success() => {
                log::info!("sent receive-timeout alert");
            }
            Ok(response) => {
                log::error!("alert gateway returned {}", response.status());
            }
            Err(e) => {
                log::error!("failed to send receive-timeout alert: {e}");
            }
        }
    }
}

/// Fallback hook when no gateway is configured: the alert only hits the log.
#[derive(Debug)]
pub struct LogAlerter;

impl Alerter for LogAlerter {
    fn alert_response_timeout(&self, log_tail: &str) {
        log::error!("receive timeout on the MDB line; log tail:\n{log_tail}");
    }
}

/// Read the last `lines` lines of `path`. Best-effort: returns an empty
/// string when the file cannot be read.
pub fn read_log_tail(path: &Path, lines: usize) -> String {
    const CHUNK: u64 = 16 * 1024;
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(CHUNK);
    if file.seek(SeekFrom::Start(start)).is_err() {
        return String::new();
    }
    let mut buf = String::new();
    if file.read_to_string(&mut buf).is_err() {
        return String::new();
    }
    let tail: Vec<&str> = buf.lines().rev().take(lines).collect();
    tail.into_iter().rev().collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn tail_returns_last_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..25 {
            writeln!(file, "line {i}").unwrap();
        }
        let tail = read_log_tail(file.path(), 10);
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[0], "line 15");
        assert_eq!(lines[9], "line 24");
    }

    #[test]
    fn tail_of_missing_file_is_empty() {
        assert_eq!(read_log_tail(Path::new("/nonexistent/kaffi.log"), 10), "");
    }

    #[test]
    fn tail_of_short_file_is_whole_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "only line").unwrap();
        assert_eq!(read_log_tail(file.path(), 10), "only line");
    }
}
