//! Sync progress reporting.
//!
//! Reports what `harvest sync` is doing while a pass runs: which connector
//! is fetching and how many records have been fetched and written so far.
//! Progress goes to **stderr** so the stdout summary stays parseable.

use std::io::Write;

/// A single progress event of one pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncProgressEvent {
    /// The connector is listing its source; totals are not known yet.
    Fetching { connector: String },
    /// A batch was flushed to the index store.
    Writing {
        connector: String,
        fetched: u64,
        written: u64,
    },
}

/// Receives progress events from the sync engine.
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress: "sync bugzilla:redhat  writing  1,200 written / 1,234 fetched".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Fetching { connector } => {
                format!("sync {}  fetching...\n", connector)
            }
            SyncProgressEvent::Writing {
                connector,
                fetched,
                written,
            } => format!(
                "sync {}  writing  {} written / {} fetched\n",
                connector,
                format_number(*written),
                format_number(*fetched)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Fetching { connector } => serde_json::json!({
                "event": "progress",
                "connector": connector,
                "phase": "fetching"
            }),
            SyncProgressEvent::Writing {
                connector,
                fetched,
                written,
            } => serde_json::json!({
                "event": "progress",
                "connector": connector,
                "phase": "writing",
                "fetched": fetched,
                "written": written
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Progress mode for the CLI.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_groups_thousands() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(12345), "12,345");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn tty_default_is_off_or_human() {
        assert_ne!(ProgressMode::default_for_tty(), ProgressMode::Json);
    }
}
