//! Sync progress reporting.
//!
//! Reports observable progress during `dbgate sync` so users see which
//! connection is being probed, how many tables have been compared, and how
//! many dirty tables have been re-fetched. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for sync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncProgressEvent {
    /// Acquiring the pool and listing tables. Total unknown.
    Probing { connection: String },
    /// Row counts compared against watermarks for `n` of `total` tables.
    Comparing {
        connection: String,
        n: u64,
        total: u64,
    },
    /// `n` of `total` dirty tables re-fetched.
    Fetching {
        connection: String,
        n: u64,
        total: u64,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync warehouse  comparing  5 / 12 tables".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Probing { connection } => {
                format!("sync {}  probing...\n", connection)
            }
            SyncProgressEvent::Comparing {
                connection,
                n,
                total,
            } => format!(
                "sync {}  comparing  {} / {} tables\n",
                connection,
                format_number(*n),
                format_number(*total)
            ),
            SyncProgressEvent::Fetching {
                connection,
                n,
                total,
            } => format!(
                "sync {}  fetching  {} / {} dirty tables\n",
                connection,
                format_number(*n),
                format_number(*total)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Probing { connection } => serde_json::json!({
                "event": "progress",
                "connection": connection,
                "phase": "probing"
            }),
            SyncProgressEvent::Comparing {
                connection,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "connection": connection,
                "phase": "comparing",
                "n": n,
                "total": total
            }),
            SyncProgressEvent::Fetching {
                connection,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "connection": connection,
                "phase": "fetching",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
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
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
