//! Per-connection wire trace files.
//!
//! Every line crossing a channel can be appended to a trace file together with
//! its direction and a UTC timestamp:
//!
//! ```text
//! [2026-02-04T10:15:30.123Z] OUT: {"kind":"user_message","id":"…","payload":{"content":"hi"}}
//! ```

use chrono::{SecondsFormat, Utc};
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

/// Cloneable handle to an optional append-only trace file.
///
/// A disabled handle accepts lines and drops them.
#[derive(Debug, Clone, Default)]
pub struct TraceLog {
    file: Arc<Mutex<Option<File>>>,
}

impl TraceLog {
    /// A handle that records nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Open `{dir}/{name}.log` for appending, creating `dir` if needed.
    ///
    /// With no directory, or when the file cannot be opened, the handle is
    /// disabled and a warning is logged.
    pub fn open(dir: Option<&Path>, name: &str) -> Self {
        let Some(dir) = dir else {
            return Self::disabled();
        };

        if let Err(e) = std::fs::create_dir_all(dir) {
            log::warn!("Failed to create trace directory {}: {}", dir.display(), e);
            return Self::disabled();
        }

        let path = dir.join(format!("{name}.log"));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                log::debug!("Tracing wire lines to {}", path.display());
                Self {
                    file: Arc::new(Mutex::new(Some(file))),
                }
            }
            Err(e) => {
                log::warn!("Failed to open trace file {}: {}", path.display(), e);
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.file
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Append one line. `direction` is a short tag such as `IN`, `OUT` or `ERR`.
    pub fn line(&self, direction: &str, data: &str) {
        let Ok(mut guard) = self.file.lock() else {
            return;
        };
        if let Some(ref mut file) = *guard {
            let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            let _ = writeln!(file, "[{}] {}: {}", timestamp, direction, data.trim_end());
        }
    }

    /// Stop recording and release the file.
    pub fn close(&self) {
        if let Ok(mut guard) = self.file.lock() {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_handle_ignores_lines() {
        let trace = TraceLog::disabled();
        assert!(!trace.is_enabled());
        trace.line("IN", "ignored");
    }

    #[test]
    fn open_without_dir_is_disabled() {
        assert!(!TraceLog::open(None, "conn").is_enabled());
    }

    #[test]
    fn writes_timestamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let trace_dir = dir.path().join("traces");
        let trace = TraceLog::open(Some(&trace_dir), "conn-1");
        assert!(trace.is_enabled());

        trace.line("OUT", "{\"kind\":\"command\"}\n");
        trace.line("ERR", "warning: something");

        let contents = std::fs::read_to_string(trace_dir.join("conn-1.log")).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] OUT: {\"kind\":\"command\"}"));
        assert!(lines[1].ends_with("] ERR: warning: something"));
    }

    #[test]
    fn clones_share_the_file_and_close_stops_writes() {
        let dir = tempfile::tempdir().unwrap();
        let trace = TraceLog::open(Some(dir.path()), "shared");
        let clone = trace.clone();
        clone.line("IN", "one");
        trace.close();
        clone.line("IN", "two");
        assert!(!clone.is_enabled());

        let contents = std::fs::read_to_string(dir.path().join("shared.log")).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }
}
