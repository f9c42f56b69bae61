use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Local;

/// Destination for the endpoint's human-readable diagnostics.
///
/// Every logged failure path produces exactly one line; the wording of
/// the line is not a compatibility contract.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Timestamped lines on stdout.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) {
        println!("[{}] {}", Local::now().format("%Y-%m-%d %H:%M:%S"), line);
    }
}

/// Appends timestamped lines to a log file.
#[derive(Debug)]
pub struct FileSink {
    log_file: PathBuf,
}

impl FileSink {
    pub fn new(log_file: impl Into<PathBuf>) -> Self {
        Self {
            log_file: log_file.into(),
        }
    }
}

impl LogSink for FileSink {
    fn write_line(&self, line: &str) {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
        {
            let _ = writeln!(
                file,
                "[{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                line
            );
        }
    }
}

/// Collects lines in memory; handy for inspecting diagnostics in tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}
