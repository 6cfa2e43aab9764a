//! Append-only human-readable event log (`loading_ui_log.txt`), mirrored in
//! a bounded in-memory tail. Diagnostic only: file errors are swallowed.

use chrono::Local;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

const TAIL_LINES: usize = 200;

pub struct UiLog {
    path: PathBuf,
    tail: Mutex<Vec<String>>,
}

impl UiLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tail: Mutex::new(Vec::new()),
        }
    }

    /// Append a timestamped line to the file and the in-memory tail.
    pub fn append(&self, line: &str) {
        let stamped = format!("{}  {line}", Local::now().format("%F %T%.3f"));

        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            let _ = writeln!(file, "{stamped}");
        }

        let mut tail = self.tail.lock();
        tail.push(stamped);
        if tail.len() > TAIL_LINES {
            let excess = tail.len() - TAIL_LINES;
            tail.drain(..excess);
        }
    }

    /// Most recent lines, oldest first.
    pub fn tail(&self) -> Vec<String> {
        self.tail.lock().clone()
    }

    pub fn clear(&self) {
        self.tail.lock().clear();
        let _ = std::fs::write(&self.path, b"");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_timestamped_lines_to_file_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loading_ui_log.txt");
        let log = UiLog::new(&path);

        log.append("App started");
        log.append("Registered scene scene01");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.lines().next().unwrap().ends_with("App started"));

        let tail = log.tail();
        assert_eq!(tail.len(), 2);
        assert!(tail[1].contains("scene01"));
    }

    #[test]
    fn tail_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let log = UiLog::new(dir.path().join("log.txt"));
        for i in 0..TAIL_LINES + 50 {
            log.append(&format!("line {i}"));
        }
        let tail = log.tail();
        assert_eq!(tail.len(), TAIL_LINES);
        assert!(tail[0].ends_with("line 50"));
    }
}
