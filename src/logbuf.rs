//! Bounded, thread-safe buffer of backend output lines

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Write;

/// Keeps the most recent `capacity` lines of a backend's output.
///
/// Every append and read takes the lock once, so readers always see a
/// whole-line prefix of what has been appended so far.
#[derive(Debug)]
pub struct LineBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LineBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Append one line, dropping the oldest when full.
    /// The stored line always ends with exactly one `\n`.
    pub fn append(&self, line: &str) {
        let mut line = line.trim_end_matches(['\r', '\n']).to_string();
        line.push('\n');

        let mut lines = self.lines.lock();
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Copy the whole buffer into `w`
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(self.snapshot().as_bytes())
    }

    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock();
        let mut out = String::with_capacity(lines.iter().map(String::len).sum());
        for line in lines.iter() {
            out.push_str(line);
        }
        out
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}
