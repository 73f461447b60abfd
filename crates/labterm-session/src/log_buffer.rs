//! Bounded, duplicate-free console log buffer.
//!
//! Successive log fetches usually return overlapping windows of the same
//! console output. Lines are merged by their trimmed text: a device line is
//! appended only when no currently held line has the same key. Membership is
//! checked against the buffer contents, not a global history, so a line
//! evicted by capacity may show up again later.

use std::collections::{HashSet, VecDeque};

use crate::types::LogPayload;

/// Default number of lines retained.
pub const DEFAULT_CAPACITY: usize = 500;

/// Prefix of the synthetic line recorded for a user command.
pub const COMMAND_MARKER: &str = "> ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOrigin {
    Device,
    Command,
}

/// One retained console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub text: String,
    pub origin: LineOrigin,
}

impl LogLine {
    /// Dedup identity of the line.
    pub fn key(&self) -> &str {
        &self.text
    }
}

#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<LogLine>,
    device_keys: HashSet<String>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            device_keys: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Merge a fetched payload. Returns the lines that were actually added,
    /// in arrival order.
    pub fn merge(&mut self, payload: LogPayload) -> Vec<String> {
        self.merge_lines(payload.into_lines())
    }

    pub fn merge_lines<I, S>(&mut self, lines: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut appended = Vec::new();
        for raw in lines {
            let trimmed = raw.as_ref().trim();
            if trimmed.is_empty() || self.device_keys.contains(trimmed) {
                continue;
            }
            self.device_keys.insert(trimmed.to_string());
            self.lines.push_back(LogLine {
                text: trimmed.to_string(),
                origin: LineOrigin::Device,
            });
            appended.push(trimmed.to_string());
            self.evict_overflow();
        }
        appended
    }

    /// Record a user command as a synthetic `> command` line. Never
    /// deduplicated against device output or earlier commands.
    pub fn push_command(&mut self, command: &str) -> String {
        let text = format!("{COMMAND_MARKER}{}", command.trim());
        self.lines.push_back(LogLine {
            text: text.clone(),
            origin: LineOrigin::Command,
        });
        self.evict_overflow();
        text
    }

    pub fn contains(&self, line: &str) -> bool {
        self.device_keys.contains(line.trim())
    }

    pub fn lines(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter()
    }

    /// Snapshot of the retained text, oldest first.
    pub fn texts(&self) -> Vec<String> {
        self.lines.iter().map(|l| l.text.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.device_keys.clear();
    }

    fn evict_overflow(&mut self) {
        while self.lines.len() > self.capacity {
            if let Some(evicted) = self.lines.pop_front() {
                if evicted.origin == LineOrigin::Device {
                    self.device_keys.remove(evicted.key());
                }
            }
        }
    }
}
