//! Per-job accounting of remote calls.
//!
//! Three counter shapes are kept for the lifetime of one job:
//!
//! - a dense call-count table indexed by `num - SyscallNumber::MIN`
//! - deduplicated error text with repeat counts, in first-seen order
//! - per-file I/O counters keyed by the name the file was opened under
//!
//! Formatting and publishing are left to the caller; [`JobReport::summary`]
//! produces a serializable snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rsc_proto::SyscallNumber;
use serde::Serialize;
use tracing::info;

/// One distinct error message and how often it occurred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub text: String,
    pub count: u64,
}

/// I/O counters for one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileIo {
    pub name: String,
    pub opens: u64,
    pub reads: u64,
    pub writes: u64,
    pub seeks: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Snapshot produced at job exit.
#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub total_calls: u64,
    pub calls: BTreeMap<&'static str, u64>,
    pub errors: Vec<ErrorRecord>,
    pub files: Vec<FileIo>,
}

/// Accumulator for one job. Owned by whoever serves the job's calls and
/// passed by `&mut`; nothing here is shared.
#[derive(Debug)]
pub struct JobReport {
    started: DateTime<Utc>,
    calls: Vec<u64>,
    errors: Vec<ErrorRecord>,
    files: Vec<FileIo>,
}

impl Default for JobReport {
    fn default() -> Self {
        Self::new()
    }
}

impl JobReport {
    pub fn new() -> Self {
        Self {
            started: Utc::now(),
            calls: vec![0; SyscallNumber::TABLE_SIZE],
            errors: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn record_call(&mut self, call: SyscallNumber) {
        if let Some(slot) = self.calls.get_mut(call.index()) {
            *slot += 1;
        }
    }

    /// Count a raw call number. Returns `false` if it is outside
    /// `[MIN, MAX]` and was not counted.
    pub fn record_call_number(&mut self, num: i32) -> bool {
        if !(SyscallNumber::MIN..=SyscallNumber::MAX).contains(&num) {
            return false;
        }
        let idx = (num - SyscallNumber::MIN) as usize;
        match self.calls.get_mut(idx) {
            Some(slot) => {
                *slot += 1;
                true
            }
            None => false,
        }
    }

    pub fn call_count(&self, call: SyscallNumber) -> u64 {
        self.calls.get(call.index()).copied().unwrap_or_default()
    }

    pub fn total_calls(&self) -> u64 {
        self.calls.iter().sum()
    }

    /// Record an error message; identical text bumps the existing count.
    pub fn record_error(&mut self, text: &str) {
        match self.errors.iter_mut().find(|e| e.text == text) {
            Some(existing) => existing.count += 1,
            None => self.errors.push(ErrorRecord {
                text: text.to_string(),
                count: 1,
            }),
        }
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    fn file_mut(&mut self, name: &str) -> Option<&mut FileIo> {
        if let Some(pos) = self.files.iter().position(|f| f.name == name) {
            return self.files.get_mut(pos);
        }
        self.files.push(FileIo {
            name: name.to_string(),
            ..FileIo::default()
        });
        self.files.last_mut()
    }

    pub fn file_opened(&mut self, name: &str) {
        if let Some(f) = self.file_mut(name) {
            f.opens += 1;
        }
    }

    pub fn file_read(&mut self, name: &str, bytes: u64) {
        if let Some(f) = self.file_mut(name) {
            f.reads += 1;
            f.read_bytes += bytes;
        }
    }

    pub fn file_written(&mut self, name: &str, bytes: u64) {
        if let Some(f) = self.file_mut(name) {
            f.writes += 1;
            f.write_bytes += bytes;
        }
    }

    pub fn file_seeked(&mut self, name: &str) {
        if let Some(f) = self.file_mut(name) {
            f.seeks += 1;
        }
    }

    pub fn file(&self, name: &str) -> Option<&FileIo> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn files(&self) -> &[FileIo] {
        &self.files
    }

    pub fn summary(&self) -> ReportSummary {
        let calls = SyscallNumber::ALL
            .iter()
            .filter_map(|&call| {
                let n = self.call_count(call);
                (n > 0).then_some((call.name(), n))
            })
            .collect();
        ReportSummary {
            started: self.started,
            finished: Utc::now(),
            total_calls: self.total_calls(),
            calls,
            errors: self.errors.clone(),
            files: self.files.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.summary())
    }

    /// Emit the summary through `tracing`.
    pub fn log_summary(&self) {
        let summary = self.summary();
        info!(total = summary.total_calls, "remote syscall summary");
        for (name, count) in &summary.calls {
            info!(call = name, count, "syscall count");
        }
        for e in &summary.errors {
            info!(text = %e.text, count = e.count, "job error");
        }
        for f in &summary.files {
            info!(
                file = %f.name,
                opens = f.opens,
                reads = f.reads,
                read_bytes = f.read_bytes,
                writes = f.writes,
                write_bytes = f.write_bytes,
                seeks = f.seeks,
                "file i/o"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_indexed_by_offset_from_min() {
        let mut r = JobReport::new();
        r.record_call(SyscallNumber::Open);
        r.record_call(SyscallNumber::Open);
        r.record_call(SyscallNumber::PutFile);
        assert!(r.record_call_number(SyscallNumber::MAX));

        assert_eq!(r.call_count(SyscallNumber::Open), 2);
        assert_eq!(r.call_count(SyscallNumber::PutFile), 1);
        assert_eq!(r.call_count(SyscallNumber::Utime), 1);
        assert_eq!(r.total_calls(), 4);
        assert_eq!(r.calls[0], 1, "MIN maps to slot 0");
    }

    #[test]
    fn out_of_range_numbers_not_counted() {
        let mut r = JobReport::new();
        assert!(!r.record_call_number(SyscallNumber::MIN - 1));
        assert!(!r.record_call_number(SyscallNumber::MAX + 1));
        assert_eq!(r.total_calls(), 0);
    }

    #[test]
    fn errors_deduplicated_in_insertion_order() {
        let mut r = JobReport::new();
        r.record_error("open /x: ENOENT");
        r.record_error("disk full");
        r.record_error("open /x: ENOENT");
        r.record_error("open /x: ENOENT");

        assert_eq!(
            r.errors(),
            &[
                ErrorRecord { text: "open /x: ENOENT".into(), count: 3 },
                ErrorRecord { text: "disk full".into(), count: 1 },
            ]
        );
    }

    #[test]
    fn file_counters_accumulate_per_name() {
        let mut r = JobReport::new();
        r.file_opened("data.in");
        r.file_read("data.in", 100);
        r.file_read("data.in", 28);
        r.file_seeked("data.in");
        r.file_opened("out.txt");
        r.file_written("out.txt", 5);

        let input = r.file("data.in").unwrap();
        assert_eq!(input.opens, 1);
        assert_eq!(input.reads, 2);
        assert_eq!(input.read_bytes, 128);
        assert_eq!(input.seeks, 1);
        assert_eq!(input.writes, 0);

        let out = r.file("out.txt").unwrap();
        assert_eq!(out.write_bytes, 5);
        assert_eq!(r.files().len(), 2);
        assert!(r.file("missing").is_none());
    }

    #[test]
    fn summary_lists_only_nonzero_calls() {
        let mut r = JobReport::new();
        r.record_call(SyscallNumber::Read);
        r.record_call(SyscallNumber::JobExit);
        r.record_error("boom");

        let s = r.summary();
        assert_eq!(s.total_calls, 2);
        assert_eq!(s.calls.len(), 2);
        assert_eq!(s.calls.get("read"), Some(&1));
        assert_eq!(s.calls.get("job_exit"), Some(&1));
        assert!(s.finished >= s.started);

        let json: serde_json::Value = serde_json::from_str(&r.to_json().unwrap()).unwrap();
        assert_eq!(json["total_calls"], 2);
        assert_eq!(json["errors"][0]["text"], "boom");
    }
}
