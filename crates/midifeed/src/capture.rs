//! NDJSON capture of a listening session.
//!
//! One file per session, `<dir>/<prefix>_<YYYYmmdd_HHMMSS>.jsonl`, one
//! compacted event record per line with a 1-based `i` and the milliseconds
//! since the previous captured record as `dt_ms`.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde_json::Value;
use tracing::debug;

use crate::event::RawMessageEvent;
use crate::normalize::{is_useful, NormalizeOptions, Normalizer};

/// File-name timestamp shared by capture and check logs.
pub const FILE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// `<dir>/<stem>_<stamp><ext>`, creating `dir` if needed.
pub fn stamped_path(dir: &Path, stem: &str, ext: &str, now: DateTime<Local>) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    Ok(dir.join(format!("{}_{}{}", stem, now.format(FILE_STAMP_FORMAT), ext)))
}

/// Writes captured events to a session file.
pub struct CaptureWriter {
    path: PathBuf,
    out: BufWriter<File>,
    normalizer: Normalizer,
    options: NormalizeOptions,
    capture_all: bool,
    count: u64,
    last_timestamp: Option<DateTime<Local>>,
}

impl CaptureWriter {
    /// Open a new capture file under `dir`.
    pub fn create(dir: &Path, prefix: &str, hold_threshold_s: f64, capture_all: bool) -> Result<Self> {
        let prefix = match prefix.trim() {
            "" => "midi_capture",
            p => p,
        };
        let path = stamped_path(dir, prefix, ".jsonl", Local::now())?;
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open capture file {}", path.display()))?;

        Ok(Self {
            path,
            out: BufWriter::new(file),
            normalizer: Normalizer::new(),
            options: NormalizeOptions::capture(hold_threshold_s),
            capture_all,
            count: 0,
            last_timestamp: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn captures_all(&self) -> bool {
        self.capture_all
    }

    /// Capture one raw message. Returns false if it was filtered out.
    pub fn write_event(&mut self, raw: &RawMessageEvent) -> Result<bool> {
        if !self.capture_all && !is_useful(raw.kind) {
            return Ok(false);
        }

        let dt_ms = self
            .last_timestamp
            .map(|last| (raw.timestamp - last).num_milliseconds());
        self.last_timestamp = Some(raw.timestamp);

        let event = self.normalizer.normalize(raw, self.options);
        let mut record = event.to_record();
        record.insert("i".to_string(), Value::from(self.count + 1));
        if let Some(dt) = dt_ms {
            record.insert("dt_ms".to_string(), Value::from(dt));
        }

        serde_json::to_writer(&mut self.out, &record)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;

        self.count += 1;
        debug!(i = self.count, kind = %raw.kind, "captured");
        Ok(true)
    }
}
