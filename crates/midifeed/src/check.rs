//! Human-readable console output for `listen`.
//!
//! Check mode prints one numbered line per key press and per resolved key
//! release, so a player can verify what the device reports. Without check
//! mode every raw message gets a plain one-liner.

use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;

use crate::capture::stamped_path;
use crate::event::{Edge, MessageKind, RawMessageEvent, UnifiedEvent};
use crate::normalize::{NormalizeOptions, Normalizer};

fn show<T: Display>(value: Option<T>) -> String {
    value.map_or_else(|| "None".to_string(), |v| v.to_string())
}

/// Check-mode line for a normalized event, if it is a press or a resolved
/// release. `seq` is the number the line will carry.
pub fn check_line(seq: u64, event: &UnifiedEvent) -> Option<String> {
    let note = event.note?;
    match event.edge? {
        Edge::Down if event.velocity.unwrap_or(0) > 0 => Some(format!(
            "{:02} down note={} velocity={} channel={} t={}",
            seq,
            note,
            show(event.velocity),
            show(event.channel),
            event.timestamp_string()
        )),
        Edge::Up => {
            let hold_ms = event.hold_ms?;
            Some(format!(
                "{:02} up note={} channel={} hold_ms={} long={} down_velocity={} t={}",
                seq,
                note,
                show(event.channel),
                hold_ms,
                if event.is_long_hold == Some(true) { 1 } else { 0 },
                show(event.down_velocity),
                event.timestamp_string()
            ))
        }
        Edge::Down => None,
    }
}

/// Plain one-liner for a raw message.
pub fn plain_line(raw: &RawMessageEvent) -> String {
    match raw.kind {
        MessageKind::NoteOn | MessageKind::NoteOff => format!(
            "{} note={} velocity={} channel={}",
            raw.kind,
            show(raw.note),
            show(raw.velocity),
            show(raw.channel)
        ),
        _ => format!(
            "{} channel={} value={}",
            raw.kind,
            show(raw.channel),
            show(raw.value)
        ),
    }
}

/// Numbered press/release log, echoed to stdout and a session file.
pub struct CheckLog {
    normalizer: Normalizer,
    hold_threshold_s: f64,
    count: u64,
    file: Option<(PathBuf, BufWriter<File>)>,
}

impl CheckLog {
    /// Check log without a backing file.
    pub fn new(hold_threshold_s: f64) -> Self {
        Self {
            normalizer: Normalizer::new(),
            hold_threshold_s,
            count: 0,
            file: None,
        }
    }

    /// Check log appending to `<dir>/midi_check_<stamp>.log`.
    pub fn create(dir: &Path, hold_threshold_s: f64) -> Result<Self> {
        let path = stamped_path(dir, "midi_check", ".log", Local::now())?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open check log {}", path.display()))?;

        let mut log = Self::new(hold_threshold_s);
        log.file = Some((path, BufWriter::new(file)));
        Ok(log)
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|(p, _)| p.as_path())
    }

    pub fn hold_threshold_s(&self) -> f64 {
        self.hold_threshold_s
    }

    /// Feed one raw message; returns the line written, if any.
    pub fn observe(&mut self, raw: &RawMessageEvent) -> Result<Option<String>> {
        let options = NormalizeOptions {
            hold_threshold_s: Some(self.hold_threshold_s),
            ..Default::default()
        };
        let event = self.normalizer.normalize(raw, options);
        let Some(line) = check_line(self.count + 1, &event) else {
            return Ok(None);
        };
        self.count += 1;

        if let Some((path, out)) = self.file.as_mut() {
            writeln!(out, "{}", line)
                .and_then(|_| out.flush())
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        Ok(Some(line))
    }
}
