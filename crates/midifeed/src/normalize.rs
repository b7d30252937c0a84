//! Raw message → unified event.
//!
//! The normalizer is stateful: it remembers which notes are currently held
//! so that a release can report how long its note sounded. One instance
//! belongs to one producer; it is `Send` but deliberately not shared.

use std::collections::HashMap;

use chrono::{DateTime, Local};
use serde_json::Value;

use crate::event::{Edge, MessageKind, RawMessageEvent, UnifiedEvent};

/// Sustain pedal controller number.
pub const SUSTAIN_CONTROLLER: u8 = 64;

/// Pedal values at or above this are "down".
pub const SUSTAIN_ON_THRESHOLD: i32 = 64;

/// Message kinds worth keeping when clock chatter is filtered out.
const USEFUL_KINDS: &[MessageKind] = &[
    MessageKind::NoteOn,
    MessageKind::NoteOff,
    MessageKind::ControlChange,
    MessageKind::PitchBend,
    MessageKind::ChannelPressure,
    MessageKind::KeyPressure,
    MessageKind::ProgramChange,
    MessageKind::SystemExclusive,
    MessageKind::TransportStart,
    MessageKind::TransportStop,
    MessageKind::TransportContinue,
    MessageKind::SongPosition,
    MessageKind::SongSelect,
];

/// Whether a kind carries meaning, as opposed to timing-clock noise.
pub fn is_useful(kind: MessageKind) -> bool {
    USEFUL_KINDS.contains(&kind)
}

/// Well-known controller names.
pub fn controller_name(controller: u8) -> Option<&'static str> {
    match controller {
        1 => Some("mod_wheel"),
        2 => Some("breath"),
        4 => Some("foot_controller"),
        7 => Some("channel_volume"),
        10 => Some("pan"),
        11 => Some("expression"),
        64 => Some("sustain"),
        66 => Some("sostenuto"),
        67 => Some("soft_pedal"),
        _ => None,
    }
}

/// Per-call switches for [`Normalizer::normalize`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NormalizeOptions {
    /// When set, releases report whether the hold reached this many seconds.
    pub hold_threshold_s: Option<f64>,
    /// Keep the raw payload map on the output.
    pub include_payload: bool,
    /// Attach names for well-known controllers.
    pub include_controller_name: bool,
}

impl NormalizeOptions {
    /// Everything on: threshold, payload and controller names.
    pub fn capture(hold_threshold_s: f64) -> Self {
        Self {
            hold_threshold_s: Some(hold_threshold_s),
            include_payload: true,
            include_controller_name: true,
        }
    }
}

/// Identifies one sounding note per channel.
pub type HeldNoteKey = (Option<u8>, Option<u8>);

/// What was captured when a note went down.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeldNoteState {
    pub down_timestamp: DateTime<Local>,
    pub down_velocity: Option<u8>,
}

/// Stateful raw → unified converter.
#[derive(Debug, Default)]
pub struct Normalizer {
    held: HashMap<HeldNoteKey, HeldNoteState>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of notes currently held down.
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Forget every held note. Releases that arrive afterwards are unmatched.
    pub fn reset(&mut self) {
        self.held.clear();
    }

    /// Convert one raw message. Never fails: missing fields stay absent.
    pub fn normalize(&mut self, raw: &RawMessageEvent, options: NormalizeOptions) -> UnifiedEvent {
        let mut edge = None;
        let mut hold_ms = None;
        let mut is_long_hold = None;
        let mut down_velocity = None;
        let mut sustain = None;

        if raw.kind == MessageKind::ControlChange && raw.controller == Some(SUSTAIN_CONTROLLER) {
            sustain = Some(raw.value.unwrap_or(0) >= SUSTAIN_ON_THRESHOLD);
        }

        let key = (raw.channel, raw.note);
        if raw.kind == MessageKind::NoteOn && raw.velocity.unwrap_or(0) > 0 {
            // Re-trigger overwrites; no synthetic release
            self.held.insert(
                key,
                HeldNoteState {
                    down_timestamp: raw.timestamp,
                    down_velocity: raw.velocity,
                },
            );
            edge = Some(Edge::Down);
        } else if raw.is_release() {
            edge = Some(Edge::Up);
            if let Some(start) = self.held.remove(&key) {
                let elapsed_s = elapsed_seconds(start.down_timestamp, raw.timestamp);
                let held = (elapsed_s * 1000.0).round() as u64;
                hold_ms = Some(held);
                down_velocity = start.down_velocity;
                // Judged on the reported value so `long` never contradicts `hold_ms`
                is_long_hold = options.hold_threshold_s.map(|t| held as f64 / 1000.0 >= t);
            }
        }

        let controller_name = if options.include_controller_name
            && raw.kind == MessageKind::ControlChange
        {
            raw.controller.and_then(controller_name)
        } else {
            None
        };

        let lifted = |name: &str| {
            raw.payload
                .as_ref()
                .and_then(|p| p.get(name))
                .and_then(Value::as_i64)
        };

        UnifiedEvent {
            timestamp: raw.timestamp,
            kind: raw.kind,
            channel: raw.channel,
            note: raw.note,
            velocity: raw.velocity,
            controller: raw.controller,
            value: raw.value,
            edge,
            hold_ms,
            sustain,
            pitch: lifted("pitch"),
            program: lifted("program"),
            pressure: lifted("pressure"),
            controller_name,
            down_velocity,
            is_long_hold,
            payload: if options.include_payload {
                raw.payload.clone()
            } else {
                None
            },
        }
    }
}

/// Seconds between two stamps, clamped at zero if the clock stepped back.
fn elapsed_seconds(from: DateTime<Local>, to: DateTime<Local>) -> f64 {
    let delta = to.signed_duration_since(from);
    let micros = delta
        .num_microseconds()
        .unwrap_or_else(|| delta.num_milliseconds().saturating_mul(1000));
    (micros.max(0) as f64) / 1_000_000.0
}
