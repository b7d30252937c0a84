//! Raw and normalized MIDI event records.
//!
//! Wire names (`type`, `control`, `cc_name`, `long`, `data`, and the kind
//! strings such as `pitchwheel`) match the feed format that browser clients
//! already consume, so field names on the Rust side and keys on the wire
//! differ in a few places.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Kind-specific extras carried alongside a raw message.
pub type Payload = BTreeMap<String, Value>;

/// Timestamp layout on the wire: local time, millisecond precision, no offset.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Closed set of message kinds the device transport can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "note_on")]
    NoteOn,
    #[serde(rename = "note_off")]
    NoteOff,
    #[serde(rename = "control_change")]
    ControlChange,
    #[serde(rename = "pitchwheel")]
    PitchBend,
    #[serde(rename = "aftertouch")]
    ChannelPressure,
    #[serde(rename = "polytouch")]
    KeyPressure,
    #[serde(rename = "program_change")]
    ProgramChange,
    #[serde(rename = "sysex")]
    SystemExclusive,
    #[serde(rename = "start")]
    TransportStart,
    #[serde(rename = "stop")]
    TransportStop,
    #[serde(rename = "continue")]
    TransportContinue,
    #[serde(rename = "songpos")]
    SongPosition,
    #[serde(rename = "song_select")]
    SongSelect,
    #[serde(rename = "clock")]
    Clock,
    #[serde(rename = "other")]
    Other,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::NoteOn => "note_on",
            MessageKind::NoteOff => "note_off",
            MessageKind::ControlChange => "control_change",
            MessageKind::PitchBend => "pitchwheel",
            MessageKind::ChannelPressure => "aftertouch",
            MessageKind::KeyPressure => "polytouch",
            MessageKind::ProgramChange => "program_change",
            MessageKind::SystemExclusive => "sysex",
            MessageKind::TransportStart => "start",
            MessageKind::TransportStop => "stop",
            MessageKind::TransportContinue => "continue",
            MessageKind::SongPosition => "songpos",
            MessageKind::SongSelect => "song_select",
            MessageKind::Clock => "clock",
            MessageKind::Other => "other",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed device message, stamped at arrival.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessageEvent {
    pub timestamp: DateTime<Local>,
    pub kind: MessageKind,
    pub channel: Option<u8>,
    pub note: Option<u8>,
    pub velocity: Option<u8>,
    pub controller: Option<u8>,
    pub value: Option<i32>,
    pub payload: Option<Payload>,
}

impl RawMessageEvent {
    pub fn new(timestamp: DateTime<Local>, kind: MessageKind) -> Self {
        Self {
            timestamp,
            kind,
            channel: None,
            note: None,
            velocity: None,
            controller: None,
            value: None,
            payload: None,
        }
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_note(mut self, note: u8) -> Self {
        self.note = Some(note);
        self
    }

    pub fn with_velocity(mut self, velocity: u8) -> Self {
        self.velocity = Some(velocity);
        self
    }

    pub fn with_controller(mut self, controller: u8) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_value(mut self, value: i32) -> Self {
        self.value = Some(value);
        self
    }

    /// Add one payload entry, creating the map on first use.
    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload
            .get_or_insert_with(Payload::new)
            .insert(key.to_string(), value.into());
        self
    }

    /// Whether this message ends a sounding note.
    pub fn is_release(&self) -> bool {
        match self.kind {
            MessageKind::NoteOff => true,
            MessageKind::NoteOn => self.velocity == Some(0),
            _ => false,
        }
    }
}

/// Press or release transition of a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    Down,
    Up,
}

/// Normalizer output. Serializes with every absent field omitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedEvent {
    #[serde(rename = "t", serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Local>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velocity: Option<u8>,
    #[serde(rename = "control", skip_serializing_if = "Option::is_none")]
    pub controller: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge: Option<Edge>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sustain: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pitch: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<i64>,
    #[serde(rename = "cc_name", skip_serializing_if = "Option::is_none")]
    pub controller_name: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub down_velocity: Option<u8>,
    #[serde(rename = "long", skip_serializing_if = "Option::is_none")]
    pub is_long_hold: Option<bool>,
    #[serde(rename = "data", skip_serializing_if = "is_absent_payload")]
    pub payload: Option<Payload>,
}

impl UnifiedEvent {
    /// Compact JSON object for logs, captures and the live feed.
    pub fn to_record(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => compact(map),
            // A struct always serializes to an object
            _ => Map::new(),
        }
    }

    /// Wire-format timestamp string.
    pub fn timestamp_string(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Local>, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(&ts.format(TIMESTAMP_FORMAT))
}

fn is_absent_payload(payload: &Option<Payload>) -> bool {
    payload.as_ref().map_or(true, |p| p.is_empty())
}

/// Drop keys whose value is null, an empty object, or an empty array.
pub fn compact(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .filter(|(_, v)| match v {
            Value::Null => false,
            Value::Object(o) => !o.is_empty(),
            Value::Array(a) => !a.is_empty(),
            _ => true,
        })
        .collect()
}

/// Severity of a status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Error,
}

/// Out-of-band notice about the producer, e.g. a lost device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename = "status")]
pub struct StatusRecord {
    pub level: StatusLevel,
    pub message: String,
}

impl StatusRecord {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Error,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: StatusLevel::Info,
            message: message.into(),
        }
    }
}

/// A record on the live feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FeedRecord {
    Event(UnifiedEvent),
    Status(StatusRecord),
}

impl From<UnifiedEvent> for FeedRecord {
    fn from(event: UnifiedEvent) -> Self {
        FeedRecord::Event(event)
    }
}

impl From<StatusRecord> for FeedRecord {
    fn from(status: StatusRecord) -> Self {
        FeedRecord::Status(status)
    }
}
