//! Raw event source: MIDI input ports via midir.
//!
//! Messages are decoded on midir's callback thread, stamped with local wall
//! clock time, and forwarded into a tokio channel. midir has no disconnect
//! notification, so a watchdog polls the port list and reports
//! [`SourceError::Disconnected`] once the port disappears.

use std::any::Any;
use std::time::Duration;

use chrono::{DateTime, Local};
use midir::{Ignore, MidiInput};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::event::{MessageKind, RawMessageEvent};

/// How often the watchdog checks that the open port still exists.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

/// Device transport errors. All are recoverable by reopening.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to initialize MIDI: {0}")]
    Init(String),

    #[error("No MIDI input devices found")]
    NoDevices,

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Device disconnected: {0}")]
    Disconnected(String),
}

/// Information about a discovered MIDI input port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiPortInfo {
    /// Port index at enumeration time
    pub index: usize,
    /// Port name reported by the backend
    pub name: String,
}

impl std::fmt::Display for MidiPortInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.index, self.name)
    }
}

/// List available MIDI input ports
pub fn list_input_ports() -> Result<Vec<MidiPortInfo>, SourceError> {
    let midi_in = MidiInput::new("midifeed-scan").map_err(|e| SourceError::Init(e.to_string()))?;

    let ports = midi_in
        .ports()
        .iter()
        .enumerate()
        .filter_map(|(i, port)| {
            midi_in
                .port_name(port)
                .ok()
                .map(|name| MidiPortInfo { index: i, name })
        })
        .collect();

    Ok(ports)
}

/// Pick a port: the first whose name contains any keyword
/// (case-insensitive), falling back to the first port.
pub fn select_port(names: &[String], keywords: &[String]) -> Option<usize> {
    if names.is_empty() {
        return None;
    }
    let keywords: Vec<String> = keywords.iter().map(|k| k.to_uppercase()).collect();
    names
        .iter()
        .position(|name| {
            let upper = name.to_uppercase();
            keywords.iter().any(|k| !k.is_empty() && upper.contains(k.as_str()))
        })
        .or(Some(0))
}

/// Decode one MIDI message.
///
/// Never fails: anything unrecognized or truncated becomes
/// [`MessageKind::Other`] carrying its bytes. A note-on with velocity 0 is
/// kept as a note-on; the normalizer decides it is a release.
pub fn decode(data: &[u8], timestamp: DateTime<Local>) -> RawMessageEvent {
    let other = || {
        RawMessageEvent::new(timestamp, MessageKind::Other).with_extra("bytes", bytes_value(data))
    };

    let Some(&status) = data.first() else {
        return other();
    };
    let channel = status & 0x0F;

    match status & 0xF0 {
        0x80 if data.len() >= 3 => RawMessageEvent::new(timestamp, MessageKind::NoteOff)
            .with_channel(channel)
            .with_note(data[1])
            .with_velocity(data[2]),
        0x90 if data.len() >= 3 => RawMessageEvent::new(timestamp, MessageKind::NoteOn)
            .with_channel(channel)
            .with_note(data[1])
            .with_velocity(data[2]),
        0xA0 if data.len() >= 3 => RawMessageEvent::new(timestamp, MessageKind::KeyPressure)
            .with_channel(channel)
            .with_note(data[1])
            .with_value(data[2] as i32)
            .with_extra("pressure", data[2]),
        0xB0 if data.len() >= 3 => RawMessageEvent::new(timestamp, MessageKind::ControlChange)
            .with_channel(channel)
            .with_controller(data[1])
            .with_value(data[2] as i32),
        0xC0 if data.len() >= 2 => RawMessageEvent::new(timestamp, MessageKind::ProgramChange)
            .with_channel(channel)
            .with_extra("program", data[1]),
        0xD0 if data.len() >= 2 => RawMessageEvent::new(timestamp, MessageKind::ChannelPressure)
            .with_channel(channel)
            .with_value(data[1] as i32)
            .with_extra("pressure", data[1]),
        0xE0 if data.len() >= 3 => {
            // 14-bit, centered at 8192
            let raw = ((data[2] as i32) << 7) | data[1] as i32;
            RawMessageEvent::new(timestamp, MessageKind::PitchBend)
                .with_channel(channel)
                .with_extra("pitch", raw - 8192)
        }
        0xF0 => decode_system(data, timestamp).unwrap_or_else(other),
        _ => other(),
    }
}

fn decode_system(data: &[u8], timestamp: DateTime<Local>) -> Option<RawMessageEvent> {
    let event = match data[0] {
        0xF0 => {
            let body: Vec<u8> = data[1..]
                .iter()
                .copied()
                .take_while(|b| *b != 0xF7)
                .collect();
            RawMessageEvent::new(timestamp, MessageKind::SystemExclusive)
                .with_extra("data", bytes_value(&body))
        }
        0xF2 if data.len() >= 3 => {
            let pos = ((data[2] as i32) << 7) | data[1] as i32;
            RawMessageEvent::new(timestamp, MessageKind::SongPosition).with_extra("pos", pos)
        }
        0xF3 if data.len() >= 2 => {
            RawMessageEvent::new(timestamp, MessageKind::SongSelect).with_extra("song", data[1])
        }
        0xF8 => RawMessageEvent::new(timestamp, MessageKind::Clock),
        0xFA => RawMessageEvent::new(timestamp, MessageKind::TransportStart),
        0xFB => RawMessageEvent::new(timestamp, MessageKind::TransportContinue),
        0xFC => RawMessageEvent::new(timestamp, MessageKind::TransportStop),
        _ => return None,
    };
    Some(event)
}

fn bytes_value(bytes: &[u8]) -> Value {
    Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())
}

/// Items flowing out of an open source.
pub type SourceItem = Result<RawMessageEvent, SourceError>;

/// An open device: raw events until it fails or ends.
pub struct RawEventStream {
    name: String,
    rx: mpsc::UnboundedReceiver<SourceItem>,
    // Keeps the underlying connection open
    _guard: Option<Box<dyn Any + Send>>,
}

impl RawEventStream {
    /// Wrap a channel fed by some producer.
    pub fn from_channel(name: impl Into<String>, rx: mpsc::UnboundedReceiver<SourceItem>) -> Self {
        Self {
            name: name.into(),
            rx,
            _guard: None,
        }
    }

    /// A stream that yields the given items, then ends.
    pub fn from_items(name: impl Into<String>, items: Vec<SourceItem>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for item in items {
            let _ = tx.send(item);
        }
        Self::from_channel(name, rx)
    }

    fn with_guard(mut self, guard: Box<dyn Any + Send>) -> Self {
        self._guard = Some(guard);
        self
    }

    /// Name of the device this stream reads from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next item; `None` when the producer side has gone away.
    pub async fn next(&mut self) -> Option<SourceItem> {
        self.rx.recv().await
    }
}

/// Anything that can be (re)opened to produce raw events.
pub trait EventSource: Send {
    fn open(&mut self) -> Result<RawEventStream, SourceError>;
}

/// Hardware MIDI input selected by name keywords.
pub struct MidiSource {
    keywords: Vec<String>,
}

impl MidiSource {
    pub fn new(keywords: Vec<String>) -> Self {
        Self { keywords }
    }
}

struct MidiGuard {
    connection: Option<midir::MidiInputConnection<()>>,
    watchdog: tokio::task::JoinHandle<()>,
    port_name: String,
}

impl Drop for MidiGuard {
    fn drop(&mut self) {
        self.watchdog.abort();
        if let Some(conn) = self.connection.take() {
            conn.close();
            info!("Closed MIDI input: {}", self.port_name);
        }
    }
}

impl EventSource for MidiSource {
    /// Must be called from within a tokio runtime (spawns the watchdog).
    fn open(&mut self) -> Result<RawEventStream, SourceError> {
        let mut midi_in =
            MidiInput::new("midifeed-in").map_err(|e| SourceError::Init(e.to_string()))?;
        midi_in.ignore(Ignore::None);

        let ports = midi_in.ports();
        let names: Vec<String> = ports
            .iter()
            .map(|p| midi_in.port_name(p).unwrap_or_default())
            .collect();
        let index = select_port(&names, &self.keywords).ok_or(SourceError::NoDevices)?;
        let port = ports
            .get(index)
            .ok_or_else(|| SourceError::PortNotFound(self.keywords.join(",")))?;
        let port_name = names[index].clone();

        let (tx, rx) = mpsc::unbounded_channel::<SourceItem>();
        let callback_tx = tx.clone();

        let connection = midi_in
            .connect(
                port,
                "midifeed-input",
                move |_stamp_us, data, _| {
                    let event = decode(data, Local::now());
                    // Receiver gone means the session is tearing down
                    let _ = callback_tx.send(Ok(event));
                },
                (),
            )
            .map_err(|e| SourceError::Connect(e.to_string()))?;

        info!("Opened MIDI input: {}", port_name);

        let watchdog = tokio::spawn(watch_port(port_name.clone(), WATCHDOG_INTERVAL, tx));
        let guard = MidiGuard {
            connection: Some(connection),
            watchdog,
            port_name: port_name.clone(),
        };

        Ok(RawEventStream::from_channel(port_name, rx).with_guard(Box::new(guard)))
    }
}

async fn watch_port(port_name: String, interval: Duration, tx: mpsc::UnboundedSender<SourceItem>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if tx.is_closed() {
            return;
        }

        let name = port_name.clone();
        let present = tokio::task::spawn_blocking(move || match list_input_ports() {
            Ok(ports) => ports.iter().any(|p| p.name == name),
            // Can't tell; assume still there
            Err(_) => true,
        })
        .await
        .unwrap_or(true);

        if !present {
            warn!("MIDI input disappeared: {}", port_name);
            let _ = tx.send(Err(SourceError::Disconnected(port_name)));
            return;
        }
        debug!("MIDI input still present: {}", port_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Local> {
        Local::now()
    }

    fn extra(event: &RawMessageEvent, key: &str) -> Value {
        event.payload.as_ref().unwrap()[key].clone()
    }

    #[test]
    fn test_port_info_display_shows_index() {
        let port = MidiPortInfo {
            index: 2,
            name: "Keystation 49 MK3".to_string(),
        };
        assert_eq!(port.to_string(), "[2] Keystation 49 MK3");
    }

    #[test]
    fn test_decode_note_on() {
        let event = decode(&[0x91, 60, 100], now());
        assert_eq!(event.kind, MessageKind::NoteOn);
        assert_eq!(event.channel, Some(1));
        assert_eq!(event.note, Some(60));
        assert_eq!(event.velocity, Some(100));
    }

    #[test]
    fn test_decode_note_on_velocity_zero_stays_note_on() {
        let event = decode(&[0x90, 60, 0], now());
        assert_eq!(event.kind, MessageKind::NoteOn);
        assert_eq!(event.velocity, Some(0));
        assert!(event.is_release());
    }

    #[test]
    fn test_decode_note_off() {
        let event = decode(&[0x8F, 61, 40], now());
        assert_eq!(event.kind, MessageKind::NoteOff);
        assert_eq!(event.channel, Some(15));
        assert_eq!(event.velocity, Some(40));
    }

    #[test]
    fn test_decode_control_change() {
        let event = decode(&[0xB0, 64, 127], now());
        assert_eq!(event.kind, MessageKind::ControlChange);
        assert_eq!(event.controller, Some(64));
        assert_eq!(event.value, Some(127));
    }

    #[test]
    fn test_decode_pitch_bend_center_and_extremes() {
        assert_eq!(extra(&decode(&[0xE0, 0x00, 0x40], now()), "pitch"), json!(0));
        assert_eq!(extra(&decode(&[0xE0, 0x00, 0x00], now()), "pitch"), json!(-8192));
        assert_eq!(extra(&decode(&[0xE0, 0x7F, 0x7F], now()), "pitch"), json!(8191));
    }

    #[test]
    fn test_decode_program_and_pressure() {
        let program = decode(&[0xC2, 5], now());
        assert_eq!(program.kind, MessageKind::ProgramChange);
        assert_eq!(extra(&program, "program"), json!(5));

        let pressure = decode(&[0xD0, 90], now());
        assert_eq!(pressure.kind, MessageKind::ChannelPressure);
        assert_eq!(extra(&pressure, "pressure"), json!(90));

        let poly = decode(&[0xA0, 60, 33], now());
        assert_eq!(poly.kind, MessageKind::KeyPressure);
        assert_eq!(poly.note, Some(60));
        assert_eq!(poly.value, Some(33));
    }

    #[test]
    fn test_decode_system_messages() {
        assert_eq!(decode(&[0xF8], now()).kind, MessageKind::Clock);
        assert_eq!(decode(&[0xFA], now()).kind, MessageKind::TransportStart);
        assert_eq!(decode(&[0xFB], now()).kind, MessageKind::TransportContinue);
        assert_eq!(decode(&[0xFC], now()).kind, MessageKind::TransportStop);

        let pos = decode(&[0xF2, 0x10, 0x01], now());
        assert_eq!(pos.kind, MessageKind::SongPosition);
        assert_eq!(extra(&pos, "pos"), json!(144));

        let song = decode(&[0xF3, 3], now());
        assert_eq!(song.kind, MessageKind::SongSelect);
        assert_eq!(extra(&song, "song"), json!(3));
    }

    #[test]
    fn test_decode_sysex_strips_framing() {
        let event = decode(&[0xF0, 0x7E, 0x01, 0xF7], now());
        assert_eq!(event.kind, MessageKind::SystemExclusive);
        assert_eq!(extra(&event, "data"), json!([0x7E, 0x01]));
    }

    #[test]
    fn test_decode_unknown_and_truncated() {
        let active_sensing = decode(&[0xFE], now());
        assert_eq!(active_sensing.kind, MessageKind::Other);
        assert_eq!(extra(&active_sensing, "bytes"), json!([0xFE]));

        assert_eq!(decode(&[0x90, 60], now()).kind, MessageKind::Other);
        assert_eq!(decode(&[], now()).kind, MessageKind::Other);
        assert_eq!(decode(&[0x3C, 0x40], now()).kind, MessageKind::Other);
    }

    #[test]
    fn test_select_port_prefers_keywords() {
        let names = vec![
            "Midi Through Port-0".to_string(),
            "Medeli SP200 USB".to_string(),
        ];
        let keywords = vec!["SAP200".to_string(), "MEDELI".to_string()];
        assert_eq!(select_port(&names, &keywords), Some(1));
    }

    #[test]
    fn test_select_port_falls_back_to_first() {
        let names = vec!["Launchpad".to_string(), "nanoKEY".to_string()];
        assert_eq!(select_port(&names, &["Roland".to_string()]), Some(0));
        assert_eq!(select_port(&[], &["Roland".to_string()]), None);
    }

    #[tokio::test]
    async fn test_stream_from_items_ends() {
        let mut stream = RawEventStream::from_items(
            "test",
            vec![Ok(decode(&[0xFA], now())), Err(SourceError::Disconnected("test".into()))],
        );
        assert_eq!(stream.name(), "test");
        assert!(matches!(stream.next().await, Some(Ok(_))));
        assert!(matches!(stream.next().await, Some(Err(SourceError::Disconnected(_)))));
        assert!(stream.next().await.is_none());
    }
}
