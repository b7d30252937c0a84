//! midifeed - MIDI keyboard input, normalized and fanned out to live clients.
//!
//! Raw device messages are decoded ([`source`]), turned into unified events
//! with press/release edges and hold durations ([`normalize`]), and either
//! written to local sinks ([`capture`], [`check`]) or published through a
//! [`hub`] to any number of SSE subscribers ([`server`]).

pub mod capture;
pub mod check;
pub mod delivery;
pub mod event;
pub mod hub;
pub mod normalize;
pub mod server;
pub mod session;
pub mod source;
pub mod telemetry;

pub use delivery::{deliveries, Delivery};
pub use event::{
    Edge, FeedRecord, MessageKind, Payload, RawMessageEvent, StatusLevel, StatusRecord,
    UnifiedEvent,
};
pub use hub::{Hub, PublishStats, SubscriberId, Subscription};
pub use normalize::{is_useful, NormalizeOptions, Normalizer};
pub use session::{run_session, SessionHandler};
pub use source::{EventSource, MidiSource, RawEventStream, SourceError};
