//! Producer session: keep a source open, forward what it yields.
//!
//! Any failure, whether opening or mid-stream, becomes a status record for
//! the handler, then a fixed backoff before the next attempt. Sessions run
//! until cancelled; the consumers behind the handler never see a reconnect
//! other than through those status records.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::{RawMessageEvent, StatusRecord};
use crate::source::{EventSource, SourceError};

/// Default wait between reconnect attempts.
pub const DEFAULT_RETRY: Duration = Duration::from_secs(1);

/// Receives what a session produces.
pub trait SessionHandler: Send {
    /// A freshly opened source, before its first event.
    fn on_open(&mut self, _device: &str) {}

    fn on_event(&mut self, event: RawMessageEvent);

    fn on_status(&mut self, status: StatusRecord);
}

/// Run until `cancel` fires. Returns the number of failed attempts.
pub async fn run_session<S, H>(
    source: &mut S,
    handler: &mut H,
    retry: Duration,
    cancel: CancellationToken,
) -> u64
where
    S: EventSource + ?Sized,
    H: SessionHandler + ?Sized,
{
    let mut failures = 0u64;

    while !cancel.is_cancelled() {
        let error = match source.open() {
            Ok(mut stream) => {
                let device = stream.name().to_string();
                info!(device = %device, "MIDI source opened");
                handler.on_open(&device);
                handler.on_status(StatusRecord::info(format!("Connected to {}", device)));

                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!("session cancelled");
                            return failures;
                        }
                        item = stream.next() => match item {
                            Some(Ok(event)) => handler.on_event(event),
                            Some(Err(e)) => break e,
                            None => break SourceError::Disconnected(device.clone()),
                        }
                    }
                }
            }
            Err(e) => e,
        };

        failures += 1;
        warn!("MIDI source failed: {}; retrying in {:?}", error, retry);
        handler.on_status(StatusRecord::error(error.to_string()));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(retry) => {}
        }
    }

    failures
}
