//! Down-channel session.
//!
//! The down-channel is a long-held GET on the directives endpoint through
//! which the service pushes directives outside any request/response cycle.
//! [`Session::run`] owns that stream plus everything that must be
//! serialized with it: directive ingestion, lifecycle events bound for the
//! service, audio sink feedback and engine notices all funnel through one
//! select loop, so the queue only ever mutates from one task.
//!
//! `run` returns on stream exhaustion or failure instead of reconnecting
//! itself; the supervisor in the binary decides when to try again.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    client::VoiceClient,
    command::Batch,
    engine::{Engine, Notice, PlayerFeedback},
    error::{Error, ErrorKind, Result},
    protocol::{directive::Directive, event::EventWrapper},
};

/// Ping cadence keeping intermediaries from dropping the idle stream.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(240);

/// Upper bound on one newline-delimited directive. A line past this is
/// discarded and the stream picks back up at the next newline.
const MAX_LINE: usize = 256 * 1024;

/// What one turn of the select loop decided to do.
enum Action {
    Shutdown,
    Chunk(bytes::Bytes),
    StreamClosed,
    StreamError(Error),
    Heartbeat,
    Outbound(EventWrapper),
    Notice(Notice),
    Feedback(PlayerFeedback),
    AlertFired(String),
    SpeechTimeout,
}

/// One connected voice session.
pub struct Session {
    client: Arc<VoiceClient>,
    engine: Engine,

    /// Lifecycle events the engine wants sent to the service.
    outbox: mpsc::UnboundedReceiver<EventWrapper>,

    /// Signals from the engine that need session-level handling.
    notices: mpsc::UnboundedReceiver<Notice>,

    /// Progress and completion reports from the audio sink.
    feedback: mpsc::UnboundedReceiver<PlayerFeedback>,

    /// Tokens of scheduled alerts whose delay has elapsed.
    alerts: mpsc::UnboundedReceiver<String>,

    /// External shutdown signal.
    cancel: CancellationToken,
}

impl Session {
    #[must_use]
    pub fn new(
        client: Arc<VoiceClient>,
        engine: Engine,
        outbox: mpsc::UnboundedReceiver<EventWrapper>,
        notices: mpsc::UnboundedReceiver<Notice>,
        feedback: mpsc::UnboundedReceiver<PlayerFeedback>,
        alerts: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            engine,
            outbox,
            notices,
            feedback,
            alerts,
            cancel,
        }
    }

    /// Opens the down-channel and runs the session until it fails or is
    /// shut down.
    ///
    /// On connect the session first synchronizes state, flushing any
    /// directives the service queued while disconnected, then reads
    /// newline-delimited JSON directives from the held-open body. A
    /// heartbeat ping fires every four minutes; its failures are logged
    /// and swallowed, since the stream's own failure is the authoritative
    /// signal of connection health.
    ///
    /// # Errors
    ///
    /// Will return `Err` when the stream closes or fails, or when the
    /// service moves the session to another endpoint. The caller decides
    /// whether to reconnect.
    pub async fn run(&mut self) -> Result<()> {
        let response = self.client.open_directives_stream().await?;
        info!("down-channel open");
        let mut stream = response.bytes_stream();

        let batch = self.client.synchronize_state().await?;
        self.engine.ingest(batch).await;

        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut lines = LineBuffer::default();
        let mut speech_deadline: Option<Instant> = None;

        loop {
            let action = tokio::select! {
                () = self.cancel.cancelled() => Action::Shutdown,

                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => Action::Chunk(bytes),
                    Some(Err(e)) => Action::StreamError(e.into()),
                    None => Action::StreamClosed,
                },

                _ = heartbeat.tick() => Action::Heartbeat,

                Some(event) = self.outbox.recv() => Action::Outbound(event),

                Some(notice) = self.notices.recv() => Action::Notice(notice),

                Some(feedback) = self.feedback.recv() => Action::Feedback(feedback),

                Some(token) = self.alerts.recv() => Action::AlertFired(token),

                () = async {
                    match speech_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => Action::SpeechTimeout,
            };

            match action {
                Action::Shutdown => {
                    info!("session shutting down");
                    return Ok(());
                }
                Action::Chunk(bytes) => {
                    for line in lines.drain(&bytes) {
                        self.handle_line(&line).await;
                    }
                }
                Action::StreamClosed => {
                    return Err(Error::unavailable("down-channel closed by server"));
                }
                Action::StreamError(e) => return Err(e),
                Action::Heartbeat => {
                    match self.client.ping().await {
                        Ok(()) => trace!("heartbeat ok"),
                        // The stream's own failure is the authoritative signal.
                        Err(e) => warn!("heartbeat failed: {e}"),
                    }
                }
                Action::Outbound(event) => self.send_event(&event).await,
                Action::Notice(notice) => {
                    if let Some(result) = self.handle_notice(notice, &mut speech_deadline) {
                        return result;
                    }
                }
                Action::Feedback(feedback) => self.engine.feedback(feedback).await,
                Action::AlertFired(token) => self.engine.alert_fired(&token),
                Action::SpeechTimeout => {
                    speech_deadline = None;
                    debug!("expect-speech window elapsed without capture");
                    self.send_event(&EventWrapper::expect_speech_timed_out()).await;
                }
            }
        }
    }

    async fn handle_line(&mut self, line: &str) {
        trace!("down-channel directive: {line}");
        match Directive::from_json(line) {
            Ok(directive) => {
                let batch = Batch::from_directives(vec![directive]);
                self.engine.ingest(batch).await;
            }
            // One bad directive must not take the stream down.
            Err(e) => warn!("dropping undecodable down-channel directive: {e}"),
        }
    }

    /// Sends one event and feeds any directives in the reply back into the
    /// engine. Send failures are contained to this event.
    async fn send_event(&mut self, event: &EventWrapper) {
        match self.client.send_event(event).await {
            Ok(batch) => self.engine.ingest(batch).await,
            Err(e) if e.kind == ErrorKind::Cancelled => {
                debug!("event send cancelled");
            }
            Err(e) => warn!("event send failed: {e}"),
        }
    }

    /// Handles one engine notice. Returns `Some` when the session must
    /// end.
    fn handle_notice(
        &self,
        notice: Notice,
        speech_deadline: &mut Option<Instant>,
    ) -> Option<Result<()>> {
        match notice {
            Notice::Idle => debug!("queue idle"),
            Notice::ExpectSpeech { timeout } => {
                // Capture is driven by the embedding application through
                // `VoiceClient::recognize`; without one, the window times
                // out and is reported as such.
                info!("service expects speech within {}ms", timeout.as_millis());
                *speech_deadline = Some(Instant::now() + timeout);
            }
            Notice::StopCapture => {
                debug!("capture stop requested");
                *speech_deadline = None;
            }
            Notice::EndpointChanged { endpoint } => {
                if let Err(e) = self.client.set_endpoint(&endpoint) {
                    return Some(Err(e));
                }
                // Reconnect against the new endpoint.
                return Some(Err(Error::aborted("session moved to a new endpoint")));
            }
            Notice::ServerFault { code, description } => {
                error!("service fault {code}: {description}");
            }
        }
        None
    }
}

/// Reassembles newline-delimited directives from arbitrary stream chunks.
///
/// A line that grows past [`MAX_LINE`] is dropped wholesale and reading
/// resumes at the next newline, the same as an undecodable directive.
#[derive(Default)]
struct LineBuffer {
    buffer: Vec<u8>,
    skipping: bool,
}

impl LineBuffer {
    /// Appends a chunk and drains every complete line.
    fn drain(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(at) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=at).collect();
            if self.skipping {
                // Tail of an already-discarded oversized line.
                self.skipping = false;
                continue;
            }
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            // Keep-alive newlines between directives are expected.
            if !text.is_empty() {
                lines.push(text.to_owned());
            }
        }

        if self.buffer.len() > MAX_LINE {
            if !self.skipping {
                warn!("ignoring down-channel line over {MAX_LINE} bytes");
                self.skipping = true;
            }
            self.buffer.clear();
        }

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_across_chunks_reassemble() {
        let mut lines = LineBuffer::default();
        assert!(lines.drain(b"{\"par").is_empty());
        let drained = lines.drain(b"t\":1}\n{\"next\":2}\n");
        assert_eq!(drained, vec![r#"{"part":1}"#, r#"{"next":2}"#]);
        assert!(lines.buffer.is_empty());
    }

    #[test]
    fn keepalive_newlines_are_skipped() {
        let mut lines = LineBuffer::default();
        let drained = lines.drain(b"\r\n\n{\"a\":1}\n\n");
        assert_eq!(drained, vec![r#"{"a":1}"#]);
    }

    #[test]
    fn oversized_line_is_dropped_and_stream_resyncs() {
        let mut lines = LineBuffer::default();

        // The line keeps growing across chunks without a newline.
        assert!(lines.drain(&vec![b'x'; MAX_LINE + 1]).is_empty());
        assert!(lines.drain(&vec![b'x'; MAX_LINE + 1]).is_empty());

        // Its tail ends at the first newline; the next line is whole.
        let drained = lines.drain(b"xxx\n{\"a\":1}\n");
        assert_eq!(drained, vec![r#"{"a":1}"#]);
        assert!(!lines.skipping);
    }
}
